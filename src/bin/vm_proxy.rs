//! Per-VM path-prefix proxy binary.

use std::net::SocketAddr;

use gatc::proxy::{BatchConfig, ProxyConfig, ProxyServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gatc=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_ansi(false))
        .init();

    let cfg = ProxyConfig::from_env();
    let batch_cfg = BatchConfig::from_env();

    tracing::info!(
        port = cfg.port,
        force_https = cfg.force_https,
        allow_list = ?cfg.url_keyword_allow_list,
        del_headers = ?cfg.del_headers,
        "starting HTTP proxy server"
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let server = ProxyServer::new(cfg, batch_cfg);
    let app = server.router();

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
