//! Application bootstrapper
//!
//! Handles all initialization and setup for the gatc control plane.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::CONFIG;
use crate::db;
use crate::endpoints;
use crate::services::gcp::GcloudClient;
use crate::services::scheduler;
use crate::state::AppState;

/// Bootstrap and run the application
pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    tracing::info!("Starting gatc control plane v{}", env!("CARGO_PKG_VERSION"));

    let state = init_services().await?;

    let app = create_app(state);

    serve(app).await
}

/// Initialize tracing/logging
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("gatc={}", CONFIG.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_ansi(false))
        .init();
}

/// Initialize all application services
async fn init_services() -> anyhow::Result<AppState> {
    let conn = init_database().await?;

    let gcp = Arc::new(GcloudClient::from_config());
    tracing::info!("gcloud client initialized");

    let state = AppState::new(conn, gcp);

    // Start periodic reconciliation tasks
    scheduler::start_scheduler(state.clone());

    Ok(state)
}

/// Initialize the database connection (runs migrations automatically)
async fn init_database() -> anyhow::Result<sea_orm::DatabaseConnection> {
    let conn = db::connect().await?;
    tracing::info!("Database connection established");
    Ok(conn)
}

/// Create the main application router
fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    endpoints::create_router(state)
        .layer(axum::middleware::from_fn(
            crate::middleware::request_id::request_id,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Start the HTTP server
async fn serve(app: Router) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", CONFIG.server.host, CONFIG.server.port).parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
