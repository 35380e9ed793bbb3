//! Path-prefix HTTP proxy
//!
//! Serves `<METHOD> /px/<target-url>`: the target is decoded from the
//! request path, validated, and the request is replayed against it with the
//! response copied back verbatim. Requests carrying the batch opt-in header
//! for an eligible target divert to the batch coalescer instead of the
//! forwarding path.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, Method, Response, StatusCode},
    routing::{any, get},
    Router,
};
use reqwest::Client;

use super::batch::{self, BatchManager, BATCH_OPT_IN_HEADER};
use super::config::{BatchConfig, ProxyConfig};

/// Per-request transport override: dial this `host:port` instead of the
/// target's address, keeping the target hostname for SNI.
pub const CONNECT_TO_HEADER: &str = "x-connect-to";

// Hop-by-hop and framing headers that must not be replayed upstream.
const SKIP_REQUEST_HEADERS: [&str; 11] = [
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "accept-encoding",
];

const SKIP_RESPONSE_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "content-encoding",
    "content-length",
];

pub struct ProxyServer {
    cfg: ProxyConfig,
    batch: Arc<BatchManager>,
    shared_client: Client,
}

impl ProxyServer {
    pub fn new(cfg: ProxyConfig, batch_cfg: BatchConfig) -> Arc<Self> {
        let shared_client = build_client(&cfg, Duration::from_secs(150), true)
            .expect("failed to build shared HTTP client");
        Arc::new(Self {
            batch: BatchManager::new(batch_cfg),
            cfg,
            shared_client,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.cfg
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/px/*target", any(proxy_handler))
            .route("/health", get(health))
            .route("/", get(usage))
            .with_state(self.clone())
    }
}

fn build_client(cfg: &ProxyConfig, timeout: Duration, pooled: bool) -> reqwest::Result<Client> {
    let mut builder = Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10));
    builder = if pooled {
        builder
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(90))
    } else {
        builder.pool_max_idle_per_host(0)
    };
    if !cfg.auto_follow {
        builder = builder.redirect(reqwest::redirect::Policy::none());
    }
    builder.build()
}

/// One-shot client that dials `connect_to` while resolving the target
/// hostname, so the TLS handshake still presents the original SNI.
fn build_connect_to_client(
    cfg: &ProxyConfig,
    sni_host: &str,
    connect_to: &str,
) -> Result<Client, String> {
    let addr = connect_to
        .to_socket_addrs()
        .map_err(|e| format!("invalid {} value: {}", CONNECT_TO_HEADER, e))?
        .next()
        .ok_or_else(|| format!("{} resolved to no address", CONNECT_TO_HEADER))?;

    let mut builder = Client::builder()
        .timeout(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(0)
        .resolve(sni_host, addr);
    if !cfg.auto_follow {
        builder = builder.redirect(reqwest::redirect::Policy::none());
    }
    builder
        .build()
        .map_err(|e| format!("failed to build pinned client: {}", e))
}

async fn health() -> &'static str {
    "OK"
}

async fn usage() -> ([(&'static str, &'static str); 1], &'static str) {
    (
        [("content-type", "text/plain")],
        "HTTP Proxy Server\n\nUsage: /px/{url}\nExample: /px/https://api.anthropic.com/v1/messages\n",
    )
}

/// Recover the target URL from the raw path-and-query, accepting both raw
/// and percent-encoded scheme separators.
pub fn decode_target(path_and_query: &str) -> Option<String> {
    let rest = path_and_query.strip_prefix("/px/")?;
    Some(rest.replacen("%3A%2F%2F", "://", 1))
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message.to_string()))
        .unwrap_or_default()
}

async fn proxy_handler(
    State(server): State<Arc<ProxyServer>>,
    req: Request,
) -> Response<Body> {
    let method = req.method().clone();
    let headers = req.headers().clone();

    let Some(target_url) = req
        .uri()
        .path_and_query()
        .and_then(|pq| decode_target(pq.as_str()))
    else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid target URL");
    };

    let body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "Failed to read request body"),
    };

    if batch::is_batch_eligible(&headers, &target_url) {
        return server.handle_batch(headers, &body).await;
    }

    server.forward(method, headers, target_url, body).await
}

impl ProxyServer {
    async fn forward(
        &self,
        method: Method,
        headers: HeaderMap,
        mut target_url: String,
        body: axum::body::Bytes,
    ) -> Response<Body> {
        if self.cfg.force_https && target_url.starts_with("http://") {
            target_url = target_url.replacen("http://", "https://", 1);
        }

        if !self.cfg.is_url_allowed(&target_url) {
            tracing::info!(target = %target_url, "blocked request");
            return error_response(StatusCode::FORBIDDEN, "Access denied");
        }

        let target = match reqwest::Url::parse(&target_url) {
            Ok(url) => url,
            Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid target URL"),
        };

        let connect_to = headers
            .get(CONNECT_TO_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Pinned and no-reuse transports are built per call; everything
        // else shares the pooled client.
        let one_shot: Option<Client> = if let Some(ref endpoint) = connect_to {
            let sni_host = target.host_str().unwrap_or_default().to_string();
            match build_connect_to_client(&self.cfg, &sni_host, endpoint) {
                Ok(client) => Some(client),
                Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
            }
        } else if !self.cfg.client_reuse {
            match build_client(&self.cfg, Duration::from_secs(150), false) {
                Ok(client) => Some(client),
                Err(e) => {
                    tracing::error!(error = %e, "failed to build per-call client");
                    return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Proxy error");
                }
            }
        } else {
            None
        };
        let client = one_shot.as_ref().unwrap_or(&self.shared_client);

        let mut builder = client.request(method.clone(), target.clone());
        for (name, value) in headers.iter() {
            let lower = name.as_str().to_lowercase();
            if SKIP_REQUEST_HEADERS.contains(&lower.as_str())
                || lower == CONNECT_TO_HEADER
                || self
                    .cfg
                    .del_headers
                    .iter()
                    .any(|d| d.eq_ignore_ascii_case(&lower))
            {
                continue;
            }
            builder = builder.header(name, value);
        }

        if !self.cfg.reset_host {
            // Keep the caller's Host instead of the target's.
            if let Some(original) = headers.get(header::HOST) {
                builder = builder.header(header::HOST, original);
            }
        }

        if !body.is_empty() {
            builder = builder.body(body.to_vec());
        }

        tracing::info!(
            method = %method,
            target = %target_url,
            user_agent = headers
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or(""),
            "proxying request"
        );

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(target = %target_url, error = %e, "proxy request failed");
                return error_response(StatusCode::BAD_GATEWAY, "Proxy request failed");
            }
        };

        let status = response.status();
        let response_headers = response.headers().clone();
        let response_body = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(target = %target_url, error = %e, "failed to read response body");
                return error_response(StatusCode::BAD_GATEWAY, "Failed to read response body");
            }
        };

        let mut builder = Response::builder().status(status);
        for (name, value) in response_headers.iter() {
            if SKIP_RESPONSE_HEADERS.contains(&name.as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder
            .body(Body::from(response_body))
            .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "Proxy error"))
    }

    /// Divert an eligible request to the coalescer and park until its reply
    /// channel resolves.
    async fn handle_batch(&self, headers: HeaderMap, body: &[u8]) -> Response<Body> {
        let mut template = headers.clone();
        template.remove(BATCH_OPT_IN_HEADER);
        template.remove(header::HOST);
        for name in &self.cfg.del_headers {
            template.remove(name.as_str());
        }

        let receiver = self.batch.add_request(template, body);

        let reply = match receiver.await {
            Ok(reply) => reply,
            Err(_) => {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "batch execution dropped the reply",
                )
            }
        };

        let mut builder = Response::builder().status(reply.status);
        for (name, value) in reply.headers.iter() {
            builder = builder.header(name, value);
        }
        builder
            .body(Body::from(reply.body))
            .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "Proxy error"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_target_raw_scheme() {
        assert_eq!(
            decode_target("/px/https://api.example.com/v1?x=1").as_deref(),
            Some("https://api.example.com/v1?x=1")
        );
    }

    #[test]
    fn test_decode_target_encoded_scheme() {
        assert_eq!(
            decode_target("/px/https%3A%2F%2Fapi.example.com/v1").as_deref(),
            Some("https://api.example.com/v1")
        );
    }

    #[test]
    fn test_decode_target_replaces_only_first_separator() {
        assert_eq!(
            decode_target("/px/https%3A%2F%2Fa.com/cb?next=https%3A%2F%2Fb.com").as_deref(),
            Some("https://a.com/cb?next=https%3A%2F%2Fb.com")
        );
    }

    #[test]
    fn test_decode_target_requires_px_prefix() {
        assert!(decode_target("/health").is_none());
        assert!(decode_target("/pxx/https://a.com").is_none());
    }
}
