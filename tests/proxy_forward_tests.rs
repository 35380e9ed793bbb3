//! End-to-end tests for the path-prefix forwarder, driven through the
//! proxy router against a local mock upstream.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    routing::{get, post},
    Json, Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use gatc::proxy::{BatchConfig, ProxyConfig, ProxyServer};

async fn spawn_upstream() -> SocketAddr {
    async fn hello() -> ([(&'static str, &'static str); 1], &'static str) {
        ([("x-upstream", "yes")], "hello world")
    }

    async fn echo(body: String) -> String {
        body
    }

    async fn header_names(headers: HeaderMap) -> Json<Value> {
        let names: Vec<String> = headers.keys().map(|k| k.as_str().to_string()).collect();
        Json(serde_json::json!({ "names": names }))
    }

    let app = Router::new()
        .route("/hello", get(hello))
        .route("/echo", post(echo))
        .route("/headers", get(header_names));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn proxy_with(cfg: ProxyConfig) -> Router {
    // The coalescer is not exercised here; defaults are fine.
    ProxyServer::new(cfg, BatchConfig::default()).router()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_forwards_get_and_copies_response() {
    let upstream = spawn_upstream().await;
    let app = proxy_with(ProxyConfig::default());

    let request = Request::builder()
        .uri(format!("/px/http://{}/hello", upstream))
        .body(Body::empty())
        .unwrap();

    let response = tokio::time::timeout(WAIT, app.oneshot(request))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-upstream").unwrap().to_str().unwrap(),
        "yes"
    );
    assert_eq!(body_bytes(response).await, b"hello world");
}

#[tokio::test]
async fn test_forwards_post_body() {
    let upstream = spawn_upstream().await;
    let app = proxy_with(ProxyConfig::default());

    let request = Request::builder()
        .method("POST")
        .uri(format!("/px/http://{}/echo", upstream))
        .header("content-type", "text/plain")
        .body(Body::from("payload goes through"))
        .unwrap();

    let response = tokio::time::timeout(WAIT, app.oneshot(request))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"payload goes through");
}

#[tokio::test]
async fn test_encoded_scheme_separator_accepted() {
    let upstream = spawn_upstream().await;
    let app = proxy_with(ProxyConfig::default());

    let request = Request::builder()
        .uri(format!("/px/http%3A%2F%2F{}/hello", upstream))
        .body(Body::empty())
        .unwrap();

    let response = tokio::time::timeout(WAIT, app.oneshot(request))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_strips_configured_and_transport_headers() {
    let upstream = spawn_upstream().await;
    let cfg = ProxyConfig {
        del_headers: vec!["x-secret".to_string()],
        ..Default::default()
    };
    let app = proxy_with(cfg);

    let request = Request::builder()
        .uri(format!("/px/http://{}/headers", upstream))
        .header("x-secret", "do-not-forward")
        .header("x-custom", "keep-me")
        .header("x-connect-to", format!("{}", upstream))
        .body(Body::empty())
        .unwrap();

    let response = tokio::time::timeout(WAIT, app.oneshot(request))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let seen: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    let names: Vec<String> = seen["names"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();

    assert!(names.contains(&"x-custom".to_string()));
    assert!(!names.contains(&"x-secret".to_string()));
    assert!(!names.contains(&"x-connect-to".to_string()));
}

#[tokio::test]
async fn test_allow_list_blocks_unlisted_target() {
    let upstream = spawn_upstream().await;
    let cfg = ProxyConfig {
        url_keyword_allow_list: vec!["googleapis".to_string()],
        ..Default::default()
    };
    let app = proxy_with(cfg);

    let request = Request::builder()
        .uri(format!("/px/http://{}/hello", upstream))
        .body(Body::empty())
        .unwrap();

    let response = tokio::time::timeout(WAIT, app.oneshot(request))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_invalid_target_url_rejected() {
    let app = proxy_with(ProxyConfig::default());

    let request = Request::builder()
        .uri("/px/notaurl")
        .body(Body::empty())
        .unwrap();

    let response = tokio::time::timeout(WAIT, app.oneshot(request))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let app = proxy_with(ProxyConfig::default());

    // RFC 5737 test address, nothing listens there.
    let request = Request::builder()
        .uri("/px/http://192.0.2.1:9/hello")
        .body(Body::empty())
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(60), app.oneshot(request))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_health_and_usage_endpoints() {
    let app = proxy_with(ProxyConfig::default());

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"OK");

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_bytes(response).await;
    assert!(String::from_utf8_lossy(&body).contains("/px/{url}"));
}
