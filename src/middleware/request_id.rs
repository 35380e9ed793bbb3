//! Request-id middleware
//!
//! Tags every inbound request with an id taken from `X-Request-ID` or, when
//! absent, a generated `req_{ms}_{ns%1000}` value. The id is mirrored back
//! in the response and attached to the request's trace span.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::Instrument;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub async fn request_id(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_request_id);

    if let Ok(value) = HeaderValue::from_str(&id) {
        req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());

        let span = tracing::info_span!("request", request_id = %id);
        let mut response = next.run(req).instrument(span).await;
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
        return response;
    }

    next.run(req).await
}

/// Millisecond timestamp plus the sub-microsecond remainder, enough to keep
/// concurrent ids distinct without a counter.
pub fn generate_request_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("req_{}_{}", now.as_millis(), now.subsec_nanos() % 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_id_has_expected_shape() {
        let id = generate_request_id();
        assert!(id.starts_with("req_"));
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[1].parse::<u128>().is_ok());
        assert!(parts[2].parse::<u32>().unwrap() < 1000);
    }
}
