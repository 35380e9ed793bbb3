pub mod account;
pub mod vm;

use axum::{routing::get, Json, Router};

use crate::state::AppState;

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1/vm", vm::vm_routes(state.clone()))
        .nest("/api/v1/account", account::account_routes(state))
}

/// Simple health check endpoint
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "gatc",
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}
