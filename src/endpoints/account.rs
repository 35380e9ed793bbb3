//! Account registration and project workflow endpoints

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::error::{success, ApiEnvelope, AppError, Result};
use crate::services::account::{
    self, ListAccountParam, StartRegistrationParam, SubmitAuthKeyParam,
};
use crate::services::bootstrap::{self, ProjectProcessParam};
use crate::state::AppState;

/// Create account routes
pub fn account_routes(state: AppState) -> Router {
    Router::new()
        .route("/start-registration", get(start_registration))
        .route(
            "/submit-auth-key",
            get(submit_auth_key_get).post(submit_auth_key_post),
        )
        .route("/list", get(list_accounts))
        .route("/process-projects-v3", get(process_projects_v3))
        .route(
            "/set-token-invalid",
            get(set_token_invalid).post(set_token_invalid_body),
        )
        .route(
            "/emails-with-unbound-projects",
            get(emails_with_unbound_projects),
        )
        .with_state(state)
}

// ============================================================================
// Request types
// ============================================================================

// Spelled out rather than flattened: query-string deserialization does not
// compose flatten with non-string fields.
#[derive(Debug, Deserialize)]
struct ProcessProjectsRequest {
    #[serde(default)]
    email: String,
    #[serde(default)]
    unbind_old_billing_proj: Option<bool>,
    #[serde(default)]
    skip_rate_limit: bool,
}

#[derive(Debug, Deserialize)]
struct SetTokenInvalidRequest {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    email: String,
    #[serde(default)]
    project_id: String,
}

// ============================================================================
// Handlers
// ============================================================================

async fn start_registration(
    State(state): State<AppState>,
    Query(param): Query<StartRegistrationParam>,
) -> Result<Json<ApiEnvelope<account::StartRegistrationResult>>> {
    let result = account::start_registration(&state, &param).await?;
    Ok(success(result))
}

// The browser callback arrives as a GET with query params; API clients may
// also POST the same fields as JSON.
async fn submit_auth_key_get(
    State(state): State<AppState>,
    Query(param): Query<SubmitAuthKeyParam>,
) -> Result<Json<ApiEnvelope<account::SubmitAuthKeyResult>>> {
    submit_auth_key(state, param).await
}

async fn submit_auth_key_post(
    State(state): State<AppState>,
    Json(param): Json<SubmitAuthKeyParam>,
) -> Result<Json<ApiEnvelope<account::SubmitAuthKeyResult>>> {
    submit_auth_key(state, param).await
}

async fn submit_auth_key(
    state: AppState,
    param: SubmitAuthKeyParam,
) -> Result<Json<ApiEnvelope<account::SubmitAuthKeyResult>>> {
    if param.session_id.is_empty() || param.auth_key.is_empty() {
        return Err(AppError::BadRequest(
            "missing session_id or auth_key parameter".to_string(),
        ));
    }
    let result = account::submit_auth_key(&state, &param).await?;
    Ok(success(result))
}

async fn list_accounts(
    State(state): State<AppState>,
    Query(param): Query<ListAccountParam>,
) -> Result<Json<ApiEnvelope<account::ListAccountResult>>> {
    let result = account::list_accounts(&state.db, &param).await?;
    Ok(success(result))
}

async fn process_projects_v3(
    State(state): State<AppState>,
    Query(req): Query<ProcessProjectsRequest>,
) -> Result<Json<ApiEnvelope<bootstrap::ProjectProcessResult>>> {
    if !req.email.is_empty() && !req.skip_rate_limit {
        let (admitted, remaining) = state.email_limiter.can_process(&req.email);
        if !admitted {
            return Err(AppError::RateLimited(format!(
                "email {} requested too frequently, retry in {}s",
                req.email,
                remaining.as_secs()
            )));
        }
    }

    let param = ProjectProcessParam {
        email: req.email,
        unbind_old_billing_proj: req.unbind_old_billing_proj,
    };
    let result = bootstrap::process_projects_v3(&state, &param).await?;
    Ok(success(result))
}

async fn set_token_invalid(
    State(state): State<AppState>,
    Query(req): Query<SetTokenInvalidRequest>,
) -> Result<Json<ApiEnvelope<serde_json::Value>>> {
    set_token_invalid_inner(state, req).await
}

async fn set_token_invalid_body(
    State(state): State<AppState>,
    Json(req): Json<SetTokenInvalidRequest>,
) -> Result<Json<ApiEnvelope<serde_json::Value>>> {
    set_token_invalid_inner(state, req).await
}

async fn set_token_invalid_inner(
    state: AppState,
    req: SetTokenInvalidRequest,
) -> Result<Json<ApiEnvelope<serde_json::Value>>> {
    match req.id {
        Some(id) => bootstrap::set_token_invalid_by_id(&state.db, id).await?,
        None => {
            if req.email.is_empty() || req.project_id.is_empty() {
                return Err(AppError::BadRequest(
                    "either id or email+project_id must be provided".to_string(),
                ));
            }
            bootstrap::set_token_invalid_by_email_project(&state.db, &req.email, &req.project_id)
                .await?;
        }
    }
    Ok(success(serde_json::json!({ "updated": true })))
}

async fn emails_with_unbound_projects(
    State(state): State<AppState>,
) -> Result<Json<ApiEnvelope<Vec<String>>>> {
    let emails = bootstrap::emails_with_unbound_projects(&state.db).await?;
    Ok(success(emails))
}
