//! VM management endpoints

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::{success, ApiEnvelope, AppError, Result};
use crate::services::vm::{
    self, BatchCreateVmParam, BatchDeleteVmParam, ListVmParam, ReplaceProxyResourceParam,
    ReplaceProxyResourceV2Result, SyncProxyPoolFromVmsRes,
};
use crate::state::AppState;

/// Create VM routes
pub fn vm_routes(state: AppState) -> Router {
    Router::new()
        .route("/create", post(create_vm))
        .route("/delete", post(delete_vm))
        .route("/list", get(list_vms))
        .route("/get", get(get_vm))
        .route("/refresh-ip", post(refresh_ip))
        .route("/replace-proxy-resource", post(replace_proxy_resource))
        .with_state(state)
}

// ============================================================================
// Request / response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct DeleteVmRequest {
    #[serde(default)]
    vm_id: String,
    #[serde(flatten)]
    batch: BatchDeleteVmParam,
}

#[derive(Debug, Deserialize)]
struct GetVmQuery {
    vm_id: String,
}

#[derive(Debug, Deserialize)]
struct RefreshIpRequest {
    vm_id: String,
}

/// Combined result of the V2 rotation and the pool sync that follows it.
#[derive(Debug, Serialize)]
struct ReplaceProxyResourceResponse {
    replace: ReplaceProxyResourceV2Result,
    pool_sync: SyncProxyPoolFromVmsRes,
}

// ============================================================================
// Handlers
// ============================================================================

/// Single or batch create; `num > 1` selects the batch path.
async fn create_vm(
    State(state): State<AppState>,
    Json(req): Json<BatchCreateVmParam>,
) -> Result<Json<ApiEnvelope<serde_json::Value>>> {
    if req.num > 1 {
        let result = vm::batch_create_vm(&state, &req).await?;
        Ok(success(serde_json::to_value(result)?))
    } else {
        let param = vm::CreateVmParam {
            zone: req.zone,
            machine_type: req.machine_type,
            tag: req.tag,
            proxy_type: req.proxy_type,
        };
        let result = vm::create_vm(&state, &param).await?;
        Ok(success(serde_json::to_value(result)?))
    }
}

/// Single delete when `vm_id` is set, otherwise list/prefix batch delete.
async fn delete_vm(
    State(state): State<AppState>,
    Json(req): Json<DeleteVmRequest>,
) -> Result<Json<ApiEnvelope<serde_json::Value>>> {
    if !req.vm_id.is_empty() {
        let result = vm::delete_vm(&state, &req.vm_id).await?;
        Ok(success(serde_json::to_value(result)?))
    } else {
        let result = vm::batch_delete_vm(&state, &req.batch).await?;
        Ok(success(serde_json::to_value(result)?))
    }
}

async fn list_vms(
    State(state): State<AppState>,
    Query(param): Query<ListVmParam>,
) -> Result<Json<ApiEnvelope<vm::ListVmResult>>> {
    let result = vm::list_vms(&state.db, &param).await?;
    Ok(success(result))
}

async fn get_vm(
    State(state): State<AppState>,
    Query(query): Query<GetVmQuery>,
) -> Result<Json<ApiEnvelope<crate::models::vm_instance::Model>>> {
    let result = vm::get_vm(&state.db, &query.vm_id).await?;
    Ok(success(result))
}

async fn refresh_ip(
    State(state): State<AppState>,
    Json(req): Json<RefreshIpRequest>,
) -> Result<Json<ApiEnvelope<vm::RefreshVmIpResult>>> {
    if req.vm_id.is_empty() {
        return Err(AppError::BadRequest("vm_id is required".to_string()));
    }
    let result = vm::refresh_vm_ip(&state, &req.vm_id).await?;
    Ok(success(result))
}

/// Rotate N http-path proxies via the deferred (V2) protocol, then converge
/// the proxy pool onto the post-rotation set of running VMs.
async fn replace_proxy_resource(
    State(state): State<AppState>,
    Json(req): Json<ReplaceProxyResourceParam>,
) -> Result<Json<ApiEnvelope<ReplaceProxyResourceResponse>>> {
    let replace = vm::replace_proxy_resource_v2(&state, &req).await?;
    let pool_sync = vm::sync_proxy_pool_from_vms(&state.db).await?;
    Ok(success(ReplaceProxyResourceResponse { replace, pool_sync }))
}
