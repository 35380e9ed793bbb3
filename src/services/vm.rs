//! VM controller
//!
//! Owns the lifecycle of fleet VMs: creation (single and batch), deletion,
//! provider reconciliation, the aged/pending-delete cleanup passes, and the
//! replace-proxy-resource rotation protocols.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::{Deserialize, Serialize};

use crate::config::{CONFIG, PENDING_DELETE_RETENTION_HOURS, VM_NAME_PREFIX, VM_NAME_PREFIX_LEGACY};
use crate::error::{AppError, Result};
use crate::models::prelude::*;
use crate::models::proxy_pool::ProxyStatus;
use crate::models::vm_instance::{ProxyKind, VmStatus};
use crate::services::{proxy_pool, ssh};
use crate::state::{AppState, DbConn};

/// Grace window between the token rewrite and the destruction of the old
/// VMs in the synchronous rotation path, letting in-flight requests drain.
pub const REPLACE_DRAIN_GRACE: Duration = Duration::from_secs(70);

// Gates the aged-VM cleanup to one concurrent pass.
static CLEANUP_RUNNING: AtomicBool = AtomicBool::new(false);

// ============================================================================
// Params / results
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateVmParam {
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub machine_type: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub proxy_type: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateVmResult {
    pub vm_id: String,
    pub vm_name: String,
    pub external_ip: String,
    pub proxy: String,
    pub ssh_connection: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub msg: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteVmResult {
    pub success: bool,
    pub message: String,
    pub vm_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListVmParam {
    #[serde(default)]
    pub status: Option<i32>,
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ListVmResult {
    pub total: u64,
    pub page: u64,
    pub size: u64,
    pub items: Vec<vm_instance::Model>,
}

#[derive(Debug, Serialize)]
pub struct RefreshVmIpResult {
    pub vm_id: String,
    pub external_ip: String,
    pub updated: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchCreateVmParam {
    #[serde(default)]
    pub num: usize,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub machine_type: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub proxy_type: String,
}

#[derive(Debug, Default, Serialize)]
pub struct BatchCreateVmResult {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub results: Vec<CreateVmResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchDeleteVmParam {
    #[serde(default)]
    pub vm_list: Vec<String>,
    /// Used only when `vm_list` is empty.
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Default, Serialize)]
pub struct BatchDeleteVmResult {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub results: Vec<DeleteVmResult>,
}

// ============================================================================
// Naming and validation
// ============================================================================

// Lowercase start, charset [a-z0-9-], no trailing hyphen, at most 50 chars
// (leaving room for the name prefix and timestamp).
static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z](?:[a-z0-9-]{0,48}[a-z0-9])?$").expect("static regex"));

/// Validate a VM tag against the provider naming rules. Empty tags pass.
pub fn validate_vm_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Ok(());
    }
    if tag.len() > 50 {
        return Err(AppError::BadRequest(format!(
            "tag must be at most 50 characters, got {}",
            tag.len()
        )));
    }
    if !TAG_RE.is_match(tag) {
        return Err(AppError::BadRequest(
            "tag must start with a lowercase letter, contain only lowercase letters, \
             digits and hyphens, and not end with a hyphen"
                .to_string(),
        ));
    }
    Ok(())
}

/// Whether this VM name belongs to the controller's namespace. Destructive
/// reconciliation ignores everything else.
pub fn is_gatc_vm(vm_name: &str) -> bool {
    vm_name.starts_with(VM_NAME_PREFIX) || vm_name.starts_with(VM_NAME_PREFIX_LEGACY)
}

/// Collapse the wire proxy-kind value (including aliases) with the socks5
/// default for empty or unknown input.
pub fn resolve_proxy_kind(raw: &str) -> ProxyKind {
    ProxyKind::parse(raw).unwrap_or(ProxyKind::Socks5)
}

fn generate_random_string(length: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

fn generate_proxy_credentials() -> (String, String) {
    (
        format!("gatc{}", generate_random_string(6)),
        generate_random_string(12),
    )
}

fn build_vm_name(kind: ProxyKind, tag: &str) -> String {
    format!(
        "{}-{}-{}-{}",
        VM_NAME_PREFIX,
        kind,
        tag.to_lowercase(),
        Utc::now().format("%m%d%H%M%S")
    )
}

/// The would-be name prefix for a (kind, tag) batch; used to refuse
/// accidental double-provisioning.
pub fn batch_name_prefix(kind: ProxyKind, tag: &str) -> String {
    format!("{}-{}-{}-", VM_NAME_PREFIX, kind, tag.to_lowercase())
}

/// Kind-specific routable proxy address for a freshly created VM.
pub fn build_proxy_address(kind: ProxyKind, external_ip: &str, user: &str, pass: &str) -> String {
    match kind {
        ProxyKind::TinyProxy => format!("http://{}:8080", external_ip),
        ProxyKind::HttpPath => format!("http://{}:1081/px", external_ip),
        ProxyKind::Socks5 => format!("{}:{}@{}:1080", user, pass, external_ip),
    }
}

/// Canonical pool form of an http-path proxy: the VM's proxy without the
/// `/px` suffix.
pub fn pool_proxy_form(vm_proxy: &str) -> &str {
    vm_proxy.strip_suffix("/px").unwrap_or(vm_proxy)
}

// ============================================================================
// Row helpers
// ============================================================================

pub async fn get_by_vm_id(db: &DbConn, vm_id: &str) -> Result<Option<vm_instance::Model>> {
    Ok(VmInstance::find()
        .filter(vm_instance::Column::VmId.eq(vm_id))
        .one(db)
        .await?)
}

pub async fn get_by_proxy(db: &DbConn, proxy: &str) -> Result<Option<vm_instance::Model>> {
    Ok(VmInstance::find()
        .filter(vm_instance::Column::Proxy.eq(proxy))
        .one(db)
        .await?)
}

pub async fn update_status(db: &DbConn, vm_id: &str, status: VmStatus) -> Result<()> {
    VmInstance::update_many()
        .col_expr(vm_instance::Column::Status, Expr::value(status))
        .col_expr(vm_instance::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(vm_instance::Column::VmId.eq(vm_id))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn batch_update_status(db: &DbConn, vm_ids: &[String], status: VmStatus) -> Result<u64> {
    if vm_ids.is_empty() {
        return Ok(0);
    }
    let res = VmInstance::update_many()
        .col_expr(vm_instance::Column::Status, Expr::value(status))
        .col_expr(vm_instance::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(vm_instance::Column::VmId.is_in(vm_ids.to_vec()))
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}

/// Non-deleted VMs whose names start with `prefix`.
pub async fn get_by_prefix(
    db: &DbConn,
    prefix: &str,
    limit: Option<u64>,
) -> Result<Vec<vm_instance::Model>> {
    let mut query = VmInstance::find()
        .filter(vm_instance::Column::VmId.starts_with(prefix))
        .filter(vm_instance::Column::Status.ne(VmStatus::Deleted));
    if let Some(limit) = limit {
        query = query.limit(limit);
    }
    Ok(query.all(db).await?)
}

/// All non-deleted VMs.
pub async fn get_active_vms(db: &DbConn) -> Result<Vec<vm_instance::Model>> {
    Ok(VmInstance::find()
        .filter(vm_instance::Column::Status.ne(VmStatus::Deleted))
        .all(db)
        .await?)
}

/// Running VMs only.
pub async fn get_running_vms(db: &DbConn) -> Result<Vec<vm_instance::Model>> {
    Ok(VmInstance::find()
        .filter(vm_instance::Column::Status.eq(VmStatus::Running))
        .all(db)
        .await?)
}

// ============================================================================
// Create / delete / read
// ============================================================================

pub async fn create_vm(state: &AppState, param: &CreateVmParam) -> Result<CreateVmResult> {
    validate_vm_tag(&param.tag)?;

    let zone = if param.zone.is_empty() {
        CONFIG.gcp.default_zone.clone()
    } else {
        param.zone.clone()
    };
    let machine_type = if param.machine_type.is_empty() {
        CONFIG.gcp.default_machine_type.clone()
    } else {
        param.machine_type.clone()
    };
    let kind = resolve_proxy_kind(&param.proxy_type);

    ssh::ensure_ssh_keys()?;
    state.gcp.activate_service_account().await?;

    let pub_key = ssh::ssh_pub_key_content()?;
    let vm_name = build_vm_name(kind, &param.tag);
    let (proxy_user, proxy_pass) = generate_proxy_credentials();

    let script = match kind {
        ProxyKind::TinyProxy => &CONFIG.gcp.startup_script_tinyproxy,
        ProxyKind::HttpPath => &CONFIG.gcp.startup_script_http_path,
        ProxyKind::Socks5 => &CONFIG.gcp.startup_script_socks5,
    };

    state
        .gcp
        .create_instance(
            &vm_name,
            &zone,
            &machine_type,
            &pub_key,
            &proxy_user,
            &proxy_pass,
            script,
        )
        .await?;

    // The NAT address can lag instance creation; retry with growing waits.
    let mut external_ip = "pending".to_string();
    for attempt in 0..3u64 {
        tokio::time::sleep(Duration::from_secs(attempt * 10)).await;
        match state.gcp.get_external_ip(&vm_name, &zone).await {
            Ok(ip) => {
                tracing::info!(ip = %ip, attempt, "Got external IP");
                external_ip = ip;
                break;
            }
            Err(e) => {
                tracing::info!(error = %e, attempt, "Failed to get external IP, will retry");
            }
        }
    }
    if external_ip == "pending" {
        tracing::info!(vm_id = %vm_name, "VM created but external IP still pending");
    }

    let proxy = build_proxy_address(kind, &external_ip, &proxy_user, &proxy_pass);

    let now = Utc::now();
    let row = vm_instance::ActiveModel {
        vm_id: Set(vm_name.clone()),
        vm_name: Set(vm_name.clone()),
        zone: Set(zone),
        machine_type: Set(machine_type),
        external_ip: Set(external_ip.clone()),
        internal_ip: Set(String::new()),
        proxy: Set(proxy.clone()),
        proxy_type: Set(kind),
        ssh_user: Set("gatc".to_string()),
        ssh_key_content: Set(String::new()),
        status: Set(VmStatus::Running),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    if let Err(e) = row.insert(&state.db).await {
        tracing::error!(error = %e, vm_id = %vm_name, "Failed to persist VM, but VM was created");
    }

    Ok(CreateVmResult {
        vm_id: vm_name.clone(),
        vm_name,
        external_ip: external_ip.clone(),
        proxy,
        ssh_connection: format!("ssh -i {} gatc@{}", CONFIG.gcp.ssh_key_path, external_ip),
        msg: String::new(),
    })
}

pub async fn delete_vm(state: &AppState, vm_id: &str) -> Result<DeleteVmResult> {
    let Some(vm) = get_by_vm_id(&state.db, vm_id).await? else {
        return Err(AppError::NotFound(format!("VM not found: {}", vm_id)));
    };

    // Provider delete failures are logged but do not block the soft delete:
    // the aged cleanup converges on any leftover instance.
    if let Err(e) = state.gcp.delete_instance(vm_id, &vm.zone).await {
        tracing::error!(error = %e, vm_id, "Failed to delete VM at provider");
    }

    update_status(&state.db, vm_id, VmStatus::Deleted).await?;

    Ok(DeleteVmResult {
        success: true,
        message: "VM deleted successfully".to_string(),
        vm_id: vm_id.to_string(),
    })
}

pub async fn list_vms(db: &DbConn, param: &ListVmParam) -> Result<ListVmResult> {
    let page = param.page.filter(|p| *p > 0).unwrap_or(1);
    let size = param
        .size
        .filter(|s| *s > 0 && *s <= 100)
        .unwrap_or(10);

    let mut query = VmInstance::find();
    if let Some(status) = param.status.filter(|s| *s > 0) {
        query = query.filter(vm_instance::Column::Status.eq(status));
    }

    let total = query.clone().count(db).await?;
    let items = query
        .order_by_desc(vm_instance::Column::CreatedAt)
        .offset((page - 1) * size)
        .limit(size)
        .all(db)
        .await?;

    Ok(ListVmResult {
        total,
        page,
        size,
        items,
    })
}

pub async fn get_vm(db: &DbConn, vm_id: &str) -> Result<vm_instance::Model> {
    get_by_vm_id(db, vm_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("VM not found: {}", vm_id)))
}

pub async fn refresh_vm_ip(state: &AppState, vm_id: &str) -> Result<RefreshVmIpResult> {
    let vm = get_vm(&state.db, vm_id).await?;

    let new_ip = match state.gcp.get_external_ip(&vm.vm_id, &vm.zone).await {
        Ok(ip) => ip,
        Err(e) => {
            tracing::error!(error = %e, vm_id, "Failed to refresh external IP");
            return Ok(RefreshVmIpResult {
                vm_id: vm_id.to_string(),
                external_ip: vm.external_ip,
                updated: false,
            });
        }
    };

    let updated = new_ip != vm.external_ip;
    if updated {
        let old_ip = vm.external_ip.clone();
        let mut am: vm_instance::ActiveModel = vm.into();
        am.external_ip = Set(new_ip.clone());
        am.updated_at = Set(Utc::now());
        am.update(&state.db).await?;
        tracing::info!(vm_id, new_ip = %new_ip, old_ip = %old_ip, "VM external IP updated");
    }

    Ok(RefreshVmIpResult {
        vm_id: vm_id.to_string(),
        external_ip: new_ip,
        updated,
    })
}

// ============================================================================
// Batch create / delete
// ============================================================================

pub async fn batch_create_vm(
    state: &AppState,
    param: &BatchCreateVmParam,
) -> Result<BatchCreateVmResult> {
    if param.num == 0 {
        return Err(AppError::BadRequest("num must be greater than 0".to_string()));
    }
    if param.num > 100 {
        return Err(AppError::BadRequest("num cannot exceed 100".to_string()));
    }

    let kind = resolve_proxy_kind(&param.proxy_type);

    // Same-prefix precondition: a tag that already has live VMs means either
    // a double submission or a stale batch; the caller must pick a new tag.
    let prefix = batch_name_prefix(kind, &param.tag);
    let existing = get_by_prefix(&state.db, &prefix, Some(1)).await?;
    if !existing.is_empty() {
        return Err(AppError::BadRequest(format!(
            "VMs with prefix {} already exist; do not re-create, or retry with a new tag",
            prefix
        )));
    }

    let mut result = BatchCreateVmResult {
        total: param.num,
        ..Default::default()
    };
    result
        .results
        .resize_with(param.num, CreateVmResult::default);

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..param.num {
        let state = state.clone();
        let create_param = CreateVmParam {
            zone: param.zone.clone(),
            machine_type: param.machine_type.clone(),
            tag: format!("{}-{}", param.tag, i),
            proxy_type: param.proxy_type.clone(),
        };
        tasks.spawn(async move { (i, create_vm(&state, &create_param).await) });
    }

    while let Some(joined) = tasks.join_next().await {
        let Ok((index, outcome)) = joined else {
            result.failed += 1;
            continue;
        };
        match outcome {
            Ok(vm) => {
                result.success += 1;
                result.results[index] = vm;
            }
            Err(e) => {
                tracing::error!(error = %e, index, "Batch create VM failed");
                result.failed += 1;
            }
        }
    }

    tracing::info!(
        total = result.total,
        success = result.success,
        failed = result.failed,
        "Batch create VMs completed"
    );
    Ok(result)
}

pub async fn batch_delete_vm(
    state: &AppState,
    param: &BatchDeleteVmParam,
) -> Result<BatchDeleteVmResult> {
    let vm_ids: Vec<String> = if !param.vm_list.is_empty() {
        param.vm_list.clone()
    } else if !param.prefix.is_empty() {
        let limit = param.limit.filter(|l| *l > 0).unwrap_or(1000);
        get_by_prefix(&state.db, &param.prefix, Some(limit))
            .await?
            .into_iter()
            .map(|vm| vm.vm_id)
            .collect()
    } else {
        return Err(AppError::BadRequest(
            "either vm_list or prefix must be provided".to_string(),
        ));
    };

    let mut result = BatchDeleteVmResult {
        total: vm_ids.len(),
        ..Default::default()
    };
    if vm_ids.is_empty() {
        return Ok(result);
    }

    let mut tasks = tokio::task::JoinSet::new();
    for vm_id in vm_ids {
        let state = state.clone();
        tasks.spawn(async move {
            let outcome = delete_vm(&state, &vm_id).await;
            (vm_id, outcome)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let Ok((vm_id, outcome)) = joined else {
            result.failed += 1;
            continue;
        };
        match outcome {
            Ok(r) => {
                result.success += 1;
                result.results.push(r);
            }
            Err(e) => {
                tracing::error!(error = %e, vm_id = %vm_id, "Batch delete VM failed");
                result.failed += 1;
                result.results.push(DeleteVmResult {
                    success: false,
                    message: e.to_string(),
                    vm_id,
                });
            }
        }
    }

    tracing::info!(
        total = result.total,
        success = result.success,
        failed = result.failed,
        "Batch delete VMs completed"
    );
    Ok(result)
}

// ============================================================================
// Reconciliation
// ============================================================================

/// Insert provider-side RUNNING instances missing from the store.
///
/// The reverse direction is deliberately disabled: a transient failure of
/// the provider list must not cascade into mass soft-deletions.
pub async fn sync_vms_with_provider(state: &AppState) -> Result<usize> {
    tracing::info!("Starting VM sync with provider");

    let provider_instances = state.gcp.list_instances().await?;
    let db_instances = get_active_vms(&state.db).await?;

    let known: std::collections::HashSet<&str> = db_instances
        .iter()
        .filter(|vm| is_gatc_vm(&vm.vm_id))
        .map(|vm| vm.vm_id.as_str())
        .collect();

    let mut inserted = 0usize;
    for inst in provider_instances
        .iter()
        .filter(|i| is_gatc_vm(&i.name) && !known.contains(i.name.as_str()))
    {
        if inst.status != "RUNNING" {
            continue;
        }
        let now = Utc::now();
        let row = vm_instance::ActiveModel {
            vm_id: Set(inst.name.clone()),
            vm_name: Set(inst.name.clone()),
            zone: Set(inst.zone.clone()),
            machine_type: Set(inst.machine_type.clone()),
            external_ip: Set(inst.external_ip.clone()),
            internal_ip: Set(inst.internal_ip.clone()),
            proxy: Set(String::new()),
            proxy_type: Set(ProxyKind::Socks5),
            ssh_user: Set("gatc".to_string()),
            ssh_key_content: Set(String::new()),
            status: Set(VmStatus::Running),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };
        match row.insert(&state.db).await {
            Ok(_) => inserted += 1,
            Err(e) => tracing::error!(error = %e, vm_id = %inst.name, "Failed to insert VM during sync"),
        }
    }

    tracing::info!(
        provider_total = provider_instances.len(),
        store_total = db_instances.len(),
        inserted,
        "VM sync with provider completed"
    );
    Ok(inserted)
}

/// Delete VMs older than the configured horizon. No-op unless the opt-in
/// env horizon is set; at most one pass runs at a time.
pub async fn cleanup_old_vms(state: &AppState) {
    if CLEANUP_RUNNING
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        tracing::info!("VM cleanup already running, skipping this execution");
        return;
    }
    let _reset = scopeguard_reset();

    let Some(hours) = CONFIG.gcp.clean_old_vm_exceed_hours else {
        tracing::info!("Aged-VM cleanup disabled, skipping");
        return;
    };

    tracing::info!(hours, "Starting cleanup of old VMs");
    let cutoff = Utc::now() - chrono::Duration::hours(hours);

    let vms = match VmInstance::find()
        .filter(vm_instance::Column::CreatedAt.lt(cutoff))
        .filter(vm_instance::Column::Status.ne(VmStatus::Deleted))
        .all(&state.db)
        .await
    {
        Ok(vms) => vms,
        Err(e) => {
            tracing::error!(error = %e, "Failed to query old VMs");
            return;
        }
    };

    if vms.is_empty() {
        tracing::info!("No old VMs to clean up");
        return;
    }

    let mut deleted = 0usize;
    for vm in vms {
        if !is_gatc_vm(&vm.vm_id) {
            tracing::info!(vm_id = %vm.vm_id, "Skipping non-gatc VM during cleanup");
            continue;
        }
        if let Err(e) = state.gcp.delete_instance(&vm.vm_id, &vm.zone).await {
            tracing::error!(error = %e, vm_id = %vm.vm_id, "Failed to delete old VM at provider");
            continue;
        }
        if let Err(e) = update_status(&state.db, &vm.vm_id, VmStatus::Deleted).await {
            tracing::error!(error = %e, vm_id = %vm.vm_id, "Failed to mark old VM deleted");
            continue;
        }
        deleted += 1;
        tracing::info!(vm_id = %vm.vm_id, "Deleted old VM");
    }

    tracing::info!(processed = deleted, "Cleanup of old VMs completed");
}

// Clears the cleanup gate when the pass returns on any path.
fn scopeguard_reset() -> impl Drop {
    struct Reset;
    impl Drop for Reset {
        fn drop(&mut self) {
            CLEANUP_RUNNING.store(false, Ordering::SeqCst);
        }
    }
    Reset
}

/// Pending-delete VMs whose updated_at is older than `cutoff`.
pub async fn get_pending_delete_before(
    db: &DbConn,
    cutoff: chrono::DateTime<Utc>,
) -> Result<Vec<vm_instance::Model>> {
    Ok(VmInstance::find()
        .filter(vm_instance::Column::Status.eq(VmStatus::PendingDelete))
        .filter(vm_instance::Column::UpdatedAt.lt(cutoff))
        .all(db)
        .await?)
}

/// Destroy VMs that have sat in PendingDelete past the retention horizon.
/// This is the second half of the V2 replace protocol.
pub async fn cleanup_pending_delete_vms(state: &AppState) {
    tracing::info!("Starting cleanup of pending-delete VMs");

    let cutoff = Utc::now() - chrono::Duration::hours(PENDING_DELETE_RETENTION_HOURS);
    let vms = match get_pending_delete_before(&state.db, cutoff).await {
        Ok(vms) => vms,
        Err(e) => {
            tracing::error!(error = %e, "Failed to query pending-delete VMs");
            return;
        }
    };

    if vms.is_empty() {
        tracing::info!("No pending-delete VMs to clean up");
        return;
    }

    let param = BatchDeleteVmParam {
        vm_list: vms.into_iter().map(|vm| vm.vm_id).collect(),
        ..Default::default()
    };
    match batch_delete_vm(state, &param).await {
        Ok(res) => tracing::info!(
            total = res.total,
            success = res.success,
            failed = res.failed,
            "Pending-delete cleanup completed"
        ),
        Err(e) => tracing::error!(error = %e, "Pending-delete cleanup failed"),
    }
}

// ============================================================================
// Replace-proxy protocols
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplaceProxyResourceParam {
    #[serde(flatten)]
    pub batch: BatchCreateVmParam,
}

#[derive(Debug, Default, Serialize)]
pub struct ReplaceProxyResourceResult {
    pub new_vms_created: usize,
    pub create_vms: Option<BatchCreateVmResult>,
    pub new_proxies_added: usize,
    pub old_proxies_disabled: usize,
    pub tokens_updated: u64,
    pub async_deleted_vm_ids: Vec<String>,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub warn: String,
}

fn require_http_path_kind(raw: &str) -> Result<()> {
    match ProxyKind::parse(raw) {
        Some(ProxyKind::HttpPath) => Ok(()),
        _ => Err(AppError::BadRequest(format!(
            "proxy_type must be 'server' or 'httpProxyServer', got: {}",
            raw
        ))),
    }
}

/// Rewrite the base_url prefix of every token routed through `old_proxy`
/// (canonical pool form) to route through `new_proxy` instead. Returns the
/// number of rows rewritten.
pub async fn replace_token_base_url(
    db: &DbConn,
    old_proxy: &str,
    new_proxy: &str,
) -> Result<u64> {
    let old_prefix = format!("{}/px", old_proxy);
    let new_prefix = format!("{}/px", new_proxy);

    let res = OfficialToken::update_many()
        .col_expr(
            official_token::Column::BaseUrl,
            Expr::cust_with_values("REPLACE(base_url, ?, ?)", [old_prefix.clone(), new_prefix]),
        )
        .col_expr(official_token::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(official_token::Column::BaseUrl.starts_with(old_prefix.as_str()))
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}

/// Synchronous rotation (V1): create N replacements, retire the last N
/// Active pool entries, rewrite token routing pairwise, then destroy the old
/// VMs after a drain grace.
pub async fn replace_proxy_resource(
    state: &AppState,
    param: &ReplaceProxyResourceParam,
) -> Result<ReplaceProxyResourceResult> {
    require_http_path_kind(&param.batch.proxy_type)?;

    let mut result = ReplaceProxyResourceResult::default();

    // Step 1: provision the replacements.
    tracing::info!(num = param.batch.num, "ReplaceProxy step 1: creating new VMs");
    let created = batch_create_vm(state, &param.batch).await?;
    if created.success == 0 {
        return Err(AppError::Upstream("all VM creations failed".to_string()));
    }
    result.new_vms_created = created.success;

    // Step 2: the outgoing set is the newest N Active entries of this kind.
    let old_entries = proxy_pool::last_batch_by_kind(
        &state.db,
        ProxyKind::HttpPath,
        ProxyStatus::Active,
        param.batch.num as u64,
    )
    .await?;
    tracing::info!(count = old_entries.len(), "ReplaceProxy step 2: found old proxies");

    // Step 3: tombstone the old entries before inserting new ones; the
    // provider can hand a recycled IP to a new VM, and the (proxy, status)
    // unique index must not trip on the transient overlap.
    let old_ids: Vec<i64> = old_entries.iter().map(|p| p.id).collect();
    if !old_ids.is_empty() {
        proxy_pool::batch_update_status(&state.db, &old_ids, ProxyStatus::Deleted).await?;
        result.old_proxies_disabled = old_ids.len();
    }

    // Step 4: insert pool entries for the successfully created VMs.
    let mut new_proxies: Vec<String> = Vec::new();
    let mut inserts = Vec::new();
    for vm in created.results.iter().filter(|r| !r.vm_id.is_empty()) {
        let canonical = pool_proxy_form(&vm.proxy).to_string();
        if canonical.is_empty() {
            result
                .warn
                .push_str(&format!("\tvm {} proxy illegal, skip", vm.vm_id));
            continue;
        }
        inserts.push(proxy_pool::new_from_vm_entry(&canonical, ProxyKind::HttpPath));
        new_proxies.push(canonical);
    }
    proxy_pool::batch_create(&state.db, inserts).await?;
    result.new_proxies_added = new_proxies.len();
    result.create_vms = Some(created);

    // Step 5: pairwise token rewrite; each pair commits independently and a
    // failed pair is skipped, the system converges on re-invocation.
    let pairs = old_entries.len().min(new_proxies.len());
    for i in 0..pairs {
        match replace_token_base_url(&state.db, &old_entries[i].proxy, &new_proxies[i]).await {
            Ok(affected) => {
                result.tokens_updated += affected;
                tracing::info!(
                    old = %old_entries[i].proxy,
                    new = %new_proxies[i],
                    affected,
                    "ReplaceProxy rewrote token routing"
                );
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    old = %old_entries[i].proxy,
                    new = %new_proxies[i],
                    "ReplaceProxy token rewrite failed, skipping pair"
                );
            }
        }
    }

    // Step 6: resolve the old pool entries back to VMs and destroy them
    // after the drain grace, off the request path.
    let mut to_delete = Vec::new();
    for entry in &old_entries {
        let with_suffix = format!("{}/px", entry.proxy);
        match get_by_proxy(&state.db, &with_suffix).await {
            Ok(Some(vm)) => to_delete.push(vm.vm_id),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, proxy = %with_suffix, "Failed to find VM by proxy")
            }
        }
    }
    result.async_deleted_vm_ids = to_delete.clone();

    if !to_delete.is_empty() {
        let state = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REPLACE_DRAIN_GRACE).await;
            let param = BatchDeleteVmParam {
                vm_list: to_delete,
                ..Default::default()
            };
            match batch_delete_vm(&state, &param).await {
                Ok(res) => tracing::info!(
                    success = res.success,
                    failed = res.failed,
                    "ReplaceProxy old VMs deleted"
                ),
                Err(e) => tracing::error!(error = %e, "ReplaceProxy failed to delete old VMs"),
            }
        });
    }

    result.message = format!(
        "proxy rotation done: {} VMs created, {} proxies added, {} proxies retired, \
         {} tokens rewritten, {} old VMs scheduled for deletion",
        result.new_vms_created,
        result.new_proxies_added,
        result.old_proxies_disabled,
        result.tokens_updated,
        result.async_deleted_vm_ids.len()
    );
    Ok(result)
}

#[derive(Debug, Default, Serialize)]
pub struct ReplaceProxyResourceV2Result {
    pub marked_pending_delete: usize,
    pub new_vms_created: usize,
    pub create_vms: Option<BatchCreateVmResult>,
    pub message: String,
}

/// Deferred rotation (V2): mark the outgoing VMs PendingDelete, create the
/// replacements, and let the pending-delete reconciler do the destruction
/// after the retention horizon.
pub async fn replace_proxy_resource_v2(
    state: &AppState,
    param: &ReplaceProxyResourceParam,
) -> Result<ReplaceProxyResourceV2Result> {
    require_http_path_kind(&param.batch.proxy_type)?;

    let zone = if param.batch.zone.is_empty() {
        CONFIG.gcp.default_zone.clone()
    } else {
        param.batch.zone.clone()
    };
    let machine_type = if param.batch.machine_type.is_empty() {
        CONFIG.gcp.default_machine_type.clone()
    } else {
        param.batch.machine_type.clone()
    };

    let mut result = ReplaceProxyResourceV2Result::default();

    // Step 1: mark up to N matching Running VMs for deferred destruction.
    let old_vms = VmInstance::find()
        .filter(vm_instance::Column::Status.eq(VmStatus::Running))
        .filter(vm_instance::Column::Zone.eq(zone))
        .filter(vm_instance::Column::MachineType.eq(machine_type))
        .filter(vm_instance::Column::ProxyType.eq(ProxyKind::HttpPath))
        .limit(param.batch.num as u64)
        .all(&state.db)
        .await?;

    if !old_vms.is_empty() {
        let vm_ids: Vec<String> = old_vms.iter().map(|vm| vm.vm_id.clone()).collect();
        batch_update_status(&state.db, &vm_ids, VmStatus::PendingDelete).await?;
        result.marked_pending_delete = vm_ids.len();
        tracing::info!(count = vm_ids.len(), "ReplaceProxyV2 marked VMs pending delete");
    }

    // Step 2: provision the replacements.
    let created = batch_create_vm(state, &param.batch).await?;
    if created.success == 0 {
        return Err(AppError::Upstream("all VM creations failed".to_string()));
    }
    result.new_vms_created = created.success;
    result.create_vms = Some(created);
    result.message = format!(
        "rotation scheduled: {} VMs marked pending delete, {} VMs created",
        result.marked_pending_delete, result.new_vms_created
    );

    Ok(result)
}

// ============================================================================
// Pool convergence
// ============================================================================

#[derive(Debug, Default, Serialize)]
pub struct SyncProxyPoolFromVmsRes {
    pub old_from_vm_proxy_count: usize,
    pub running_vm_count: usize,
    pub del_proxies_count: usize,
    pub del_proxies: Vec<i64>,
    pub add_proxy_count: usize,
    pub add_proxies: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub err_msg: String,
}

/// Converge the pool's from-VM entries to the multiset of Running http-path
/// VMs: entries with no backing VM are tombstoned, VMs with no entry get
/// one. Tombstoning commits before the inserts so a recycled address never
/// collides on the (proxy, status) unique index.
pub async fn sync_proxy_pool_from_vms(db: &DbConn) -> Result<SyncProxyPoolFromVmsRes> {
    tracing::info!("Starting proxy pool sync from VMs");

    let mut res = SyncProxyPoolFromVmsRes::default();

    let pool_entries = proxy_pool::list_from_vm(db).await?;
    res.old_from_vm_proxy_count = pool_entries.len();

    let running = get_running_vms(db).await?;
    res.running_vm_count = running.len();

    // Canonical proxy -> seen flag, http-path VMs only.
    let mut vm_proxies: std::collections::HashMap<String, bool> = running
        .iter()
        .filter(|vm| vm.proxy_type == ProxyKind::HttpPath && !vm.proxy.is_empty())
        .map(|vm| (pool_proxy_form(&vm.proxy).to_string(), false))
        .collect();

    let mut to_delete: Vec<i64> = Vec::new();
    for entry in pool_entries
        .iter()
        .filter(|e| e.proxy_type == ProxyKind::HttpPath)
    {
        match vm_proxies.get_mut(&entry.proxy) {
            Some(seen) => *seen = true,
            None => to_delete.push(entry.id),
        }
    }
    res.del_proxies_count = to_delete.len();
    res.del_proxies = to_delete.clone();

    if !to_delete.is_empty() {
        if let Err(e) = proxy_pool::batch_update_status(db, &to_delete, ProxyStatus::Deleted).await
        {
            res.err_msg = format!("failed to tombstone stale proxies: {}", e);
            return Err(e);
        }
    }

    let mut inserts = Vec::new();
    for (proxy, seen) in &vm_proxies {
        if !*seen {
            inserts.push(proxy_pool::new_from_vm_entry(proxy, ProxyKind::HttpPath));
            res.add_proxies.push(proxy.clone());
        }
    }
    if !inserts.is_empty() {
        if let Err(e) = proxy_pool::batch_create(db, inserts).await {
            res.err_msg = format!("failed to insert new proxies: {}", e);
            return Err(e);
        }
    }
    res.add_proxy_count = res.add_proxies.len();

    tracing::info!(
        deleted = res.del_proxies_count,
        inserted = res.add_proxy_count,
        "Proxy pool sync completed"
    );
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_max_length_with_trailing_digit() {
        let tag = format!("a{}9", "b".repeat(48));
        assert_eq!(tag.len(), 50);
        assert!(validate_vm_tag(&tag).is_ok());
    }

    #[test]
    fn test_tag_over_max_length_rejected() {
        let tag = format!("a{}9", "b".repeat(49));
        assert_eq!(tag.len(), 51);
        assert!(validate_vm_tag(&tag).is_err());
    }

    #[test]
    fn test_tag_rules() {
        assert!(validate_vm_tag("").is_ok());
        assert!(validate_vm_tag("a").is_ok());
        assert!(validate_vm_tag("a-1").is_ok());
        assert!(validate_vm_tag("proxy-batch-7").is_ok());

        assert!(validate_vm_tag("1abc").is_err());
        assert!(validate_vm_tag("Abc").is_err());
        assert!(validate_vm_tag("abc-").is_err());
        assert!(validate_vm_tag("ab_c").is_err());
    }

    #[test]
    fn test_proxy_kind_aliases_collapse() {
        assert_eq!(resolve_proxy_kind("server"), ProxyKind::HttpPath);
        assert_eq!(resolve_proxy_kind("httpProxyServer"), ProxyKind::HttpPath);
        assert_eq!(resolve_proxy_kind("tinyproxy"), ProxyKind::TinyProxy);
        assert_eq!(resolve_proxy_kind("socks5"), ProxyKind::Socks5);
        assert_eq!(resolve_proxy_kind(""), ProxyKind::Socks5);
        assert_eq!(resolve_proxy_kind("bogus"), ProxyKind::Socks5);
    }

    #[test]
    fn test_is_gatc_vm_gate() {
        assert!(is_gatc_vm("gatcvm-server-x-0101"));
        assert!(is_gatc_vm("gatc-vm-old-style"));
        assert!(!is_gatc_vm("prod-db-1"));
        assert!(!is_gatc_vm(""));
    }

    #[test]
    fn test_proxy_address_per_kind() {
        assert_eq!(
            build_proxy_address(ProxyKind::Socks5, "1.2.3.4", "u", "p"),
            "u:p@1.2.3.4:1080"
        );
        assert_eq!(
            build_proxy_address(ProxyKind::TinyProxy, "1.2.3.4", "u", "p"),
            "http://1.2.3.4:8080"
        );
        assert_eq!(
            build_proxy_address(ProxyKind::HttpPath, "1.2.3.4", "u", "p"),
            "http://1.2.3.4:1081/px"
        );
    }

    #[test]
    fn test_pool_proxy_form_trims_suffix_once() {
        assert_eq!(pool_proxy_form("http://1.2.3.4:1081/px"), "http://1.2.3.4:1081");
        assert_eq!(pool_proxy_form("http://1.2.3.4:8080"), "http://1.2.3.4:8080");
    }

    #[test]
    fn test_batch_name_prefix() {
        assert_eq!(
            batch_name_prefix(ProxyKind::HttpPath, "Edge"),
            "gatcvm-server-edge-"
        );
    }

    #[test]
    fn test_proxy_credentials_shape() {
        let (user, pass) = generate_proxy_credentials();
        assert!(user.starts_with("gatc"));
        assert_eq!(user.len(), 10);
        assert_eq!(pass.len(), 12);
    }
}
