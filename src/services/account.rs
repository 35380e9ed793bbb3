//! Account registration and login orchestration
//!
//! Owns the start-registration / submit-auth-key pair: resolving or
//! provisioning the VM the email will log in on, probing the VM's existing
//! CLI credentials, and driving the interactive login session.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::CONFIG;
use crate::error::{AppError, Result};
use crate::models::gcp_account::AuthStatus;
use crate::models::prelude::*;
use crate::models::vm_instance::VmStatus;
use crate::services::login_session::AuthSession;
use crate::services::{ssh, vm};
use crate::state::{AppState, DbConn};

// ============================================================================
// Params / results
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRegistrationParam {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub proxy_type: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StartRegistrationResult {
    pub session_id: String,
    pub email: String,
    pub login_url: String,
    pub callback_url: String,
    pub vm_id: String,
    pub msg: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitAuthKeyParam {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub auth_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitAuthKeyResult {
    pub session_id: String,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub email: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListAccountParam {
    #[serde(default)]
    pub status: Option<i32>,
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ListAccountResult {
    pub total: u64,
    pub page: u64,
    pub size: u64,
    pub items: Vec<gcp_account::Model>,
}

// ============================================================================
// Session id
// ============================================================================

/// `sess___{unix}___{email with @ -> _}___{vm_id}`; the parts carry enough
/// to route a key back without any persistent lookup.
pub fn build_session_id(email: &str, vm_id: &str) -> String {
    format!(
        "sess___{}___{}___{}",
        Utc::now().timestamp(),
        email.replace('@', "_"),
        vm_id
    )
}

/// Recover the email from a session id. The encoded form replaced the one
/// `@` with `_`, so the last underscore is the separator to restore.
pub fn extract_email_from_session_id(session_id: &str) -> Option<String> {
    let parts: Vec<&str> = session_id.split("___").collect();
    if parts.len() < 4 {
        return None;
    }
    let encoded = parts[2];
    let (local, domain) = encoded.rsplit_once('_')?;
    Some(format!("{}@{}", local, domain))
}

// ============================================================================
// Session-record helpers
// ============================================================================

/// The per-email session record (the row with empty project_id).
pub async fn get_account_status(db: &DbConn, email: &str) -> Result<Option<gcp_account::Model>> {
    Ok(GcpAccount::find()
        .filter(gcp_account::Column::Email.eq(email))
        .filter(gcp_account::Column::ProjectId.eq(""))
        .one(db)
        .await?)
}

/// Create or update the session record for an email.
pub async fn upsert_account_status(
    db: &DbConn,
    email: &str,
    vm_id: &str,
    auth_status: AuthStatus,
    debug_info: &str,
) -> Result<()> {
    let now = Utc::now();
    match get_account_status(db, email).await? {
        Some(existing) => {
            let mut am: gcp_account::ActiveModel = existing.into();
            am.vm_id = Set(vm_id.to_string());
            am.auth_status = Set(auth_status);
            am.auth_debug_info = Set(debug_info.to_string());
            am.updated_at = Set(now);
            am.update(db).await?;
        }
        None => {
            let row = gcp_account::ActiveModel {
                email: Set(email.to_string()),
                project_id: Set(String::new()),
                vm_id: Set(vm_id.to_string()),
                auth_status: Set(auth_status),
                auth_debug_info: Set(debug_info.to_string()),
                official_token: Set(String::new()),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            };
            row.insert(db).await?;
        }
    }
    Ok(())
}

/// Point every account row of this email at a freshly provisioned VM.
pub async fn update_account_vm_info(
    db: &DbConn,
    email: &str,
    new_vm: &vm_instance::Model,
) -> Result<u64> {
    let res = GcpAccount::update_many()
        .col_expr(gcp_account::Column::VmId, Expr::value(new_vm.vm_id.clone()))
        .col_expr(
            gcp_account::Column::ProxyHint,
            Expr::value(new_vm.proxy.clone()),
        )
        .col_expr(gcp_account::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(gcp_account::Column::Email.eq(email))
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}

/// Mark a stale VM row Deleted and blank every account reference to it.
pub async fn clean_account_vm_id_tag(db: &DbConn, invalid_vm_id: &str) -> Result<()> {
    if invalid_vm_id.is_empty() {
        return Ok(());
    }

    vm::update_status(db, invalid_vm_id, VmStatus::Deleted).await?;

    GcpAccount::update_many()
        .col_expr(gcp_account::Column::VmId, Expr::value(String::new()))
        .col_expr(gcp_account::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(gcp_account::Column::VmId.eq(invalid_vm_id))
        .exec(db)
        .await?;

    tracing::info!(vm_id = invalid_vm_id, "cleared stale VM references");
    Ok(())
}

// ============================================================================
// Remote auth probe
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteAuthState {
    /// The target email is the active CLI account.
    Active,
    /// Present on the VM but not the active account.
    Inactive,
    /// Not authenticated on this VM at all.
    NotLogin,
}

/// Parse `gcloud auth list --format='value(account,status)'` output for the
/// target email. Service-account identities are skipped.
pub fn parse_auth_list(output: &str, email: &str) -> RemoteAuthState {
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(account), Some(status)) = (fields.next(), fields.next()) else {
            continue;
        };
        if account.contains("@developer.gserviceaccount.com") {
            continue;
        }
        if account == email {
            if status.eq_ignore_ascii_case("active") || status == "*" {
                return RemoteAuthState::Active;
            }
            return RemoteAuthState::Inactive;
        }
    }
    RemoteAuthState::NotLogin
}

/// Probe the target account's login state on the VM.
pub async fn check_target_account(
    vm: &vm_instance::Model,
    email: &str,
) -> Result<RemoteAuthState> {
    let output =
        ssh::run_remote_checked(vm, "gcloud auth list --format='value(account,status)'").await?;
    Ok(parse_auth_list(&output, email))
}

/// Make the target email the active CLI account on the VM.
pub async fn switch_to_account(vm: &vm_instance::Model, email: &str) -> Result<()> {
    ssh::run_remote_checked(vm, &format!("gcloud config set account {}", email)).await?;
    Ok(())
}

// ============================================================================
// Registration flow
// ============================================================================

/// Resolve the account's recorded VM if it is still usable. Returns the VM,
/// or `None` with the reason logged when a fresh VM is needed.
async fn resolve_existing_vm(
    state: &AppState,
    email: &str,
    vm_id: &str,
) -> Result<Option<vm_instance::Model>> {
    if vm_id.is_empty() {
        return Ok(None);
    }

    let Some(vm_row) = vm::get_by_vm_id(&state.db, vm_id).await? else {
        clean_account_vm_id_tag(&state.db, vm_id).await?;
        tracing::info!(email, vm_id, "recorded VM row missing, will create a new VM");
        return Ok(None);
    };

    if vm_row.status != VmStatus::Running {
        clean_account_vm_id_tag(&state.db, vm_id).await?;
        tracing::info!(email, vm_id, "recorded VM not running, will create a new VM");
        return Ok(None);
    }

    if !state.gcp.instance_exists(&vm_row.vm_id, &vm_row.zone).await {
        clean_account_vm_id_tag(&state.db, vm_id).await?;
        tracing::info!(email, vm_id, "recorded VM gone at provider, will create a new VM");
        return Ok(None);
    }

    Ok(Some(vm_row))
}

pub async fn start_registration(
    state: &AppState,
    param: &StartRegistrationParam,
) -> Result<StartRegistrationResult> {
    if param.email.is_empty() {
        return Err(AppError::BadRequest("no email".to_string()));
    }
    let email = param.email.as_str();

    // Reuse the recorded VM when possible, otherwise provision one.
    let recorded_vm_id = get_account_status(&state.db, email)
        .await?
        .map(|a| a.vm_id)
        .unwrap_or_default();

    let vm_row = match resolve_existing_vm(state, email, &recorded_vm_id).await? {
        Some(vm_row) => {
            tracing::info!(email, vm_id = %vm_row.vm_id, "using existing VM");
            vm_row
        }
        None => {
            tracing::info!(email, "creating a new VM for registration");
            let created = vm::create_vm(
                state,
                &vm::CreateVmParam {
                    proxy_type: param.proxy_type.clone(),
                    ..Default::default()
                },
            )
            .await?;
            let vm_row = vm::get_vm(&state.db, &created.vm_id).await?;

            if let Err(e) = update_account_vm_info(&state.db, email, &vm_row).await {
                tracing::error!(error = %e, email, "failed to update account VM info");
            }
            // Let the startup script bring sshd and gcloud up.
            tokio::time::sleep(Duration::from_secs(10)).await;
            vm_row
        }
    };

    let session_id = build_session_id(email, &vm_row.vm_id);
    let mut ret = StartRegistrationResult {
        session_id: session_id.clone(),
        email: email.to_string(),
        vm_id: vm_row.vm_id.clone(),
        ..Default::default()
    };

    // A fresh VM often refuses the first few probes while it boots.
    let mut probe = check_target_account(&vm_row, email).await;
    for _ in 0..6 {
        if probe.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        probe = check_target_account(&vm_row, email).await;
    }
    let auth_state = match probe {
        Ok(s) => s,
        Err(e) => {
            ret.msg = format!("failed to read login state: {}", e);
            return Ok(ret);
        }
    };

    match auth_state {
        RemoteAuthState::Active => {
            upsert_account_status(
                &state.db,
                email,
                &vm_row.vm_id,
                AuthStatus::LoggedIn,
                "account already logged in",
            )
            .await?;
            ret.msg = "account already logged in".to_string();
            return Ok(ret);
        }
        RemoteAuthState::Inactive => match switch_to_account(&vm_row, email).await {
            Ok(()) => {
                upsert_account_status(
                    &state.db,
                    email,
                    &vm_row.vm_id,
                    AuthStatus::LoggedIn,
                    "account switched",
                )
                .await?;
                ret.msg = "account exists, switched and logged in".to_string();
                return Ok(ret);
            }
            Err(e) => {
                upsert_account_status(
                    &state.db,
                    email,
                    &vm_row.vm_id,
                    AuthStatus::LoginFailed,
                    &format!("account switch failed: {}", e),
                )
                .await?;
                ret.msg = format!("account exists but switching failed: {}", e);
                return Ok(ret);
            }
        },
        RemoteAuthState::NotLogin => {
            tracing::info!(email, session_id = %session_id, "account absent, starting login");
        }
    }

    let session = AuthSession::open(&session_id, email, vm_row)?;
    state.sessions.insert(session.clone()).await?;

    match session.do_login().await {
        Ok(url) => {
            ret.login_url = url;
            ret.callback_url = format!(
                "{}/api/v1/account/submit-auth-key?session_id={}&auth_key={{auth key from the browser flow}}",
                CONFIG.callback_base_url, session_id
            );
            Ok(ret)
        }
        Err(e) => {
            state.sessions.remove(&session_id).await;
            ret.msg = format!("failed to get login url: {}", e);
            Ok(ret)
        }
    }
}

pub async fn submit_auth_key(
    state: &AppState,
    param: &SubmitAuthKeyParam,
) -> Result<SubmitAuthKeyResult> {
    tracing::info!(session_id = %param.session_id, "submitting auth key");

    let Some(email) = extract_email_from_session_id(&param.session_id) else {
        return Ok(SubmitAuthKeyResult {
            session_id: param.session_id.clone(),
            success: false,
            message: "invalid session id, could not extract email".to_string(),
            email: String::new(),
        });
    };

    let Some(session) = state.sessions.get(&param.session_id).await else {
        return Ok(SubmitAuthKeyResult {
            session_id: param.session_id.clone(),
            success: false,
            message: "session id not found".to_string(),
            email: String::new(),
        });
    };

    if let Err(e) = session.complete_login_token(&param.auth_key).await {
        return Ok(SubmitAuthKeyResult {
            session_id: param.session_id.clone(),
            success: false,
            message: format!("submitting auth key failed: {}", e),
            email: String::new(),
        });
    }

    // The CLI exited zero; verify the account actually went active.
    let status = check_target_account(&session.vm, &email).await?;
    if status == RemoteAuthState::Active {
        upsert_account_status(
            &state.db,
            &email,
            &session.vm.vm_id,
            AuthStatus::LoggedIn,
            "login succeeded",
        )
        .await?;
        return Ok(SubmitAuthKeyResult {
            session_id: param.session_id.clone(),
            success: true,
            message: "login succeeded".to_string(),
            email,
        });
    }

    Ok(SubmitAuthKeyResult {
        session_id: param.session_id.clone(),
        success: false,
        message: format!("unexpected login state: {:?}", status),
        email: String::new(),
    })
}

// ============================================================================
// Listing
// ============================================================================

pub async fn list_accounts(db: &DbConn, param: &ListAccountParam) -> Result<ListAccountResult> {
    let page = param.page.filter(|p| *p > 0).unwrap_or(1);
    let size = param.size.filter(|s| *s > 0 && *s <= 100).unwrap_or(10);

    let mut query = GcpAccount::find();
    if let Some(status) = param.status.filter(|s| *s > 0) {
        query = query.filter(gcp_account::Column::AuthStatus.eq(status));
    }

    let total = query.clone().count(db).await?;
    let items = query
        .offset((page - 1) * size)
        .limit(size)
        .all(db)
        .await?;

    Ok(ListAccountResult {
        total,
        page,
        size,
        items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_round_trip() {
        let id = build_session_id("user@example.com", "gatcvm-server-x-0101120000");
        assert!(id.starts_with("sess___"));
        assert_eq!(
            extract_email_from_session_id(&id).as_deref(),
            Some("user@example.com")
        );
    }

    #[test]
    fn test_session_id_round_trip_with_underscore_local_part() {
        let id = build_session_id("john_doe@example.com", "gatcvm-socks5-a-0101");
        assert_eq!(
            extract_email_from_session_id(&id).as_deref(),
            Some("john_doe@example.com")
        );
    }

    #[test]
    fn test_extract_email_rejects_malformed_ids() {
        assert!(extract_email_from_session_id("").is_none());
        assert!(extract_email_from_session_id("sess___123").is_none());
        assert!(extract_email_from_session_id("not-a-session-id").is_none());
    }

    #[test]
    fn test_parse_auth_list_active() {
        let out = "user@example.com  ACTIVE\nother@example.com  -\n";
        assert_eq!(
            parse_auth_list(out, "user@example.com"),
            RemoteAuthState::Active
        );
    }

    #[test]
    fn test_parse_auth_list_star_means_active() {
        let out = "user@example.com  *\n";
        assert_eq!(
            parse_auth_list(out, "user@example.com"),
            RemoteAuthState::Active
        );
    }

    #[test]
    fn test_parse_auth_list_inactive() {
        let out = "user@example.com  -\nactive@example.com ACTIVE\n";
        assert_eq!(
            parse_auth_list(out, "user@example.com"),
            RemoteAuthState::Inactive
        );
    }

    #[test]
    fn test_parse_auth_list_skips_service_accounts() {
        let out = "1234-compute@developer.gserviceaccount.com  ACTIVE\n";
        assert_eq!(
            parse_auth_list(out, "1234-compute@developer.gserviceaccount.com"),
            RemoteAuthState::NotLogin
        );
    }

    #[test]
    fn test_parse_auth_list_absent() {
        let out = "someone@example.com  ACTIVE\n";
        assert_eq!(
            parse_auth_list(out, "user@example.com"),
            RemoteAuthState::NotLogin
        );
    }
}
