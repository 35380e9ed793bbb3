//! Post-login project workflow
//!
//! Once an email is logged in on its VM, this workflow converges the
//! account to a fully provisioned state: 12 projects, billing bound, an API
//! key per project, and one official_tokens row per key. Steps commit
//! incrementally; a failing step leaves earlier progress in place and the
//! whole workflow is safe to re-invoke.

use std::collections::HashMap;

use chrono::Utc;
use rand::Rng;
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QuerySelect, Set};
use serde::{Deserialize, Serialize};

use crate::config::MAX_PROJECTS_PER_ACCOUNT;
use crate::error::{AppError, Result};
use crate::models::gcp_account::{AuthStatus, BillingStatus, TokenStatus};
use crate::models::prelude::*;
use crate::models::vm_instance::VmStatus;
use crate::services::{account, ssh, vm};
use crate::state::{AppState, DbConn};

// ============================================================================
// Params / results
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectProcessParam {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub unbind_old_billing_proj: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectProcessResult {
    pub email: String,
    pub success: bool,
    pub message: String,
    pub synced_projects: usize,
    pub synced_projects_detail: Vec<String>,
    pub created_projects: usize,
    pub created_projects_detail: Vec<String>,
    pub old_binding_projects: usize,
    pub unbound_proj: usize,
    pub unbound_proj_detail: Vec<String>,
    pub bound_projects: usize,
    pub bound_projects_detail: Vec<String>,
    pub create_tokens: usize,
    pub total_projects: usize,
    pub synced_tokens: usize,
}

/// One project as reported by `gcloud projects list --format=json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GcpProject {
    #[serde(default, rename = "projectId")]
    pub project_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "projectNumber")]
    pub project_number: String,
    #[serde(default, rename = "lifecycleState")]
    pub lifecycle_state: String,
}

/// Cross-step workflow state for one invocation.
struct ProcessCtx {
    email: String,
    vm: vm_instance::Model,
    unbind_old: bool,
    cli_projects: Vec<GcpProject>,
    db_projects: HashMap<String, gcp_account::Model>,
    billing_accounts: Vec<String>,
    result: ProjectProcessResult,
}

// ============================================================================
// Project-row helpers
// ============================================================================

/// Project rows for an email (the session record is excluded).
pub async fn get_projects_by_email(db: &DbConn, email: &str) -> Result<Vec<gcp_account::Model>> {
    Ok(GcpAccount::find()
        .filter(gcp_account::Column::Email.eq(email))
        .filter(gcp_account::Column::ProjectId.ne(""))
        .all(db)
        .await?)
}

pub async fn get_by_email_and_project(
    db: &DbConn,
    email: &str,
    project_id: &str,
) -> Result<Option<gcp_account::Model>> {
    Ok(GcpAccount::find()
        .filter(gcp_account::Column::Email.eq(email))
        .filter(gcp_account::Column::ProjectId.eq(project_id))
        .one(db)
        .await?)
}

/// Flip a token to Invalid by row id.
pub async fn set_token_invalid_by_id(db: &DbConn, id: i64) -> Result<()> {
    GcpAccount::update_many()
        .col_expr(
            gcp_account::Column::TokenStatus,
            Expr::value(TokenStatus::Invalid),
        )
        .col_expr(gcp_account::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(gcp_account::Column::Id.eq(id))
        .exec(db)
        .await?;
    Ok(())
}

/// Flip a token to Invalid by (email, project).
pub async fn set_token_invalid_by_email_project(
    db: &DbConn,
    email: &str,
    project_id: &str,
) -> Result<()> {
    GcpAccount::update_many()
        .col_expr(
            gcp_account::Column::TokenStatus,
            Expr::value(TokenStatus::Invalid),
        )
        .col_expr(gcp_account::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(gcp_account::Column::Email.eq(email))
        .filter(gcp_account::Column::ProjectId.eq(project_id))
        .exec(db)
        .await?;
    Ok(())
}

/// Emails that still have any Unbound project.
pub async fn emails_with_unbound_projects(db: &DbConn) -> Result<Vec<String>> {
    let emails: Vec<String> = GcpAccount::find()
        .select_only()
        .column(gcp_account::Column::Email)
        .distinct()
        .filter(gcp_account::Column::BillingStatus.eq(BillingStatus::Unbound))
        .filter(gcp_account::Column::ProjectId.ne(""))
        .into_tuple()
        .all(db)
        .await?;
    Ok(emails)
}

// ============================================================================
// Workflow entry
// ============================================================================

pub async fn process_projects_v3(
    state: &AppState,
    param: &ProjectProcessParam,
) -> Result<ProjectProcessResult> {
    tracing::info!(email = %param.email, "starting project workflow");

    let Some(status) = account::get_account_status(&state.db, &param.email).await? else {
        return Err(AppError::Precondition(format!(
            "no account record, log in first: {}",
            param.email
        )));
    };
    if status.auth_status != AuthStatus::LoggedIn {
        account::upsert_account_status(
            &state.db,
            &param.email,
            &status.vm_id,
            AuthStatus::NotLogin,
            "needs a fresh login",
        )
        .await?;
        return Err(AppError::Precondition(
            "account not logged in, complete the login flow first".to_string(),
        ));
    }

    let vm_row = match vm::get_by_vm_id(&state.db, &status.vm_id).await? {
        Some(vm_row) if vm_row.status == VmStatus::Running => vm_row,
        _ => {
            account::upsert_account_status(
                &state.db,
                &param.email,
                &status.vm_id,
                AuthStatus::VmError,
                "VM missing or not running",
            )
            .await?;
            return Err(AppError::Precondition(
                "VM missing or not running, check the VM state".to_string(),
            ));
        }
    };

    let mut ctx = ProcessCtx {
        email: param.email.clone(),
        vm: vm_row,
        unbind_old: param.unbind_old_billing_proj.unwrap_or(true),
        cli_projects: Vec::new(),
        db_projects: HashMap::new(),
        billing_accounts: Vec::new(),
        result: ProjectProcessResult {
            email: param.email.clone(),
            ..Default::default()
        },
    };

    if let Err(e) = run_steps(state, &mut ctx).await {
        ctx.result.message = format!("{} (workflow failed: {})", ctx.result.message, e);
        return Ok(ctx.result);
    }

    ctx.result.success = true;
    ctx.result.message = format!(
        "workflow done: {} projects total, {} created, {} detached, {} bound, \
         {} keys issued, {} tokens synced",
        ctx.result.total_projects,
        ctx.result.created_projects,
        ctx.result.unbound_proj,
        ctx.result.bound_projects,
        ctx.result.create_tokens,
        ctx.result.synced_tokens
    );
    tracing::info!(email = %ctx.email, message = %ctx.result.message, "project workflow complete");
    Ok(ctx.result)
}

async fn run_steps(state: &AppState, ctx: &mut ProcessCtx) -> Result<()> {
    step1_project_setup(&state.db, ctx).await?;
    step2_billing_check(&state.db, ctx).await?;
    step3_billing_bind(&state.db, ctx).await?;
    step4_token_generation(&state.db, ctx).await?;
    step5_token_sync(&state.db, ctx).await?;
    Ok(())
}

// ============================================================================
// Step 1: project inventory
// ============================================================================

async fn list_cli_projects(vm: &vm_instance::Model) -> Result<Vec<GcpProject>> {
    let output = ssh::run_remote_checked(vm, "gcloud projects list --format=json").await?;
    let projects: Vec<GcpProject> = serde_json::from_str(&output)
        .map_err(|e| AppError::Upstream(format!("failed to parse project list: {}", e)))?;
    Ok(projects)
}

fn new_project_id() -> String {
    format!(
        "gatc-project-{}-{}",
        Utc::now().timestamp(),
        rand::thread_rng().gen_range(0..1_000_000)
    )
}

async fn create_remote_projects(vm: &vm_instance::Model, count: usize) -> Vec<String> {
    let mut created = Vec::new();
    for _ in 0..count {
        let project_id = new_project_id();
        let cmd = format!("gcloud projects create {} --name='GATC Project'", project_id);
        match ssh::run_remote(vm, &cmd).await {
            Ok(out) if out.success => {
                tracing::info!(project_id = %project_id, "project created");
                created.push(project_id);
            }
            Ok(out) => {
                tracing::error!(project_id = %project_id, stderr = %out.stderr, "project create failed");
                break;
            }
            Err(e) => {
                tracing::error!(project_id = %project_id, error = %e, "project create failed");
                break;
            }
        }
    }
    created
}

async fn load_db_projects(db: &DbConn, ctx: &mut ProcessCtx) -> Result<()> {
    let rows = get_projects_by_email(db, &ctx.email).await?;
    ctx.db_projects = rows
        .into_iter()
        .map(|row| (row.project_id.clone(), row))
        .collect();
    Ok(())
}

/// Bring the project inventory to the target count and mirror it into the
/// store (status reconciliation happens in later steps).
async fn step1_project_setup(db: &DbConn, ctx: &mut ProcessCtx) -> Result<()> {
    tracing::info!(email = %ctx.email, "step 1: project setup");

    ctx.cli_projects = list_cli_projects(&ctx.vm).await?;
    tracing::info!(count = ctx.cli_projects.len(), "existing projects listed");

    if ctx.cli_projects.len() < MAX_PROJECTS_PER_ACCOUNT {
        let need = MAX_PROJECTS_PER_ACCOUNT - ctx.cli_projects.len();
        let created = create_remote_projects(&ctx.vm, need).await;
        ctx.result.created_projects = created.len();
        ctx.result.created_projects_detail = created.clone();
        for project_id in created {
            ctx.cli_projects.push(GcpProject {
                project_id,
                name: "GATC Project".to_string(),
                ..Default::default()
            });
        }
    }
    ctx.result.total_projects = ctx.cli_projects.len();

    load_db_projects(db, ctx).await?;

    let mut need_reload = false;
    for project in &ctx.cli_projects {
        if ctx.db_projects.contains_key(&project.project_id) {
            continue;
        }
        let now = Utc::now();
        let row = gcp_account::ActiveModel {
            email: Set(ctx.email.clone()),
            project_id: Set(project.project_id.clone()),
            billing_status: Set(BillingStatus::Unbound),
            token_status: Set(TokenStatus::None),
            vm_id: Set(ctx.vm.vm_id.clone()),
            proxy_hint: Set(ctx.vm.proxy.clone()),
            official_token: Set(String::new()),
            region: Set("us-central1".to_string()),
            auth_status: Set(AuthStatus::LoggedIn),
            auth_debug_info: Set(String::new()),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };
        match row.insert(db).await {
            Ok(_) => {
                ctx.result.synced_projects += 1;
                ctx.result
                    .synced_projects_detail
                    .push(project.project_id.clone());
                need_reload = true;
            }
            Err(e) => {
                tracing::error!(project_id = %project.project_id, error = %e, "failed to insert project row");
            }
        }
    }

    if need_reload {
        load_db_projects(db, ctx).await?;
    }

    tracing::info!(
        cli = ctx.cli_projects.len(),
        db = ctx.db_projects.len(),
        "step 1 complete"
    );
    Ok(())
}

// ============================================================================
// Step 2: billing check / optional detach
// ============================================================================

/// Query which projects are billing-bound and which open billing accounts
/// are available. Projects recorded Detached are skipped.
async fn get_billing_info(ctx: &ProcessCtx) -> Result<(HashMap<String, String>, Vec<String>)> {
    let mut bound = HashMap::new();

    for project in &ctx.cli_projects {
        if ctx
            .db_projects
            .get(&project.project_id)
            .is_some_and(|row| row.billing_status == BillingStatus::Detached)
        {
            continue;
        }

        let cmd = format!(
            "gcloud billing projects describe {} --format='value(billingAccountName)' 2>/dev/null || echo ''",
            project.project_id
        );
        match ssh::run_remote(&ctx.vm, &cmd).await {
            Ok(out) if out.success => {
                let account_name = out.stdout.trim().to_string();
                if !account_name.is_empty() && account_name != "null" {
                    bound.insert(project.project_id.clone(), account_name);
                }
            }
            Ok(out) => {
                tracing::warn!(project_id = %project.project_id, stderr = %out.stderr, "billing describe failed");
            }
            Err(e) => {
                tracing::warn!(project_id = %project.project_id, error = %e, "billing describe failed");
            }
        }
    }

    let accounts = match ssh::run_remote(
        &ctx.vm,
        "gcloud billing accounts list --filter='open=true' --format='value(name)' 2>/dev/null || echo ''",
    )
    .await
    {
        Ok(out) if out.success => out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        _ => {
            tracing::warn!("billing accounts list failed");
            Vec::new()
        }
    };

    Ok((bound, accounts))
}

async fn save_project_row(
    db: &DbConn,
    ctx: &mut ProcessCtx,
    project_id: &str,
    update: impl FnOnce(&mut gcp_account::ActiveModel),
) -> Result<()> {
    let Some(row) = ctx.db_projects.get(project_id) else {
        return Ok(());
    };
    let mut am: gcp_account::ActiveModel = row.clone().into();
    update(&mut am);
    am.updated_at = Set(Utc::now());
    let saved = am.update(db).await?;
    ctx.db_projects.insert(project_id.to_string(), saved);
    Ok(())
}

async fn step2_billing_check(db: &DbConn, ctx: &mut ProcessCtx) -> Result<()> {
    tracing::info!(email = %ctx.email, unbind = ctx.unbind_old, "step 2: billing check");

    let (bound_projects, billing_accounts) = get_billing_info(ctx).await?;
    ctx.result.old_binding_projects = bound_projects.len();
    ctx.billing_accounts = billing_accounts;

    if ctx.unbind_old {
        for project_id in bound_projects.keys() {
            let cmd = format!("gcloud billing projects unlink {}", project_id);
            match ssh::run_remote(&ctx.vm, &cmd).await {
                Ok(out) if out.success => {}
                Ok(out) => {
                    tracing::error!(project_id = %project_id, stderr = %out.stderr, "billing unlink failed");
                    continue;
                }
                Err(e) => {
                    tracing::error!(project_id = %project_id, error = %e, "billing unlink failed");
                    continue;
                }
            }
            ctx.result.unbound_proj += 1;
            ctx.result.unbound_proj_detail.push(project_id.clone());

            save_project_row(db, ctx, project_id, |am| {
                am.billing_status = Set(BillingStatus::Detached);
            })
            .await?;
        }
    } else {
        // Reconcile: the cloud is the authority on what is actually bound.
        for project_id in bound_projects.keys() {
            if ctx
                .db_projects
                .get(project_id)
                .is_some_and(|row| row.billing_status == BillingStatus::Unbound)
            {
                save_project_row(db, ctx, project_id, |am| {
                    am.billing_status = Set(BillingStatus::Bound);
                })
                .await?;
            }
        }
    }

    tracing::info!(
        accounts = ctx.billing_accounts.len(),
        detached = ctx.result.unbound_proj,
        "step 2 complete"
    );
    Ok(())
}

// ============================================================================
// Step 3: billing bind
// ============================================================================

async fn step3_billing_bind(db: &DbConn, ctx: &mut ProcessCtx) -> Result<()> {
    tracing::info!(email = %ctx.email, "step 3: billing bind");

    let Some(billing_account) = ctx.billing_accounts.first().cloned() else {
        tracing::info!("no open billing account available, skipping bind");
        return Ok(());
    };

    let project_ids: Vec<String> = ctx
        .cli_projects
        .iter()
        .map(|p| p.project_id.clone())
        .collect();

    for project_id in project_ids {
        if !ctx
            .db_projects
            .get(&project_id)
            .is_some_and(|row| row.billing_status == BillingStatus::Unbound)
        {
            continue;
        }

        let cmd = format!(
            "gcloud billing projects link {} --billing-account={}",
            project_id, billing_account
        );
        match ssh::run_remote(&ctx.vm, &cmd).await {
            Ok(out) if out.success => {}
            // Bind failures are expected (quota, unusable account); no
            // status change, the next invocation retries.
            Ok(out) => {
                tracing::info!(project_id = %project_id, stderr = %out.stderr.trim(), "billing link refused");
                continue;
            }
            Err(e) => {
                tracing::info!(project_id = %project_id, error = %e, "billing link failed");
                continue;
            }
        }

        save_project_row(db, ctx, &project_id, |am| {
            am.billing_status = Set(BillingStatus::Bound);
        })
        .await?;
        ctx.result.bound_projects += 1;
        ctx.result.bound_projects_detail.push(project_id.clone());
        tracing::info!(project_id = %project_id, account = %billing_account, "billing bound");
    }

    tracing::info!(bound = ctx.result.bound_projects, "step 3 complete");
    Ok(())
}

// ============================================================================
// Step 4: token generation for newly bound projects
// ============================================================================

const REQUIRED_SERVICES: [&str; 4] = [
    "cloudresourcemanager.googleapis.com",
    "serviceusage.googleapis.com",
    "apikeys.googleapis.com",
    "generativelanguage.googleapis.com",
];

/// Enable the required services then mint an API key. Returns the key
/// string on success.
async fn generate_token_for_project(vm: &vm_instance::Model, project_id: &str) -> Option<String> {
    for service in REQUIRED_SERVICES {
        let cmd = format!("gcloud services enable {} --project={}", service, project_id);
        match ssh::run_remote(vm, &cmd).await {
            Ok(out) if out.success => {}
            Ok(out) => {
                tracing::error!(project_id, service, stderr = %out.stderr, "service enable failed");
                return None;
            }
            Err(e) => {
                tracing::error!(project_id, service, error = %e, "service enable failed");
                return None;
            }
        }
    }

    let cmd = format!(
        "gcloud services api-keys create --project=\"{}\" --display-name=\"Gemini API Key\" \
         --api-target=service=generativelanguage.googleapis.com --format=json 2>/dev/null",
        project_id
    );
    let output = match ssh::run_remote(vm, &cmd).await {
        Ok(out) if out.success => out.stdout,
        Ok(out) => {
            tracing::error!(project_id, stderr = %out.stderr, "api key create failed");
            return None;
        }
        Err(e) => {
            tracing::error!(project_id, error = %e, "api key create failed");
            return None;
        }
    };

    let parsed: serde_json::Value = match serde_json::from_str(&output) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(project_id, error = %e, "failed to parse api key response");
            return None;
        }
    };

    let key_string = parsed
        .get("response")
        .and_then(|r| r.get("keyString"))
        .and_then(|k| k.as_str())
        .unwrap_or_default();
    if !key_string.starts_with("AIza") {
        tracing::error!(project_id, "api key response missing or malformed keyString");
        return None;
    }

    tracing::info!(
        project_id,
        prefix = &key_string[..key_string.len().min(10)],
        "api key issued"
    );
    Some(key_string.to_string())
}

/// Issue keys only for projects bound in this invocation whose token state
/// has not yet reached Got.
async fn step4_token_generation(db: &DbConn, ctx: &mut ProcessCtx) -> Result<()> {
    tracing::info!(email = %ctx.email, "step 4: token generation");

    let targets = ctx.result.bound_projects_detail.clone();
    for project_id in targets {
        let skip = match ctx.db_projects.get(&project_id) {
            None => true,
            Some(row) => row.token_status == TokenStatus::Got
                || row.token_status == TokenStatus::Invalid,
        };
        if skip {
            tracing::info!(project_id = %project_id, "token generation skipped");
            continue;
        }

        match generate_token_for_project(&ctx.vm, &project_id).await {
            Some(token) => {
                save_project_row(db, ctx, &project_id, |am| {
                    am.token_status = Set(TokenStatus::Got);
                    am.official_token = Set(token);
                })
                .await?;
                ctx.result.create_tokens += 1;
            }
            None => {
                save_project_row(db, ctx, &project_id, |am| {
                    am.token_status = Set(TokenStatus::CreateFail);
                })
                .await?;
            }
        }
    }

    tracing::info!(issued = ctx.result.create_tokens, "step 4 complete");
    Ok(())
}

// ============================================================================
// Step 5: official_tokens sync
// ============================================================================

/// Project ids already present in official_tokens for this email.
pub async fn existing_token_project_ids(
    db: &DbConn,
    email: &str,
) -> Result<std::collections::HashSet<String>> {
    let ids: Vec<String> = OfficialToken::find()
        .select_only()
        .column(official_token::Column::ProjectId)
        .filter(official_token::Column::Email.eq(email))
        .into_tuple()
        .all(db)
        .await?;
    Ok(ids.into_iter().filter(|id| !id.is_empty()).collect())
}

fn official_token_row(email: &str, project: &gcp_account::Model) -> official_token::ActiveModel {
    let now = Utc::now();
    official_token::ActiveModel {
        channel_id: Set(16),
        name: Set("gatc".to_string()),
        token: Set(project.official_token.clone()),
        base_url: Set(String::new()),
        status: Set(1),
        priority: Set(50),
        weight: Set(100),
        rpm_limit: Set(0),
        tpm_limit: Set(0),
        proxy: Set(project.proxy_hint.clone()),
        token_type: Set("static".to_string()),
        oauth2_config: Set(String::new()),
        runtime_token: Set(String::new()),
        email: Set(email.to_string()),
        project_id: Set(project.project_id.clone()),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
}

/// Insert an official_tokens row for every bound-and-tokenized project not
/// yet present there. Independent of the earlier steps so it also picks up
/// keys issued in previous invocations.
pub async fn sync_official_tokens(db: &DbConn, email: &str) -> Result<usize> {
    let projects = get_projects_by_email(db, email).await?;
    let valid: Vec<&gcp_account::Model> = projects
        .iter()
        .filter(|p| {
            p.billing_status == BillingStatus::Bound
                && p.token_status == TokenStatus::Got
                && !p.official_token.is_empty()
        })
        .collect();
    if valid.is_empty() {
        return Ok(0);
    }

    let existing = existing_token_project_ids(db, email).await?;

    let mut synced = 0usize;
    for project in valid {
        if existing.contains(&project.project_id) {
            continue;
        }
        let row = official_token_row(email, project);
        match row.insert(db).await {
            Ok(inserted) => {
                synced += 1;
                // Record the back-link on the account row.
                let mut am: gcp_account::ActiveModel = project.clone().into();
                am.official_token_id = Set(inserted.id);
                am.updated_at = Set(Utc::now());
                if let Err(e) = am.update(db).await {
                    tracing::error!(project_id = %project.project_id, error = %e, "failed to record token back-link");
                }
                tracing::info!(project_id = %project.project_id, "token synced");
            }
            Err(e) => {
                tracing::error!(project_id = %project.project_id, error = %e, "token sync insert failed");
            }
        }
    }
    Ok(synced)
}

async fn step5_token_sync(db: &DbConn, ctx: &mut ProcessCtx) -> Result<()> {
    tracing::info!(email = %ctx.email, "step 5: token sync");
    ctx.result.synced_tokens = sync_official_tokens(db, &ctx.email).await?;
    tracing::info!(synced = ctx.result.synced_tokens, "step 5 complete");
    Ok(())
}
