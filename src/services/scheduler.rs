//! Periodic task scheduler
//!
//! A simple scheduler for running background reconciliation at regular
//! intervals. Add new tasks by implementing the `PeriodicTask` trait.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::interval;

use crate::services::vm;
use crate::state::AppState;

/// Trait for periodic background tasks
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run
    fn interval(&self) -> Duration;

    /// Execute the task
    async fn run(&self, state: &AppState) -> anyhow::Result<()>;
}

/// Start all periodic tasks
pub fn start_scheduler(state: AppState) {
    let tasks: Vec<Box<dyn PeriodicTask>> = vec![
        Box::new(ProviderSyncTask),
        Box::new(AgedVmCleanupTask),
        Box::new(PendingDeleteCleanupTask),
        Box::new(RateLimitCleanupTask),
    ];

    for task in tasks {
        let state = state.clone();
        tokio::spawn(async move {
            run_task(task, state).await;
        });
    }

    tracing::info!("Periodic task scheduler started");
}

/// Run a single task on its interval
async fn run_task(task: Box<dyn PeriodicTask>, state: AppState) {
    let mut ticker = interval(task.interval());

    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        ticker.tick().await;

        tracing::debug!(task = task.name(), "Running periodic task");

        match task.run(&state).await {
            Ok(()) => {
                tracing::debug!(task = task.name(), "Periodic task completed");
            }
            Err(e) => {
                tracing::error!(task = task.name(), error = %e, "Periodic task failed");
            }
        }
    }
}

// ============================================================================
// Provider sync
// ============================================================================

/// Pulls the provider's instance list and inserts store rows for running
/// instances the store does not know about.
struct ProviderSyncTask;

#[async_trait]
impl PeriodicTask for ProviderSyncTask {
    fn name(&self) -> &'static str {
        "provider_sync"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(10 * 60)
    }

    async fn run(&self, state: &AppState) -> anyhow::Result<()> {
        vm::sync_vms_with_provider(state).await?;
        Ok(())
    }
}

// ============================================================================
// Aged-VM cleanup
// ============================================================================

/// Destroys VMs older than the opt-in horizon; no-op when disabled.
struct AgedVmCleanupTask;

#[async_trait]
impl PeriodicTask for AgedVmCleanupTask {
    fn name(&self) -> &'static str {
        "aged_vm_cleanup"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(60 * 60)
    }

    async fn run(&self, state: &AppState) -> anyhow::Result<()> {
        vm::cleanup_old_vms(state).await;
        Ok(())
    }
}

// ============================================================================
// Pending-delete cleanup
// ============================================================================

/// Second half of the replace-proxy V2 protocol: destroys VMs that have
/// sat in PendingDelete past the retention horizon.
struct PendingDeleteCleanupTask;

#[async_trait]
impl PeriodicTask for PendingDeleteCleanupTask {
    fn name(&self) -> &'static str {
        "pending_delete_cleanup"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(10 * 60)
    }

    async fn run(&self, state: &AppState) -> anyhow::Result<()> {
        vm::cleanup_pending_delete_vms(state).await;
        Ok(())
    }
}

// ============================================================================
// Rate-limit map cleanup
// ============================================================================

struct RateLimitCleanupTask;

#[async_trait]
impl PeriodicTask for RateLimitCleanupTask {
    fn name(&self) -> &'static str {
        "rate_limit_cleanup"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(60 * 60)
    }

    async fn run(&self, state: &AppState) -> anyhow::Result<()> {
        state.email_limiter.cleanup();
        Ok(())
    }
}
