use std::env;

/// Prefix shared by every VM name this controller provisions. Reconciliation
/// refuses to touch instances outside this namespace.
pub const VM_NAME_PREFIX: &str = "gatcvm";

/// Older deployments used a dashed prefix; still recognized by the guard.
pub const VM_NAME_PREFIX_LEGACY: &str = "gatc-vm";

/// How long a PendingDelete VM is retained before the reconciler destroys it.
pub const PENDING_DELETE_RETENTION_HOURS: i64 = 1;

/// Target number of upstream projects per account.
pub const MAX_PROJECTS_PER_ACCOUNT: usize = 12;

#[derive(Debug, Clone)]
pub struct GcpConfig {
    /// Service account key used for `gcloud auth activate-service-account`.
    pub service_account_key_path: String,
    pub default_zone: String,
    pub default_machine_type: String,
    pub ssh_key_path: String,
    pub ssh_pub_key_path: String,
    pub startup_script_socks5: String,
    pub startup_script_tinyproxy: String,
    pub startup_script_http_path: String,
    /// Aged-VM cleanup horizon in hours; `None` disables the job.
    pub clean_old_vm_exceed_hours: Option<i64>,
}

impl GcpConfig {
    pub fn from_env() -> Self {
        Self {
            service_account_key_path: env::var("GATC_SA_KEY_PATH")
                .unwrap_or_else(|_| "./conf/gcp/sa-key0.json".to_string()),
            default_zone: env::var("GATC_DEFAULT_ZONE")
                .unwrap_or_else(|_| "us-central1-a".to_string()),
            default_machine_type: env::var("GATC_DEFAULT_MACHINE_TYPE")
                .unwrap_or_else(|_| "e2-small".to_string()),
            ssh_key_path: env::var("GATC_SSH_KEY_PATH")
                .unwrap_or_else(|_| "./conf/gcp/gatc_rsa".to_string()),
            ssh_pub_key_path: env::var("GATC_SSH_PUB_KEY_PATH")
                .unwrap_or_else(|_| "./conf/gcp/gatc_rsa.pub".to_string()),
            startup_script_socks5: env::var("GATC_VM_INIT_SCRIPT")
                .unwrap_or_else(|_| "./scripts/vm_init.sh".to_string()),
            startup_script_tinyproxy: env::var("GATC_VM_INIT_SCRIPT_TINYPROXY")
                .unwrap_or_else(|_| "./scripts/vm_init_tinyproxy.sh".to_string()),
            startup_script_http_path: env::var("GATC_VM_INIT_SCRIPT_HTTPPROXY")
                .unwrap_or_else(|_| "./scripts/vm_init_httpproxy.sh".to_string()),
            clean_old_vm_exceed_hours: env::var("CLEAN_OLD_VM_EXIST_EXCEED_H")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|h| *h > 0),
        }
    }
}
