//! gcloud CLI adaptor
//!
//! All provider mutations go through the `gcloud` binary with the service
//! account activated first. Command strings mirror what an operator would
//! type, which keeps provider behavior reproducible from the logs.

use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;

use crate::config::CONFIG;
use crate::error::{AppError, Result};

/// Captured output of one shell invocation.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Run a shell command line and capture stdout/stderr.
pub async fn exec_command(command: &str) -> Result<CommandOutput> {
    let output = Command::new("/bin/bash")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| AppError::Upstream(format!("failed to spawn command: {}", e)))?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        success: output.status.success(),
    })
}

/// A provider-side instance as reported by `instances list`.
#[derive(Debug, Clone, Default)]
pub struct GcpInstance {
    pub id: String,
    pub name: String,
    pub zone: String,
    pub machine_type: String,
    pub status: String,
    pub external_ip: String,
    pub internal_ip: String,
}

// Raw JSON shape of `gcloud compute instances list --format=json`. Zone and
// machineType arrive as full resource URLs; only the last path segment is
// meaningful here.
#[derive(Deserialize)]
struct RawInstance {
    #[serde(default)]
    name: String,
    #[serde(default)]
    zone: String,
    #[serde(default, rename = "machineType")]
    machine_type: String,
    #[serde(default)]
    status: String,
    #[serde(default, rename = "networkInterfaces")]
    network_interfaces: Vec<RawNetworkInterface>,
}

#[derive(Deserialize)]
struct RawNetworkInterface {
    #[serde(default, rename = "networkIP")]
    network_ip: String,
    #[serde(default, rename = "accessConfigs")]
    access_configs: Vec<RawAccessConfig>,
}

#[derive(Deserialize)]
struct RawAccessConfig {
    #[serde(default, rename = "natIP")]
    nat_ip: String,
}

fn last_segment(url: &str) -> String {
    url.rsplit('/').next().unwrap_or_default().to_string()
}

impl From<RawInstance> for GcpInstance {
    fn from(raw: RawInstance) -> Self {
        let (internal_ip, external_ip) = raw
            .network_interfaces
            .first()
            .map(|ni| {
                (
                    ni.network_ip.clone(),
                    ni.access_configs
                        .first()
                        .map(|ac| ac.nat_ip.clone())
                        .unwrap_or_default(),
                )
            })
            .unwrap_or_default();

        GcpInstance {
            id: raw.name.clone(),
            name: raw.name,
            zone: last_segment(&raw.zone),
            machine_type: last_segment(&raw.machine_type),
            status: raw.status,
            external_ip,
            internal_ip,
        }
    }
}

/// Handle to the cloud provider for one configured project.
pub struct GcloudClient {
    project_id: String,
    key_file: String,
}

impl GcloudClient {
    pub fn from_config() -> Self {
        let key_file = CONFIG.gcp.service_account_key_path.clone();
        let project_id = Self::load_project_id(&key_file).unwrap_or_default();
        Self {
            project_id,
            key_file,
        }
    }

    /// Client with a fixed project id and no key file; no provider call
    /// can succeed through it, which is what DB-only tests want.
    pub fn for_tests(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            key_file: String::new(),
        }
    }

    /// The provider project id is embedded in the service account key file.
    fn load_project_id(key_file: &str) -> Option<String> {
        #[derive(Deserialize)]
        struct KeyData {
            project_id: String,
        }

        let content = std::fs::read_to_string(key_file).ok()?;
        let key: KeyData = serde_json::from_str(&content).ok()?;
        if key.project_id.is_empty() {
            None
        } else {
            Some(key.project_id)
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Authenticate the service account before any mutating call.
    pub async fn activate_service_account(&self) -> Result<()> {
        let cmd = format!(
            "gcloud auth activate-service-account --key-file={}",
            self.key_file
        );
        tracing::info!(command = %cmd, "Activating service account");

        let out = exec_command(&cmd).await?;
        if !out.success {
            return Err(AppError::Upstream(format!(
                "failed to activate service account: {}",
                out.stderr
            )));
        }
        Ok(())
    }

    /// Issue `instances create` with SSH key, proxy credentials and the
    /// kind-specific startup script attached as metadata.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_instance(
        &self,
        vm_name: &str,
        zone: &str,
        machine_type: &str,
        ssh_pub_key: &str,
        proxy_username: &str,
        proxy_password: &str,
        startup_script_path: &str,
    ) -> Result<String> {
        let ssh_key_metadata = format!("gatc:{}", ssh_pub_key.trim());
        let cmd = format!(
            "gcloud compute instances create {} \
             --project={} --zone={} --machine-type={} --network-tier=STANDARD --maintenance-policy=MIGRATE \
             --image-family=debian-12 --image-project=debian-cloud \
             --boot-disk-type=pd-standard \
             --metadata=ssh-keys='{}',proxy-username='{}',proxy-password='{}' \
             --metadata-from-file=startup-script={} \
             --tags=http-server,https-server --format=json",
            vm_name,
            self.project_id,
            zone,
            machine_type,
            ssh_key_metadata,
            proxy_username,
            proxy_password,
            startup_script_path,
        );

        tracing::info!(command = %cmd, "Executing gcloud command to create VM");

        let out = exec_command(&cmd).await?;
        if !out.success {
            return Err(AppError::Upstream(format!(
                "failed to create VM: {}",
                out.stderr
            )));
        }
        Ok(out.stdout)
    }

    /// Delete an instance. A "not found" response is treated as success so
    /// repeated deletes stay idempotent.
    pub async fn delete_instance(&self, vm_name: &str, zone: &str) -> Result<()> {
        let cmd = format!(
            "gcloud compute instances delete {} --project={} --zone={} --quiet",
            vm_name, self.project_id, zone
        );
        tracing::info!(command = %cmd, "Deleting VM from provider");

        let out = exec_command(&cmd).await?;
        if !out.success {
            if out.stderr.contains("was not found") || out.stderr.contains("not found") {
                tracing::info!(vm_id = vm_name, "VM already deleted at provider");
                return Ok(());
            }
            return Err(AppError::Upstream(format!(
                "failed to delete VM: {}",
                out.stderr
            )));
        }
        Ok(())
    }

    /// Read the current external IP of an instance.
    pub async fn get_external_ip(&self, vm_name: &str, zone: &str) -> Result<String> {
        let cmd = format!(
            "gcloud compute instances describe {} --project={} --zone={} \
             --format='value(networkInterfaces[0].accessConfigs[0].natIP)'",
            vm_name, self.project_id, zone
        );

        let out = exec_command(&cmd).await?;
        if !out.success {
            return Err(AppError::Upstream(format!(
                "failed to get external IP: {}",
                out.stderr
            )));
        }

        let ip = out.stdout.trim().to_string();
        if ip.is_empty() {
            return Err(AppError::Upstream("external IP not found".to_string()));
        }
        Ok(ip)
    }

    /// List every instance in the project.
    pub async fn list_instances(&self) -> Result<Vec<GcpInstance>> {
        self.activate_service_account().await?;

        let cmd = format!(
            "gcloud compute instances list --project={} --format=json",
            self.project_id
        );

        let out = exec_command(&cmd).await?;
        if !out.success {
            return Err(AppError::Upstream(format!(
                "failed to list instances: {}",
                out.stderr
            )));
        }

        let raw: Vec<RawInstance> = serde_json::from_str(&out.stdout)?;
        Ok(raw.into_iter().map(GcpInstance::from).collect())
    }

    /// Check that an instance still exists at the provider.
    pub async fn instance_exists(&self, vm_name: &str, zone: &str) -> bool {
        let cmd = format!(
            "gcloud compute instances describe {} --project={} --zone={} --format='value(name)'",
            vm_name, self.project_id, zone
        );

        match exec_command(&cmd).await {
            Ok(out) if out.success => out.stdout.trim() == vm_name,
            Ok(out) => {
                if out.stderr.contains("was not found") || out.stderr.contains("does not exist") {
                    tracing::info!(vm_id = vm_name, "VM not found at provider");
                } else {
                    tracing::error!(vm_id = vm_name, stderr = %out.stderr, "instance describe failed");
                }
                false
            }
            Err(e) => {
                tracing::error!(vm_id = vm_name, error = %e, "instance describe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_instances_list_json() {
        let json = r#"[
            {
                "name": "gatcvm-server-a-0101120000",
                "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a",
                "machineType": "https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a/machineTypes/e2-small",
                "status": "RUNNING",
                "networkInterfaces": [
                    {
                        "networkIP": "10.128.0.2",
                        "accessConfigs": [{"natIP": "35.208.1.2"}]
                    }
                ]
            }
        ]"#;

        let raw: Vec<RawInstance> = serde_json::from_str(json).unwrap();
        let instances: Vec<GcpInstance> = raw.into_iter().map(GcpInstance::from).collect();

        assert_eq!(instances.len(), 1);
        let vm = &instances[0];
        assert_eq!(vm.name, "gatcvm-server-a-0101120000");
        assert_eq!(vm.zone, "us-central1-a");
        assert_eq!(vm.machine_type, "e2-small");
        assert_eq!(vm.status, "RUNNING");
        assert_eq!(vm.external_ip, "35.208.1.2");
        assert_eq!(vm.internal_ip, "10.128.0.2");
    }

    #[test]
    fn test_parse_instance_without_access_config() {
        let json = r#"[{"name": "x", "zone": "z/us-east1-b", "machineType": "m/e2-micro",
                        "status": "TERMINATED", "networkInterfaces": [{"networkIP": "10.0.0.9"}]}]"#;
        let raw: Vec<RawInstance> = serde_json::from_str(json).unwrap();
        let vm = GcpInstance::from(raw.into_iter().next().unwrap());
        assert_eq!(vm.external_ip, "");
        assert_eq!(vm.internal_ip, "10.0.0.9");
        assert_eq!(vm.zone, "us-east1-b");
    }

    #[tokio::test]
    async fn test_exec_command_captures_output() {
        let out = exec_command("echo hello; echo oops 1>&2").await.unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_exec_command_nonzero_exit() {
        let out = exec_command("exit 3").await.unwrap();
        assert!(!out.success);
    }
}
