//! SSH key management and remote command execution
//!
//! The controller drives `gcloud` on its VMs over plain `ssh` with a
//! dedicated RSA keypair that is generated on first use and injected into
//! each VM's metadata at creation time.

use std::path::Path;
use std::process::Stdio;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use tokio::process::{Child, Command};

use crate::config::CONFIG;
use crate::error::{AppError, Result};
use crate::models::vm_instance;
use crate::services::gcp::CommandOutput;

const SSH_OPTS: [&str; 4] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
];

/// Make sure the controller keypair exists on disk, generating RSA-2048 if
/// missing. The private key is written 0600.
pub fn ensure_ssh_keys() -> Result<()> {
    let private_path = &CONFIG.gcp.ssh_key_path;
    let public_path = &CONFIG.gcp.ssh_pub_key_path;

    if Path::new(private_path).exists() {
        tracing::info!("SSH key pair already exists");
        return Ok(());
    }

    tracing::info!("SSH key not found, generating new key pair");
    generate_ssh_key_pair(private_path, public_path)
}

fn generate_ssh_key_pair(private_path: &str, public_path: &str) -> Result<()> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 2048)
        .map_err(|e| AppError::Internal(format!("failed to generate private key: {}", e)))?;

    if let Some(dir) = Path::new(private_path).parent() {
        std::fs::create_dir_all(dir)?;
    }

    let pem = private_key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(format!("failed to encode private key: {}", e)))?;
    std::fs::write(private_path, pem.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(private_path, std::fs::Permissions::from_mode(0o600))?;
    }

    let public_line = encode_openssh_public_key(&private_key);
    std::fs::write(public_path, public_line)?;

    tracing::info!("SSH key pair generated successfully");
    Ok(())
}

/// Encode the public half as an `authorized_keys` line.
fn encode_openssh_public_key(key: &RsaPrivateKey) -> String {
    let public = key.to_public_key();
    let mut blob = Vec::new();
    write_ssh_string(&mut blob, b"ssh-rsa");
    write_ssh_mpint(&mut blob, &public.e().to_bytes_be());
    write_ssh_mpint(&mut blob, &public.n().to_bytes_be());
    format!("ssh-rsa {} gatc\n", BASE64.encode(&blob))
}

fn write_ssh_string(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

// mpint is big-endian two's complement; a value whose high bit is set needs
// a leading zero byte to stay positive.
fn write_ssh_mpint(out: &mut Vec<u8>, bytes: &[u8]) {
    let mut start = 0;
    while start < bytes.len() && bytes[start] == 0 {
        start += 1;
    }
    let trimmed = &bytes[start..];
    if trimmed.first().is_some_and(|b| b & 0x80 != 0) {
        out.extend_from_slice(&((trimmed.len() + 1) as u32).to_be_bytes());
        out.push(0);
    } else {
        out.extend_from_slice(&(trimmed.len() as u32).to_be_bytes());
    }
    out.extend_from_slice(trimmed);
}

/// Read the public key as stored on disk.
pub fn ssh_pub_key_content() -> Result<String> {
    Ok(std::fs::read_to_string(&CONFIG.gcp.ssh_pub_key_path)?)
}

fn ssh_target(vm: &vm_instance::Model) -> String {
    format!("{}@{}", vm.ssh_user, vm.external_ip)
}

/// Run a one-shot command on the VM and capture its output.
pub async fn run_remote(vm: &vm_instance::Model, command: &str) -> Result<CommandOutput> {
    let output = Command::new("ssh")
        .arg("-i")
        .arg(&CONFIG.gcp.ssh_key_path)
        .args(SSH_OPTS)
        .arg(ssh_target(vm))
        .arg(command)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| AppError::Ssh(format!("failed to spawn ssh: {}", e)))?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        success: output.status.success(),
    })
}

/// Like [`run_remote`] but errors unless the command exited zero; returns
/// stdout.
pub async fn run_remote_checked(vm: &vm_instance::Model, command: &str) -> Result<String> {
    let out = run_remote(vm, command).await?;
    if !out.success {
        return Err(AppError::Ssh(format!(
            "remote command failed: {} {}",
            out.stderr.trim(),
            out.stdout.trim()
        )));
    }
    Ok(out.stdout)
}

/// Spawn the interactive login CLI on the VM with all three stdio streams
/// piped; the login session state machine owns the child from here.
pub fn spawn_login_command(vm: &vm_instance::Model) -> Result<Child> {
    Command::new("ssh")
        .arg("-i")
        .arg(&CONFIG.gcp.ssh_key_path)
        .args(SSH_OPTS)
        .arg(ssh_target(vm))
        .arg("gcloud auth login --no-launch-browser")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AppError::Ssh(format!("failed to start ssh login command: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mpint_strips_leading_zeros() {
        let mut out = Vec::new();
        write_ssh_mpint(&mut out, &[0, 0, 0x42]);
        assert_eq!(out, vec![0, 0, 0, 1, 0x42]);
    }

    #[test]
    fn test_mpint_pads_high_bit() {
        let mut out = Vec::new();
        write_ssh_mpint(&mut out, &[0x80, 0x01]);
        assert_eq!(out, vec![0, 0, 0, 3, 0, 0x80, 0x01]);
    }

    #[test]
    fn test_openssh_public_key_shape() {
        let mut rng = rand::thread_rng();
        // 512 bits keeps the test fast; the encoding path is size-agnostic.
        let key = RsaPrivateKey::new(&mut rng, 512).unwrap();
        let line = encode_openssh_public_key(&key);
        assert!(line.starts_with("ssh-rsa "));
        assert!(line.trim_end().ends_with(" gatc"));

        let b64 = line.split_whitespace().nth(1).unwrap();
        let blob = BASE64.decode(b64).unwrap();
        // Blob opens with the algorithm name as an ssh string.
        assert_eq!(&blob[0..4], &[0, 0, 0, 7]);
        assert_eq!(&blob[4..11], b"ssh-rsa");
    }
}
