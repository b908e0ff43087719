use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ConnectionTest, ShellTransport, ShutdownResult, ShutdownStatus};

/// Commande d'arrêt ; `-n` exige un sudo sans mot de passe provisionné
const SHUTDOWN_COMMAND: &str = "sudo -n /sbin/shutdown -h now";
/// Sonde légère : authentification + exécution triviale
const TEST_COMMAND: &str = "echo ok";

/// Transport shell via le client `ssh` en mode batch
pub struct SshTransport {
    key_path: PathBuf,
    connect_timeout: Duration,
}

impl SshTransport {
    pub fn new(key_path: PathBuf, connect_timeout: Duration) -> Self {
        Self {
            key_path,
            connect_timeout,
        }
    }

    fn public_key_path(&self) -> PathBuf {
        let mut path = self.key_path.clone().into_os_string();
        path.push(".pub");
        PathBuf::from(path)
    }

    /// Arguments de `ssh` ; `None` si l'hôte ou l'utilisateur ressemble à une option
    fn ssh_args(&self, host: &str, user: &str, command: &str) -> Option<Vec<String>> {
        if [host, user].iter().any(|v| v.is_empty() || v.starts_with('-')) {
            return None;
        }
        Some(vec![
            "-i".to_string(),
            self.key_path.to_string_lossy().into_owned(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "--".to_string(),
            format!("{user}@{host}"),
            command.to_string(),
        ])
    }

    async fn run(&self, host: &str, user: &str, command: &str) -> std::io::Result<Output> {
        let args = self.ssh_args(host, user, command).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid host or user")
        })?;
        tokio::process::Command::new("ssh")
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
    }
}

#[async_trait]
impl ShellTransport for SshTransport {
    async fn test_connection(&self, host: &str, user: &str) -> ConnectionTest {
        match self.run(host, user, TEST_COMMAND).await {
            Ok(o) if o.status.success() => ConnectionTest::ok(),
            Ok(o) => {
                let stderr = String::from_utf8_lossy(&o.stderr);
                ConnectionTest::failed(format!("SSH failed: {}", stderr.trim()))
            }
            Err(e) => ConnectionTest::failed(format!("Failed to run ssh: {e}")),
        }
    }

    async fn shutdown(&self, host: &str, user: &str) -> ShutdownResult {
        let output = match self.run(host, user, SHUTDOWN_COMMAND).await {
            Ok(o) => o,
            Err(e) => return ShutdownResult::failed(format!("Failed to run ssh: {e}")),
        };
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        debug!(host, user, code = ?output.status.code(), "SSH shutdown command returned");
        classify_shutdown(output.status.code(), &stderr)
    }

    fn public_key(&self) -> Option<String> {
        match std::fs::read_to_string(self.public_key_path()) {
            Ok(key) => Some(key.trim().to_string()),
            Err(e) => {
                warn!(path = %self.public_key_path().display(), "SSH public key unavailable: {}", e);
                None
            }
        }
    }
}

/// Classe le code de sortie du client `ssh`.
///
/// 255 signifie que la connexion s'est terminée côté client : après l'envoi de
/// la commande c'est l'effet attendu de l'arrêt, sauf si ssh n'a jamais pu
/// s'authentifier ou joindre la cible.
fn classify_shutdown(code: Option<i32>, stderr: &str) -> ShutdownResult {
    match code {
        Some(0) => ShutdownResult::new(ShutdownStatus::Executed, "shutdown command accepted"),
        Some(255) if !is_connection_failure(stderr) => {
            ShutdownResult::new(ShutdownStatus::Initiated, "connection closed by remote host")
        }
        Some(_) | None => {
            if stderr.is_empty() {
                ShutdownResult::failed(format!("ssh exited with status {code:?}"))
            } else {
                ShutdownResult::failed(format!("SSH error: {stderr}"))
            }
        }
    }
}

fn is_connection_failure(stderr: &str) -> bool {
    const MARKERS: [&str; 6] = [
        "Permission denied",
        "Connection refused",
        "Could not resolve",
        "No route to host",
        "Connection timed out",
        "Host key verification failed",
    ];
    MARKERS.iter().any(|m| stderr.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_follows_end_of_options() {
        let ssh = SshTransport::new(PathBuf::from("/keys/id_ed25519"), Duration::from_secs(5));
        let args = ssh.ssh_args("nas", "root", TEST_COMMAND).unwrap();
        let end = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(args[end + 1], "root@nas");
        assert_eq!(args[end + 2], "echo ok");
        assert!(args.contains(&"ConnectTimeout=5".to_string()));

        assert!(ssh.ssh_args("nas", "-oProxyCommand=id", TEST_COMMAND).is_none());
        assert!(ssh.ssh_args("-oProxyCommand=id", "root", TEST_COMMAND).is_none());
    }

    #[tokio::test]
    async fn test_option_like_user_is_not_executed() {
        let ssh = SshTransport::new(PathBuf::from("/keys/id_ed25519"), Duration::from_secs(1));
        let test = ssh.test_connection("nas", "-oProxyCommand=id").await;
        assert!(!test.success);
        assert!(test.error.unwrap().contains("invalid host or user"));
    }

    #[test]
    fn test_classify_exit_zero() {
        assert_eq!(classify_shutdown(Some(0), "").status, ShutdownStatus::Executed);
    }

    #[test]
    fn test_classify_dropped_connection() {
        let result = classify_shutdown(Some(255), "Connection to nas closed by remote host.");
        assert_eq!(result.status, ShutdownStatus::Initiated);
    }

    #[test]
    fn test_classify_unreachable() {
        let result = classify_shutdown(Some(255), "ssh: connect to host nas port 22: Connection refused");
        assert_eq!(result.status, ShutdownStatus::Failed);
        assert!(result.detail.unwrap().contains("Connection refused"));

        let result = classify_shutdown(Some(255), "root@nas: Permission denied (publickey).");
        assert_eq!(result.status, ShutdownStatus::Failed);
    }

    #[test]
    fn test_classify_sudo_failure() {
        let result = classify_shutdown(Some(1), "sudo: a password is required");
        assert_eq!(result.status, ShutdownStatus::Failed);
        assert_eq!(result.detail.as_deref(), Some("SSH error: sudo: a password is required"));
    }

    #[test]
    fn test_public_key_path() {
        let transport = SshTransport::new(PathBuf::from("/data/ssh/id_ed25519"), Duration::from_secs(5));
        assert_eq!(transport.public_key_path(), PathBuf::from("/data/ssh/id_ed25519.pub"));
    }

    #[test]
    fn test_public_key_read() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("id_ed25519");
        let transport = SshTransport::new(key_path.clone(), Duration::from_secs(5));
        assert!(transport.public_key().is_none());

        std::fs::write(dir.path().join("id_ed25519.pub"), "ssh-ed25519 AAAA deadman\n").unwrap();
        assert_eq!(transport.public_key().as_deref(), Some("ssh-ed25519 AAAA deadman"));
    }
}
