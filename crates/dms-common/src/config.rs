use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration principale chargée depuis les variables d'environnement
///
/// Tous les secrets sont optionnels : leur absence désactive la fonctionnalité
/// concernée (login, notifications) sans empêcher le démarrage.
#[derive(Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Répertoire des données (base SQLite `deadman.db`)
    pub data_dir: PathBuf,
    /// Secret statique partagé (premier facteur)
    pub static_token: Option<String>,
    /// Graine TOTP encodée en base32 (second facteur)
    pub totp_secret: Option<String>,
    /// Seule identité opérateur autorisée (chat Telegram)
    pub operator_id: Option<String>,
    /// Jeton du bot Telegram (adaptateur + notifications)
    pub bot_token: Option<String>,
    /// Clé privée SSH utilisée pour les hôtes shell
    pub ssh_key_path: PathBuf,
    pub monitor_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    /// Durée de vie d'un login ou d'une opération en attente de confirmation
    pub flow_ttl_secs: u64,
}

impl std::fmt::Debug for EnvConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvConfig")
            .field("data_dir", &self.data_dir)
            .field("static_token", &self.static_token.as_ref().map(|_| "<set>"))
            .field("totp_secret", &self.totp_secret.as_ref().map(|_| "<set>"))
            .field("operator_id", &self.operator_id)
            .field("bot_token", &self.bot_token.as_ref().map(|_| "<set>"))
            .field("ssh_key_path", &self.ssh_key_path)
            .field("monitor_interval_secs", &self.monitor_interval_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("shutdown_timeout_secs", &self.shutdown_timeout_secs)
            .field("flow_ttl_secs", &self.flow_ttl_secs)
            .finish()
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/opt/deadman/data"),
            static_token: None,
            totp_secret: None,
            operator_id: None,
            bot_token: None,
            ssh_key_path: PathBuf::from("/opt/deadman/data/ssh/id_ed25519"),
            monitor_interval_secs: 60,
            connect_timeout_secs: 10,
            shutdown_timeout_secs: 30,
            flow_ttl_secs: 300,
        }
    }
}

impl EnvConfig {
    /// Charge la configuration depuis les variables d'environnement
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("DMS_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        config.static_token = non_empty_var("DMS_STATIC_TOKEN");
        config.totp_secret = non_empty_var("DMS_TOTP_SECRET");
        config.operator_id = non_empty_var("TELEGRAM_CHAT_ID");
        config.bot_token = non_empty_var("TELEGRAM_BOT_TOKEN");
        if let Ok(v) = std::env::var("DMS_SSH_KEY_PATH") {
            config.ssh_key_path = PathBuf::from(v);
        }
        if let Some(secs) = parse_var("DMS_MONITOR_INTERVAL_SECS") {
            config.monitor_interval_secs = secs;
        }
        if let Some(secs) = parse_var("DMS_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout_secs = secs;
        }
        if let Some(secs) = parse_var("DMS_SHUTDOWN_TIMEOUT_SECS") {
            config.shutdown_timeout_secs = secs;
        }
        if let Some(secs) = parse_var("DMS_FLOW_TTL_SECS") {
            config.flow_ttl_secs = secs;
        }

        config
    }

    /// Charge le fichier .env puis les variables d'environnement
    pub fn load(env_file: Option<&Path>) -> Self {
        if let Some(path) = env_file {
            load_dotenv(path);
        } else {
            let candidates = [PathBuf::from("/opt/deadman/.env"), PathBuf::from(".env")];
            for candidate in &candidates {
                if candidate.exists() {
                    load_dotenv(candidate);
                    break;
                }
            }
        }

        Self::from_env()
    }

    /// Chemin de la base SQLite partagée (hôtes + sessions)
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("deadman.db")
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs.max(1))
    }

    pub fn flow_ttl(&self) -> Duration {
        Duration::from_secs(self.flow_ttl_secs)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Charge un fichier .env basique (KEY=VALUE par ligne)
fn load_dotenv(path: &Path) {
    if let Ok(content) = std::fs::read_to_string(path) {
        for (key, value) in parse_dotenv(&content) {
            if std::env::var(&key).is_err() {
                // SAFETY: called before spawning any threads (single-threaded init)
                unsafe { std::env::set_var(&key, &value) };
            }
        }
    }
}

fn parse_dotenv(content: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"').trim_matches('\'');
            pairs.push((key.to_string(), value.to_string()));
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dotenv() {
        let pairs = parse_dotenv(
            "# commentaire\n\nDMS_STATIC_TOKEN=\"abc\"\nTELEGRAM_CHAT_ID = 42\nbroken line\n",
        );
        assert_eq!(
            pairs,
            vec![
                ("DMS_STATIC_TOKEN".to_string(), "abc".to_string()),
                ("TELEGRAM_CHAT_ID".to_string(), "42".to_string()),
            ]
        );
    }

    #[test]
    fn test_debug_hides_secrets() {
        let config = EnvConfig {
            static_token: Some("super-secret".into()),
            totp_secret: Some("JBSWY3DPEHPK3PXP".into()),
            ..EnvConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("JBSWY3DPEHPK3PXP"));
        assert!(rendered.contains("<set>"));
    }

    #[test]
    fn test_timeouts_never_zero() {
        let config = EnvConfig {
            connect_timeout_secs: 0,
            shutdown_timeout_secs: 0,
            ..EnvConfig::default()
        };
        assert_eq!(config.connect_timeout(), Duration::from_secs(1));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(1));
    }
}
