use serde::{Deserialize, Serialize};
use std::fmt;

/// Dernier statut observé d'un hôte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    #[default]
    Unknown,
    Online,
    Offline,
}

impl HostStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HostStatus::Unknown => "unknown",
            HostStatus::Online => "online",
            HostStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "online" => HostStatus::Online,
            "offline" => HostStatus::Offline,
            _ => HostStatus::Unknown,
        }
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    #[serde(rename = "ssh")]
    Shell,
    Api,
}

impl HostKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HostKind::Shell => "ssh",
            HostKind::Api => "api",
        }
    }
}

/// Hôte joignable par session shell distante (clé : `(host, user)`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellHost {
    pub host: String,
    pub user: String,
    pub description: String,
    pub enabled: bool,
    pub last_status: HostStatus,
    pub last_error: Option<String>,
    pub last_checked: Option<i64>,
}

/// Hôte piloté par une API constructeur (clé opérateur : `host`)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiHost {
    pub host: String,
    pub api_type: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub api_endpoint: String,
    pub description: String,
    pub enabled: bool,
    pub last_status: HostStatus,
    pub last_error: Option<String>,
    pub last_checked: Option<i64>,
}

impl fmt::Debug for ApiHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiHost")
            .field("host", &self.host)
            .field("api_type", &self.api_type)
            .field("api_key", &"<redacted>")
            .field("api_endpoint", &self.api_endpoint)
            .field("enabled", &self.enabled)
            .field("last_status", &self.last_status)
            .finish_non_exhaustive()
    }
}

impl ApiHost {
    pub fn target(&self) -> ApiTarget<'_> {
        ApiTarget {
            host: &self.host,
            api_key: &self.api_key,
            api_endpoint: &self.api_endpoint,
        }
    }
}

/// Paramètres de connexion passés à un plugin API
#[derive(Clone, Copy)]
pub struct ApiTarget<'a> {
    pub host: &'a str,
    pub api_key: &'a str,
    pub api_endpoint: &'a str,
}

/// Identité d'exécution d'un hôte, sérialisée en `kind:host:discriminator`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostKey {
    Shell { host: String, user: String },
    Api { host: String, api_type: String },
}

impl HostKey {
    pub fn kind(&self) -> HostKind {
        match self {
            HostKey::Shell { .. } => HostKind::Shell,
            HostKey::Api { .. } => HostKind::Api,
        }
    }

    pub fn host(&self) -> &str {
        match self {
            HostKey::Shell { host, .. } | HostKey::Api { host, .. } => host,
        }
    }

    pub fn id(&self) -> String {
        match self {
            HostKey::Shell { host, user } => format!("ssh:{host}:{user}"),
            HostKey::Api { host, api_type } => format!("api:{host}:{api_type}"),
        }
    }

    /// Parse un identifiant `kind:host:discriminator`.
    ///
    /// Le discriminant (utilisateur ou type d'API) ne contient jamais de `:`,
    /// l'hôte peut en contenir (IPv6).
    pub fn parse(id: &str) -> Option<Self> {
        let (kind, rest) = id.split_once(':')?;
        let (host, discriminator) = rest.rsplit_once(':')?;
        if host.is_empty() || discriminator.is_empty() {
            return None;
        }
        match kind {
            "ssh" => Some(HostKey::Shell {
                host: host.to_string(),
                user: discriminator.to_string(),
            }),
            "api" => Some(HostKey::Api {
                host: host.to_string(),
                api_type: discriminator.to_string(),
            }),
            _ => None,
        }
    }

    /// Libellé lisible : `user@host` ou `host (type)`
    pub fn label(&self) -> String {
        match self {
            HostKey::Shell { host, user } => format!("{user}@{host}"),
            HostKey::Api { host, api_type } => format!("{host} ({api_type})"),
        }
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Entrée du registre, quel que soit son type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEntry {
    Shell(ShellHost),
    Api(ApiHost),
}

impl HostEntry {
    pub fn key(&self) -> HostKey {
        match self {
            HostEntry::Shell(h) => HostKey::Shell {
                host: h.host.clone(),
                user: h.user.clone(),
            },
            HostEntry::Api(h) => HostKey::Api {
                host: h.host.clone(),
                api_type: h.api_type.clone(),
            },
        }
    }

    pub fn label(&self) -> String {
        self.key().label()
    }

    pub fn enabled(&self) -> bool {
        match self {
            HostEntry::Shell(h) => h.enabled,
            HostEntry::Api(h) => h.enabled,
        }
    }

    pub fn last_status(&self) -> HostStatus {
        match self {
            HostEntry::Shell(h) => h.last_status,
            HostEntry::Api(h) => h.last_status,
        }
    }

    /// Nom de la phase d'arrêt : `ssh` ou le type d'API
    pub fn phase_type(&self) -> &str {
        match self {
            HostEntry::Shell(_) => "ssh",
            HostEntry::Api(h) => &h.api_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_key_roundtrip() {
        let shell = HostKey::Shell {
            host: "nas.local".into(),
            user: "root".into(),
        };
        assert_eq!(shell.id(), "ssh:nas.local:root");
        assert_eq!(HostKey::parse(&shell.id()), Some(shell.clone()));
        assert_eq!(shell.label(), "root@nas.local");

        let api = HostKey::Api {
            host: "pve1".into(),
            api_type: "proxmox".into(),
        };
        assert_eq!(HostKey::parse("api:pve1:proxmox"), Some(api));
    }

    #[test]
    fn test_host_key_ipv6_host() {
        let key = HostKey::parse("ssh:fd00::12:admin").unwrap();
        assert_eq!(
            key,
            HostKey::Shell {
                host: "fd00::12".into(),
                user: "admin".into()
            }
        );
    }

    #[test]
    fn test_host_key_rejects_malformed() {
        assert!(HostKey::parse("ssh:nas").is_none());
        assert!(HostKey::parse("ftp:nas:root").is_none());
        assert!(HostKey::parse("ssh::root").is_none());
        assert!(HostKey::parse("").is_none());
    }

    #[test]
    fn test_api_host_debug_redacts_key() {
        let host = ApiHost {
            host: "bmc1".into(),
            api_type: "redfish".into(),
            api_key: "admin:hunter2".into(),
            api_endpoint: String::new(),
            description: String::new(),
            enabled: true,
            last_status: HostStatus::Unknown,
            last_error: None,
            last_checked: None,
        };
        assert!(!format!("{host:?}").contains("hunter2"));
        assert!(!serde_json::to_string(&host).unwrap().contains("hunter2"));
    }
}
