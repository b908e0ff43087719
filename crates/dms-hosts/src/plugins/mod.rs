//! Capacités d'exécution : test de connexion et arrêt, par type d'hôte.
//!
//! Les hôtes API sont servis par un plugin choisi via leur `api_type` ;
//! les hôtes shell passent tous par le même transport intégré.

pub mod proxmox;
pub mod redfish;
pub mod ssh;
pub mod vcenter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::types::{ApiTarget, HostEntry};

/// Résultat d'un test de connexion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTest {
    pub success: bool,
    pub error: Option<String>,
}

impl ConnectionTest {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownStatus {
    /// Commande acceptée, arrêt en cours
    Initiated,
    /// Commande exécutée et acquittée
    Executed,
    /// Pas de réponse dans le délai (probablement déjà éteint)
    Timeout,
    Failed,
}

impl ShutdownStatus {
    /// Un délai dépassé compte comme un succès : la cible s'est très
    /// probablement éteinte avant d'acquitter.
    pub fn is_success(self) -> bool {
        !matches!(self, ShutdownStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownStatus::Initiated => "shutdown_initiated",
            ShutdownStatus::Executed => "executed",
            ShutdownStatus::Timeout => "timeout",
            ShutdownStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ShutdownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Résultat brut d'un arrêt, avant agrégation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownResult {
    pub status: ShutdownStatus,
    pub detail: Option<String>,
}

impl ShutdownResult {
    pub fn new(status: ShutdownStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: Some(detail.into()),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self::new(ShutdownStatus::Failed, detail)
    }
}

/// Capacité d'un type d'hôte API
#[async_trait]
pub trait ApiPlugin: Send + Sync {
    /// Étiquette utilisée dans `api_type`
    fn api_type(&self) -> &'static str;

    /// Doit rendre la main dans un délai borné ; toute erreur réseau ou
    /// d'authentification devient `success = false`.
    async fn test_connection(&self, target: ApiTarget<'_>) -> ConnectionTest;

    async fn shutdown(&self, target: ApiTarget<'_>) -> ShutdownResult;
}

/// Transport intégré des hôtes shell
#[async_trait]
pub trait ShellTransport: Send + Sync {
    async fn test_connection(&self, host: &str, user: &str) -> ConnectionTest;

    async fn shutdown(&self, host: &str, user: &str) -> ShutdownResult;

    /// Moitié publique de l'identité opérateur, à provisionner sur les cibles
    fn public_key(&self) -> Option<String>;
}

/// Association `api_type` → plugin
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn ApiPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registre avec les plugins fournis (proxmox, redfish, vcenter)
    pub fn with_builtin(timeout: Duration) -> Self {
        let client = http_client(timeout);
        let mut registry = Self::new();
        registry.register(Arc::new(proxmox::ProxmoxPlugin::new(client.clone())));
        registry.register(Arc::new(redfish::RedfishPlugin::new(client.clone())));
        registry.register(Arc::new(vcenter::VcenterPlugin::new(client)));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn ApiPlugin>) {
        self.plugins.insert(plugin.api_type().to_string(), plugin);
    }

    pub fn get(&self, api_type: &str) -> Option<Arc<dyn ApiPlugin>> {
        self.plugins.get(api_type).cloned()
    }

    pub fn types(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }
}

/// Regroupe les capacités : transport shell + plugins API
#[derive(Clone)]
pub struct Executors {
    pub shell: Arc<dyn ShellTransport>,
    pub plugins: Arc<PluginRegistry>,
}

impl Executors {
    pub fn new(shell: Arc<dyn ShellTransport>, plugins: PluginRegistry) -> Self {
        Self {
            shell,
            plugins: Arc::new(plugins),
        }
    }

    pub async fn test_connection(&self, entry: &HostEntry) -> ConnectionTest {
        match entry {
            HostEntry::Shell(h) => self.shell.test_connection(&h.host, &h.user).await,
            HostEntry::Api(h) => match self.plugins.get(&h.api_type) {
                Some(plugin) => plugin.test_connection(h.target()).await,
                None => ConnectionTest::failed(format!("Unknown type: {}", h.api_type)),
            },
        }
    }

    pub async fn shutdown(&self, entry: &HostEntry) -> ShutdownResult {
        match entry {
            HostEntry::Shell(h) => self.shell.shutdown(&h.host, &h.user).await,
            HostEntry::Api(h) => match self.plugins.get(&h.api_type) {
                Some(plugin) => plugin.shutdown(h.target()).await,
                None => ShutdownResult::failed(format!("Unknown type: {}", h.api_type)),
            },
        }
    }
}

/// Client HTTP partagé par les plugins.
///
/// Les interfaces de gestion (BMC, hyperviseurs) exposent presque toujours
/// des certificats auto-signés.
pub fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("Failed to build HTTP client, using defaults: {}", e);
            reqwest::Client::new()
        })
}

/// Base URL d'une cible : endpoint explicite ou `https://host`
pub(crate) fn base_url(target: &ApiTarget<'_>, default_port: Option<u16>) -> String {
    let endpoint = target.api_endpoint.trim();
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.trim_end_matches('/').to_string();
    }
    match default_port {
        Some(port) => format!("https://{}:{}", target.host, port),
        None => format!("https://{}", target.host),
    }
}

/// Traduit une erreur HTTP en résultat d'arrêt
pub(crate) fn shutdown_error(e: reqwest::Error) -> ShutdownResult {
    if e.is_timeout() {
        ShutdownResult::new(ShutdownStatus::Timeout, "request timed out")
    } else {
        ShutdownResult::failed(format!("HTTP request failed: {e}"))
    }
}

pub(crate) fn connection_error(e: reqwest::Error) -> ConnectionTest {
    if e.is_timeout() {
        ConnectionTest::failed("Connection timed out")
    } else if e.is_connect() {
        ConnectionTest::failed(format!("Connection failed: {e}"))
    } else {
        ConnectionTest::failed(format!("HTTP request failed: {e}"))
    }
}

/// Sépare `user:password`
pub(crate) fn split_credentials(api_key: &str) -> Option<(&str, &str)> {
    api_key
        .split_once(':')
        .filter(|(user, _)| !user.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target<'a>(host: &'a str, endpoint: &'a str) -> ApiTarget<'a> {
        ApiTarget {
            host,
            api_key: "",
            api_endpoint: endpoint,
        }
    }

    #[test]
    fn test_builtin_plugins() {
        let registry = PluginRegistry::with_builtin(Duration::from_secs(5));
        assert_eq!(registry.types(), vec!["proxmox", "redfish", "vcenter"]);
        assert!(registry.get("proxmox").is_some());
        assert!(registry.get("ipmi").is_none());
    }

    #[test]
    fn test_timeout_counts_as_success() {
        assert!(ShutdownStatus::Initiated.is_success());
        assert!(ShutdownStatus::Executed.is_success());
        assert!(ShutdownStatus::Timeout.is_success());
        assert!(!ShutdownStatus::Failed.is_success());
    }

    #[test]
    fn test_base_url() {
        assert_eq!(base_url(&target("pve", ""), Some(8006)), "https://pve:8006");
        assert_eq!(base_url(&target("bmc", ""), None), "https://bmc");
        assert_eq!(
            base_url(&target("pve", "http://10.0.0.5:8006/"), Some(8006)),
            "http://10.0.0.5:8006"
        );
    }

    #[test]
    fn test_split_credentials() {
        assert_eq!(split_credentials("root:pa:ss"), Some(("root", "pa:ss")));
        assert_eq!(split_credentials(":pass"), None);
        assert_eq!(split_credentials("token"), None);
    }
}
