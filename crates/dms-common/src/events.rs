use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Bus d'événements pour la communication inter-services
pub struct EventBus {
    /// Événements critiques à relayer vers l'opérateur (control → notifier)
    pub notifications: broadcast::Sender<Notification>,
    /// Changements de statut des hôtes (monitor → logs / adaptateur)
    pub host_status: broadcast::Sender<HostStatusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            notifications: broadcast::channel(64).0,
            host_status: broadcast::channel(256).0,
        }
    }

    /// Publie une notification sans jamais bloquer ni échouer l'appelant
    pub fn notify(&self, notification: Notification) {
        if self.notifications.send(notification).is_err() {
            tracing::debug!("No notification subscriber, event dropped");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// Une identité non autorisée a contacté le canal de contrôle
    UntrustedSource { source: String, channel: String },
    ShutdownInitiated { scope: ShutdownScope, hosts: usize },
    HostAdded { host: String, kind: String },
    HostRemoved { host: String, kind: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownScope {
    Full,
    Selective,
}

impl Notification {
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Notification::UntrustedSource { .. } | Notification::ShutdownInitiated { .. }
        )
    }

    /// Texte brut envoyé au puits de notification
    pub fn message(&self) -> String {
        let prefix = if self.is_critical() { "CRITICAL" } else { "INFO" };
        let body = match self {
            Notification::UntrustedSource { source, channel } => {
                format!("New untrusted source detected\nSource: {source}\nChannel: {channel}")
            }
            Notification::ShutdownInitiated { scope, hosts } => {
                let scope = match scope {
                    ShutdownScope::Full => "full",
                    ShutdownScope::Selective => "selective",
                };
                format!("Shutdown sequence initiated\nScope: {scope}\nHosts: {hosts}")
            }
            Notification::HostAdded { host, kind } => {
                format!("Host added\nType: {kind}\nHost: {host}")
            }
            Notification::HostRemoved { host, kind } => {
                format!("Host removed\nType: {kind}\nHost: {host}")
            }
        };
        format!("{prefix}\n\n{body}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostStatusEvent {
    /// Identifiant `kind:host:discriminator`
    pub host_id: String,
    pub status: String,
    pub error: Option<String>,
}
