use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use dms_common::events::{EventBus, HostStatusEvent};

use crate::plugins::Executors;
use crate::store::HostRegistry;
use crate::types::{HostEntry, HostKey, HostStatus};

/// Surveillance de joignabilité des hôtes activés.
///
/// Une sonde et l'écriture du statut qui la suit se font sous le verrou de
/// ligne de l'hôte : le balayage périodique et une sonde à la demande ne se
/// chevauchent jamais sur un même hôte.
pub struct Monitor {
    registry: Arc<HostRegistry>,
    executors: Executors,
    connect_timeout: Duration,
    events: Arc<EventBus>,
}

impl Monitor {
    pub fn new(
        registry: Arc<HostRegistry>,
        executors: Executors,
        connect_timeout: Duration,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            executors,
            connect_timeout,
            events,
        }
    }

    /// Boucle périodique
    pub async fn run(self: Arc<Self>, interval: Duration) {
        info!("Host monitoring started (interval: {}s)", interval.as_secs());
        loop {
            self.sweep().await;
            tokio::time::sleep(interval).await;
        }
    }

    /// Sonde tous les hôtes activés en parallèle, retourne le nombre sondé
    pub async fn sweep(self: &Arc<Self>) -> usize {
        let hosts = match self.registry.enabled_hosts() {
            Ok(hosts) => hosts,
            Err(e) => {
                error!("Monitoring cycle error: {}", e);
                return 0;
            }
        };
        if hosts.is_empty() {
            return 0;
        }

        let mut join_set = JoinSet::new();
        for entry in hosts {
            let monitor = Arc::clone(self);
            join_set.spawn(async move { monitor.check_and_record(&entry.key()).await });
        }

        let mut checked = 0;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Some(_)) => checked += 1,
                Ok(None) => {}
                Err(e) => error!("Check task failed: {}", e),
            }
        }
        checked
    }

    /// Teste une entrée sans jamais échouer : toute erreur devient `Offline`
    pub async fn check_host(&self, entry: &HostEntry) -> (HostStatus, Option<String>) {
        match tokio::time::timeout(self.connect_timeout, self.executors.test_connection(entry)).await {
            Ok(test) if test.success => (HostStatus::Online, None),
            Ok(test) => (
                HostStatus::Offline,
                Some(test.error.unwrap_or_else(|| "connection test failed".to_string())),
            ),
            Err(_) => (HostStatus::Offline, Some("Connection timed out".to_string())),
        }
    }

    /// Sonde un hôte et enregistre son statut. `None` si l'hôte n'est plus
    /// activé (supprimé entre-temps).
    pub async fn check_and_record(&self, key: &HostKey) -> Option<HostStatus> {
        let _row = self.registry.lock_host(key).await;

        let entry = match self.registry.resolve_enabled(key) {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                error!(host = %key, "Failed to load host: {}", e);
                return None;
            }
        };

        let (status, check_error) = self.check_host(&entry).await;
        if let Err(e) = self.registry.update_status(key, status, check_error.as_deref()) {
            error!(host = %key, "Failed to record status: {}", e);
        }

        let previous = entry.last_status();
        if previous != status {
            debug!(host = %key, "{} -> {}", previous, status);
            let event = HostStatusEvent {
                host_id: key.id(),
                status: status.to_string(),
                error: check_error,
            };
            if self.events.host_status.send(event).is_err() {
                debug!(host = %key, "No status subscriber");
            }
        }
        Some(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{ConnectionTest, PluginRegistry, ShellTransport, ShutdownResult};
    use async_trait::async_trait;

    struct FakeShell;

    #[async_trait]
    impl ShellTransport for FakeShell {
        async fn test_connection(&self, host: &str, _user: &str) -> ConnectionTest {
            match host {
                "up" => ConnectionTest::ok(),
                "hang" => {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    ConnectionTest::ok()
                }
                _ => ConnectionTest::failed("Connection refused"),
            }
        }

        async fn shutdown(&self, _host: &str, _user: &str) -> ShutdownResult {
            ShutdownResult::failed("unused")
        }

        fn public_key(&self) -> Option<String> {
            None
        }
    }

    fn monitor(registry: Arc<HostRegistry>, events: Arc<EventBus>) -> Arc<Monitor> {
        Arc::new(Monitor::new(
            registry,
            Executors::new(Arc::new(FakeShell), PluginRegistry::new()),
            Duration::from_millis(100),
            events,
        ))
    }

    fn key(host: &str) -> HostKey {
        HostKey::Shell {
            host: host.into(),
            user: "root".into(),
        }
    }

    #[tokio::test]
    async fn test_sweep_updates_statuses() {
        let registry = Arc::new(HostRegistry::open_in_memory().unwrap());
        registry.add_shell_host("up", "root", "").unwrap();
        registry.add_shell_host("down", "root", "").unwrap();
        registry.add_shell_host("hang", "root", "").unwrap();
        registry.add_shell_host("disabled", "root", "").unwrap();
        registry.set_enabled(&key("disabled"), false).unwrap();

        let events = Arc::new(EventBus::new());
        let mut rx = events.host_status.subscribe();
        let checked = monitor(Arc::clone(&registry), events).sweep().await;
        assert_eq!(checked, 3);

        let hosts = registry.list_shell_hosts(false).unwrap();
        assert_eq!(hosts[0].last_status, HostStatus::Online);
        assert_eq!(hosts[1].last_status, HostStatus::Offline);
        assert_eq!(hosts[1].last_error.as_deref(), Some("Connection refused"));
        assert_eq!(hosts[2].last_status, HostStatus::Offline);
        assert_eq!(hosts[2].last_error.as_deref(), Some("Connection timed out"));
        assert_eq!(hosts[3].last_status, HostStatus::Unknown);

        let mut changed = 0;
        while rx.try_recv().is_ok() {
            changed += 1;
        }
        assert_eq!(changed, 3);
    }

    #[tokio::test]
    async fn test_unknown_api_type_is_offline() {
        let registry = Arc::new(HostRegistry::open_in_memory().unwrap());
        registry.add_api_host("ipmi1", "ipmi", "k", "", "").unwrap();
        let monitor = monitor(Arc::clone(&registry), Arc::new(EventBus::new()));

        let status = monitor
            .check_and_record(&HostKey::Api {
                host: "ipmi1".into(),
                api_type: "ipmi".into(),
            })
            .await;
        assert_eq!(status, Some(HostStatus::Offline));
    }

    #[tokio::test]
    async fn test_check_removed_host() {
        let registry = Arc::new(HostRegistry::open_in_memory().unwrap());
        let monitor = monitor(registry, Arc::new(EventBus::new()));
        assert_eq!(monitor.check_and_record(&key("ghost")).await, None);
    }
}
