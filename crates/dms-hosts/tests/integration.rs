use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::tempdir;

use dms_common::events::EventBus;
use dms_hosts::{
    ApiPlugin, ApiTarget, ConnectionTest, Executors, HostKey, HostRegistry, HostStatus, Monitor,
    Orchestrator, PluginRegistry, ShellTransport, ShutdownResult, ShutdownStatus,
};

#[derive(Default)]
struct CountingShell {
    shutdowns: AtomicUsize,
}

#[async_trait]
impl ShellTransport for CountingShell {
    async fn test_connection(&self, _host: &str, _user: &str) -> ConnectionTest {
        ConnectionTest::ok()
    }

    async fn shutdown(&self, _host: &str, _user: &str) -> ShutdownResult {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        ShutdownResult::new(ShutdownStatus::Initiated, "connection closed by remote host")
    }

    fn public_key(&self) -> Option<String> {
        Some("ssh-ed25519 AAAA test".into())
    }
}

struct UnreachableBmc;

#[async_trait]
impl ApiPlugin for UnreachableBmc {
    fn api_type(&self) -> &'static str {
        "redfish"
    }

    async fn test_connection(&self, target: ApiTarget<'_>) -> ConnectionTest {
        ConnectionTest::failed(format!("Connection failed: {}", target.host))
    }

    async fn shutdown(&self, _target: ApiTarget<'_>) -> ShutdownResult {
        ShutdownResult::failed("HTTP request failed")
    }
}

/// Registre sur disque, sonde puis arrêt complet, statuts relus après réouverture
#[tokio::test]
async fn test_monitor_then_shutdown_on_disk() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("deadman.db");

    let shell = Arc::new(CountingShell::default());
    let mut plugins = PluginRegistry::new();
    plugins.register(Arc::new(UnreachableBmc));
    let executors = Executors::new(shell.clone(), plugins);

    {
        let registry = Arc::new(HostRegistry::new(&db_path).unwrap());
        registry.add_shell_host("nas", "root", "NAS").unwrap();
        registry.add_shell_host("backup", "admin", "").unwrap();
        registry.add_api_host("bmc1", "redfish", "root:calvin", "", "iDRAC").unwrap();

        let monitor = Arc::new(Monitor::new(
            Arc::clone(&registry),
            executors.clone(),
            Duration::from_secs(1),
            Arc::new(EventBus::new()),
        ));
        assert_eq!(monitor.sweep().await, 3);

        let bmc = HostKey::Api {
            host: "bmc1".into(),
            api_type: "redfish".into(),
        };
        let entry = registry.get(&bmc).unwrap().unwrap();
        assert_eq!(entry.last_status(), HostStatus::Offline);

        let orchestrator = Orchestrator::new(registry, executors, Duration::from_secs(1));
        let report = orchestrator.full_shutdown().await.unwrap();
        assert_eq!(report.summary(), "2/3");
        assert_eq!(shell.shutdowns.load(Ordering::SeqCst), 2);
        let failed: Vec<_> = report
            .outcomes()
            .filter(|o| o.status == ShutdownStatus::Failed)
            .map(|o| o.host_label.as_str())
            .collect();
        assert_eq!(failed, vec!["bmc1 (redfish)"]);
    }

    let registry = HostRegistry::new(&db_path).unwrap();
    let shells = registry.list_shell_hosts(true).unwrap();
    assert!(shells.iter().all(|h| h.last_status == HostStatus::Offline));
    let apis = registry.list_api_hosts(true).unwrap();
    assert_eq!(apis[0].api_key, "root:calvin");
    assert_eq!(apis[0].last_error.as_deref(), Some("HTTP request failed"));
}

/// Une sélection entièrement périmée produit un bilan vide, pas une erreur
#[tokio::test]
async fn test_selective_shutdown_all_stale() {
    let registry = Arc::new(HostRegistry::open_in_memory().unwrap());
    registry.add_shell_host("nas", "root", "").unwrap();
    let keys = vec![HostKey::parse("ssh:nas:root").unwrap()];
    registry.remove_shell_host("nas", "root").unwrap();

    let shell = Arc::new(CountingShell::default());
    let orchestrator = Orchestrator::new(
        registry,
        Executors::new(shell.clone(), PluginRegistry::new()),
        Duration::from_secs(1),
    );
    let report = orchestrator.selective_shutdown(&keys).await.unwrap();
    assert_eq!(report.total_count(), 0);
    assert!(report.phases.is_empty());
    assert_eq!(shell.shutdowns.load(Ordering::SeqCst), 0);
}
