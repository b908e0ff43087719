//! Orchestration de l'arrêt d'urgence.
//!
//! Les hôtes sont regroupés en phases (une pour les hôtes shell, une par type
//! d'API). Toutes les phases d'une exécution tournent en parallèle ; à
//! l'intérieur d'une phase chaque hôte a sa propre tâche et son propre délai.
//! Une défaillance sur un hôte ne fait jamais échouer les autres : chaque
//! hôte ciblé produit exactement une entrée de résultat.

use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dms_common::events::ShutdownScope;

use crate::plugins::{Executors, ShutdownResult, ShutdownStatus};
use crate::store::HostRegistry;
use crate::types::{HostEntry, HostKey, HostStatus};

/// Résultat d'un arrêt pour un hôte
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownOutcome {
    pub host_id: String,
    pub host_label: String,
    pub status: ShutdownStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub name: String,
    pub outcomes: Vec<ShutdownOutcome>,
}

impl PhaseReport {
    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.status.is_success()).count()
    }
}

/// Bilan d'une exécution complète ou sélective
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub run_id: Uuid,
    pub scope: ShutdownScope,
    pub started_at: i64,
    pub finished_at: i64,
    pub phases: Vec<PhaseReport>,
}

impl ShutdownReport {
    pub fn outcomes(&self) -> impl Iterator<Item = &ShutdownOutcome> {
        self.phases.iter().flat_map(|p| p.outcomes.iter())
    }

    /// Initiated, Executed et Timeout comptent comme des succès
    pub fn success_count(&self) -> usize {
        self.phases.iter().map(PhaseReport::success_count).sum()
    }

    pub fn total_count(&self) -> usize {
        self.phases.iter().map(|p| p.outcomes.len()).sum()
    }

    /// `succès/total`, ex. `2/3`
    pub fn summary(&self) -> String {
        format!("{}/{}", self.success_count(), self.total_count())
    }
}

/// État d'avancement exposé par la commande de statut
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownProgress {
    pub in_progress: bool,
    /// Phases encore en cours
    pub phases: Vec<String>,
    pub started_at: Option<i64>,
}

struct Phase {
    name: String,
    /// Capacité partagée par tous les hôtes de la phase (`ssh`, `proxmox`…)
    type_label: String,
    hosts: Vec<HostEntry>,
}

pub struct Orchestrator {
    registry: Arc<HostRegistry>,
    executors: Executors,
    per_host_timeout: Duration,
    progress: RwLock<ShutdownProgress>,
    /// Une seule exécution à la fois
    run_lock: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn new(registry: Arc<HostRegistry>, executors: Executors, per_host_timeout: Duration) -> Self {
        Self {
            registry,
            executors,
            per_host_timeout,
            progress: RwLock::new(ShutdownProgress::default()),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn progress(&self) -> ShutdownProgress {
        self.progress
            .read()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Arrête tous les hôtes activés, une phase par type présent
    pub async fn full_shutdown(&self) -> anyhow::Result<ShutdownReport> {
        let _run = self.run_lock.lock().await;
        let hosts = self.registry.enabled_hosts()?;
        error!(hosts = hosts.len(), "CRITICAL: full shutdown sequence started");
        Ok(self.run(ShutdownScope::Full, group_phases(hosts)).await)
    }

    /// Arrête un sous-ensemble choisi par l'opérateur.
    ///
    /// Les clés sont résolues maintenant : un hôte supprimé ou désactivé
    /// depuis la sélection est simplement ignoré.
    pub async fn selective_shutdown(&self, keys: &[HostKey]) -> anyhow::Result<ShutdownReport> {
        let _run = self.run_lock.lock().await;
        let mut hosts = Vec::with_capacity(keys.len());
        for key in keys {
            match self.registry.resolve_enabled(key)? {
                Some(entry) => hosts.push(entry),
                None => info!(host = %key, "Selected host no longer enabled, skipped"),
            }
        }
        error!(
            selected = keys.len(),
            resolved = hosts.len(),
            "CRITICAL: selective shutdown sequence started"
        );
        Ok(self.run(ShutdownScope::Selective, group_phases(hosts)).await)
    }

    /// Exécute une seule phase et retourne ses résultats, dans l'ordre des hôtes.
    ///
    /// Un hôte qui n'appartient pas à `type_label` n'est pas exécuté et reçoit
    /// un résultat `Failed`.
    pub async fn execute_phase(
        &self,
        hosts: Vec<HostEntry>,
        type_label: &str,
        phase_name: &str,
    ) -> PhaseReport {
        debug!(phase = phase_name, type_label, hosts = hosts.len(), "Executing shutdown phase");
        let mut phases = self
            .execute_phases(vec![Phase {
                name: phase_name.to_string(),
                type_label: type_label.to_string(),
                hosts,
            }])
            .await;
        phases.pop().unwrap_or_else(|| PhaseReport {
            name: phase_name.to_string(),
            outcomes: Vec::new(),
        })
    }

    async fn run(&self, scope: ShutdownScope, phases: Vec<Phase>) -> ShutdownReport {
        let run_id = Uuid::new_v4();
        let started_at = dms_common::now_millis();
        self.set_progress(ShutdownProgress {
            in_progress: true,
            phases: phases.iter().map(|p| p.name.clone()).collect(),
            started_at: Some(started_at),
        });

        let phases = self.execute_phases(phases).await;
        self.set_progress(ShutdownProgress::default());

        let report = ShutdownReport {
            run_id,
            scope,
            started_at,
            finished_at: dms_common::now_millis(),
            phases,
        };
        info!(
            run_id = %report.run_id,
            summary = %report.summary(),
            "Shutdown sequence finished"
        );
        report
    }

    async fn execute_phases(&self, phases: Vec<Phase>) -> Vec<PhaseReport> {
        // Une entrée par hôte, remplie au fil des retours
        let mut reports: Vec<PhaseReport> = phases
            .iter()
            .map(|phase| PhaseReport {
                name: phase.name.clone(),
                outcomes: phase
                    .hosts
                    .iter()
                    .map(|h| ShutdownOutcome {
                        host_id: h.key().id(),
                        host_label: h.label(),
                        status: ShutdownStatus::Failed,
                        detail: Some("no result".to_string()),
                    })
                    .collect(),
            })
            .collect();
        let mut remaining: Vec<usize> = phases.iter().map(|p| p.hosts.len()).collect();

        let mut tasks = JoinSet::new();
        for (phase_idx, phase) in phases.into_iter().enumerate() {
            for (host_idx, entry) in phase.hosts.into_iter().enumerate() {
                if entry.phase_type() != phase.type_label {
                    warn!(host = %entry.key(), phase = %phase.name, "Host does not match phase type, skipped");
                    let outcome = &mut reports[phase_idx].outcomes[host_idx];
                    outcome.detail = Some(format!("not a {} host", phase.type_label));
                    remaining[phase_idx] -= 1;
                    continue;
                }
                let executors = self.executors.clone();
                let registry = Arc::clone(&self.registry);
                let timeout = self.per_host_timeout;
                tasks.spawn(async move {
                    let result = shutdown_host(&executors, &entry, timeout).await;
                    record_result(&registry, &entry, &result).await;
                    (phase_idx, host_idx, result)
                });
            }
        }

        for (phase_idx, left) in remaining.iter().enumerate() {
            if *left == 0 {
                self.phase_done(&reports[phase_idx].name);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            let (phase_idx, host_idx, result) = match joined {
                Ok(r) => r,
                Err(e) => {
                    error!("Shutdown task aborted: {}", e);
                    continue;
                }
            };
            let outcome = &mut reports[phase_idx].outcomes[host_idx];
            outcome.status = result.status;
            outcome.detail = result.detail;

            remaining[phase_idx] -= 1;
            if remaining[phase_idx] == 0 {
                let name = reports[phase_idx].name.clone();
                self.phase_done(&name);
            }
        }

        reports
    }

    fn set_progress(&self, progress: ShutdownProgress) {
        let mut guard = self.progress.write().unwrap_or_else(|e| e.into_inner());
        *guard = progress;
    }

    fn phase_done(&self, name: &str) {
        let mut guard = self.progress.write().unwrap_or_else(|e| e.into_inner());
        guard.phases.retain(|p| p != name);
    }
}

/// Regroupe par type, en conservant l'ordre de première apparition
fn group_phases(hosts: Vec<HostEntry>) -> Vec<Phase> {
    let mut phases: Vec<(String, Phase)> = Vec::new();
    for entry in hosts {
        let type_label = entry.phase_type().to_string();
        match phases.iter_mut().find(|(t, _)| *t == type_label) {
            Some((_, phase)) => phase.hosts.push(entry),
            None => phases.push((
                type_label.clone(),
                Phase {
                    name: type_label.to_uppercase(),
                    type_label,
                    hosts: vec![entry],
                },
            )),
        }
    }
    phases.into_iter().map(|(_, phase)| phase).collect()
}

/// Lance l'arrêt dans sa propre tâche : une panique du plugin devient un
/// échec, un dépassement de délai devient `Timeout` et la tâche est annulée.
async fn shutdown_host(executors: &Executors, entry: &HostEntry, timeout: Duration) -> ShutdownResult {
    let executors = executors.clone();
    let owned = entry.clone();
    let handle = tokio::spawn(async move { executors.shutdown(&owned).await });
    let abort = handle.abort_handle();

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!(host = %entry.key(), "Shutdown execution panicked: {}", e);
            ShutdownResult::failed("internal error during execution")
        }
        Err(_) => {
            abort.abort();
            ShutdownResult::new(
                ShutdownStatus::Timeout,
                format!("no answer after {}s", timeout.as_secs_f32()),
            )
        }
    }
}

async fn record_result(registry: &HostRegistry, entry: &HostEntry, result: &ShutdownResult) {
    let key = entry.key();
    let _row = registry.lock_host(&key).await;
    let update = if result.status.is_success() {
        registry.update_status(&key, HostStatus::Offline, None)
    } else {
        warn!(host = %key, "Shutdown failed: {}", result.detail.as_deref().unwrap_or(""));
        registry.update_status(&key, entry.last_status(), result.detail.as_deref())
    };
    if let Err(e) = update {
        error!(host = %key, "Failed to record shutdown result: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{ApiPlugin, ConnectionTest, PluginRegistry, ShellTransport};
    use crate::types::ApiTarget;
    use async_trait::async_trait;

    /// Transport dont le comportement dépend du nom d'hôte
    struct ScriptedShell;

    #[async_trait]
    impl ShellTransport for ScriptedShell {
        async fn test_connection(&self, _host: &str, _user: &str) -> ConnectionTest {
            ConnectionTest::ok()
        }

        async fn shutdown(&self, host: &str, _user: &str) -> ShutdownResult {
            match host {
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    ShutdownResult::new(ShutdownStatus::Executed, "late")
                }
                "broken" => ShutdownResult::failed("Permission denied"),
                "panics" => panic!("plugin bug"),
                _ => ShutdownResult::new(ShutdownStatus::Executed, "ok"),
            }
        }

        fn public_key(&self) -> Option<String> {
            None
        }
    }

    struct OkPlugin(&'static str);

    #[async_trait]
    impl ApiPlugin for OkPlugin {
        fn api_type(&self) -> &'static str {
            self.0
        }

        async fn test_connection(&self, _target: ApiTarget<'_>) -> ConnectionTest {
            ConnectionTest::ok()
        }

        async fn shutdown(&self, _target: ApiTarget<'_>) -> ShutdownResult {
            ShutdownResult::new(ShutdownStatus::Initiated, "accepted")
        }
    }

    fn orchestrator(registry: Arc<HostRegistry>) -> Orchestrator {
        let mut plugins = PluginRegistry::new();
        plugins.register(Arc::new(OkPlugin("proxmox")));
        plugins.register(Arc::new(OkPlugin("redfish")));
        Orchestrator::new(
            registry,
            Executors::new(Arc::new(ScriptedShell), plugins),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_full_shutdown_counts_timeout_as_success() {
        let registry = Arc::new(HostRegistry::open_in_memory().unwrap());
        registry.add_shell_host("slow", "root", "").unwrap();
        registry.add_shell_host("fine", "root", "").unwrap();
        registry.add_shell_host("broken", "root", "").unwrap();

        let report = orchestrator(Arc::clone(&registry)).full_shutdown().await.unwrap();
        assert_eq!(report.phases.len(), 1);
        assert_eq!(report.phases[0].name, "SSH");
        assert_eq!(report.total_count(), 3);
        assert_eq!(report.summary(), "2/3");

        let statuses: Vec<ShutdownStatus> = report.outcomes().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![ShutdownStatus::Timeout, ShutdownStatus::Executed, ShutdownStatus::Failed]
        );
        assert_eq!(report.phases[0].outcomes[0].host_label, "root@slow");
    }

    #[tokio::test]
    async fn test_phases_per_type() {
        let registry = Arc::new(HostRegistry::open_in_memory().unwrap());
        registry.add_shell_host("nas", "root", "").unwrap();
        registry.add_api_host("pve1", "proxmox", "k", "", "").unwrap();
        registry.add_api_host("bmc1", "redfish", "a:b", "", "").unwrap();
        registry.add_api_host("pve2", "proxmox", "k", "", "").unwrap();

        let report = orchestrator(registry).full_shutdown().await.unwrap();
        let names: Vec<&str> = report.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["SSH", "PROXMOX", "REDFISH"]);
        assert_eq!(report.phases[1].outcomes.len(), 2);
        assert_eq!(report.summary(), "4/4");
    }

    #[tokio::test]
    async fn test_panicking_plugin_is_isolated() {
        let registry = Arc::new(HostRegistry::open_in_memory().unwrap());
        registry.add_shell_host("panics", "root", "").unwrap();
        registry.add_shell_host("fine", "root", "").unwrap();

        let report = orchestrator(registry).full_shutdown().await.unwrap();
        assert_eq!(report.total_count(), 2);
        assert_eq!(report.phases[0].outcomes[0].status, ShutdownStatus::Failed);
        assert_eq!(report.phases[0].outcomes[1].status, ShutdownStatus::Executed);
    }

    #[tokio::test]
    async fn test_status_recorded_after_execution() {
        let registry = Arc::new(HostRegistry::open_in_memory().unwrap());
        registry.add_shell_host("fine", "root", "").unwrap();
        registry.add_shell_host("broken", "root", "").unwrap();

        orchestrator(Arc::clone(&registry)).full_shutdown().await.unwrap();
        let hosts = registry.list_shell_hosts(false).unwrap();
        assert_eq!(hosts[0].last_status, HostStatus::Offline);
        assert_eq!(hosts[1].last_status, HostStatus::Unknown);
        assert_eq!(hosts[1].last_error.as_deref(), Some("Permission denied"));
    }

    #[tokio::test]
    async fn test_selective_skips_removed_hosts() {
        let registry = Arc::new(HostRegistry::open_in_memory().unwrap());
        registry.add_shell_host("a", "root", "").unwrap();
        registry.add_shell_host("b", "root", "").unwrap();
        let selected: Vec<HostKey> = registry
            .enabled_hosts()
            .unwrap()
            .iter()
            .map(HostEntry::key)
            .collect();

        registry.remove_shell_host("b", "root").unwrap();

        let report = orchestrator(registry).selective_shutdown(&selected).await.unwrap();
        assert_eq!(report.total_count(), 1);
        assert_eq!(report.summary(), "1/1");
        assert!(report.outcomes().all(|o| o.host_id != "ssh:b:root"));
    }

    #[tokio::test]
    async fn test_execute_phase_rejects_foreign_hosts() {
        let registry = Arc::new(HostRegistry::open_in_memory().unwrap());
        registry.add_shell_host("fine", "root", "").unwrap();
        registry.add_api_host("pve1", "proxmox", "k", "", "").unwrap();
        let hosts = registry.enabled_hosts().unwrap();

        let orch = orchestrator(Arc::clone(&registry));
        let phase = orch.execute_phase(hosts, "ssh", "SSH").await;
        assert_eq!(phase.name, "SSH");
        assert_eq!(phase.outcomes.len(), 2);
        assert_eq!(phase.outcomes[0].status, ShutdownStatus::Executed);
        assert_eq!(phase.outcomes[1].host_id, "api:pve1:proxmox");
        assert_eq!(phase.outcomes[1].status, ShutdownStatus::Failed);
        assert_eq!(phase.outcomes[1].detail.as_deref(), Some("not a ssh host"));
        assert_eq!(phase.success_count(), 1);

        // L'hôte écarté n'a pas été touché
        let api = registry.list_api_hosts(false).unwrap();
        assert_eq!(api[0].last_status, HostStatus::Unknown);
        assert_eq!(orch.progress(), ShutdownProgress::default());
    }

    #[tokio::test]
    async fn test_progress_reset_after_run() {
        let registry = Arc::new(HostRegistry::open_in_memory().unwrap());
        registry.add_shell_host("fine", "root", "").unwrap();
        let orch = orchestrator(registry);
        orch.full_shutdown().await.unwrap();
        assert_eq!(orch.progress(), ShutdownProgress::default());
    }
}
