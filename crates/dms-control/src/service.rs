//! Surface de commande du canal de contrôle.
//!
//! Chaque commande vérifie d'abord l'identité appelante, puis la session,
//! puis fait avancer le flux de l'identité sous son verrou. Aucune mutation
//! du registre ni aucun arrêt n'est exécuté sans un code frais fourni pour
//! cette requête précise.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

use dms_auth::AuthService;
use dms_auth::login::{LoginOutcome, LoginStep};
use dms_common::config::EnvConfig;
use dms_common::events::{EventBus, Notification, ShutdownScope};
use dms_common::locks::KeyedLocks;
use dms_hosts::{Executors, HostEntry, HostKey, HostKind, HostRegistry, Monitor, Orchestrator};

use crate::commands::{ApiSpec, Command, RemoveTarget, ShellSpec};
use crate::error::{ControlError, ControlResult};
use crate::flows::{Flow, FlowTable, Operation, OperationState, PendingOperation};
use crate::response::{
    Confirmation, HostLine, HostListing, Reply, Response, SUDOERS_LINE, StatusReport,
};
use crate::selection::parse_selection;

/// Au-delà, les sources non autorisées ne sont plus mémorisées
const MAX_TRACKED_SOURCES: usize = 1024;

pub struct ControlService {
    operator_id: Option<String>,
    channel: String,
    auth: Arc<AuthService>,
    registry: Arc<HostRegistry>,
    executors: Executors,
    orchestrator: Arc<Orchestrator>,
    monitor: Arc<Monitor>,
    events: Arc<EventBus>,
    flows: FlowTable,
    identity_locks: KeyedLocks,
    connect_timeout: Duration,
    untrusted_seen: Mutex<HashSet<String>>,
}

impl ControlService {
    pub fn new(
        config: &EnvConfig,
        auth: Arc<AuthService>,
        registry: Arc<HostRegistry>,
        executors: Executors,
        orchestrator: Arc<Orchestrator>,
        monitor: Arc<Monitor>,
        events: Arc<EventBus>,
    ) -> Self {
        if config.operator_id.is_none() {
            warn!("No operator identity configured, every caller will be rejected");
        }
        Self {
            operator_id: config.operator_id.clone(),
            channel: "control".to_string(),
            auth,
            registry,
            executors,
            orchestrator,
            monitor,
            events,
            flows: FlowTable::new(config.flow_ttl()),
            identity_locks: KeyedLocks::new(),
            connect_timeout: config.connect_timeout(),
            untrusted_seen: Mutex::new(HashSet::new()),
        }
    }

    /// Nom du canal reporté dans les alertes de source non autorisée
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    /// Point d'entrée de l'adaptateur pour un message brut : l'identité est
    /// vérifiée avant toute interprétation du texte
    pub async fn handle_text(&self, identity: &str, raw: &str) -> Reply {
        if let Err(e) = self.authorize(identity) {
            return Reply {
                result: Err(e),
                sensitive: false,
            };
        }
        match Command::parse(raw) {
            Ok(command) => self.handle(identity, command).await,
            Err(e) => Reply {
                result: Err(e),
                sensitive: raw.trim_start().starts_with("/addapi"),
            },
        }
    }

    /// Exécute une commande déjà interprétée
    pub async fn handle(&self, identity: &str, command: Command) -> Reply {
        match command {
            // Dépend du flux retiré sous le verrou de l'identité
            Command::Text(text) => {
                let (result, sensitive) = self.advance_text(identity, &text).await;
                Reply { result, sensitive }
            }
            command => {
                let sensitive = matches!(command, Command::AddApi(Some(_)));
                let result = self.dispatch(identity, command).await;
                Reply { result, sensitive }
            }
        }
    }

    async fn dispatch(&self, identity: &str, command: Command) -> ControlResult<Response> {
        match command {
            Command::Start => self.start(identity),
            Command::Login => self.begin_login(identity).await,
            Command::Status => self.status(identity),
            Command::Logout => self.logout(identity).await,
            Command::ListShell => self.list_hosts(identity, HostKind::Shell),
            Command::ListApi => self.list_hosts(identity, HostKind::Api),
            Command::AddShell(None) => self.add_shell_instructions(identity),
            Command::AddShell(Some(spec)) => self.request_add_shell(identity, &spec).await,
            Command::AddApi(None) => self.add_api_instructions(identity),
            Command::AddApi(Some(spec)) => self.request_add_api(identity, &spec).await,
            Command::Remove(target) => self.request_remove(identity, target).await,
            Command::Shutdown => self.request_shutdown(identity).await,
            Command::SelectiveShutdown => self.begin_selective_shutdown(identity).await,
            Command::Text(text) => self.submit_text(identity, &text).await,
        }
    }

    // ── Autorisation ────────────────────────────────────────────────────

    /// Rejette toute identité autre que l'opérateur configuré, sans créer
    /// d'état de flux pour elle
    fn authorize(&self, identity: &str) -> ControlResult<()> {
        if self.operator_id.as_deref() == Some(identity) {
            return Ok(());
        }
        warn!(identity, "Unauthorized caller rejected");

        let first_seen = {
            let mut seen = self.untrusted_seen.lock().unwrap_or_else(|e| e.into_inner());
            seen.len() < MAX_TRACKED_SOURCES && seen.insert(identity.to_string())
        };
        if first_seen {
            self.events.notify(Notification::UntrustedSource {
                source: identity.to_string(),
                channel: self.channel.clone(),
            });
        }
        Err(ControlError::Unauthorized)
    }

    fn require_session(&self, identity: &str) -> ControlResult<()> {
        self.authorize(identity)?;
        if self.auth.sessions.is_valid(identity)? {
            Ok(())
        } else {
            Err(ControlError::NotAuthenticated)
        }
    }

    // ── Session opérateur ───────────────────────────────────────────────

    pub fn start(&self, identity: &str) -> ControlResult<Response> {
        self.authorize(identity)?;
        let authenticated = self.auth.sessions.is_valid(identity)?;
        Ok(Response::Menu { authenticated })
    }

    pub async fn begin_login(&self, identity: &str) -> ControlResult<Response> {
        self.authorize(identity)?;
        let _guard = self.identity_locks.lock(identity).await;
        self.flows.put(identity, Flow::Login(LoginStep::AwaitingSecret));
        info!(identity, "Login started");
        Ok(Response::AskSecret)
    }

    pub async fn logout(&self, identity: &str) -> ControlResult<Response> {
        self.authorize(identity)?;
        let _guard = self.identity_locks.lock(identity).await;
        self.flows.discard(identity);
        let had_session = self.auth.sessions.end_session(identity)?;
        if had_session {
            info!(identity, "Operator logged out");
        }
        Ok(Response::LoggedOut { had_session })
    }

    /// Texte libre : fait avancer le flux en cours, sinon interprète une
    /// requête `ssh:` / `api:` / `rm`
    pub async fn submit_text(&self, identity: &str, text: &str) -> ControlResult<Response> {
        self.advance_text(identity, text).await.0
    }

    /// Le booléen indique si le texte portait un secret : réponse à un login,
    /// code de confirmation ou requête `api:` contenant une clé
    async fn advance_text(&self, identity: &str, text: &str) -> (ControlResult<Response>, bool) {
        if let Err(e) = self.authorize(identity) {
            return (Err(e), false);
        }
        let _guard = self.identity_locks.lock(identity).await;
        let text = text.trim();

        let flow = self.flows.take(identity);
        let sensitive = match &flow {
            Some(Flow::Login(_)) => true,
            Some(Flow::Operation(pending)) => pending.state == OperationState::AwaitingCode,
            None => text.starts_with("api"),
        };
        let result = match flow {
            Some(Flow::Login(step)) => self.advance_login(identity, step, text),
            Some(Flow::Operation(pending)) => self.advance_operation(identity, pending, text).await,
            None => self.interpret_request(identity, text).await,
        };
        (result, sensitive)
    }

    async fn interpret_request(&self, identity: &str, text: &str) -> ControlResult<Response> {
        if text.starts_with("ssh:") {
            self.prepare_add_shell(identity, text).await
        } else if text.starts_with("api:") || text.starts_with("api|") {
            self.prepare_add_api(identity, text).await
        } else if let Some(args) = text.strip_prefix("rm ") {
            self.prepare_remove(identity, RemoveTarget::parse_args(args)?)
        } else {
            Err(ControlError::MalformedInput(
                "nothing pending, use the menu".to_string(),
            ))
        }
    }

    fn advance_login(&self, identity: &str, step: LoginStep, text: &str) -> ControlResult<Response> {
        match self.auth.advance_login(identity, step, text)? {
            LoginOutcome::Advanced(next) => {
                self.flows.put(identity, Flow::Login(next));
                Ok(Response::AskCode)
            }
            LoginOutcome::Authenticated(session) => Ok(Response::Authenticated {
                expires_at: session.expires_at,
            }),
            LoginOutcome::Rejected(_) => Err(ControlError::InvalidCredential),
        }
    }

    // ── Consultation ────────────────────────────────────────────────────

    pub fn status(&self, identity: &str) -> ControlResult<Response> {
        self.require_session(identity)?;
        let entries = self.all_hosts()?;
        Ok(Response::Status(StatusReport::build(
            self.orchestrator.progress(),
            &entries,
        )))
    }

    pub fn list_hosts(&self, identity: &str, kind: HostKind) -> ControlResult<Response> {
        self.require_session(identity)?;
        let entries: Vec<HostEntry> = match kind {
            HostKind::Shell => self
                .registry
                .list_shell_hosts(false)?
                .into_iter()
                .map(HostEntry::Shell)
                .collect(),
            HostKind::Api => self
                .registry
                .list_api_hosts(false)?
                .into_iter()
                .map(HostEntry::Api)
                .collect(),
        };
        Ok(Response::Hosts(HostListing::new(kind, &entries)))
    }

    pub fn add_shell_instructions(&self, identity: &str) -> ControlResult<Response> {
        self.require_session(identity)?;
        Ok(Response::AddShellInstructions {
            public_key: self.executors.shell.public_key(),
            sudoers_line: SUDOERS_LINE.to_string(),
        })
    }

    pub fn add_api_instructions(&self, identity: &str) -> ControlResult<Response> {
        self.require_session(identity)?;
        Ok(Response::AddApiInstructions {
            types: self.plugin_types(),
        })
    }

    fn all_hosts(&self) -> anyhow::Result<Vec<HostEntry>> {
        let mut entries: Vec<HostEntry> = self
            .registry
            .list_shell_hosts(false)?
            .into_iter()
            .map(HostEntry::Shell)
            .collect();
        entries.extend(self.registry.list_api_hosts(false)?.into_iter().map(HostEntry::Api));
        Ok(entries)
    }

    fn plugin_types(&self) -> Vec<String> {
        self.executors
            .plugins
            .types()
            .into_iter()
            .map(String::from)
            .collect()
    }

    // ── Demandes d'opération ────────────────────────────────────────────

    pub async fn request_add_shell(&self, identity: &str, spec: &str) -> ControlResult<Response> {
        self.authorize(identity)?;
        let _guard = self.identity_locks.lock(identity).await;
        self.prepare_add_shell(identity, spec).await
    }

    pub async fn request_add_api(&self, identity: &str, spec: &str) -> ControlResult<Response> {
        self.authorize(identity)?;
        let _guard = self.identity_locks.lock(identity).await;
        self.prepare_add_api(identity, spec).await
    }

    pub async fn request_remove(&self, identity: &str, target: RemoveTarget) -> ControlResult<Response> {
        self.authorize(identity)?;
        let _guard = self.identity_locks.lock(identity).await;
        self.prepare_remove(identity, target)
    }

    pub async fn request_shutdown(&self, identity: &str) -> ControlResult<Response> {
        self.require_session(identity)?;
        let _guard = self.identity_locks.lock(identity).await;

        let hosts = self.registry.enabled_hosts()?;
        if hosts.is_empty() {
            return Err(ControlError::NotFound("no enabled host".to_string()));
        }
        self.flows.put(
            identity,
            Flow::Operation(PendingOperation::awaiting_code(Operation::Shutdown)),
        );
        warn!(identity, hosts = hosts.len(), "Full shutdown requested, awaiting code");
        Ok(Response::AwaitingCode(Confirmation::Shutdown {
            hosts: hosts.iter().map(HostEntry::label).collect(),
        }))
    }

    pub async fn begin_selective_shutdown(&self, identity: &str) -> ControlResult<Response> {
        self.require_session(identity)?;
        let _guard = self.identity_locks.lock(identity).await;

        let hosts = self.registry.enabled_hosts()?;
        if hosts.is_empty() {
            return Err(ControlError::NotFound("no enabled host".to_string()));
        }
        let lines: Vec<HostLine> = hosts
            .iter()
            .enumerate()
            .map(|(i, e)| HostLine::from_entry(i + 1, e))
            .collect();
        self.flows.put(
            identity,
            Flow::Operation(PendingOperation {
                operation: Operation::SelectiveShutdown {
                    host_ids: lines.iter().map(|l| l.id.clone()).collect(),
                },
                state: OperationState::AwaitingSelection,
            }),
        );
        Ok(Response::AskSelection { hosts: lines })
    }

    async fn prepare_add_shell(&self, identity: &str, text: &str) -> ControlResult<Response> {
        self.require_session(identity)?;
        let spec = ShellSpec::parse(text)?;
        let key = HostKey::Shell {
            host: spec.host.clone(),
            user: spec.user.clone(),
        };
        if self.registry.get(&key)?.is_some() {
            return Err(ControlError::Conflict(key.label()));
        }

        let test = tokio::time::timeout(
            self.connect_timeout,
            self.executors.shell.test_connection(&spec.host, &spec.user),
        )
        .await
        .map_err(|_| ControlError::TransportFailure("Connection timed out".to_string()))?;
        if !test.success {
            return Err(ControlError::TransportFailure(test.error.unwrap_or_default()));
        }

        let confirmation = Confirmation::AddShell {
            label: key.label(),
            description: spec.description.clone(),
        };
        self.flows.put(
            identity,
            Flow::Operation(PendingOperation::awaiting_code(Operation::AddShell(spec))),
        );
        Ok(Response::AwaitingCode(confirmation))
    }

    async fn prepare_add_api(&self, identity: &str, text: &str) -> ControlResult<Response> {
        self.require_session(identity)?;
        let spec = ApiSpec::parse(text)?;

        // Refus avant tout appel réseau
        let Some(plugin) = self.executors.plugins.get(&spec.api_type) else {
            return Err(ControlError::UnknownApiType {
                api_type: spec.api_type,
                available: self.plugin_types().join(", "),
            });
        };
        let existing = self.registry.list_api_hosts(false)?;
        if existing.iter().any(|h| h.host == spec.host) {
            return Err(ControlError::Conflict(spec.host));
        }

        let target = dms_hosts::ApiTarget {
            host: &spec.host,
            api_key: &spec.api_key,
            api_endpoint: &spec.api_endpoint,
        };
        let test = tokio::time::timeout(self.connect_timeout, plugin.test_connection(target))
            .await
            .map_err(|_| ControlError::TransportFailure("Connection timed out".to_string()))?;
        if !test.success {
            return Err(ControlError::TransportFailure(test.error.unwrap_or_default()));
        }

        let confirmation = Confirmation::AddApi {
            label: format!("{} ({})", spec.host, spec.api_type),
            description: spec.description.clone(),
        };
        self.flows.put(
            identity,
            Flow::Operation(PendingOperation::awaiting_code(Operation::AddApi(spec))),
        );
        Ok(Response::AwaitingCode(confirmation))
    }

    fn prepare_remove(&self, identity: &str, target: RemoveTarget) -> ControlResult<Response> {
        self.require_session(identity)?;
        let (operation, confirmation) = match target {
            RemoveTarget::Shell { host, user } => {
                let key = HostKey::Shell {
                    host: host.clone(),
                    user: user.clone(),
                };
                if self.registry.get(&key)?.is_none() {
                    return Err(ControlError::NotFound(key.label()));
                }
                (
                    Operation::RemoveShell { host, user },
                    Confirmation::RemoveShell { label: key.label() },
                )
            }
            RemoveTarget::Api { host } => {
                let Some(existing) = self
                    .registry
                    .list_api_hosts(false)?
                    .into_iter()
                    .find(|h| h.host == host)
                else {
                    return Err(ControlError::NotFound(host));
                };
                (
                    Operation::RemoveApi { host },
                    Confirmation::RemoveApi {
                        label: format!("{} ({})", existing.host, existing.api_type),
                    },
                )
            }
        };
        self.flows.put(
            identity,
            Flow::Operation(PendingOperation::awaiting_code(operation)),
        );
        Ok(Response::AwaitingCode(confirmation))
    }

    // ── Confirmation ────────────────────────────────────────────────────

    async fn advance_operation(
        &self,
        identity: &str,
        pending: PendingOperation,
        text: &str,
    ) -> ControlResult<Response> {
        // Le flux est déjà retiré : un échec ci-dessous l'abandonne
        self.require_session(identity)?;

        match pending.state {
            OperationState::AwaitingSelection => self.select_targets(identity, pending, text),
            OperationState::AwaitingCode => {
                if !self.auth.confirm_code(text) {
                    warn!(identity, operation = pending.operation.name(), "Invalid confirmation code");
                    return Err(ControlError::InvalidCredential);
                }
                info!(identity, operation = pending.operation.name(), "Operation confirmed");
                self.execute(pending.operation).await
            }
        }
    }

    fn select_targets(
        &self,
        identity: &str,
        pending: PendingOperation,
        text: &str,
    ) -> ControlResult<Response> {
        let Operation::SelectiveShutdown { host_ids } = &pending.operation else {
            error!(identity, "Selection received for a non-selective operation");
            return Err(ControlError::Internal("inconsistent pending operation".to_string()));
        };

        let indices = parse_selection(text, host_ids.len());
        if indices.is_empty() {
            // Sélection vide : on redemande sans perdre la liste affichée
            self.flows.put(identity, Flow::Operation(pending.clone()));
            return Err(ControlError::MalformedInput(
                "no valid host selected, try again".to_string(),
            ));
        }

        let selected: Vec<String> = indices.into_iter().map(|i| host_ids[i].clone()).collect();
        let labels = selected
            .iter()
            .map(|id| HostKey::parse(id).map(|k| k.label()).unwrap_or_else(|| id.clone()))
            .collect();
        self.flows.put(
            identity,
            Flow::Operation(PendingOperation::awaiting_code(Operation::SelectiveShutdown {
                host_ids: selected,
            })),
        );
        Ok(Response::AwaitingCode(Confirmation::SelectiveShutdown { hosts: labels }))
    }

    async fn execute(&self, operation: Operation) -> ControlResult<Response> {
        match operation {
            Operation::Shutdown => {
                let hosts = self.registry.enabled_hosts()?.len();
                self.events.notify(Notification::ShutdownInitiated {
                    scope: ShutdownScope::Full,
                    hosts,
                });
                let report = self.orchestrator.full_shutdown().await?;
                Ok(Response::Shutdown(report))
            }
            Operation::SelectiveShutdown { host_ids } => {
                let keys: Vec<HostKey> = host_ids.iter().filter_map(|id| HostKey::parse(id)).collect();
                self.events.notify(Notification::ShutdownInitiated {
                    scope: ShutdownScope::Selective,
                    hosts: keys.len(),
                });
                let report = self.orchestrator.selective_shutdown(&keys).await?;
                Ok(Response::Shutdown(report))
            }
            Operation::AddShell(spec) => {
                if !self.registry.add_shell_host(&spec.host, &spec.user, &spec.description)? {
                    return Err(ControlError::Conflict(format!("{}@{}", spec.user, spec.host)));
                }
                let key = HostKey::Shell {
                    host: spec.host,
                    user: spec.user,
                };
                self.after_add(key).await
            }
            Operation::AddApi(spec) => {
                let added = self.registry.add_api_host(
                    &spec.host,
                    &spec.api_type,
                    &spec.api_key,
                    &spec.api_endpoint,
                    &spec.description,
                )?;
                if !added {
                    return Err(ControlError::Conflict(spec.host));
                }
                let key = HostKey::Api {
                    host: spec.host,
                    api_type: spec.api_type,
                };
                self.after_add(key).await
            }
            Operation::RemoveShell { host, user } => {
                if !self.registry.remove_shell_host(&host, &user)? {
                    return Err(ControlError::NotFound(format!("{user}@{host}")));
                }
                info!(host = %host, user = %user, "Shell host removed");
                self.events.notify(Notification::HostRemoved {
                    host: host.clone(),
                    kind: HostKind::Shell.as_str().to_string(),
                });
                Ok(Response::HostRemoved {
                    label: format!("{user}@{host}"),
                })
            }
            Operation::RemoveApi { host } => {
                if !self.registry.remove_api_host(&host)? {
                    return Err(ControlError::NotFound(host));
                }
                info!(host = %host, "API host removed");
                self.events.notify(Notification::HostRemoved {
                    host: host.clone(),
                    kind: HostKind::Api.as_str().to_string(),
                });
                Ok(Response::HostRemoved { label: host })
            }
        }
    }

    /// Sonde immédiate après l'enrôlement, puis notification
    async fn after_add(&self, key: HostKey) -> ControlResult<Response> {
        info!(host = %key, "Host added");
        let status = self.monitor.check_and_record(&key).await;
        self.events.notify(Notification::HostAdded {
            host: key.host().to_string(),
            kind: key.kind().as_str().to_string(),
        });
        Ok(Response::HostAdded {
            label: key.label(),
            status,
        })
    }

    /// Purge des flux expirés, appelée périodiquement par le binaire
    pub fn purge_expired_flows(&self) -> usize {
        self.flows.purge_expired()
    }
}
