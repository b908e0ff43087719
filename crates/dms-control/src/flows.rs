//! Table des flux en cours, une entrée au plus par identité.
//!
//! Un login et une opération en attente partagent la même case : démarrer
//! l'un écrase l'autre. Les entrées plus vieilles que la durée de vie sont
//! considérées absentes et supprimées à la lecture.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dms_auth::login::LoginStep;

use crate::commands::{ApiSpec, ShellSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    AwaitingSelection,
    AwaitingCode,
}

/// Opération destructive ou de mutation en attente de confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Shutdown,
    /// Identifiants `kind:host:discriminator` : la liste affichée tant que la
    /// sélection est attendue, puis le sous-ensemble choisi
    SelectiveShutdown { host_ids: Vec<String> },
    AddShell(ShellSpec),
    AddApi(ApiSpec),
    RemoveShell { host: String, user: String },
    RemoveApi { host: String },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Shutdown => "shutdown",
            Operation::SelectiveShutdown { .. } => "selective_shutdown",
            Operation::AddShell(_) => "add_ssh",
            Operation::AddApi(_) => "add_api",
            Operation::RemoveShell { .. } => "remove_ssh",
            Operation::RemoveApi { .. } => "remove_api",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub operation: Operation,
    pub state: OperationState,
}

impl PendingOperation {
    pub fn awaiting_code(operation: Operation) -> Self {
        Self {
            operation,
            state: OperationState::AwaitingCode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Login(LoginStep),
    Operation(PendingOperation),
}

struct FlowEntry {
    flow: Flow,
    created_at: Instant,
}

pub struct FlowTable {
    entries: Mutex<HashMap<String, FlowEntry>>,
    ttl: Duration,
}

impl FlowTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, FlowEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remplace le flux de l'identité (dernier écrivain gagnant)
    pub fn put(&self, identity: &str, flow: Flow) {
        let mut entries = self.entries();
        if let Some(previous) = entries.get(identity) {
            tracing::debug!(identity, "Discarding previous flow {:?}", flow_label(&previous.flow));
        }
        entries.insert(
            identity.to_string(),
            FlowEntry {
                flow,
                created_at: Instant::now(),
            },
        );
    }

    /// Retire et retourne le flux vivant de l'identité
    pub fn take(&self, identity: &str) -> Option<Flow> {
        let entry = self.entries().remove(identity)?;
        if entry.created_at.elapsed() >= self.ttl {
            tracing::info!(identity, "Expired {} flow dropped", flow_label(&entry.flow));
            return None;
        }
        Some(entry.flow)
    }

    /// Vrai si un flux vivant attend une réponse de cette identité
    pub fn is_pending(&self, identity: &str) -> bool {
        self.entries()
            .get(identity)
            .is_some_and(|e| e.created_at.elapsed() < self.ttl)
    }

    pub fn discard(&self, identity: &str) -> bool {
        self.entries().remove(identity).is_some()
    }

    /// Purge les entrées expirées, retourne le nombre supprimé
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, e| e.created_at.elapsed() < self.ttl);
        before - entries.len()
    }
}

fn flow_label(flow: &Flow) -> &'static str {
    match flow {
        Flow::Login(_) => "login",
        Flow::Operation(op) => op.operation.name(),
    }
}
