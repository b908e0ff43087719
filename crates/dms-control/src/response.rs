//! Résultats structurés des commandes ; le rendu appartient à l'adaptateur.

use serde::Serialize;

use dms_hosts::{HostEntry, HostKind, HostStatus, ShutdownProgress, ShutdownReport};

use crate::error::ControlResult;

/// Nombre maximal d'entrées dans une liste d'hôtes
pub const LISTING_LIMIT: usize = 10;
/// Longueur maximale d'une erreur dans le rapport de statut
pub const STATUS_ERROR_CHARS: usize = 50;
/// Ligne sudoers à installer sur une cible shell
pub const SUDOERS_LINE: &str = "user ALL=(ALL) NOPASSWD: /sbin/shutdown";

#[derive(Debug, Clone, Serialize)]
pub struct HostLine {
    /// Position 1-based dans l'énumération affichée
    pub index: usize,
    pub id: String,
    pub kind: HostKind,
    pub label: String,
    pub description: String,
    pub enabled: bool,
    pub status: HostStatus,
    pub error: Option<String>,
}

impl HostLine {
    pub fn from_entry(index: usize, entry: &HostEntry) -> Self {
        let key = entry.key();
        let (description, error) = match entry {
            HostEntry::Shell(h) => (h.description.clone(), h.last_error.clone()),
            HostEntry::Api(h) => (h.description.clone(), h.last_error.clone()),
        };
        Self {
            index,
            id: key.id(),
            kind: key.kind(),
            label: key.label(),
            description,
            enabled: entry.enabled(),
            status: entry.last_status(),
            error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HostListing {
    pub kind: HostKind,
    pub hosts: Vec<HostLine>,
    /// Entrées non affichées au-delà de la limite
    pub remaining: usize,
}

impl HostListing {
    pub fn new(kind: HostKind, entries: &[HostEntry]) -> Self {
        Self {
            kind,
            hosts: entries
                .iter()
                .take(LISTING_LIMIT)
                .enumerate()
                .map(|(i, e)| HostLine::from_entry(i + 1, e))
                .collect(),
            remaining: entries.len().saturating_sub(LISTING_LIMIT),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub total: usize,
    pub online: usize,
    /// Activés mais pas `online` (y compris `unknown`)
    pub offline: usize,
    pub disabled: usize,
}

impl KindCounts {
    fn count(&mut self, entry: &HostEntry) {
        self.total += 1;
        if !entry.enabled() {
            self.disabled += 1;
        } else if entry.last_status() == HostStatus::Online {
            self.online += 1;
        } else {
            self.offline += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub progress: ShutdownProgress,
    pub shell: KindCounts,
    pub api: KindCounts,
    /// Hôtes activés qui ne sont pas `online`, erreur tronquée
    pub attention: Vec<HostLine>,
}

impl StatusReport {
    pub fn build(progress: ShutdownProgress, entries: &[HostEntry]) -> Self {
        let mut shell = KindCounts::default();
        let mut api = KindCounts::default();
        let mut attention = Vec::new();

        for entry in entries {
            match entry {
                HostEntry::Shell(_) => shell.count(entry),
                HostEntry::Api(_) => api.count(entry),
            }
            if entry.enabled() && entry.last_status() != HostStatus::Online {
                let mut line = HostLine::from_entry(attention.len() + 1, entry);
                line.error = line
                    .error
                    .map(|e| dms_common::truncate_chars(&e, STATUS_ERROR_CHARS));
                attention.push(line);
            }
        }

        Self {
            progress,
            shell,
            api,
            attention,
        }
    }
}

/// Résumé affiché avant la saisie du code de confirmation
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Confirmation {
    Shutdown { hosts: Vec<String> },
    SelectiveShutdown { hosts: Vec<String> },
    AddShell { label: String, description: String },
    AddApi { label: String, description: String },
    RemoveShell { label: String },
    RemoveApi { label: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Menu { authenticated: bool },
    AskSecret,
    AskCode,
    Authenticated { expires_at: i64 },
    LoggedOut { had_session: bool },
    Status(StatusReport),
    Hosts(HostListing),
    AddShellInstructions { public_key: Option<String>, sudoers_line: String },
    AddApiInstructions { types: Vec<String> },
    /// Liste numérotée pour l'arrêt sélectif
    AskSelection { hosts: Vec<HostLine> },
    AwaitingCode(Confirmation),
    HostAdded { label: String, status: Option<HostStatus> },
    HostRemoved { label: String },
    Shutdown(ShutdownReport),
}

/// Réponse complète : le résultat et l'indication que le message déclencheur
/// contenait un secret (à effacer côté adaptateur)
#[derive(Debug)]
pub struct Reply {
    pub result: ControlResult<Response>,
    pub sensitive: bool,
}
