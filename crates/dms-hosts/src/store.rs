//! Registre persistant des hôtes enrôlés (SQLite).
//!
//! L'ordre d'énumération est l'ordre d'insertion : l'index affiché à
//! l'opérateur pour la sélection en dépend.

use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use dms_common::locks::KeyedLocks;

use crate::types::{ApiHost, HostEntry, HostKey, HostStatus, ShellHost};

const SHELL_COLUMNS: &str =
    "host, user, description, enabled, last_status, last_error, last_checked";
const API_COLUMNS: &str =
    "host, api_type, api_key, api_endpoint, description, enabled, last_status, last_error, last_checked";

pub struct HostRegistry {
    conn: Mutex<Connection>,
    /// Sérialise les mises à jour de statut d'un même hôte
    row_locks: KeyedLocks,
}

impl HostRegistry {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS shell_hosts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                host TEXT NOT NULL,
                user TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                enabled INTEGER NOT NULL DEFAULT 1,
                last_status TEXT NOT NULL DEFAULT 'unknown',
                last_error TEXT,
                last_checked INTEGER,
                UNIQUE(host, user)
            );
            CREATE TABLE IF NOT EXISTS api_hosts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                host TEXT NOT NULL UNIQUE,
                api_type TEXT NOT NULL,
                api_key TEXT NOT NULL,
                api_endpoint TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                enabled INTEGER NOT NULL DEFAULT 1,
                last_status TEXT NOT NULL DEFAULT 'unknown',
                last_error TEXT,
                last_checked INTEGER
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            row_locks: KeyedLocks::new(),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Verrou exclusif sur la ligne d'un hôte (sonde + écriture du statut)
    pub async fn lock_host(&self, key: &HostKey) -> OwnedMutexGuard<()> {
        self.row_locks.lock(&key.id()).await
    }

    // ── Lecture ─────────────────────────────────────────────────────────

    pub fn list_shell_hosts(&self, enabled_only: bool) -> anyhow::Result<Vec<ShellHost>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {SHELL_COLUMNS} FROM shell_hosts {} ORDER BY id",
            if enabled_only { "WHERE enabled = 1" } else { "" }
        );
        let mut stmt = conn.prepare(&sql)?;
        let hosts = stmt
            .query_map([], shell_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(hosts)
    }

    pub fn list_api_hosts(&self, enabled_only: bool) -> anyhow::Result<Vec<ApiHost>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {API_COLUMNS} FROM api_hosts {} ORDER BY id",
            if enabled_only { "WHERE enabled = 1" } else { "" }
        );
        let mut stmt = conn.prepare(&sql)?;
        let hosts = stmt
            .query_map([], api_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(hosts)
    }

    /// Tous les hôtes activés : shell d'abord, puis API, ordre d'insertion
    pub fn enabled_hosts(&self) -> anyhow::Result<Vec<HostEntry>> {
        let mut hosts: Vec<HostEntry> = self
            .list_shell_hosts(true)?
            .into_iter()
            .map(HostEntry::Shell)
            .collect();
        hosts.extend(self.list_api_hosts(true)?.into_iter().map(HostEntry::Api));
        Ok(hosts)
    }

    /// Retrouve une entrée par clé, activée ou non
    pub fn get(&self, key: &HostKey) -> anyhow::Result<Option<HostEntry>> {
        let conn = self.conn();
        let entry = match key {
            HostKey::Shell { host, user } => conn
                .query_row(
                    &format!("SELECT {SHELL_COLUMNS} FROM shell_hosts WHERE host = ?1 AND user = ?2"),
                    params![host, user],
                    shell_from_row,
                )
                .optional()?
                .map(HostEntry::Shell),
            HostKey::Api { host, api_type } => conn
                .query_row(
                    &format!("SELECT {API_COLUMNS} FROM api_hosts WHERE host = ?1 AND api_type = ?2"),
                    params![host, api_type],
                    api_from_row,
                )
                .optional()?
                .map(HostEntry::Api),
        };
        Ok(entry)
    }

    /// Résout une clé vers l'entrée vivante, uniquement si elle est activée
    pub fn resolve_enabled(&self, key: &HostKey) -> anyhow::Result<Option<HostEntry>> {
        Ok(self.get(key)?.filter(HostEntry::enabled))
    }

    // ── Mutations ───────────────────────────────────────────────────────

    /// Ajoute un hôte shell. Faux si `(host, user)` existe déjà.
    pub fn add_shell_host(&self, host: &str, user: &str, description: &str) -> anyhow::Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO shell_hosts (host, user, description) VALUES (?1, ?2, ?3)",
            params![host, user, description],
        )?;
        Ok(inserted > 0)
    }

    /// Ajoute un hôte API. Faux si `host` existe déjà, quel que soit le type.
    pub fn add_api_host(
        &self,
        host: &str,
        api_type: &str,
        api_key: &str,
        api_endpoint: &str,
        description: &str,
    ) -> anyhow::Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO api_hosts (host, api_type, api_key, api_endpoint, description)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![host, api_type, api_key, api_endpoint, description],
        )?;
        Ok(inserted > 0)
    }

    pub fn remove_shell_host(&self, host: &str, user: &str) -> anyhow::Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM shell_hosts WHERE host = ?1 AND user = ?2",
            params![host, user],
        )?;
        Ok(removed > 0)
    }

    pub fn remove_api_host(&self, host: &str) -> anyhow::Result<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM api_hosts WHERE host = ?1", params![host])?;
        Ok(removed > 0)
    }

    #[cfg(test)]
    pub(crate) fn set_enabled(&self, key: &HostKey, enabled: bool) -> anyhow::Result<bool> {
        let changed = match key {
            HostKey::Shell { host, user } => self.conn().execute(
                "UPDATE shell_hosts SET enabled = ?1 WHERE host = ?2 AND user = ?3",
                params![enabled, host, user],
            )?,
            HostKey::Api { host, api_type } => self.conn().execute(
                "UPDATE api_hosts SET enabled = ?1 WHERE host = ?2 AND api_type = ?3",
                params![enabled, host, api_type],
            )?,
        };
        Ok(changed > 0)
    }

    /// Écrit le dernier statut observé (dernier écrivain gagnant)
    pub fn update_status(
        &self,
        key: &HostKey,
        status: HostStatus,
        error: Option<&str>,
    ) -> anyhow::Result<bool> {
        let now = dms_common::now_millis();
        let changed = match key {
            HostKey::Shell { host, user } => self.conn().execute(
                "UPDATE shell_hosts SET last_status = ?1, last_error = ?2, last_checked = ?3
                 WHERE host = ?4 AND user = ?5",
                params![status.as_str(), error, now, host, user],
            )?,
            HostKey::Api { host, api_type } => self.conn().execute(
                "UPDATE api_hosts SET last_status = ?1, last_error = ?2, last_checked = ?3
                 WHERE host = ?4 AND api_type = ?5",
                params![status.as_str(), error, now, host, api_type],
            )?,
        };
        if changed == 0 {
            debug!(host = %key, "Status update for unknown host ignored");
        }
        Ok(changed > 0)
    }
}

fn shell_from_row(row: &Row<'_>) -> rusqlite::Result<ShellHost> {
    Ok(ShellHost {
        host: row.get(0)?,
        user: row.get(1)?,
        description: row.get(2)?,
        enabled: row.get(3)?,
        last_status: HostStatus::parse(&row.get::<_, String>(4)?),
        last_error: row.get(5)?,
        last_checked: row.get(6)?,
    })
}

fn api_from_row(row: &Row<'_>) -> rusqlite::Result<ApiHost> {
    Ok(ApiHost {
        host: row.get(0)?,
        api_type: row.get(1)?,
        api_key: row.get(2)?,
        api_endpoint: row.get(3)?,
        description: row.get(4)?,
        enabled: row.get(5)?,
        last_status: HostStatus::parse(&row.get::<_, String>(6)?),
        last_error: row.get(7)?,
        last_checked: row.get(8)?,
    })
}
