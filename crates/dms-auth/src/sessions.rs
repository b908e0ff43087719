use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

/// Durée fixe d'une session opérateur
pub const SESSION_DURATION_MS: i64 = 24 * 60 * 60 * 1000; // 24 heures

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorSession {
    pub identity: String,
    pub created_at: i64,
    pub expires_at: i64,
}

impl OperatorSession {
    /// Valide tant que `now < expires_at`
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at
    }
}

/// Store de sessions SQLite (thread-safe via Mutex)
///
/// Une seule session par identité : une nouvelle authentification remplace
/// la précédente. L'expiration est vérifiée à la lecture.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
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
            "CREATE TABLE IF NOT EXISTS operator_sessions (
                identity TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_operator_sessions_expires_at
                ON operator_sessions(expires_at);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Crée ou remplace la session de l'identité
    pub fn start_session(&self, identity: &str) -> anyhow::Result<OperatorSession> {
        self.start_session_at(identity, dms_common::now_millis())
    }

    pub fn start_session_at(&self, identity: &str, now_ms: i64) -> anyhow::Result<OperatorSession> {
        let session = OperatorSession {
            identity: identity.to_string(),
            created_at: now_ms,
            expires_at: now_ms + SESSION_DURATION_MS,
        };

        self.conn().execute(
            "INSERT INTO operator_sessions (identity, created_at, expires_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(identity) DO UPDATE SET
                created_at = excluded.created_at,
                expires_at = excluded.expires_at",
            params![session.identity, session.created_at, session.expires_at],
        )?;

        Ok(session)
    }

    pub fn get(&self, identity: &str) -> anyhow::Result<Option<OperatorSession>> {
        let conn = self.conn();
        let session = conn
            .query_row(
                "SELECT identity, created_at, expires_at
                 FROM operator_sessions WHERE identity = ?1",
                params![identity],
                |row| {
                    Ok(OperatorSession {
                        identity: row.get(0)?,
                        created_at: row.get(1)?,
                        expires_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    pub fn is_valid(&self, identity: &str) -> anyhow::Result<bool> {
        self.is_valid_at(identity, dms_common::now_millis())
    }

    pub fn is_valid_at(&self, identity: &str, now_ms: i64) -> anyhow::Result<bool> {
        Ok(self
            .get(identity)?
            .is_some_and(|session| session.is_valid_at(now_ms)))
    }

    /// Supprime la session (idempotent). Retourne vrai si une session existait.
    pub fn end_session(&self, identity: &str) -> anyhow::Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM operator_sessions WHERE identity = ?1",
            params![identity],
        )?;
        Ok(removed > 0)
    }

    /// Nettoie les sessions expirées
    pub fn cleanup_expired(&self) -> anyhow::Result<usize> {
        let removed = self.conn().execute(
            "DELETE FROM operator_sessions WHERE expires_at <= ?1",
            params![dms_common::now_millis()],
        )?;
        Ok(removed)
    }
}
