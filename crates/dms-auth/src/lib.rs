pub mod login;
pub mod secret;
pub mod sessions;

use crate::secret::SecretVerifier;
use crate::sessions::SessionStore;
use dms_common::config::EnvConfig;
use std::sync::Arc;
use std::time::Duration;

/// Service d'authentification unifié
///
/// Encapsule le vérificateur de facteurs et le store de sessions (SQLite).
/// Thread-safe via Arc, partagé entre le flux de login et le flux de
/// confirmation des opérations.
pub struct AuthService {
    pub verifier: SecretVerifier,
    pub sessions: SessionStore,
}

impl AuthService {
    /// Crée et initialise le service d'authentification
    pub fn new(config: &EnvConfig) -> anyhow::Result<Arc<Self>> {
        let sessions = SessionStore::new(&config.db_path())?;
        let verifier = SecretVerifier::new(
            config.static_token.as_deref(),
            config.totp_secret.as_deref(),
        );

        Ok(Arc::new(Self::with_parts(verifier, sessions)))
    }

    pub fn with_parts(verifier: SecretVerifier, sessions: SessionStore) -> Self {
        Self { verifier, sessions }
    }

    /// Code TOTP frais exigé par chaque opération destructive
    pub fn confirm_code(&self, code: &str) -> bool {
        self.verifier.verify_time_code(code)
    }

    /// Purge périodique des sessions expirées. Une erreur de la base arrête
    /// la boucle et remonte au superviseur.
    pub async fn run_cleanup(&self, every: Duration) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let removed = self.sessions.cleanup_expired()?;
            if removed > 0 {
                tracing::debug!("Removed {} expired sessions", removed);
            }
        }
    }
}
