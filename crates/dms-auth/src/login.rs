//! Étapes du login opérateur : secret statique → code TOTP → session.
//!
//! Aucun état de retry : tout échec met fin au login, l'opérateur doit
//! recommencer depuis le début.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::AuthService;
use crate::sessions::OperatorSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginStep {
    AwaitingSecret,
    AwaitingCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Secret accepté, le login passe en attente du code
    Advanced(LoginStep),
    Authenticated(OperatorSession),
    /// Facteur invalide, le login est abandonné
    Rejected(LoginStep),
}

impl AuthService {
    /// Fait avancer un login en cours avec le texte soumis par l'opérateur
    pub fn advance_login(
        &self,
        identity: &str,
        step: LoginStep,
        text: &str,
    ) -> anyhow::Result<LoginOutcome> {
        match step {
            LoginStep::AwaitingSecret => {
                if self.verifier.verify_static_secret(text) {
                    info!(identity, "Static token verified");
                    Ok(LoginOutcome::Advanced(LoginStep::AwaitingCode))
                } else {
                    warn!(identity, "Invalid static token");
                    Ok(LoginOutcome::Rejected(step))
                }
            }
            LoginStep::AwaitingCode => {
                if self.verifier.verify_time_code(text) {
                    let session = self.sessions.start_session(identity)?;
                    info!(identity, expires_at = session.expires_at, "Operator authenticated");
                    Ok(LoginOutcome::Authenticated(session))
                } else {
                    warn!(identity, "Invalid TOTP code during login");
                    Ok(LoginOutcome::Rejected(step))
                }
            }
        }
    }
}
