use thiserror::Error;

/// Échecs visibles par l'opérateur.
///
/// Les messages restent génériques : ils ne révèlent jamais quel facteur a
/// échoué ni le contenu d'un secret.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Authentication required")]
    NotAuthenticated,

    #[error("Invalid credential, operation cancelled")]
    InvalidCredential,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already registered: {0}")]
    Conflict(String),

    #[error("Unknown type: {api_type} (available: {available})")]
    UnknownApiType { api_type: String, available: String },

    #[error("Connection test failed: {0}")]
    TransportFailure(String),

    #[error("Invalid input: {0}")]
    MalformedInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ControlResult<T> = Result<T, ControlError>;

impl From<anyhow::Error> for ControlError {
    fn from(e: anyhow::Error) -> Self {
        tracing::error!("Control handler failure: {:#}", e);
        ControlError::Internal(e.to_string())
    }
}
