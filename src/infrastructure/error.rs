use crate::domain::models::TimerError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    Unreachable,
    Unauthorized,
    Unknown,
}

/// Failure of a single remote call. Every kind is transient for the sync
/// engine: it flips the session to disconnected and waits for the next trigger.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("remote rejected credentials: {0}")]
    Unauthorized(String),
    #[error("remote error: {0}")]
    Unknown(String),
}

impl RemoteError {
    pub fn kind(&self) -> RemoteErrorKind {
        match self {
            Self::Unreachable(_) => RemoteErrorKind::Unreachable,
            Self::Unauthorized(_) => RemoteErrorKind::Unauthorized,
            Self::Unknown(_) => RemoteErrorKind::Unknown,
        }
    }

    pub fn timed_out(operation: &str) -> Self {
        Self::Unreachable(format!("{operation} timed out"))
    }
}

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Credential error: {0}")]
    Credential(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Timer(#[from] TimerError),
    #[error("account '{0}' already exists")]
    AccountExists(String),
    #[error("account '{0}' does not exist")]
    UnknownAccount(String),
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("no user is logged in")]
    NotLoggedIn,
    #[error("Invalid state: {0}")]
    InvalidState(String),
}
