/// Error taxonomy for the token lifecycle
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Client id / secret missing
    #[error("client credentials not configured: {0}")]
    Configuration(String),

    #[error("token storage error at {}: {message}", .path.display())]
    Storage { path: PathBuf, message: String },

    /// Provider rejected the authorization code
    #[error("authorization code exchange failed{}: {body}", status_suffix(.status))]
    Exchange { status: Option<u16>, body: String },

    /// Refresh token is invalid, expired or revoked. Terminal for the current record.
    #[error("token refresh rejected{}: {body}", status_suffix(.status))]
    Refresh { status: Option<u16>, body: String },

    /// Network blip or provider outage. The caller may retry later.
    #[error("transient token endpoint failure: {0}")]
    Transient(String),

    #[error("failed to bind callback listener on {addr}: {message}")]
    ListenerBind { addr: String, message: String },

    #[error("authorization flow already in progress")]
    FlowInProgress,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

impl AuthError {
    /// Credential is dead, re-authorization required
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthError::Refresh { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::Transient(_))
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        AuthError::Storage {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

pub type AuthResult<T> = std::result::Result<T, AuthError>;
