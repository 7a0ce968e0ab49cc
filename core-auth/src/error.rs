use thiserror::Error;

/// Errors surfaced by the auth core.
///
/// `Clone` so a single refresh outcome can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Token refresh rejected: {0}")]
    RefreshRejected(String),

    #[error("Token refresh failed after {attempts} attempts: {last_error}")]
    RefreshRetriesExhausted { attempts: u32, last_error: String },

    #[error("Token refresh aborted")]
    RefreshAborted,

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Not authenticated")]
    NotAuthenticated,

    /// A request was rejected again after its one permitted retry.
    #[error("Session expired, please log in again")]
    Unauthorized,

    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Secure storage unavailable: {0}")]
    SecureStorageUnavailable(String),

    #[error("Stored credentials are corrupted: {0}")]
    TokenCorrupted(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Platform capability failed: {0}")]
    Platform(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<core_runtime::Error> for AuthError {
    fn from(err: core_runtime::Error) -> Self {
        AuthError::Config(err.to_string())
    }
}

impl AuthError {
    /// Whether a refresh failure of this kind ends the session.
    ///
    /// Terminal failures clear stored credentials and trigger logout;
    /// everything else is retried on a later request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthError::RefreshRejected(_)
                | AuthError::RefreshRetriesExhausted { .. }
                | AuthError::NoRefreshToken
                | AuthError::NotAuthenticated
                | AuthError::TokenCorrupted(_)
        )
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            AuthError::Api { status, .. } => Some(*status),
            AuthError::Unauthorized => Some(401),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
