//! Error types for session authentication operations

use transport::{ApiError, ErrorKind};

/// Errors from refresh/login/logout calls and credential file handling.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The auth endpoint failed or was unreachable (already classified)
    #[error("auth endpoint failed: {0}")]
    Api(#[from] ApiError),

    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Whether the server refused the refresh token or login outright.
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            Error::Api(e) if matches!(e.kind, ErrorKind::Unauthorized | ErrorKind::Forbidden)
        )
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Api(e) => e,
            other => ApiError::new(ErrorKind::Unknown, other.to_string()),
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
