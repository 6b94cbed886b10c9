//! Error taxonomy for pairing and client operations

use homelink_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the pairing subsystem.
///
/// The variants map one-to-one onto HTTP status classes at the REST boundary
/// (400 / 401 / 409 / 404 / 500).
#[derive(Debug, Error)]
pub enum AuthError {
    /// Malformed request fields
    #[error("{0}")]
    Validation(String),
    /// Invalid/expired PIN or bad certificate
    #[error("{0}")]
    Authentication(String),
    /// Public key already bound to a client
    #[error("{0}")]
    Conflict(String),
    /// Unknown client
    #[error("{0}")]
    NotFound(String),
    /// Store I/O failure; not retried, no partial state left behind
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl AuthError {
    /// The generic PIN failure. Expired and already-used PINs must be
    /// indistinguishable to the caller, so every PIN-related failure in the
    /// pairing flow uses this exact message.
    pub fn invalid_pin() -> Self {
        AuthError::Authentication("invalid or expired PIN".to_string())
    }
}

pub type AuthResult<T> = Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_pin_message_is_generic() {
        assert_eq!(AuthError::invalid_pin().to_string(), "invalid or expired PIN");
    }
}
