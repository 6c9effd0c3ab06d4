//! Collaborator error types.

use std::time::Duration;

use thiserror::Error;

/// Errors reported by a driver or physical connection.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum DriverError {
    /// The server could not be reached.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The server rejected the supplied credentials.
    #[error("authentication failed for user {}", username.as_deref().unwrap_or("<none>"))]
    AuthenticationFailed {
        /// Username that was rejected.
        username: Option<String>,
    },

    /// A statement failed without affecting the connection itself.
    #[error("statement failed: {0}")]
    Statement(String),

    /// The connection is broken and must not be reused.
    #[error("connection broken: {0}")]
    Broken(String),

    /// The physical connection has already been closed.
    #[error("physical connection is closed")]
    Closed,

    /// An operation did not finish in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The driver does not support the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl DriverError {
    /// Whether this error means the physical connection is unusable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Broken(_) | Self::Closed)
    }
}

/// Errors from a naming/lookup service.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum NamingError {
    /// Nothing is bound under the requested name.
    #[error("name not bound: {0}")]
    NotBound(String),

    /// The naming service could not be used.
    #[error("naming service unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the external transaction manager.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum TransactionError {
    /// The transaction is not active (already completed or unknown).
    #[error("transaction {0} is not active")]
    NotActive(String),

    /// The transaction manager refused the resource or synchronization.
    #[error("transaction manager rejected the request: {0}")]
    Rejected(String),

    /// A resource failed while carrying out a transaction operation.
    #[error("transactional resource failed: {0}")]
    Resource(#[from] DriverError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(DriverError::Broken("socket reset".into()).is_fatal());
        assert!(DriverError::Closed.is_fatal());
        assert!(!DriverError::Statement("syntax".into()).is_fatal());
        assert!(!DriverError::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(!DriverError::AuthenticationFailed { username: None }.is_fatal());
    }

    #[test]
    fn test_authentication_message_names_user() {
        let err = DriverError::AuthenticationFailed {
            username: Some("alice".into()),
        };
        assert_eq!(err.to_string(), "authentication failed for user alice");
    }
}
