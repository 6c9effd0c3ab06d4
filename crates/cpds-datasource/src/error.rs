//! Data source error types.

use cpds_driver::{DriverError, NamingError, TransactionError};
use cpds_pool::{MaxWait, ObjectPoolError};
use thiserror::Error;

/// Result type for data source operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors that can occur while configuring a data source or using its
/// connections.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The data source is not usable with its current configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The driver failed to open a physical connection.
    #[error("failed to create connection: {0}")]
    ConnectionCreation(#[source] DriverError),

    /// No connection became available within the configured wait.
    #[error("pool exhausted (max wait {max_wait})")]
    PoolExhausted {
        /// The wait policy that was in effect.
        max_wait: MaxWait,
    },

    /// The password given does not match the one the pooled connection was
    /// opened with, and the server rejected it as well.
    #[error(
        "given password did not match password used to create the pooled connection for user {}",
        username.as_deref().unwrap_or("<default>")
    )]
    AuthenticationMismatch {
        /// User whose password was rejected.
        username: Option<String>,
        /// Error from the test connection attempt.
        #[source]
        source: DriverError,
    },

    /// The transaction manager refused the connection's resource.
    #[error("failed to enlist connection in transaction: {0}")]
    Enlistment(#[from] TransactionError),

    /// A connection could not be acquired for another reason.
    #[error("cannot acquire connection: {0}")]
    ConnectionAcquisition(String),

    /// The logical connection has been closed or reclaimed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The sub-pool has been closed.
    #[error("pool is closed")]
    PoolClosed,

    /// A delegated call failed in the driver.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The connection source could not be resolved by name.
    #[error("connection source lookup failed: {0}")]
    Naming(#[from] NamingError),

    /// The operation is controlled by the external transaction the
    /// connection is enlisted in.
    #[error("{0} is not allowed while enlisted in a transaction")]
    EnlistedOperation(&'static str),
}

impl PoolError {
    /// Whether the error was raised while acquiring a connection, as opposed
    /// to while configuring the data source or using a connection.
    #[must_use]
    pub fn is_acquisition_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionCreation(_)
                | Self::PoolExhausted { .. }
                | Self::AuthenticationMismatch { .. }
                | Self::Enlistment(_)
                | Self::ConnectionAcquisition(_)
                | Self::PoolClosed
                | Self::Naming(_)
        )
    }

    /// Whether the error is a pool exhaustion timeout.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}

impl From<ObjectPoolError<DriverError>> for PoolError {
    fn from(err: ObjectPoolError<DriverError>) -> Self {
        match err {
            ObjectPoolError::Exhausted { max_wait } => Self::PoolExhausted { max_wait },
            ObjectPoolError::Closed => Self::PoolClosed,
            ObjectPoolError::Create(e) => Self::ConnectionCreation(e),
            ObjectPoolError::Configuration(e) => Self::Configuration(e.to_string()),
            other => Self::ConnectionAcquisition(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_pool_error_conversion() {
        let err: PoolError = ObjectPoolError::<DriverError>::Exhausted {
            max_wait: MaxWait::FAIL_FAST,
        }
        .into();
        assert!(err.is_exhausted());
        assert!(err.is_acquisition_failure());

        let err: PoolError = ObjectPoolError::Create(DriverError::ConnectionRefused("down".into())).into();
        assert!(matches!(err, PoolError::ConnectionCreation(_)));

        let err: PoolError = ObjectPoolError::<DriverError>::Validation.into();
        assert!(matches!(err, PoolError::ConnectionAcquisition(_)));
    }

    #[test]
    fn test_closed_message() {
        assert_eq!(PoolError::ConnectionClosed.to_string(), "connection is closed");
        assert!(!PoolError::ConnectionClosed.is_acquisition_failure());
        assert!(!PoolError::Configuration("x".into()).is_acquisition_failure());
    }

    #[test]
    fn test_authentication_mismatch_message() {
        let err = PoolError::AuthenticationMismatch {
            username: Some("alice".into()),
            source: DriverError::AuthenticationFailed {
                username: Some("alice".into()),
            },
        };
        assert!(err.to_string().contains("alice"));
    }
}
