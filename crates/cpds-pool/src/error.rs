//! Pool error types.

use thiserror::Error;

use crate::config::MaxWait;

/// Invalid pool configuration.
#[derive(Debug, Clone, Error)]
#[error("invalid pool configuration: {0}")]
pub struct ConfigError(pub String);

/// Errors that can occur while borrowing from a pool.
///
/// `E` is the error type of the pool's object factory.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ObjectPoolError<E> {
    /// No object became available within the configured wait.
    #[error("pool exhausted (max wait {max_wait})")]
    Exhausted {
        /// The wait policy that was in effect.
        max_wait: MaxWait,
    },

    /// The pool has been closed.
    #[error("pool is closed")]
    Closed,

    /// The factory failed to create an object.
    #[error("failed to create pooled object: {0}")]
    Create(#[source] E),

    /// A newly created object failed activation or validation.
    #[error("unable to validate newly created object")]
    Validation,

    /// The pool configuration is invalid.
    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

impl<E> ObjectPoolError<E> {
    /// Whether the error was caused by lack of capacity.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}
