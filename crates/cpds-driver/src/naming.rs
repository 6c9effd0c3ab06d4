//! Naming/lookup service contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::connection::ConnectionSource;
use crate::error::NamingError;

/// Resolves connection sources by name.
#[async_trait]
pub trait NamingContext: Send + Sync {
    /// Look up the connection source bound under `name`.
    async fn lookup(&self, name: &str) -> Result<Arc<dyn ConnectionSource>, NamingError>;
}

/// Naming context backed by an in-process map.
#[derive(Default)]
pub struct InMemoryNamingContext {
    bindings: RwLock<HashMap<String, Arc<dyn ConnectionSource>>>,
}

impl InMemoryNamingContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `source` under `name`, replacing any previous binding.
    pub fn bind(&self, name: impl Into<String>, source: Arc<dyn ConnectionSource>) {
        let name = name.into();
        tracing::debug!(name = %name, "binding connection source");
        self.bindings.write().insert(name, source);
    }

    /// Remove the binding for `name`. Returns whether a binding existed.
    pub fn unbind(&self, name: &str) -> bool {
        self.bindings.write().remove(name).is_some()
    }

    /// Whether anything is bound under `name`.
    #[must_use]
    pub fn is_bound(&self, name: &str) -> bool {
        self.bindings.read().contains_key(name)
    }
}

#[async_trait]
impl NamingContext for InMemoryNamingContext {
    async fn lookup(&self, name: &str) -> Result<Arc<dyn ConnectionSource>, NamingError> {
        self.bindings
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| NamingError::NotBound(name.to_string()))
    }
}

impl std::fmt::Debug for InMemoryNamingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bindings = self.bindings.read();
        let mut names: Vec<&String> = bindings.keys().collect();
        names.sort();
        f.debug_struct("InMemoryNamingContext")
            .field("names", &names)
            .finish()
    }
}
