//! Sub-pool and per-user keys.

use std::fmt;

/// Identifies one sub-pool: the data source it belongs to and, for users with
/// their own configuration, the username.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    data_source_name: String,
    username: Option<String>,
}

impl PoolKey {
    /// Create a key.
    #[must_use]
    pub fn new(data_source_name: impl Into<String>, username: Option<&str>) -> Self {
        Self {
            data_source_name: data_source_name.into(),
            username: username.map(str::to_string),
        }
    }

    /// Name of the owning data source.
    #[must_use]
    pub fn data_source_name(&self) -> &str {
        &self.data_source_name
    }

    /// Username of a per-user sub-pool, `None` for the default sub-pool.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(user) => write!(f, "{}/{}", self.data_source_name, user),
            None => f.write_str(&self.data_source_name),
        }
    }
}

/// Key of a connection inside one sub-pool.
///
/// Unlike [`PoolKey`], this always carries the requesting username, so
/// connections opened for one user are never handed to another even when
/// both share the default sub-pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserKey(Option<String>);

impl UserKey {
    /// Create a key for `username`.
    #[must_use]
    pub fn new(username: Option<&str>) -> Self {
        Self(username.map(str::to_string))
    }

    /// The username.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_deref().unwrap_or("<default>"))
    }
}

/// Resolve the sub-pool key for a request.
///
/// Users without their own configuration all map to the default sub-pool.
#[must_use]
pub fn resolve_key(
    data_source_name: &str,
    username: Option<&str>,
    per_user_config_present: bool,
) -> PoolKey {
    if per_user_config_present {
        PoolKey::new(data_source_name, username)
    } else {
        PoolKey::new(data_source_name, None)
    }
}
