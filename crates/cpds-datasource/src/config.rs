//! Data source configuration.
//!
//! Pool settings come in two layers: data source wide defaults and optional
//! per-user overrides. [`LayeredConfig`] is immutable; the data source swaps
//! in a modified copy when a setting changes, so a sub-pool always sees one
//! consistent snapshot.

use std::collections::BTreeMap;
use std::time::Duration;

use cpds_driver::IsolationLevel;
use cpds_pool::{MaxWait, PoolConfig};

use crate::error::{PoolError, Result};

/// Settings for one sub-pool and the connections it hands out.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    /// Maximum number of connections (idle + active) in the sub-pool.
    pub max_total: u32,

    /// Maximum number of idle connections kept per user.
    pub max_idle: u32,

    /// Number of idle connections the evictor keeps per user.
    pub min_idle: u32,

    /// How long `get_connection` waits when the sub-pool is exhausted.
    pub max_wait: MaxWait,

    /// Reuse the most recently returned connection first.
    pub lifo: bool,

    /// Interval between maintenance runs; `None` disables the evictor.
    pub time_between_eviction_runs: Option<Duration>,

    /// Minimum time a connection may sit idle before eviction.
    pub min_evictable_idle_time: Duration,

    /// Idle connections examined per user in one eviction run.
    pub num_tests_per_eviction_run: u32,

    /// Maximum lifetime of a physical connection.
    pub max_conn_lifetime: Option<Duration>,

    /// Validate connections right after creation.
    pub test_on_create: bool,

    /// Validate idle connections before handing them out.
    pub test_on_borrow: bool,

    /// Validate connections when they are returned.
    pub test_on_return: bool,

    /// Validate idle connections during eviction runs.
    pub test_while_idle: bool,

    /// Query used for validation; must return at least one row.
    pub validation_query: Option<String>,

    /// Timeout applied to the validation query.
    pub validation_query_timeout: Option<Duration>,

    /// Roll back after a successful validation query.
    pub rollback_after_validation: bool,

    /// Auto-commit mode applied to every handed-out connection.
    pub default_auto_commit: Option<bool>,

    /// Read-only flag applied to every handed-out connection.
    pub default_read_only: Option<bool>,

    /// Isolation level applied to every handed-out connection.
    pub default_transaction_isolation: Option<IsolationLevel>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_total: 8,
            max_idle: 8,
            min_idle: 0,
            max_wait: MaxWait::Indefinite,
            lifo: true,
            time_between_eviction_runs: None,
            min_evictable_idle_time: Duration::from_secs(30 * 60),
            num_tests_per_eviction_run: 3,
            max_conn_lifetime: None,
            test_on_create: false,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            validation_query: None,
            validation_query_timeout: None,
            rollback_after_validation: false,
            default_auto_commit: None,
            default_read_only: None,
            default_transaction_isolation: None,
        }
    }
}

impl PoolSettings {
    /// Create settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_total(mut self, count: u32) -> Self {
        self.max_total = count;
        self
    }

    /// Set the maximum number of idle connections per user.
    #[must_use]
    pub fn max_idle(mut self, count: u32) -> Self {
        self.max_idle = count;
        self
    }

    /// Set the minimum number of idle connections per user.
    #[must_use]
    pub fn min_idle(mut self, count: u32) -> Self {
        self.min_idle = count;
        self
    }

    /// Set the borrow wait policy.
    #[must_use]
    pub fn max_wait(mut self, max_wait: MaxWait) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Choose LIFO (`true`) or FIFO (`false`) reuse.
    #[must_use]
    pub fn lifo(mut self, lifo: bool) -> Self {
        self.lifo = lifo;
        self
    }

    /// Set the maintenance interval.
    #[must_use]
    pub fn time_between_eviction_runs(mut self, interval: Option<Duration>) -> Self {
        self.time_between_eviction_runs = interval;
        self
    }

    /// Set the minimum idle time before eviction.
    #[must_use]
    pub fn min_evictable_idle_time(mut self, idle: Duration) -> Self {
        self.min_evictable_idle_time = idle;
        self
    }

    /// Set how many idle connections are examined per user in one run.
    #[must_use]
    pub fn num_tests_per_eviction_run(mut self, count: u32) -> Self {
        self.num_tests_per_eviction_run = count;
        self
    }

    /// Set the maximum connection lifetime.
    #[must_use]
    pub fn max_conn_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_conn_lifetime = lifetime;
        self
    }

    /// Enable or disable validation after creation.
    #[must_use]
    pub fn test_on_create(mut self, enabled: bool) -> Self {
        self.test_on_create = enabled;
        self
    }

    /// Enable or disable validation on borrow.
    #[must_use]
    pub fn test_on_borrow(mut self, enabled: bool) -> Self {
        self.test_on_borrow = enabled;
        self
    }

    /// Enable or disable validation on return.
    #[must_use]
    pub fn test_on_return(mut self, enabled: bool) -> Self {
        self.test_on_return = enabled;
        self
    }

    /// Enable or disable validation during eviction runs.
    #[must_use]
    pub fn test_while_idle(mut self, enabled: bool) -> Self {
        self.test_while_idle = enabled;
        self
    }

    /// Set the validation query.
    #[must_use]
    pub fn validation_query(mut self, query: impl Into<String>) -> Self {
        self.validation_query = Some(query.into());
        self
    }

    /// Set the validation query timeout.
    #[must_use]
    pub fn validation_query_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.validation_query_timeout = timeout;
        self
    }

    /// Roll back after each successful validation query.
    #[must_use]
    pub fn rollback_after_validation(mut self, enabled: bool) -> Self {
        self.rollback_after_validation = enabled;
        self
    }

    /// Set the default auto-commit mode.
    #[must_use]
    pub fn default_auto_commit(mut self, auto_commit: Option<bool>) -> Self {
        self.default_auto_commit = auto_commit;
        self
    }

    /// Set the default read-only flag.
    #[must_use]
    pub fn default_read_only(mut self, read_only: Option<bool>) -> Self {
        self.default_read_only = read_only;
        self
    }

    /// Set the default isolation level.
    #[must_use]
    pub fn default_transaction_isolation(mut self, level: Option<IsolationLevel>) -> Self {
        self.default_transaction_isolation = level;
        self
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<()> {
        if self.max_total == 0 {
            return Err(PoolError::Configuration(
                "max_total must be greater than 0".into(),
            ));
        }
        if self.min_idle > self.max_idle {
            return Err(PoolError::Configuration(
                "min_idle cannot be greater than max_idle".into(),
            ));
        }
        if self.time_between_eviction_runs.is_some_and(|d| d.is_zero()) {
            return Err(PoolError::Configuration(
                "time_between_eviction_runs must be greater than 0".into(),
            ));
        }
        if self
            .validation_query
            .as_deref()
            .is_some_and(|q| q.trim().is_empty())
        {
            return Err(PoolError::Configuration(
                "validation_query must not be empty".into(),
            ));
        }

        if let MaxWait::Bounded(wait) = self.max_wait {
            whole_millis("max_wait", wait)?;
        }
        whole_millis("min_evictable_idle_time", self.min_evictable_idle_time)?;
        let optional = [
            ("time_between_eviction_runs", self.time_between_eviction_runs),
            ("max_conn_lifetime", self.max_conn_lifetime),
            ("validation_query_timeout", self.validation_query_timeout),
        ];
        for (name, duration) in optional {
            duration.map_or(Ok(()), |d| whole_millis(name, d))?;
        }
        Ok(())
    }

    /// Object pool configuration for a sub-pool using these settings.
    #[must_use]
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig::new()
            .max_total(self.max_total)
            .max_idle_per_key(self.max_idle)
            .min_idle_per_key(self.min_idle)
            .max_wait(self.max_wait)
            .lifo(self.lifo)
            .test_on_create(self.test_on_create)
            .test_on_borrow(self.test_on_borrow)
            .test_while_idle(self.test_while_idle)
            .min_evictable_idle_time(self.min_evictable_idle_time)
            .num_tests_per_eviction_run(self.num_tests_per_eviction_run)
            .max_lifetime(self.max_conn_lifetime)
    }

    /// Flatten into named properties. Unset optional values are omitted.
    pub(crate) fn to_properties(&self) -> Vec<(&'static str, String)> {
        let mut props = vec![
            ("maxTotal", self.max_total.to_string()),
            ("maxIdle", self.max_idle.to_string()),
            ("minIdle", self.min_idle.to_string()),
            ("maxWaitMillis", self.max_wait.as_millis().to_string()),
            ("lifo", self.lifo.to_string()),
            (
                "minEvictableIdleTimeMillis",
                millis(self.min_evictable_idle_time),
            ),
            (
                "numTestsPerEvictionRun",
                self.num_tests_per_eviction_run.to_string(),
            ),
            ("testOnCreate", self.test_on_create.to_string()),
            ("testOnBorrow", self.test_on_borrow.to_string()),
            ("testOnReturn", self.test_on_return.to_string()),
            ("testWhileIdle", self.test_while_idle.to_string()),
            (
                "rollbackAfterValidation",
                self.rollback_after_validation.to_string(),
            ),
        ];
        if let Some(d) = self.time_between_eviction_runs {
            props.push(("timeBetweenEvictionRunsMillis", millis(d)));
        }
        if let Some(d) = self.max_conn_lifetime {
            props.push(("maxConnLifetimeMillis", millis(d)));
        }
        if let Some(q) = &self.validation_query {
            props.push(("validationQuery", q.clone()));
        }
        if let Some(d) = self.validation_query_timeout {
            props.push(("validationQueryTimeoutMillis", millis(d)));
        }
        if let Some(v) = self.default_auto_commit {
            props.push(("defaultAutoCommit", v.to_string()));
        }
        if let Some(v) = self.default_read_only {
            props.push(("defaultReadOnly", v.to_string()));
        }
        if let Some(level) = self.default_transaction_isolation {
            props.push(("defaultTransactionIsolation", level.as_str().to_string()));
        }
        props
    }

    /// Set one named property, as produced by
    /// [`to_properties`](Self::to_properties).
    pub(crate) fn set_property(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "maxTotal" => self.max_total = parse(name, value)?,
            "maxIdle" => self.max_idle = parse(name, value)?,
            "minIdle" => self.min_idle = parse(name, value)?,
            "maxWaitMillis" => self.max_wait = MaxWait::from_millis(parse(name, value)?),
            "lifo" => self.lifo = parse(name, value)?,
            "timeBetweenEvictionRunsMillis" => {
                self.time_between_eviction_runs = Some(parse_millis(name, value)?);
            }
            "minEvictableIdleTimeMillis" => {
                self.min_evictable_idle_time = parse_millis(name, value)?;
            }
            "numTestsPerEvictionRun" => self.num_tests_per_eviction_run = parse(name, value)?,
            "maxConnLifetimeMillis" => self.max_conn_lifetime = Some(parse_millis(name, value)?),
            "testOnCreate" => self.test_on_create = parse(name, value)?,
            "testOnBorrow" => self.test_on_borrow = parse(name, value)?,
            "testOnReturn" => self.test_on_return = parse(name, value)?,
            "testWhileIdle" => self.test_while_idle = parse(name, value)?,
            "validationQuery" => self.validation_query = Some(value.to_string()),
            "validationQueryTimeoutMillis" => {
                self.validation_query_timeout = Some(parse_millis(name, value)?);
            }
            "rollbackAfterValidation" => self.rollback_after_validation = parse(name, value)?,
            "defaultAutoCommit" => self.default_auto_commit = Some(parse(name, value)?),
            "defaultReadOnly" => self.default_read_only = Some(parse(name, value)?),
            "defaultTransactionIsolation" => {
                self.default_transaction_isolation = Some(parse(name, value)?);
            }
            _ => {
                return Err(PoolError::Configuration(format!(
                    "unknown pool property: {name}"
                )));
            }
        }
        Ok(())
    }
}

/// Per-user overrides of [`PoolSettings`]. `None` inherits the default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserOverrides {
    /// Override of [`PoolSettings::max_total`].
    pub max_total: Option<u32>,
    /// Override of [`PoolSettings::max_idle`].
    pub max_idle: Option<u32>,
    /// Override of [`PoolSettings::min_idle`].
    pub min_idle: Option<u32>,
    /// Override of [`PoolSettings::max_wait`].
    pub max_wait: Option<MaxWait>,
    /// Override of [`PoolSettings::lifo`].
    pub lifo: Option<bool>,
    /// Override of [`PoolSettings::min_evictable_idle_time`].
    pub min_evictable_idle_time: Option<Duration>,
    /// Override of [`PoolSettings::num_tests_per_eviction_run`].
    pub num_tests_per_eviction_run: Option<u32>,
    /// Override of [`PoolSettings::test_on_create`].
    pub test_on_create: Option<bool>,
    /// Override of [`PoolSettings::test_on_borrow`].
    pub test_on_borrow: Option<bool>,
    /// Override of [`PoolSettings::test_on_return`].
    pub test_on_return: Option<bool>,
    /// Override of [`PoolSettings::test_while_idle`].
    pub test_while_idle: Option<bool>,
    /// Override of [`PoolSettings::default_auto_commit`].
    pub default_auto_commit: Option<bool>,
    /// Override of [`PoolSettings::default_read_only`].
    pub default_read_only: Option<bool>,
    /// Override of [`PoolSettings::default_transaction_isolation`].
    pub default_transaction_isolation: Option<IsolationLevel>,
}

impl UserOverrides {
    /// Create an empty set of overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the maximum number of connections.
    #[must_use]
    pub fn max_total(mut self, count: u32) -> Self {
        self.max_total = Some(count);
        self
    }

    /// Override the maximum number of idle connections.
    #[must_use]
    pub fn max_idle(mut self, count: u32) -> Self {
        self.max_idle = Some(count);
        self
    }

    /// Override the minimum number of idle connections.
    #[must_use]
    pub fn min_idle(mut self, count: u32) -> Self {
        self.min_idle = Some(count);
        self
    }

    /// Override the borrow wait policy.
    #[must_use]
    pub fn max_wait(mut self, max_wait: MaxWait) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Override validation on borrow.
    #[must_use]
    pub fn test_on_borrow(mut self, enabled: bool) -> Self {
        self.test_on_borrow = Some(enabled);
        self
    }

    /// Override validation on return.
    #[must_use]
    pub fn test_on_return(mut self, enabled: bool) -> Self {
        self.test_on_return = Some(enabled);
        self
    }

    /// Override the default auto-commit mode.
    #[must_use]
    pub fn default_auto_commit(mut self, auto_commit: bool) -> Self {
        self.default_auto_commit = Some(auto_commit);
        self
    }

    /// Override the default read-only flag.
    #[must_use]
    pub fn default_read_only(mut self, read_only: bool) -> Self {
        self.default_read_only = Some(read_only);
        self
    }

    /// Override the default isolation level.
    #[must_use]
    pub fn default_transaction_isolation(mut self, level: IsolationLevel) -> Self {
        self.default_transaction_isolation = Some(level);
        self
    }

    /// Apply the overrides on top of `defaults`.
    #[must_use]
    pub fn apply(&self, defaults: &PoolSettings) -> PoolSettings {
        let mut settings = defaults.clone();
        if let Some(v) = self.max_total {
            settings.max_total = v;
        }
        if let Some(v) = self.max_idle {
            settings.max_idle = v;
        }
        if let Some(v) = self.min_idle {
            settings.min_idle = v;
        }
        if let Some(v) = self.max_wait {
            settings.max_wait = v;
        }
        if let Some(v) = self.lifo {
            settings.lifo = v;
        }
        if let Some(v) = self.min_evictable_idle_time {
            settings.min_evictable_idle_time = v;
        }
        if let Some(v) = self.num_tests_per_eviction_run {
            settings.num_tests_per_eviction_run = v;
        }
        if let Some(v) = self.test_on_create {
            settings.test_on_create = v;
        }
        if let Some(v) = self.test_on_borrow {
            settings.test_on_borrow = v;
        }
        if let Some(v) = self.test_on_return {
            settings.test_on_return = v;
        }
        if let Some(v) = self.test_while_idle {
            settings.test_while_idle = v;
        }
        if self.default_auto_commit.is_some() {
            settings.default_auto_commit = self.default_auto_commit;
        }
        if self.default_read_only.is_some() {
            settings.default_read_only = self.default_read_only;
        }
        if self.default_transaction_isolation.is_some() {
            settings.default_transaction_isolation = self.default_transaction_isolation;
        }
        settings
    }

    pub(crate) fn to_properties(&self) -> Vec<(&'static str, String)> {
        let mut props = Vec::new();
        let mut push = |name: &'static str, value: Option<String>| {
            if let Some(value) = value {
                props.push((name, value));
            }
        };
        push("maxTotal", self.max_total.map(|v| v.to_string()));
        push("maxIdle", self.max_idle.map(|v| v.to_string()));
        push("minIdle", self.min_idle.map(|v| v.to_string()));
        push(
            "maxWaitMillis",
            self.max_wait.map(|v| v.as_millis().to_string()),
        );
        push("lifo", self.lifo.map(|v| v.to_string()));
        push(
            "minEvictableIdleTimeMillis",
            self.min_evictable_idle_time.map(millis),
        );
        push(
            "numTestsPerEvictionRun",
            self.num_tests_per_eviction_run.map(|v| v.to_string()),
        );
        push("testOnCreate", self.test_on_create.map(|v| v.to_string()));
        push("testOnBorrow", self.test_on_borrow.map(|v| v.to_string()));
        push("testOnReturn", self.test_on_return.map(|v| v.to_string()));
        push("testWhileIdle", self.test_while_idle.map(|v| v.to_string()));
        push(
            "defaultAutoCommit",
            self.default_auto_commit.map(|v| v.to_string()),
        );
        push(
            "defaultReadOnly",
            self.default_read_only.map(|v| v.to_string()),
        );
        push(
            "defaultTransactionIsolation",
            self.default_transaction_isolation
                .map(|v| v.as_str().to_string()),
        );
        props
    }

    pub(crate) fn set_property(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "maxTotal" => self.max_total = Some(parse(name, value)?),
            "maxIdle" => self.max_idle = Some(parse(name, value)?),
            "minIdle" => self.min_idle = Some(parse(name, value)?),
            "maxWaitMillis" => self.max_wait = Some(MaxWait::from_millis(parse(name, value)?)),
            "lifo" => self.lifo = Some(parse(name, value)?),
            "minEvictableIdleTimeMillis" => {
                self.min_evictable_idle_time = Some(parse_millis(name, value)?);
            }
            "numTestsPerEvictionRun" => {
                self.num_tests_per_eviction_run = Some(parse(name, value)?);
            }
            "testOnCreate" => self.test_on_create = Some(parse(name, value)?),
            "testOnBorrow" => self.test_on_borrow = Some(parse(name, value)?),
            "testOnReturn" => self.test_on_return = Some(parse(name, value)?),
            "testWhileIdle" => self.test_while_idle = Some(parse(name, value)?),
            "defaultAutoCommit" => self.default_auto_commit = Some(parse(name, value)?),
            "defaultReadOnly" => self.default_read_only = Some(parse(name, value)?),
            "defaultTransactionIsolation" => {
                self.default_transaction_isolation = Some(parse(name, value)?);
            }
            _ => {
                return Err(PoolError::Configuration(format!(
                    "unknown per-user property: {name}"
                )));
            }
        }
        Ok(())
    }
}

/// Defaults plus per-user overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayeredConfig {
    defaults: PoolSettings,
    per_user: BTreeMap<String, UserOverrides>,
}

impl LayeredConfig {
    /// Create a configuration with the given defaults and no overrides.
    #[must_use]
    pub fn new(defaults: PoolSettings) -> Self {
        Self {
            defaults,
            per_user: BTreeMap::new(),
        }
    }

    /// The data source wide defaults.
    #[must_use]
    pub fn defaults(&self) -> &PoolSettings {
        &self.defaults
    }

    /// Overrides configured for `username`.
    #[must_use]
    pub fn overrides(&self, username: &str) -> Option<&UserOverrides> {
        self.per_user.get(username)
    }

    /// Iterate over every user with overrides.
    pub fn users(&self) -> impl Iterator<Item = (&str, &UserOverrides)> {
        self.per_user.iter().map(|(user, o)| (user.as_str(), o))
    }

    /// Whether `username` has its own configuration.
    #[must_use]
    pub fn has_user(&self, username: Option<&str>) -> bool {
        username.is_some_and(|user| self.per_user.contains_key(user))
    }

    /// Effective settings for `username`.
    #[must_use]
    pub fn resolve(&self, username: Option<&str>) -> PoolSettings {
        match username.and_then(|user| self.per_user.get(user)) {
            Some(overrides) => overrides.apply(&self.defaults),
            None => self.defaults.clone(),
        }
    }

    /// A copy with different defaults.
    #[must_use]
    pub fn with_defaults(&self, defaults: PoolSettings) -> Self {
        Self {
            defaults,
            per_user: self.per_user.clone(),
        }
    }

    /// A copy with `overrides` installed for `username`.
    #[must_use]
    pub fn with_user(&self, username: &str, overrides: UserOverrides) -> Self {
        let mut per_user = self.per_user.clone();
        per_user.insert(username.to_string(), overrides);
        Self {
            defaults: self.defaults.clone(),
            per_user,
        }
    }

    /// Validate the defaults and every user's effective settings.
    pub fn validate(&self) -> Result<()> {
        self.defaults.validate()?;
        for user in self.per_user.keys() {
            self.resolve(Some(user)).validate().map_err(|e| match e {
                PoolError::Configuration(msg) => {
                    PoolError::Configuration(format!("user {user}: {msg}"))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}

/// Abandoned connection tracking settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbandonedConfig {
    /// Sweep before a borrow when the sub-pool is close to exhaustion.
    pub remove_on_borrow: bool,

    /// Sweep from the maintenance task.
    pub remove_on_maintenance: bool,

    /// Time without use after which a connection counts as abandoned.
    pub timeout: Duration,

    /// Capture the borrow site and log it on reclamation.
    pub log_abandoned: bool,
}

impl Default for AbandonedConfig {
    fn default() -> Self {
        Self {
            remove_on_borrow: false,
            remove_on_maintenance: false,
            timeout: Duration::from_secs(300),
            log_abandoned: false,
        }
    }
}

impl AbandonedConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweep before borrowing from a nearly exhausted sub-pool.
    #[must_use]
    pub fn remove_on_borrow(mut self, enabled: bool) -> Self {
        self.remove_on_borrow = enabled;
        self
    }

    /// Sweep from the maintenance task.
    #[must_use]
    pub fn remove_on_maintenance(mut self, enabled: bool) -> Self {
        self.remove_on_maintenance = enabled;
        self
    }

    /// Set the abandoned timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Log the borrow site of reclaimed connections.
    #[must_use]
    pub fn log_abandoned(mut self, enabled: bool) -> Self {
        self.log_abandoned = enabled;
        self
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<()> {
        whole_millis("abandoned timeout", self.timeout)
    }

    pub(crate) fn to_properties(&self) -> Vec<(&'static str, String)> {
        vec![
            ("removeOnBorrow", self.remove_on_borrow.to_string()),
            ("removeOnMaintenance", self.remove_on_maintenance.to_string()),
            ("timeoutMillis", millis(self.timeout)),
            ("logAbandoned", self.log_abandoned.to_string()),
        ]
    }

    pub(crate) fn set_property(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "removeOnBorrow" => self.remove_on_borrow = parse(name, value)?,
            "removeOnMaintenance" => self.remove_on_maintenance = parse(name, value)?,
            "timeoutMillis" => self.timeout = parse_millis(name, value)?,
            "logAbandoned" => self.log_abandoned = parse(name, value)?,
            _ => {
                return Err(PoolError::Configuration(format!(
                    "unknown abandoned property: {name}"
                )));
            }
        }
        Ok(())
    }
}

/// Durations are stored as milliseconds, so finer precision cannot be kept.
fn whole_millis(name: &str, duration: Duration) -> Result<()> {
    if duration.subsec_nanos() % 1_000_000 != 0 {
        return Err(PoolError::Configuration(format!(
            "{name} must be a whole number of milliseconds, got {duration:?}"
        )));
    }
    Ok(())
}

fn millis(d: Duration) -> String {
    d.as_millis().to_string()
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| PoolError::Configuration(format!("invalid value for {name}: {value:?}")))
}

fn parse_millis(name: &str, value: &str) -> Result<Duration> {
    parse::<u64>(name, value).map(Duration::from_millis)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = PoolSettings::default();
        assert_eq!(settings.max_total, 8);
        assert_eq!(settings.max_idle, 8);
        assert_eq!(settings.min_idle, 0);
        assert_eq!(settings.max_wait, MaxWait::Indefinite);
        assert!(settings.lifo);
        assert_eq!(settings.num_tests_per_eviction_run, 3);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        assert!(PoolSettings::new().max_total(0).validate().is_err());
        assert!(PoolSettings::new().max_idle(1).min_idle(2).validate().is_err());
        assert!(
            PoolSettings::new()
                .time_between_eviction_runs(Some(Duration::ZERO))
                .validate()
                .is_err()
        );
        assert!(PoolSettings::new().validation_query("  ").validate().is_err());
    }

    #[test]
    fn test_validate_rejects_sub_millisecond_durations() {
        let fine = Duration::from_micros(1500);
        assert!(PoolSettings::new().min_evictable_idle_time(fine).validate().is_err());
        assert!(PoolSettings::new().max_wait(MaxWait::Bounded(fine)).validate().is_err());
        assert!(PoolSettings::new().max_conn_lifetime(Some(fine)).validate().is_err());
        assert!(
            PoolSettings::new()
                .validation_query_timeout(Some(fine))
                .validate()
                .is_err()
        );
        assert!(AbandonedConfig::new().timeout(fine).validate().is_err());

        let config = LayeredConfig::default().with_user(
            "alice",
            UserOverrides::new().max_wait(MaxWait::Bounded(fine)),
        );
        assert!(config.validate().is_err());

        assert!(
            PoolSettings::new()
                .min_evictable_idle_time(Duration::from_millis(1500))
                .validate()
                .is_ok()
        );
        assert!(AbandonedConfig::new().timeout(Duration::ZERO).validate().is_ok());
    }

    #[test]
    fn test_resolve_prefers_user_overrides() {
        let config = LayeredConfig::new(PoolSettings::new().max_total(10).default_read_only(Some(false)))
            .with_user(
                "reporting",
                UserOverrides::new().max_total(2).default_read_only(true),
            );

        let reporting = config.resolve(Some("reporting"));
        assert_eq!(reporting.max_total, 2);
        assert_eq!(reporting.default_read_only, Some(true));

        let other = config.resolve(Some("alice"));
        assert_eq!(other.max_total, 10);
        assert_eq!(other.default_read_only, Some(false));

        assert!(config.has_user(Some("reporting")));
        assert!(!config.has_user(Some("alice")));
        assert!(!config.has_user(None));
    }

    #[test]
    fn test_copy_on_write_leaves_original_untouched() {
        let original = LayeredConfig::default();
        let updated = original.with_user("alice", UserOverrides::new().max_total(1));
        assert!(!original.has_user(Some("alice")));
        assert!(updated.has_user(Some("alice")));
    }

    #[test]
    fn test_layered_validate_reports_user() {
        let config = LayeredConfig::new(PoolSettings::new().max_idle(4))
            .with_user("alice", UserOverrides::new().min_idle(5));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("alice"));
    }

    #[test]
    fn test_pool_config_conversion() {
        let settings = PoolSettings::new()
            .max_total(3)
            .max_idle(2)
            .max_wait(MaxWait::FAIL_FAST)
            .max_conn_lifetime(Some(Duration::from_secs(60)));
        let config = settings.to_pool_config();
        assert_eq!(config.max_total, 3);
        assert_eq!(config.max_idle_per_key, 2);
        assert_eq!(config.max_wait, MaxWait::FAIL_FAST);
        assert_eq!(config.max_lifetime, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_property_round_trip() {
        let settings = PoolSettings::new()
            .max_total(5)
            .max_wait(MaxWait::Bounded(Duration::from_millis(1500)))
            .validation_query("SELECT 1")
            .default_transaction_isolation(Some(IsolationLevel::Serializable));

        let mut restored = PoolSettings::new();
        for (name, value) in settings.to_properties() {
            restored.set_property(name, &value).unwrap();
        }
        assert_eq!(restored, settings);
    }

    #[test]
    fn test_set_property_rejects_malformed_values() {
        let mut settings = PoolSettings::new();
        assert!(settings.set_property("maxTotal", "lots").is_err());
        assert!(settings.set_property("noSuchThing", "1").is_err());
        assert!(UserOverrides::new().set_property("validationQuery", "x").is_err());
    }
}
