//! Pool configuration.

use std::fmt;
use std::time::Duration;

/// How long a borrow may wait for capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaxWait {
    /// Wait until an object becomes available.
    #[default]
    Indefinite,
    /// Wait at most this long. Zero fails immediately when the pool is full.
    Bounded(Duration),
}

impl MaxWait {
    /// Fail immediately when no capacity is available.
    pub const FAIL_FAST: Self = Self::Bounded(Duration::ZERO);

    /// Convert from the conventional millisecond encoding where any negative
    /// value means "wait forever".
    #[must_use]
    pub fn from_millis(millis: i64) -> Self {
        match u64::try_from(millis) {
            Ok(ms) => Self::Bounded(Duration::from_millis(ms)),
            Err(_) => Self::Indefinite,
        }
    }

    /// Millisecond encoding, `-1` for [`MaxWait::Indefinite`].
    #[must_use]
    pub fn as_millis(&self) -> i64 {
        match self {
            Self::Indefinite => -1,
            Self::Bounded(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
        }
    }
}

impl fmt::Display for MaxWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Indefinite => f.write_str("indefinite"),
            Self::Bounded(d) => write!(f, "{d:?}"),
        }
    }
}

/// Configuration for a keyed object pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Maximum number of objects (idle + active + being created) across all keys.
    pub max_total: u32,

    /// Maximum number of idle objects kept per key.
    pub max_idle_per_key: u32,

    /// Number of idle objects the evictor tries to keep per key.
    pub min_idle_per_key: u32,

    /// How long a borrow waits when the pool is at capacity.
    pub max_wait: MaxWait,

    /// Hand out the most recently returned object first.
    pub lifo: bool,

    /// Validate objects right after creation.
    pub test_on_create: bool,

    /// Validate idle objects before handing them out.
    pub test_on_borrow: bool,

    /// Validate idle objects during eviction runs.
    pub test_while_idle: bool,

    /// Minimum time an object may sit idle before it is eligible for eviction.
    pub min_evictable_idle_time: Duration,

    /// Maximum number of idle objects examined per key in one eviction run.
    pub num_tests_per_eviction_run: u32,

    /// Maximum lifetime of an object; `None` means unlimited.
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 8,
            max_idle_per_key: 8,
            min_idle_per_key: 0,
            max_wait: MaxWait::Indefinite,
            lifo: true,
            test_on_create: false,
            test_on_borrow: false,
            test_while_idle: false,
            min_evictable_idle_time: Duration::from_secs(30 * 60),
            num_tests_per_eviction_run: 3,
            max_lifetime: None,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of objects.
    #[must_use]
    pub fn max_total(mut self, count: u32) -> Self {
        self.max_total = count;
        self
    }

    /// Set the maximum number of idle objects per key.
    #[must_use]
    pub fn max_idle_per_key(mut self, count: u32) -> Self {
        self.max_idle_per_key = count;
        self
    }

    /// Set the minimum number of idle objects per key.
    #[must_use]
    pub fn min_idle_per_key(mut self, count: u32) -> Self {
        self.min_idle_per_key = count;
        self
    }

    /// Set the borrow wait policy.
    #[must_use]
    pub fn max_wait(mut self, max_wait: MaxWait) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Choose LIFO (`true`) or FIFO (`false`) ordering of idle objects.
    #[must_use]
    pub fn lifo(mut self, lifo: bool) -> Self {
        self.lifo = lifo;
        self
    }

    /// Enable or disable validation right after creation.
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

    /// Enable or disable validation of idle objects during eviction.
    #[must_use]
    pub fn test_while_idle(mut self, enabled: bool) -> Self {
        self.test_while_idle = enabled;
        self
    }

    /// Set the minimum idle time before eviction.
    #[must_use]
    pub fn min_evictable_idle_time(mut self, idle: Duration) -> Self {
        self.min_evictable_idle_time = idle;
        self
    }

    /// Set how many idle objects are examined per key in one eviction run.
    #[must_use]
    pub fn num_tests_per_eviction_run(mut self, count: u32) -> Self {
        self.num_tests_per_eviction_run = count;
        self
    }

    /// Set the maximum object lifetime.
    #[must_use]
    pub fn max_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        if self.max_total == 0 {
            return Err(crate::error::ConfigError(
                "max_total must be greater than 0".into(),
            ));
        }
        if self.min_idle_per_key > self.max_idle_per_key {
            return Err(crate::error::ConfigError(
                "min_idle_per_key cannot be greater than max_idle_per_key".into(),
            ));
        }
        Ok(())
    }
}
