//! Serializable data source references.
//!
//! A [`Reference`] is a flat, versioned property map describing how to
//! rebuild a data source: its identity, default settings, per-user overrides
//! and abandoned tracking. Pools and connections are not part of it; a
//! restored data source creates its sub-pools lazily.
//!
//! Property names are grouped by prefix:
//!
//! | Prefix | Content |
//! |--------|---------|
//! | *(none)* | `dataSourceName`, `description`, `connectionSourceName`, `transactionSharing` |
//! | `default.` | [`PoolSettings`] |
//! | `user.<name>.` | [`UserOverrides`] for one user |
//! | `abandoned.` | [`AbandonedConfig`] |

use std::collections::BTreeMap;
use std::sync::Arc;

use cpds_driver::NamingContext;
use serde::{Deserialize, Serialize};

use crate::config::{AbandonedConfig, LayeredConfig, PoolSettings, UserOverrides};
use crate::datasource::{DataSource, Identity, SourceBinding};
use crate::error::{PoolError, Result};

/// Kind tag of data source references.
pub const REFERENCE_KIND: &str = "cpds.DataSource";

/// Current reference schema version.
pub const SCHEMA_VERSION: u32 = 1;

const DATA_SOURCE_NAME: &str = "dataSourceName";
const DESCRIPTION: &str = "description";
const CONNECTION_SOURCE_NAME: &str = "connectionSourceName";
const TRANSACTION_SHARING: &str = "transactionSharing";
const DEFAULT_PREFIX: &str = "default.";
const USER_PREFIX: &str = "user.";
const ABANDONED_PREFIX: &str = "abandoned.";
/// Present for every configured user, so users without overrides survive.
const USER_CONFIGURED: &str = "configured";

/// Flat description of a data source configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// What kind of object the reference describes.
    pub kind: String,
    /// Version of the property layout.
    pub schema_version: u32,
    /// The properties.
    pub properties: BTreeMap<String, String>,
}

impl Reference {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| PoolError::Configuration(format!("cannot serialize reference: {e}")))
    }

    /// Parse from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| PoolError::Configuration(format!("malformed reference: {e}")))
    }

    /// Look up one property.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

impl DataSource {
    /// Describe this data source's configuration.
    ///
    /// A directly attached connection source cannot be represented and is
    /// left out; the restored data source needs one attached again.
    #[must_use]
    pub fn to_reference(&self) -> Reference {
        let mut properties = BTreeMap::new();
        properties.insert(DATA_SOURCE_NAME.to_string(), self.name().to_string());
        if let Some(description) = self.description() {
            properties.insert(DESCRIPTION.to_string(), description);
        }

        let identity = self.identity();
        if let Some(SourceBinding::Named { name, .. }) = &identity.source {
            properties.insert(CONNECTION_SOURCE_NAME.to_string(), name.clone());
        }
        properties.insert(
            TRANSACTION_SHARING.to_string(),
            identity.transaction_sharing.to_string(),
        );
        if let Some(abandoned) = &identity.abandoned {
            for (name, value) in abandoned.to_properties() {
                properties.insert(format!("{ABANDONED_PREFIX}{name}"), value);
            }
        }

        let config = self.config();
        for (name, value) in config.defaults().to_properties() {
            properties.insert(format!("{DEFAULT_PREFIX}{name}"), value);
        }
        for (user, overrides) in config.users() {
            properties.insert(format!("{USER_PREFIX}{user}.{USER_CONFIGURED}"), "true".to_string());
            for (name, value) in overrides.to_properties() {
                properties.insert(format!("{USER_PREFIX}{user}.{name}"), value);
            }
        }

        Reference {
            kind: REFERENCE_KIND.to_string(),
            schema_version: SCHEMA_VERSION,
            properties,
        }
    }

    /// Rebuild a data source from `reference`.
    ///
    /// A `connectionSourceName` is resolved through `naming` when sub-pools
    /// are created. Unknown properties, malformed values and unsupported
    /// schema versions are rejected.
    pub fn from_reference(reference: &Reference, naming: Arc<dyn NamingContext>) -> Result<Self> {
        if reference.kind != REFERENCE_KIND {
            return Err(PoolError::Configuration(format!(
                "reference kind {:?} is not a data source",
                reference.kind
            )));
        }
        if reference.schema_version != SCHEMA_VERSION {
            return Err(PoolError::Configuration(format!(
                "unsupported reference schema version {}",
                reference.schema_version
            )));
        }

        let name = reference
            .get(DATA_SOURCE_NAME)
            .ok_or_else(|| PoolError::Configuration(format!("reference has no {DATA_SOURCE_NAME}")))?
            .to_string();
        let mut description = None;
        let mut identity = Identity::default();
        let mut abandoned: Option<AbandonedConfig> = None;
        let mut defaults = PoolSettings::default();
        let mut per_user: BTreeMap<String, UserOverrides> = BTreeMap::new();

        for (key, value) in &reference.properties {
            if let Some(property) = key.strip_prefix(DEFAULT_PREFIX) {
                defaults.set_property(property, value)?;
            } else if let Some(rest) = key.strip_prefix(USER_PREFIX) {
                let (user, property) = rest.rsplit_once('.').ok_or_else(|| {
                    PoolError::Configuration(format!("malformed per-user property: {key}"))
                })?;
                if user.is_empty() {
                    return Err(PoolError::Configuration(format!(
                        "per-user property without a user: {key}"
                    )));
                }
                let overrides = per_user.entry(user.to_string()).or_default();
                if property == USER_CONFIGURED {
                    if value.trim() != "true" {
                        return Err(PoolError::Configuration(format!(
                            "invalid value for {key}: {value:?}"
                        )));
                    }
                } else {
                    overrides.set_property(property, value)?;
                }
            } else if let Some(property) = key.strip_prefix(ABANDONED_PREFIX) {
                abandoned
                    .get_or_insert_with(AbandonedConfig::default)
                    .set_property(property, value)?;
            } else {
                match key.as_str() {
                    DATA_SOURCE_NAME => {}
                    DESCRIPTION => description = Some(value.clone()),
                    CONNECTION_SOURCE_NAME => {
                        identity.source = Some(SourceBinding::Named {
                            name: value.clone(),
                            naming: Arc::clone(&naming),
                        });
                    }
                    TRANSACTION_SHARING => {
                        identity.transaction_sharing = value.trim().parse().map_err(|_| {
                            PoolError::Configuration(format!(
                                "invalid value for {TRANSACTION_SHARING}: {value:?}"
                            ))
                        })?;
                    }
                    _ => {
                        return Err(PoolError::Configuration(format!(
                            "unknown reference property: {key}"
                        )));
                    }
                }
            }
        }
        if let Some(abandoned) = &abandoned {
            abandoned.validate()?;
        }
        identity.abandoned = abandoned;

        let config = per_user
            .into_iter()
            .fold(LayeredConfig::new(defaults), |config, (user, overrides)| {
                config.with_user(&user, overrides)
            });
        config.validate()?;

        tracing::debug!(data_source = %name, "data source restored from reference");
        Ok(DataSource::from_parts(name, description, identity, config))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use cpds_driver::{InMemoryNamingContext, IsolationLevel};
    use cpds_pool::MaxWait;
    use std::time::Duration;

    fn naming() -> Arc<dyn NamingContext> {
        Arc::new(InMemoryNamingContext::new())
    }

    fn reference(properties: &[(&str, &str)]) -> Reference {
        Reference {
            kind: REFERENCE_KIND.to_string(),
            schema_version: SCHEMA_VERSION,
            properties: properties
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_round_trip_preserves_configuration() {
        let ds = DataSource::builder("orders")
            .description("order database")
            .connection_source_name("jdbc/orders", naming())
            .abandoned(AbandonedConfig::new().timeout(Duration::from_secs(60)).log_abandoned(true))
            .defaults(
                PoolSettings::new()
                    .max_total(12)
                    .max_wait(MaxWait::Bounded(Duration::from_millis(750)))
                    .validation_query("SELECT 1")
                    .default_transaction_isolation(Some(IsolationLevel::Serializable)),
            )
            .per_user("reporting", UserOverrides::new().max_total(3).default_read_only(true))
            .per_user("alice", UserOverrides::new())
            .build()
            .unwrap();

        let json = ds.to_reference().to_json().unwrap();
        let restored = DataSource::from_reference(&Reference::from_json(&json).unwrap(), naming()).unwrap();

        assert_eq!(restored.name(), "orders");
        assert_eq!(restored.description().as_deref(), Some("order database"));
        assert_eq!(*restored.config(), *ds.config());
        assert_eq!(restored.to_reference(), ds.to_reference());
        assert_eq!(
            restored.to_reference().get("abandoned.timeoutMillis"),
            Some("60000")
        );

        // A user without any overrides still gets a sub-pool of its own.
        assert!(restored.config().has_user(Some("alice")));
        assert_eq!(restored.to_reference().get("user.alice.configured"), Some("true"));
    }

    #[test]
    fn test_user_names_with_dots() {
        let ds = DataSource::builder("ds")
            .per_user("first.last", UserOverrides::new().max_idle(2))
            .build()
            .unwrap();
        let reference = ds.to_reference();
        assert_eq!(reference.get("user.first.last.maxIdle"), Some("2"));

        let restored = DataSource::from_reference(&reference, naming()).unwrap();
        assert_eq!(
            restored.config().overrides("first.last").unwrap().max_idle,
            Some(2)
        );
    }

    #[test]
    fn test_attached_source_is_not_serialized() {
        let db = cpds_testing::MockDatabase::new();
        let ds = DataSource::builder("ds")
            .connection_source(cpds_testing::MockConnectionSource::new(&db))
            .build()
            .unwrap();
        assert_eq!(ds.to_reference().get(CONNECTION_SOURCE_NAME), None);
    }

    #[test]
    fn test_rejects_bad_references() {
        let mut wrong_version = reference(&[(DATA_SOURCE_NAME, "ds")]);
        wrong_version.schema_version = 2;
        let mut wrong_kind = reference(&[(DATA_SOURCE_NAME, "ds")]);
        wrong_kind.kind = "something.Else".into();

        let cases = [
            wrong_version,
            wrong_kind,
            reference(&[]),
            reference(&[(DATA_SOURCE_NAME, "ds"), ("default.maxTotal", "many")]),
            reference(&[(DATA_SOURCE_NAME, "ds"), ("default.bogus", "1")]),
            reference(&[(DATA_SOURCE_NAME, "ds"), ("user.maxTotal", "1")]),
            reference(&[(DATA_SOURCE_NAME, "ds"), ("user..maxTotal", "1")]),
            reference(&[(DATA_SOURCE_NAME, "ds"), ("user.alice.configured", "maybe")]),
            reference(&[(DATA_SOURCE_NAME, "ds"), ("abandoned.timeoutMillis", "-5")]),
            reference(&[(DATA_SOURCE_NAME, "ds"), (TRANSACTION_SHARING, "yes")]),
            reference(&[(DATA_SOURCE_NAME, "ds"), ("surprise", "1")]),
            reference(&[(DATA_SOURCE_NAME, "ds"), ("default.maxTotal", "0")]),
        ];
        for case in &cases {
            let err = DataSource::from_reference(case, naming()).unwrap_err();
            assert!(matches!(err, PoolError::Configuration(_)), "{case:?}: {err}");
        }
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            Reference::from_json("{not json").unwrap_err(),
            PoolError::Configuration(_)
        ));
    }
}
