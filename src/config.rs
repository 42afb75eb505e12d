//! Discovery configuration.
//!
//! Configuration is built in code or loaded from environment variables.
//! The store password is redacted in Debug output.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{DiscoveryError, Result};
use crate::record::{InstanceRecord, normalize_namespace};
use crate::watcher::DEFAULT_RESYNC_INTERVAL;

/// Default coordination store endpoint.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";

/// Default namespace all registrations live under.
pub const DEFAULT_NAMESPACE: &str = "/services";

/// Default registration lease TTL in seconds.
pub const DEFAULT_LEASE_TTL_SECS: u64 = 10;

/// Error loading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// A variable is set but cannot be parsed.
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue {
        /// Variable name.
        name: String,
        /// Raw value.
        value: String,
    },
}

impl From<ConfigError> for DiscoveryError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

/// Configuration of one [`Discovery`](crate::Discovery) facade.
#[derive(Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Coordination store endpoints.
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Namespace prefix shared by every service of the platform.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Logical service name this process registers as.
    pub service_name: String,

    /// Address other processes dial to reach this one, e.g. `10.0.0.7:9000`.
    pub address: String,

    /// Optional metadata published with the record.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,

    /// Registration lease TTL.
    #[serde(
        rename = "lease_ttl_secs",
        with = "seconds",
        default = "default_lease_ttl"
    )]
    pub lease_ttl: Duration,

    /// Safety-net resync interval of watchers.
    #[serde(
        rename = "resync_interval_secs",
        with = "seconds",
        default = "default_resync_interval"
    )]
    pub resync_interval: Duration,

    /// Store user name.
    #[serde(default)]
    pub username: Option<String>,

    /// Store password. Never serialized.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl fmt::Debug for DiscoveryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryConfig")
            .field("endpoints", &self.endpoints)
            .field("namespace", &self.namespace)
            .field("service_name", &self.service_name)
            .field("address", &self.address)
            .field("metadata", &self.metadata)
            .field("lease_ttl", &self.lease_ttl)
            .field("resync_interval", &self.resync_interval)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl DiscoveryConfig {
    /// Creates a configuration with default store settings.
    #[must_use]
    pub fn new(service_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            endpoints: default_endpoints(),
            namespace: default_namespace(),
            service_name: service_name.into(),
            address: address.into(),
            metadata: BTreeMap::new(),
            lease_ttl: default_lease_ttl(),
            resync_interval: default_resync_interval(),
            username: None,
            password: None,
        }
    }

    /// Sets the namespace prefix.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Replaces the store endpoints.
    #[must_use]
    pub fn endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the registration lease TTL.
    #[must_use]
    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Sets the resync interval.
    #[must_use]
    pub fn resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Adds a metadata entry to the published record.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets store credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// See [`from_vars`](Self::from_vars).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Loads configuration from a variable map.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnvVar`] when `DISCOVERY_SERVICE_NAME`
    /// or `DISCOVERY_ADDRESS` is unset and [`ConfigError::InvalidValue`] for
    /// unparseable durations.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let required = |name: &str| {
            vars.get(name)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
        };

        let seconds = |name: &str, default: Duration| match vars.get(name) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::InvalidValue {
                    name: name.to_string(),
                    value: raw.clone(),
                }),
            None => Ok(default),
        };

        let mut config = Self::new(
            required("DISCOVERY_SERVICE_NAME")?,
            required("DISCOVERY_ADDRESS")?,
        );

        if let Some(endpoints) = vars.get("DISCOVERY_ENDPOINTS") {
            config.endpoints = endpoints
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(namespace) = vars.get("DISCOVERY_NAMESPACE") {
            config.namespace.clone_from(namespace);
        }

        config.lease_ttl = seconds("DISCOVERY_LEASE_TTL_SECS", config.lease_ttl)?;
        config.resync_interval = seconds("DISCOVERY_RESYNC_INTERVAL_SECS", config.resync_interval)?;
        config.username = vars.get("DISCOVERY_USERNAME").cloned();
        config.password = vars.get("DISCOVERY_PASSWORD").cloned();

        Ok(config)
    }

    /// Checks the configuration, failing fast on values that can never work.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(DiscoveryError::Config(msg.to_string()));

        if self.endpoints.is_empty() {
            return invalid("at least one store endpoint is required");
        }

        if self.service_name.is_empty() || self.service_name.contains('/') {
            return invalid("service name must be non-empty and must not contain '/'");
        }

        if self.address.is_empty() {
            return invalid("advertised address must not be empty");
        }

        if normalize_namespace(&self.namespace).is_empty() {
            return invalid("namespace must not be empty");
        }

        if self.lease_ttl.as_secs() == 0 {
            return invalid("lease TTL must be at least one second");
        }

        if self.resync_interval.is_zero() {
            return invalid("resync interval must be positive");
        }

        Ok(())
    }

    /// The record this process publishes.
    #[must_use]
    pub fn record(&self) -> InstanceRecord {
        self.metadata.iter().fold(
            InstanceRecord::new(&self.service_name, &self.address),
            |record, (k, v)| record.with_metadata(k, v),
        )
    }
}

fn default_endpoints() -> Vec<String> {
    vec![DEFAULT_ENDPOINT.to_string()]
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_lease_ttl() -> Duration {
    Duration::from_secs(DEFAULT_LEASE_TTL_SECS)
}

fn default_resync_interval() -> Duration {
    DEFAULT_RESYNC_INTERVAL
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
