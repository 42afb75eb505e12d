//! Instance records and the registration key layout.
//!
//! A running instance is published as `<namespace>/<name>/<address>` with a
//! JSON value `{"name": ..., "address": ..., "metadata": {...}}`. The
//! instance ID segment is the advertised address, so a delete event's key can
//! be parsed back into a record without the (already deleted) value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{DiscoveryError, Result};

/// A registered service instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Service name the instance belongs to.
    pub name: String,

    /// Advertised `host:port` (or full URI) clients dial.
    pub address: String,

    /// Free-form instance metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl InstanceRecord {
    /// Creates a record without metadata.
    #[must_use]
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns the registration key for this record under `namespace`.
    #[must_use]
    pub fn key(&self, namespace: &str) -> String {
        format!("{}{}", service_prefix(namespace, &self.name), self.address)
    }

    /// Serializes the record as a store value.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidRecord`] if serialization fails.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| DiscoveryError::InvalidRecord(e.to_string()))
    }

    /// Parses a store value.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidRecord`] if the value is not a record
    /// or carries an empty name or address.
    pub fn decode(value: &str) -> Result<Self> {
        let record: Self =
            serde_json::from_str(value).map_err(|e| DiscoveryError::InvalidRecord(e.to_string()))?;

        if record.name.is_empty() || record.address.is_empty() {
            return Err(DiscoveryError::InvalidRecord(format!(
                "empty name or address in {value}"
            )));
        }

        Ok(record)
    }

    /// Recovers a record (without metadata) from a registration key.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidRecord`] if `key` does not follow the
    /// `<namespace>/<name>/<address>` layout.
    pub fn from_key(namespace: &str, key: &str) -> Result<Self> {
        let rest = key
            .strip_prefix(&namespace_prefix(namespace))
            .ok_or_else(|| DiscoveryError::InvalidRecord(format!("{key} is outside {namespace}")))?;

        match rest.split_once('/') {
            Some((name, address)) if !name.is_empty() && !address.is_empty() => {
                Ok(Self::new(name, address))
            }
            _ => Err(DiscoveryError::InvalidRecord(format!("malformed key {key}"))),
        }
    }
}

/// Normalizes a namespace by stripping trailing slashes.
#[must_use]
pub fn normalize_namespace(namespace: &str) -> &str {
    namespace.trim_end_matches('/')
}

/// Returns the prefix covering every service in `namespace`.
#[must_use]
pub fn namespace_prefix(namespace: &str) -> String {
    format!("{}/", normalize_namespace(namespace))
}

/// Returns the prefix covering every instance of `name` in `namespace`.
#[must_use]
pub fn service_prefix(namespace: &str, name: &str) -> String {
    format!("{}/{name}/", normalize_namespace(namespace))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let record = InstanceRecord::new("svcA", "10.0.0.1:9000");

        assert_eq!(record.key("/meet"), "/meet/svcA/10.0.0.1:9000");
        assert_eq!(record.key("/meet/"), "/meet/svcA/10.0.0.1:9000");
    }

    #[test]
    fn prefixes_end_with_separator() {
        assert_eq!(namespace_prefix("/meet//"), "/meet/");
        assert_eq!(service_prefix("/meet", "svcA"), "/meet/svcA/");
    }

    #[test]
    fn encoded_value_is_stable_json() {
        let record = InstanceRecord::new("svcA", "10.0.0.1:9000");

        assert_eq!(
            record.encode().unwrap(),
            r#"{"name":"svcA","address":"10.0.0.1:9000"}"#
        );
    }

    #[test]
    fn metadata_survives_decode() {
        let record = InstanceRecord::new("svcA", "10.0.0.1:9000").with_metadata("zone", "b");
        let decoded = InstanceRecord::decode(&record.encode().unwrap()).unwrap();

        assert_eq!(decoded.metadata.get("zone").map(String::as_str), Some("b"));
    }

    #[test]
    fn decode_rejects_garbage_and_blank_fields() {
        assert!(InstanceRecord::decode("not json").is_err());
        assert!(InstanceRecord::decode(r#"{"name":"svcA","address":""}"#).is_err());
        assert!(InstanceRecord::decode(r#"{"name":"svcA"}"#).is_err());
    }

    #[test]
    fn from_key_recovers_name_and_address() {
        let record = InstanceRecord::from_key("/meet", "/meet/svcA/10.0.0.1:9000").unwrap();

        assert_eq!(record, InstanceRecord::new("svcA", "10.0.0.1:9000"));
    }

    #[test]
    fn from_key_rejects_foreign_or_short_keys() {
        assert!(InstanceRecord::from_key("/meet", "/other/svcA/10.0.0.1:9000").is_err());
        assert!(InstanceRecord::from_key("/meet", "/meet/svcA").is_err());
        assert!(InstanceRecord::from_key("/meet", "/meet/svcA/").is_err());
    }
}
