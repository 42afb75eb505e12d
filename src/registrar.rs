//! Registration lifecycle of the local process.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{DiscoveryError, Result};
use crate::record::InstanceRecord;
use crate::registry::RegistryClient;
use crate::store::{CoordinationStore, LeaseId};

/// Publishes this process's [`InstanceRecord`] under a lease.
#[derive(Debug)]
pub struct Registrar {
    client: RegistryClient,
    record: InstanceRecord,
    key: String,
    value: String,
    ttl: Duration,
}

impl Registrar {
    /// Creates a registrar for `record` under `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Config`] if the record has an empty name or
    /// address, or if `ttl` is zero.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        namespace: &str,
        record: InstanceRecord,
        ttl: Duration,
    ) -> Result<Self> {
        if record.name.is_empty() || record.address.is_empty() {
            return Err(DiscoveryError::Config(
                "service name and address must not be empty".to_string(),
            ));
        }

        if ttl.is_zero() {
            return Err(DiscoveryError::Config("lease TTL must be positive".to_string()));
        }

        let key = record.key(namespace);
        let value = record.encode()?;

        Ok(Self {
            client: RegistryClient::new(store),
            record,
            key,
            value,
            ttl,
        })
    }

    /// Publishes the record, replacing any earlier registration by this registrar.
    ///
    /// # Errors
    ///
    /// Returns the registry error; the process is then unregistered and
    /// callers should treat this as a startup failure.
    pub async fn register(&self) -> Result<LeaseId> {
        match self.client.register(&self.key, &self.value, self.ttl).await {
            Ok(lease) => {
                tracing::info!(
                    "registered {} at {} (lease {lease})",
                    self.record.name,
                    self.record.address
                );
                Ok(lease)
            }

            Err(e) => {
                tracing::error!("failed to register {}: {e}", self.key);
                Err(e)
            }
        }
    }

    /// Deletes the registration. Failures are logged; the lease TTL cleans up.
    pub async fn deregister(&self) {
        match self.client.deregister(&self.key).await {
            Ok(()) => tracing::info!("deregistered {}", self.key),
            Err(e) => tracing::warn!(
                "failed to deregister {}, leaving it to lease expiry: {e}",
                self.key
            ),
        }
    }

    /// Returns the registration key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the published record.
    #[must_use]
    pub fn record(&self) -> &InstanceRecord {
        &self.record
    }

    /// Returns the lease currently backing the registration.
    #[must_use]
    pub fn lease_id(&self) -> Option<LeaseId> {
        self.client.lease_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    const TTL: Duration = Duration::from_secs(10);

    fn registrar(store: &MemoryStore, address: &str) -> Result<Registrar> {
        Registrar::new(
            Arc::new(store.clone()),
            "/meet",
            InstanceRecord::new("svcA", address),
            TTL,
        )
    }

    #[test]
    fn rejects_empty_address_and_zero_ttl() {
        let store = MemoryStore::new();

        assert!(matches!(registrar(&store, ""), Err(DiscoveryError::Config(_))));
        assert!(matches!(
            Registrar::new(
                Arc::new(store),
                "/meet",
                InstanceRecord::new("svcA", "h:1"),
                Duration::ZERO
            ),
            Err(DiscoveryError::Config(_))
        ));
    }

    #[tokio::test]
    async fn register_publishes_encoded_record() {
        let store = MemoryStore::new();
        let registrar = registrar(&store, "10.0.0.1:9000").unwrap();

        registrar.register().await.unwrap();

        let value = store.value("/meet/svcA/10.0.0.1:9000").unwrap();
        assert_eq!(
            InstanceRecord::decode(&value).unwrap(),
            InstanceRecord::new("svcA", "10.0.0.1:9000")
        );
        assert!(registrar.lease_id().is_some());
    }

    #[tokio::test]
    async fn register_twice_never_duplicates() {
        let store = MemoryStore::new();
        let registrar = registrar(&store, "10.0.0.1:9000").unwrap();

        registrar.register().await.unwrap();
        registrar.register().await.unwrap();

        assert_eq!(store.get_prefix("/meet/").await.unwrap().len(), 1);
        assert_eq!(store.lease_count(), 1);
    }

    #[tokio::test]
    async fn register_failure_leaves_process_unregistered() {
        let store = MemoryStore::new();
        let registrar = registrar(&store, "10.0.0.1:9000").unwrap();

        store.set_unavailable(true);
        assert!(registrar.register().await.is_err());
        store.set_unavailable(false);

        assert!(registrar.lease_id().is_none());
        assert!(store.value(registrar.key()).is_none());
    }

    #[tokio::test]
    async fn deregister_is_best_effort() {
        let store = MemoryStore::new();
        let registrar = registrar(&store, "10.0.0.1:9000").unwrap();
        registrar.register().await.unwrap();

        store.set_unavailable(true);
        registrar.deregister().await;
        store.set_unavailable(false);

        // The delete failed but the lease was released, so the key expires.
        assert!(registrar.lease_id().is_none());
    }
}
