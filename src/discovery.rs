//! Per-process discovery facade.
//!
//! A [`Discovery`] composes a [`Registrar`] for this process with a lazily
//! started [`Instancer`] for every service in the namespace, and hands out
//! [`ResolverBuilder`]s that share its dial options. Create one per process
//! and pass it by reference through the bootstrap path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::OnceCell;
use tonic::transport::Channel;

use crate::config::DiscoveryConfig;
use crate::dial::{DialOption, DialOptionSet};
use crate::error::{DiscoveryError, Result};
use crate::instancer::{Conn, Instancer};
use crate::registrar::Registrar;
use crate::resolver::{Resolver, ResolverBuilder};
use crate::store::{CoordinationStore, LeaseId};

/// Registration and discovery for one process.
pub struct Discovery {
    config: DiscoveryConfig,
    store: Arc<dyn CoordinationStore>,
    registrar: Registrar,
    options: DialOptionSet,
    instancer: OnceCell<Instancer>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("config", &self.config)
            .field("registrar", &self.registrar)
            .field("options", &self.options)
            .field("started", &self.instancer.initialized())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Discovery {
    /// Creates a facade over `store`. Nothing is registered or watched yet.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Config`] if the configuration is invalid.
    pub fn new(config: DiscoveryConfig, store: Arc<dyn CoordinationStore>) -> Result<Self> {
        config.validate()?;

        let registrar = Registrar::new(
            Arc::clone(&store),
            &config.namespace,
            config.record(),
            config.lease_ttl,
        )?;

        Ok(Self {
            config,
            store,
            registrar,
            options: DialOptionSet::new(),
            instancer: OnceCell::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Returns the registrar publishing this process.
    #[must_use]
    pub fn registrar(&self) -> &Registrar {
        &self.registrar
    }

    /// Publishes the configured address under a fresh lease.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Stopped`] after [`close`](Self::close), or the
    /// registry error. A failed registration is a startup failure.
    pub async fn register(&self) -> Result<LeaseId> {
        self.ensure_open()?;
        self.registrar.register().await
    }

    /// Deletes the registration. Best effort: failures are logged.
    pub async fn unregister(&self) {
        self.registrar.deregister().await;
    }

    /// Appends a dial option used for every connection made afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::OptionsFrozen`] once connections have been requested.
    pub fn add_option(&self, option: DialOption) -> Result<()> {
        self.options.push(option)
    }

    /// Registers this process and loads the connection pool.
    ///
    /// # Errors
    ///
    /// Returns the registration error, or the initial load error of the pool.
    pub async fn start(&self) -> Result<()> {
        self.register().await?;
        self.instancer().await.map(|_| ())
    }

    async fn instancer(&self) -> Result<&Instancer> {
        self.ensure_open()?;

        let instancer = self
            .instancer
            .get_or_try_init(|| async {
                let instancer = Instancer::new(
                    Arc::clone(&self.store),
                    &self.config.namespace,
                    self.options.freeze(),
                    self.config.resync_interval,
                );

                instancer.initialize().await?;
                Ok::<_, DiscoveryError>(instancer)
            })
            .await?;

        // A close that ran during the initial load found no pool to release.
        if self.closed.load(Ordering::Acquire) {
            instancer.shutdown().await;
            return Err(DiscoveryError::Stopped);
        }

        Ok(instancer)
    }

    /// Returns ready connections to every live instance of `service`.
    ///
    /// The pool is loaded on the first call, which also freezes dial options.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::NotFound`] if no instance of `service` is
    /// live, [`DiscoveryError::Stopped`] after [`close`](Self::close), or the
    /// store or connect error of the initial load.
    pub async fn get_conns(&self, service: &str) -> Result<Vec<Conn>> {
        let instancer = match self.instancer().await {
            Ok(instancer) => instancer,
            Err(DiscoveryError::NoInstances(_)) => {
                return Err(DiscoveryError::NotFound(service.to_string()));
            }
            Err(e) => return Err(e),
        };

        instancer.get_local_conns(service)
    }

    /// Returns a resolver builder sharing this facade's store, namespace and dial options.
    ///
    /// Freezes dial options.
    #[must_use]
    pub fn resolver(&self) -> ResolverBuilder {
        ResolverBuilder::new(
            Arc::clone(&self.store),
            self.config.namespace.clone(),
            self.options.freeze(),
        )
        .with_resync_interval(self.config.resync_interval)
    }

    /// Creates a load-balanced channel across the live instances of `service`.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Stopped`] after [`close`](Self::close), or the
    /// resolver's initial resync error.
    pub async fn balanced_channel(&self, service: &str) -> Result<(Channel, Resolver)> {
        self.ensure_open()?;
        self.resolver().channel(service).await
    }

    /// Deregisters this process and releases every pooled connection.
    ///
    /// Resolvers handed out earlier are closed by their own handles.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.unregister().await;

        if let Some(instancer) = self.instancer.get() {
            instancer.shutdown().await;
        }

        tracing::info!("discovery for {} closed", self.config.service_name);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DiscoveryError::Stopped);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::{KeepAliveStream, KeyValue, StoreResult, WatchStream};

    fn discovery(store: &MemoryStore, service: &str, address: &str) -> Discovery {
        let config = DiscoveryConfig::new(service, address).namespace("/meet");
        let discovery = Discovery::new(config, Arc::new(store.clone())).unwrap();
        discovery.add_option(DialOption::Lazy).unwrap();
        discovery
    }

    #[test]
    fn rejects_invalid_config() {
        let store = MemoryStore::new();
        let config = DiscoveryConfig::new("svcA", "h:1").lease_ttl(Duration::ZERO);

        assert!(matches!(
            Discovery::new(config, Arc::new(store)),
            Err(DiscoveryError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn start_registers_and_serves_itself() {
        let store = MemoryStore::new();
        let discovery = discovery(&store, "svcA", "10.0.0.1:9000");

        discovery.start().await.unwrap();

        let conns = discovery.get_conns("svcA").await.unwrap();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].address(), "10.0.0.1:9000");
    }

    #[tokio::test(start_paused = true)]
    async fn get_conns_on_empty_namespace_is_not_found() {
        let store = MemoryStore::new();
        let discovery = discovery(&store, "svcA", "10.0.0.1:9000");

        let err = discovery.get_conns("svcB").await.unwrap_err();

        assert!(matches!(err, DiscoveryError::NotFound(ref s) if s == "svcB"));
    }

    #[tokio::test(start_paused = true)]
    async fn options_freeze_on_first_get_conns() {
        let store = MemoryStore::new();
        let peer = discovery(&store, "svcB", "10.0.0.2:9000");
        peer.register().await.unwrap();

        let discovery = discovery(&store, "svcA", "10.0.0.1:9000");
        discovery.get_conns("svcB").await.unwrap();

        assert!(matches!(
            discovery.add_option(DialOption::TcpNodelay(true)),
            Err(DiscoveryError::OptionsFrozen)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn close_deregisters_and_stops() {
        let store = MemoryStore::new();
        let discovery = discovery(&store, "svcA", "10.0.0.1:9000");
        discovery.start().await.unwrap();

        discovery.close().await;

        assert!(store.value("/meet/svcA/10.0.0.1:9000").is_none());
        assert_eq!(store.lease_count(), 0);
        assert!(matches!(
            discovery.get_conns("svcA").await,
            Err(DiscoveryError::Stopped)
        ));
        assert!(matches!(discovery.register().await, Err(DiscoveryError::Stopped)));

        // Closing twice is harmless.
        discovery.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn balanced_channel_resolves_registered_peers() {
        let store = MemoryStore::new();
        let peer = discovery(&store, "svcB", "10.0.0.2:9000");
        peer.register().await.unwrap();

        let discovery = discovery(&store, "svcA", "10.0.0.1:9000");
        let (_channel, resolver) = discovery.balanced_channel("svcB").await.unwrap();

        let mut updates = resolver.subscribe();
        updates.wait_for(|a| !a.is_empty()).await.unwrap();
        assert_eq!(resolver.addresses(), ["10.0.0.2:9000"]);
        assert!(matches!(
            discovery.add_option(DialOption::Lazy),
            Err(DiscoveryError::OptionsFrozen)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn balanced_channel_returns_when_peers_exceed_capacity() {
        let store = MemoryStore::new();
        let mut peers = Vec::new();
        for address in ["10.0.0.2:9000", "10.0.0.3:9000", "10.0.0.4:9000"] {
            let peer = discovery(&store, "svcB", address);
            peer.register().await.unwrap();
            peers.push(peer);
        }

        let discovery = discovery(&store, "svcA", "10.0.0.1:9000");
        discovery.add_option(DialOption::BalanceCapacity(1)).unwrap();

        let built = tokio::time::timeout(
            Duration::from_secs(5),
            discovery.balanced_channel("svcB"),
        )
        .await;

        assert!(matches!(built, Ok(Ok(_))));
    }

    /// Delays every prefix read so a close can land mid-load.
    struct SlowReads(MemoryStore);

    #[async_trait::async_trait]
    impl CoordinationStore for SlowReads {
        async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.0.get_prefix(prefix).await
        }

        async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream> {
            self.0.watch_prefix(prefix).await
        }

        async fn grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
            self.0.grant(ttl).await
        }

        async fn keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream> {
            self.0.keep_alive(lease).await
        }

        async fn revoke(&self, lease: LeaseId) -> StoreResult<()> {
            self.0.revoke(lease).await
        }

        async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()> {
            self.0.put(key, value, lease).await
        }

        async fn delete(&self, key: &str) -> StoreResult<()> {
            self.0.delete(key).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_initial_load_releases_pool() {
        let store = MemoryStore::new();
        let peer = discovery(&store, "svcB", "10.0.0.2:9000");
        peer.register().await.unwrap();

        let config = DiscoveryConfig::new("svcA", "10.0.0.1:9000").namespace("/meet");
        let discovery = Discovery::new(config, Arc::new(SlowReads(store.clone()))).unwrap();
        discovery.add_option(DialOption::Lazy).unwrap();

        let (conns, ()) = tokio::join!(discovery.get_conns("svcB"), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            discovery.close().await;
        });

        assert!(matches!(conns, Err(DiscoveryError::Stopped)));

        let instancer = discovery.instancer.get().unwrap();
        assert!(instancer.services().is_empty());
        assert_eq!(instancer.retired_count(), 0);
        assert_eq!(store.watch_count(), 0);
    }
}
