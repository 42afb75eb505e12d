//! Managed pool of ready connections for every service in a namespace.
//!
//! The [`Instancer`] performs a synchronous initial load, then keeps the pool
//! in sync from a background loop driven by watch events and a periodic
//! resync. Each refresh builds a new pool generation: connections to
//! surviving addresses are carried over, new addresses are dialed, and the
//! superseded connections are retired. Retired connections are released once
//! no caller holds them anymore, which closes the underlying channel.
//!
//! Readers never wait on a refresh: the pool lock is only taken to clone or
//! swap slices, never across a dial.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use crate::dial::DialOptions;
use crate::error::{DiscoveryError, Result};
use crate::membership::Membership;
use crate::record::namespace_prefix;
use crate::registry::RegistryClient;
use crate::store::{CoordinationStore, KeyValue};
use crate::watcher::{PrefixWatcher, Update};

/// Consecutive empty reads required before the pool is cleared.
const EMPTY_READS_BEFORE_CLEAR: u32 = 2;

/// An established connection to one service instance.
///
/// The channel closes when the last [`Conn`] referencing it, and every
/// clone of the channel taken from it, is dropped.
#[derive(Debug)]
pub struct Connection {
    service: String,
    address: String,
    generation: u64,
    channel: Channel,
}

impl Connection {
    /// Service name of the instance.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Address the connection was dialed to.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Pool generation that dialed this connection.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns a handle to the channel for building client stubs.
    #[must_use]
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        tracing::debug!(
            "closing connection to {} instance {} (generation {})",
            self.service,
            self.address,
            self.generation
        );
    }
}

/// Shared handle to a pooled connection.
pub type Conn = Arc<Connection>;

#[derive(Debug, Default)]
struct Pool {
    generation: u64,
    services: HashMap<String, Arc<[Conn]>>,
    retired: Vec<Conn>,
}

impl Pool {
    /// Releases retired connections the pool holds the last reference to.
    fn sweep(&mut self) {
        let before = self.retired.len();
        self.retired.retain(|conn| Arc::strong_count(conn) > 1);

        let closed = before - self.retired.len();
        if closed > 0 {
            tracing::debug!("released {closed} retired connections");
        }
    }

    fn retire_all(&mut self) {
        for (_, conns) in self.services.drain() {
            self.retired.extend(conns.iter().cloned());
        }
    }
}

#[derive(Debug)]
struct Shared {
    registry: RegistryClient,
    prefix: String,
    options: DialOptions,
    resync_interval: Duration,
    pool: RwLock<Pool>,
    stop: CancellationToken,
}

/// Connection pool for every service registered under a namespace.
#[derive(Debug)]
pub struct Instancer {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Instancer {
    /// Creates an uninitialized instancer watching `namespace`.
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        namespace: &str,
        options: DialOptions,
        resync_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: RegistryClient::new(store),
                prefix: namespace_prefix(namespace),
                options,
                resync_interval: resync_interval.max(Duration::from_millis(1)),
                pool: RwLock::new(Pool::default()),
                stop: CancellationToken::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Loads the initial pool and starts the background watch loop.
    ///
    /// Calling this again once serving is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::NoInstances`] if the namespace is empty,
    /// [`DiscoveryError::Stopped`] after [`stop`](Self::stop), or the store or
    /// connect error of the initial load.
    pub async fn initialize(&self) -> Result<()> {
        let mut task = self.task.lock().await;

        if self.shared.stop.is_cancelled() {
            return Err(DiscoveryError::Stopped);
        }

        if task.is_some() {
            return Ok(());
        }

        if self.shared.is_empty() {
            let entries = self.shared.registry.get(&self.shared.prefix).await?;
            if entries.is_empty() {
                return Err(DiscoveryError::NoInstances(self.shared.prefix.clone()));
            }

            self.shared.do_connect(&entries).await?;

            if self.shared.is_empty() {
                return Err(DiscoveryError::NoInstances(self.shared.prefix.clone()));
            }
        }

        *task = Some(tokio::spawn(run(Arc::clone(&self.shared))));
        tracing::info!("instancer serving {}", self.shared.prefix);

        Ok(())
    }

    /// Returns the pooled connections for `service`, in a stable order until the next refresh.
    ///
    /// Also releases retired connections no caller holds anymore.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::NotFound`] if no live instance is known.
    pub fn get_local_conns(&self, service: &str) -> Result<Vec<Conn>> {
        self.shared.try_sweep();

        self.shared
            .read_pool()
            .services
            .get(service)
            .filter(|conns| !conns.is_empty())
            .map(|conns| conns.to_vec())
            .ok_or_else(|| DiscoveryError::NotFound(service.to_string()))
    }

    /// Returns the names of services with at least one pooled connection.
    #[must_use]
    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.shared.read_pool().services.keys().cloned().collect();
        services.sort();
        services
    }

    /// Current pool generation; bumped by every applied refresh.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.read_pool().generation
    }

    /// Number of superseded connections still referenced by callers.
    #[must_use]
    pub fn retired_count(&self) -> usize {
        self.shared.read_pool().retired.len()
    }

    /// Prefix this instancer watches.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.shared.prefix
    }

    /// Stops the watch loop. The pool is left untouched and no longer changes.
    pub fn stop(&self) {
        self.shared.stop.cancel();
    }

    /// Stops the watch loop, waits for it to exit and releases every connection.
    ///
    /// Connections still held by callers close when the last holder drops them.
    pub async fn shutdown(&self) {
        self.stop();

        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!("instancer loop for {} failed: {e}", self.shared.prefix);
            }
        }

        let mut pool = self.shared.write_pool();
        pool.retire_all();
        pool.sweep();

        let held = pool.retired.len();
        if held > 0 {
            tracing::debug!(
                "{held} connections under {} still held by callers",
                self.shared.prefix
            );
            pool.retired.clear();
        }
    }
}

impl Drop for Instancer {
    fn drop(&mut self) {
        self.shared.stop.cancel();
    }
}

impl Shared {
    fn read_pool(&self) -> RwLockReadGuard<'_, Pool> {
        self.pool.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_pool(&self) -> RwLockWriteGuard<'_, Pool> {
        self.pool.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_empty(&self) -> bool {
        self.read_pool().services.is_empty()
    }

    /// Replaces the pool with connections for `entries`.
    ///
    /// An empty read is ignored. If any new address fails to connect, the
    /// previous pool stays in place untouched.
    async fn do_connect(&self, entries: &[KeyValue]) -> Result<()> {
        if entries.is_empty() {
            tracing::debug!("ignoring empty read of {}", self.prefix);
            return Ok(());
        }

        let membership = Membership::from_entries(entries);
        if membership.is_empty() {
            tracing::debug!("no parseable instances under {}, keeping pool", self.prefix);
            return Ok(());
        }

        let (generation, mut existing) = {
            let pool = self.read_pool();
            let existing: HashMap<(String, String), Conn> = pool
                .services
                .iter()
                .flat_map(|(service, conns)| {
                    conns
                        .iter()
                        .map(move |conn| {
                            ((service.clone(), conn.address.clone()), Arc::clone(conn))
                        })
                })
                .collect();

            (pool.generation + 1, existing)
        };

        let mut next = HashMap::new();
        let mut dialed = 0_usize;

        for (service, addresses) in membership.iter() {
            let mut conns = Vec::with_capacity(addresses.len());

            for address in addresses {
                if let Some(conn) = existing.remove(&(service.to_string(), address.clone())) {
                    conns.push(conn);
                    continue;
                }

                let channel = self.options.connect(address).await.inspect_err(|e| {
                    tracing::warn!("failed to connect to {service} instance {address}: {e}");
                })?;

                dialed += 1;
                conns.push(Arc::new(Connection {
                    service: service.to_string(),
                    address: address.clone(),
                    generation,
                    channel,
                }));
            }

            next.insert(service.to_string(), Arc::<[Conn]>::from(conns));
        }

        drop(existing);

        let mut pool = self.write_pool();
        if self.stop.is_cancelled() {
            return Err(DiscoveryError::Stopped);
        }

        let previous = std::mem::replace(&mut pool.services, next);
        pool.generation = generation;

        let mut retired = 0_usize;
        for conns in previous.into_values() {
            for conn in conns.iter() {
                let kept = pool
                    .services
                    .get(&conn.service)
                    .is_some_and(|live| live.iter().any(|c| Arc::ptr_eq(c, conn)));

                if !kept {
                    pool.retired.push(Arc::clone(conn));
                    retired += 1;
                }
            }
        }

        pool.sweep();

        tracing::debug!(
            "pool generation {generation} for {}: {} instances, {dialed} dialed, {retired} retired",
            self.prefix,
            membership.len()
        );

        Ok(())
    }

    fn clear(&self) {
        let mut pool = self.write_pool();
        if self.stop.is_cancelled() || pool.services.is_empty() {
            return;
        }

        pool.retire_all();
        pool.generation += 1;
        pool.sweep();

        tracing::info!("no instances left under {}, pool cleared", self.prefix);
    }

    /// Applies a full read of the prefix, tracking consecutive empty reads.
    async fn apply(&self, entries: &[KeyValue], empty_reads: &mut u32) {
        if entries.is_empty() {
            *empty_reads += 1;
            if *empty_reads >= EMPTY_READS_BEFORE_CLEAR {
                self.clear();
            } else {
                tracing::debug!("empty read of {}, keeping pool until confirmed", self.prefix);
            }
            return;
        }

        *empty_reads = 0;
        match self.do_connect(entries).await {
            Ok(()) | Err(DiscoveryError::Stopped) => {}
            Err(e) => {
                tracing::warn!("refresh of {} failed, keeping previous pool: {e}", self.prefix);
            }
        }
    }

    /// Releases retired connections without waiting on a writer.
    fn try_sweep(&self) {
        match self.pool.try_write() {
            Ok(mut pool) => pool.sweep(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().sweep(),
            Err(TryLockError::WouldBlock) => {}
        }
    }
}

/// Background loop: applies every snapshot and re-reads on every watch event.
async fn run(shared: Arc<Shared>) {
    let mut watcher = PrefixWatcher::new(
        Arc::clone(shared.registry.store()),
        shared.prefix.clone(),
        shared.resync_interval,
        shared.stop.clone(),
        None,
    );
    let mut empty_reads = 0;

    while let Some(update) = watcher.next().await {
        let entries = match update {
            Update::Snapshot(entries) => Some(entries),
            Update::Event(event) => {
                tracing::trace!("{} changed under {}", event.key(), watcher.prefix());
                watcher.read().await
            }
        };

        if let Some(entries) = entries {
            shared.apply(&entries, &mut empty_reads).await;
        }

        shared.write_pool().sweep();
    }

    tracing::debug!("instancer loop for {} exited", shared.prefix);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dial::DialOption;
    use crate::memory::MemoryStore;
    use crate::record::InstanceRecord;

    const NS: &str = "/meet";
    const RESYNC: Duration = Duration::from_secs(60);

    fn lazy() -> DialOptions {
        DialOptions::new(vec![DialOption::Lazy])
    }

    fn instancer(store: &MemoryStore) -> Instancer {
        Instancer::new(Arc::new(store.clone()), NS, lazy(), RESYNC)
    }

    fn entry(name: &str, address: &str) -> KeyValue {
        let record = InstanceRecord::new(name, address);
        KeyValue::new(record.key(NS), record.encode().unwrap())
    }

    async fn seed(store: &MemoryStore, name: &str, address: &str) {
        let kv = entry(name, address);
        store.put(&kv.key, &kv.value, None).await.unwrap();
    }

    fn addresses(instancer: &Instancer, service: &str) -> Vec<String> {
        instancer
            .get_local_conns(service)
            .map(|conns| conns.iter().map(|c| c.address().to_string()).collect())
            .unwrap_or_default()
    }

    async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn initialize_fails_without_instances() {
        let store = MemoryStore::new();
        let instancer = instancer(&store);

        let err = instancer.initialize().await.unwrap_err();

        assert!(matches!(err, DiscoveryError::NoInstances(ref prefix) if prefix == "/meet/"));
    }

    #[tokio::test]
    async fn initialize_fails_when_every_record_is_unparseable() {
        let store = MemoryStore::new();
        store.put("/meet/svcA/x", "garbage", None).await.unwrap();

        let err = instancer(&store).initialize().await.unwrap_err();

        assert!(matches!(err, DiscoveryError::NoInstances(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_loads_every_service() {
        let store = MemoryStore::new();
        seed(&store, "svcA", "10.0.0.1:9000").await;
        seed(&store, "svcA", "10.0.0.2:9000").await;
        seed(&store, "svcB", "10.0.0.3:9000").await;

        let instancer = instancer(&store);
        instancer.initialize().await.unwrap();

        assert_eq!(
            addresses(&instancer, "svcA"),
            ["10.0.0.1:9000", "10.0.0.2:9000"]
        );
        assert_eq!(addresses(&instancer, "svcB"), ["10.0.0.3:9000"]);
        assert_eq!(instancer.services(), ["svcA", "svcB"]);

        // Initializing again is a no-op.
        let generation = instancer.generation();
        instancer.initialize().await.unwrap();
        assert_eq!(instancer.generation(), generation);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_service_is_not_found() {
        let store = MemoryStore::new();
        seed(&store, "svcA", "10.0.0.1:9000").await;

        let instancer = instancer(&store);
        instancer.initialize().await.unwrap();

        assert!(matches!(
            instancer.get_local_conns("svcZ"),
            Err(DiscoveryError::NotFound(ref s)) if s == "svcZ"
        ));
    }

    #[tokio::test]
    async fn empty_entries_never_clear_pool() {
        let store = MemoryStore::new();
        let instancer = instancer(&store);

        instancer
            .shared
            .do_connect(&[entry("svcA", "10.0.0.1:9000")])
            .await
            .unwrap();
        let generation = instancer.generation();

        instancer.shared.do_connect(&[]).await.unwrap();

        assert_eq!(addresses(&instancer, "svcA"), ["10.0.0.1:9000"]);
        assert_eq!(instancer.generation(), generation);
    }

    #[tokio::test]
    async fn refresh_reuses_survivors_and_retires_superseded() {
        let store = MemoryStore::new();
        let instancer = instancer(&store);

        instancer
            .shared
            .do_connect(&[entry("svcA", "host1:1"), entry("svcA", "host2:1")])
            .await
            .unwrap();

        let held = instancer.get_local_conns("svcA").unwrap();
        let host1 = Arc::downgrade(&held[0]);

        instancer
            .shared
            .do_connect(&[entry("svcA", "host2:1"), entry("svcA", "host3:1")])
            .await
            .unwrap();

        let current = instancer.get_local_conns("svcA").unwrap();
        assert_eq!(addresses(&instancer, "svcA"), ["host2:1", "host3:1"]);
        assert!(Arc::ptr_eq(&current[0], &held[1]));
        assert_eq!(current[0].generation(), 1);
        assert_eq!(current[1].generation(), 2);

        // host1 is superseded but still referenced by `held`.
        assert_eq!(instancer.retired_count(), 1);
        assert!(host1.upgrade().is_some());

        drop(held);
        instancer.shared.write_pool().sweep();

        assert_eq!(instancer.retired_count(), 0);
        assert!(host1.upgrade().is_none());
    }

    #[tokio::test]
    async fn services_missing_from_full_read_are_dropped() {
        let store = MemoryStore::new();
        let instancer = instancer(&store);

        instancer
            .shared
            .do_connect(&[entry("svcA", "host1:1"), entry("svcB", "host2:1")])
            .await
            .unwrap();
        instancer
            .shared
            .do_connect(&[entry("svcB", "host2:1")])
            .await
            .unwrap();

        assert!(instancer.get_local_conns("svcA").is_err());
        assert_eq!(addresses(&instancer, "svcB"), ["host2:1"]);
        assert_eq!(instancer.retired_count(), 0);
    }

    #[tokio::test]
    async fn connect_failure_keeps_previous_pool() {
        let store = MemoryStore::new();
        let instancer = instancer(&store);

        instancer
            .shared
            .do_connect(&[entry("svcA", "host1:1")])
            .await
            .unwrap();
        let generation = instancer.generation();

        let err = instancer
            .shared
            .do_connect(&[entry("svcA", "host2:1"), entry("svcA", "bad address")])
            .await
            .unwrap_err();

        assert!(matches!(err, DiscoveryError::InvalidAddress { .. }));
        assert_eq!(addresses(&instancer, "svcA"), ["host1:1"]);
        assert_eq!(instancer.generation(), generation);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_events_refresh_pool() {
        let store = MemoryStore::new();
        seed(&store, "svcA", "10.0.0.1:9000").await;

        let instancer = instancer(&store);
        instancer.initialize().await.unwrap();
        seed(&store, "svcA", "10.0.0.2:9000").await;

        assert!(eventually(|| addresses(&instancer, "svcA").len() == 2).await);
    }

    #[tokio::test(start_paused = true)]
    async fn single_empty_read_is_not_trusted() {
        let store = MemoryStore::new();
        seed(&store, "svcA", "10.0.0.1:9000").await;

        let instancer = instancer(&store);
        instancer.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.delete("/meet/svcA/10.0.0.1:9000").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(addresses(&instancer, "svcA"), ["10.0.0.1:9000"]);

        // The periodic resync confirms the empty read.
        tokio::time::sleep(RESYNC).await;
        assert!(matches!(
            instancer.get_local_conns("svcA"),
            Err(DiscoveryError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn resync_catches_lost_delete() {
        let store = MemoryStore::new();
        seed(&store, "svcA", "10.0.0.1:9000").await;
        seed(&store, "svcA", "10.0.0.2:9000").await;

        let instancer = instancer(&store);
        instancer.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.mute_watches(true);
        store.delete("/meet/svcA/10.0.0.1:9000").await.unwrap();
        tokio::time::sleep(RESYNC + Duration::from_secs(1)).await;

        assert_eq!(addresses(&instancer, "svcA"), ["10.0.0.2:9000"]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_store_error_keeps_pool() {
        let store = MemoryStore::new();
        seed(&store, "svcA", "10.0.0.1:9000").await;

        let instancer = instancer(&store);
        instancer.initialize().await.unwrap();

        store.set_unavailable(true);
        tokio::time::sleep(RESYNC * 3).await;

        assert_eq!(addresses(&instancer, "svcA"), ["10.0.0.1:9000"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_freezes_pool() {
        let store = MemoryStore::new();
        seed(&store, "svcA", "10.0.0.1:9000").await;

        let instancer = instancer(&store);
        instancer.initialize().await.unwrap();
        instancer.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;

        seed(&store, "svcA", "10.0.0.2:9000").await;
        tokio::time::sleep(RESYNC * 2).await;

        assert_eq!(addresses(&instancer, "svcA"), ["10.0.0.1:9000"]);
        assert!(matches!(
            instancer.initialize().await,
            Err(DiscoveryError::Stopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn canceled_watch_is_reestablished() {
        let store = MemoryStore::new();
        seed(&store, "svcA", "10.0.0.1:9000").await;

        let instancer = instancer(&store);
        instancer.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.cancel_watches();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.watch_count(), 1);

        seed(&store, "svcA", "10.0.0.2:9000").await;

        assert!(eventually(|| addresses(&instancer, "svcA").len() == 2).await);
    }

    #[tokio::test(start_paused = true)]
    async fn canceled_watch_still_resyncs_lost_instances() {
        let store = MemoryStore::new();
        seed(&store, "svcA", "10.0.0.1:9000").await;
        seed(&store, "svcA", "10.0.0.2:9000").await;

        let instancer = instancer(&store);
        instancer.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The watch dies and the expiry event is lost with it.
        store.mute_watches(true);
        store.cancel_watches();
        store.delete("/meet/svcA/10.0.0.1:9000").await.unwrap();

        tokio::time::sleep(RESYNC + Duration::from_secs(1)).await;

        assert_eq!(addresses(&instancer, "svcA"), ["10.0.0.2:9000"]);
    }

    #[tokio::test]
    async fn lookups_release_unheld_retired_connections() {
        let store = MemoryStore::new();
        let instancer = instancer(&store);

        instancer
            .shared
            .do_connect(&[entry("svcA", "host1:1")])
            .await
            .unwrap();
        let held = instancer.get_local_conns("svcA").unwrap();
        let host1 = Arc::downgrade(&held[0]);

        instancer
            .shared
            .do_connect(&[entry("svcA", "host2:1")])
            .await
            .unwrap();
        assert_eq!(instancer.retired_count(), 1);

        drop(held);
        instancer.get_local_conns("svcA").unwrap();

        assert_eq!(instancer.retired_count(), 0);
        assert!(host1.upgrade().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_leaves_held_connections_to_their_holders() {
        let store = MemoryStore::new();
        seed(&store, "svcA", "10.0.0.1:9000").await;

        let instancer = instancer(&store);
        instancer.initialize().await.unwrap();

        let held = instancer.get_local_conns("svcA").unwrap();
        let conn = Arc::downgrade(&held[0]);
        instancer.shutdown().await;

        assert_eq!(instancer.retired_count(), 0);
        assert!(conn.upgrade().is_some());

        drop(held);
        assert!(conn.upgrade().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_connections() {
        let store = MemoryStore::new();
        seed(&store, "svcA", "10.0.0.1:9000").await;

        let instancer = instancer(&store);
        instancer.initialize().await.unwrap();

        let conn = Arc::downgrade(&instancer.get_local_conns("svcA").unwrap()[0]);
        instancer.shutdown().await;

        assert!(conn.upgrade().is_none());
        assert!(instancer.services().is_empty());
        assert_eq!(instancer.retired_count(), 0);
    }
}
