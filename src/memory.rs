//! In-process coordination store.
//!
//! [`MemoryStore`] implements [`CoordinationStore`] entirely in memory. Lease
//! expiry runs on `tokio::time`, so tests using a paused clock can
//! fast-forward through TTLs. It also exposes a few fault-injection switches
//! (unavailability, lost watch events, canceled watches, dead keep-alives)
//! used to exercise the failure paths of the discovery components.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::StoreError;
use crate::store::{
    CoordinationStore, KeepAliveResponse, KeepAliveStream, KeyValue, LeaseId, StoreEvent,
    StoreResult, WatchStream,
};

/// Shortest keep-alive period, regardless of TTL.
const MIN_KEEP_ALIVE_PERIOD: Duration = Duration::from_millis(10);

/// In-memory coordination store with real lease semantics.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    kv: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseState>,
    next_lease: i64,
    watchers: Vec<Watcher>,
    keep_alive_epoch: u64,
    unavailable: bool,
    muted: bool,
}

#[derive(Debug)]
struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseState {
    ttl: Duration,
    deadline: Instant,
}

#[derive(Debug)]
struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<StoreResult<StoreEvent>>,
}

impl Inner {
    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable {
            Err(StoreError::Unavailable("memory store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn notify(&mut self, event: &StoreEvent) {
        self.watchers.retain(|w| !w.tx.is_closed());

        if self.muted {
            return;
        }

        for watcher in &self.watchers {
            if event.key().starts_with(&watcher.prefix) {
                let _ = watcher.tx.send(Ok(event.clone()));
            }
        }
    }

    fn remove_key(&mut self, key: &str) -> bool {
        if self.kv.remove(key).is_some() {
            self.notify(&StoreEvent::Delete {
                key: key.to_string(),
            });
            true
        } else {
            false
        }
    }

    fn revoke(&mut self, lease: LeaseId) -> bool {
        if self.leases.remove(&lease).is_none() {
            return false;
        }

        let bound: Vec<String> = self
            .kv
            .iter()
            .filter(|(_, entry)| entry.lease == Some(lease))
            .map(|(key, _)| key.clone())
            .collect();

        for key in bound {
            self.remove_key(&key);
        }

        true
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Silently drops watch events while `muted` is set.
    pub fn mute_watches(&self, muted: bool) {
        self.lock().muted = muted;
    }

    /// Ends every open watch stream.
    pub fn cancel_watches(&self) {
        self.lock().watchers.clear();
    }

    /// Ends every open keep-alive stream, leaving leases to expire at their TTL.
    pub fn drop_keep_alives(&self) {
        self.lock().keep_alive_epoch += 1;
    }

    /// Returns the number of live leases.
    #[must_use]
    pub fn lease_count(&self) -> usize {
        self.lock().leases.len()
    }

    /// Returns the number of open watch streams.
    #[must_use]
    pub fn watch_count(&self) -> usize {
        let mut inner = self.lock();
        inner.watchers.retain(|w| !w.tx.is_closed());
        inner.watchers.len()
    }

    /// Returns the value stored under `key`, if any.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<String> {
        self.lock().kv.get(key).map(|entry| entry.value.clone())
    }

    /// Returns the lease `key` is bound to, if any.
    #[must_use]
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        self.lock().kv.get(key).and_then(|entry| entry.lease)
    }

    fn spawn_reaper(&self, lease: LeaseId) {
        let store = self.clone();

        tokio::spawn(async move {
            loop {
                let deadline = store.lock().leases.get(&lease).map(|state| state.deadline);
                let Some(deadline) = deadline else {
                    return;
                };

                tokio::time::sleep_until(deadline).await;

                let mut inner = store.lock();
                match inner.leases.get(&lease).map(|state| state.deadline) {
                    None => return,
                    Some(current) if current > Instant::now() => {}
                    Some(_) => {
                        tracing::debug!("memory store: lease {lease} expired");
                        inner.revoke(lease);
                        return;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let inner = self.lock();
        inner.check_available()?;

        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue::new(key.clone(), entry.value.clone()))
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream> {
        let mut inner = self.lock();
        inner.check_available()?;

        let (tx, rx) = mpsc::unbounded_channel();
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Ok(events.boxed())
    }

    async fn grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
        if ttl.is_zero() {
            return Err(StoreError::InvalidRequest("lease TTL must be positive".to_string()));
        }

        let lease = {
            let mut inner = self.lock();
            inner.check_available()?;
            inner.next_lease += 1;

            let lease = LeaseId(inner.next_lease);
            inner.leases.insert(
                lease,
                LeaseState {
                    ttl,
                    deadline: Instant::now() + ttl,
                },
            );

            lease
        };

        self.spawn_reaper(lease);
        Ok(lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream> {
        let (ttl, epoch) = {
            let inner = self.lock();
            inner.check_available()?;

            let state = inner
                .leases
                .get(&lease)
                .ok_or(StoreError::LeaseNotFound(lease))?;

            (state.ttl, inner.keep_alive_epoch)
        };

        let mut ticker = tokio::time::interval((ttl / 3).max(MIN_KEEP_ALIVE_PERIOD));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let store = self.clone();
        let responses = stream::unfold((store, ticker), move |(store, mut ticker)| async move {
            ticker.tick().await;

            let response = {
                let mut inner = store.lock();
                if inner.keep_alive_epoch != epoch || inner.unavailable {
                    return None;
                }

                let state = inner.leases.get_mut(&lease)?;
                state.deadline = Instant::now() + state.ttl;

                KeepAliveResponse {
                    lease,
                    ttl: state.ttl,
                }
            };

            Some((Ok(response), (store, ticker)))
        });

        Ok(responses.boxed())
    }

    async fn revoke(&self, lease: LeaseId) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.check_available()?;

        if inner.revoke(lease) {
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(lease))
        }
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.check_available()?;

        if let Some(lease) = lease {
            if !inner.leases.contains_key(&lease) {
                return Err(StoreError::LeaseNotFound(lease));
            }
        }

        inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease,
            },
        );

        inner.notify(&StoreEvent::Put(KeyValue::new(key, value)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.check_available()?;
        inner.remove_key(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_prefix_returns_sorted_matches_only() {
        let store = MemoryStore::new();
        store.put("/svc/b/2", "two", None).await.unwrap();
        store.put("/svc/a/1", "one", None).await.unwrap();
        store.put("/svcx/a/1", "other", None).await.unwrap();

        let entries = store.get_prefix("/svc/").await.unwrap();

        assert_eq!(
            entries,
            vec![KeyValue::new("/svc/a/1", "one"), KeyValue::new("/svc/b/2", "two")]
        );
    }

    #[tokio::test]
    async fn watch_delivers_matching_events() {
        let store = MemoryStore::new();
        let mut events = store.watch_prefix("/svc/").await.unwrap();

        store.put("/svc/a/1", "one", None).await.unwrap();
        store.put("/other/a/1", "ignored", None).await.unwrap();
        store.delete("/svc/a/1").await.unwrap();

        assert_eq!(
            events.next().await.unwrap().unwrap(),
            StoreEvent::Put(KeyValue::new("/svc/a/1", "one"))
        );
        assert_eq!(
            events.next().await.unwrap().unwrap(),
            StoreEvent::Delete {
                key: "/svc/a/1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn muted_watch_loses_events() {
        let store = MemoryStore::new();
        let mut events = store.watch_prefix("/svc/").await.unwrap();

        store.mute_watches(true);
        store.put("/svc/a/1", "lost", None).await.unwrap();
        store.mute_watches(false);
        store.put("/svc/a/2", "seen", None).await.unwrap();

        assert_eq!(
            events.next().await.unwrap().unwrap(),
            StoreEvent::Put(KeyValue::new("/svc/a/2", "seen"))
        );
    }

    #[tokio::test]
    async fn cancel_watches_ends_streams() {
        let store = MemoryStore::new();
        let mut events = store.watch_prefix("/svc/").await.unwrap();

        store.cancel_watches();

        assert!(events.next().await.is_none());
        assert_eq!(store.watch_count(), 0);
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let store = MemoryStore::new();
        let err = store.grant(Duration::ZERO).await.unwrap_err();

        assert!(matches!(err, StoreError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn put_with_unknown_lease_fails() {
        let store = MemoryStore::new();
        let err = store.put("/k", "v", Some(LeaseId(42))).await.unwrap_err();

        assert!(matches!(err, StoreError::LeaseNotFound(LeaseId(42))));
        assert!(store.value("/k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expiry_deletes_bound_keys() {
        let store = MemoryStore::new();
        let mut events = store.watch_prefix("/svc/").await.unwrap();

        let lease = store.grant(Duration::from_secs(10)).await.unwrap();
        store.put("/svc/a/1", "one", Some(lease)).await.unwrap();
        events.next().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(store.value("/svc/a/1").is_none());
        assert_eq!(store.lease_count(), 0);
        assert_eq!(
            events.next().await.unwrap().unwrap(),
            StoreEvent::Delete {
                key: "/svc/a/1".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_extends_lease() {
        let store = MemoryStore::new();
        let lease = store.grant(Duration::from_secs(3)).await.unwrap();
        store.put("/svc/a/1", "one", Some(lease)).await.unwrap();

        let mut responses = store.keep_alive(lease).await.unwrap();
        let driver = tokio::spawn(async move { while responses.next().await.is_some() {} });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.value("/svc/a/1").as_deref(), Some("one"));

        store.drop_keep_alives();
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert!(store.value("/svc/a/1").is_none());
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn revoke_deletes_only_bound_keys() {
        let store = MemoryStore::new();
        let lease = store.grant(Duration::from_secs(60)).await.unwrap();
        store.put("/svc/a/1", "leased", Some(lease)).await.unwrap();
        store.put("/svc/a/2", "static", None).await.unwrap();

        store.revoke(lease).await.unwrap();

        assert!(store.value("/svc/a/1").is_none());
        assert_eq!(store.value("/svc/a/2").as_deref(), Some("static"));
        assert!(matches!(
            store.revoke(lease).await.unwrap_err(),
            StoreError::LeaseNotFound(_)
        ));
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        assert!(store.get_prefix("/").await.is_err());
        assert!(store.watch_prefix("/").await.is_err());
        assert!(store.put("/k", "v", None).await.is_err());

        store.set_unavailable(false);
        assert!(store.get_prefix("/").await.unwrap().is_empty());
    }
}
