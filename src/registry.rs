//! Registry client: the capability wrapper every discovery component talks to.
//!
//! A [`RegistryClient`] wraps a shared [`CoordinationStore`] and owns at most
//! one lease. The store handle may be shared by many clients in a process;
//! leases and watches never are.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{DiscoveryError, Result};
use crate::store::{CoordinationStore, KeepAliveStream, KeyValue, LeaseId, WatchStream};

/// Coarse signal derived from a prefix watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchSignal {
    /// Sent once as soon as the watch is established.
    Initial,
    /// Something under the prefix changed.
    Changed,
    /// The watch stream failed; the subscriber should re-watch.
    Interrupted(String),
    /// The store canceled the watch. Always the last signal.
    Canceled,
}

/// Lease held by a registry client, kept alive until dropped.
struct ActiveLease {
    id: LeaseId,
    _keep_alive: DropGuard,
}

/// Wrapper over the coordination store owning one registration lease.
pub struct RegistryClient {
    store: Arc<dyn CoordinationStore>,
    lease: Mutex<Option<ActiveLease>>,
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("lease", &self.lease_id())
            .finish_non_exhaustive()
    }
}

impl RegistryClient {
    /// Creates a client over a shared store handle.
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            lease: Mutex::new(None),
        }
    }

    fn lock_lease(&self) -> MutexGuard<'_, Option<ActiveLease>> {
        self.lease.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the shared store handle.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Reads every entry under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Store`] if the read fails. No retry is attempted.
    pub async fn get(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        Ok(self.store.get_prefix(prefix).await?)
    }

    /// Watches `prefix`, returning the raw event stream.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Store`] if the watch cannot be established.
    pub async fn watch_events(&self, prefix: &str) -> Result<WatchStream> {
        Ok(self.store.watch_prefix(prefix).await?)
    }

    /// Watches `prefix`, collapsing events into [`WatchSignal`]s.
    ///
    /// The first signal is always [`WatchSignal::Initial`], so subscribers
    /// resynchronize once right after subscribing. The stream ends after
    /// [`WatchSignal::Interrupted`] or [`WatchSignal::Canceled`].
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Store`] if the watch cannot be established.
    pub async fn watch_prefix(&self, prefix: &str) -> Result<BoxStream<'static, WatchSignal>> {
        let events = self.watch_events(prefix).await?;

        let signals = events
            .map(|event| match event {
                Ok(_) => WatchSignal::Changed,
                Err(e) => WatchSignal::Interrupted(e.to_string()),
            })
            .chain(stream::once(async { WatchSignal::Canceled }))
            .scan(false, |done, signal| {
                if *done {
                    return futures::future::ready(None);
                }

                *done = !matches!(signal, WatchSignal::Changed);
                futures::future::ready(Some(signal))
            });

        Ok(stream::once(async { WatchSignal::Initial })
            .chain(signals)
            .boxed())
    }

    /// Publishes `value` under `key`, bound to a fresh lease kept alive in the background.
    ///
    /// Registering again replaces the previous registration: the key is
    /// rebound to a new lease and the old lease is revoked.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Config`] for an empty key or value or a zero
    /// TTL, and [`DiscoveryError::Store`] if the store rejects the lease or write.
    pub async fn register(&self, key: &str, value: &str, ttl: Duration) -> Result<LeaseId> {
        if key.is_empty() || value.is_empty() {
            return Err(DiscoveryError::Config(
                "registration key and value must not be empty".to_string(),
            ));
        }

        if ttl.is_zero() {
            return Err(DiscoveryError::Config("lease TTL must be positive".to_string()));
        }

        let lease = self.store.grant(ttl).await?;

        let responses = match self.publish(key, value, lease).await {
            Ok(responses) => responses,
            Err(e) => {
                if let Err(revoke_err) = self.store.revoke(lease).await {
                    tracing::debug!("failed to revoke unused lease {lease}: {revoke_err}");
                }
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        tokio::spawn(keep_alive_loop(responses, lease, cancel.clone()));

        let previous = self.lock_lease().replace(ActiveLease {
            id: lease,
            _keep_alive: cancel.drop_guard(),
        });

        if let Some(previous) = previous {
            let old = previous.id;
            drop(previous);

            if let Err(e) = self.store.revoke(old).await {
                tracing::debug!("failed to revoke superseded lease {old}: {e}");
            }
        }

        tracing::debug!("registered {key} under lease {lease} (ttl {ttl:?})");
        Ok(lease)
    }

    async fn publish(&self, key: &str, value: &str, lease: LeaseId) -> Result<KeepAliveStream> {
        self.store.put(key, value, Some(lease)).await?;
        Ok(self.store.keep_alive(lease).await?)
    }

    /// Deletes `key` and releases the lease held by this client, if any.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Store`] if the delete fails. The lease is
    /// released either way, so the key still disappears at its TTL.
    pub async fn deregister(&self, key: &str) -> Result<()> {
        let released = self.lock_lease().take();
        let deleted = self.store.delete(key).await;

        if let Some(lease) = released {
            let id = lease.id;
            drop(lease);

            if let Err(e) = self.store.revoke(id).await {
                tracing::debug!("failed to revoke lease {id}: {e}");
            }
        }

        Ok(deleted?)
    }

    /// Returns the lease currently held by this client.
    #[must_use]
    pub fn lease_id(&self) -> Option<LeaseId> {
        self.lock_lease().as_ref().map(|lease| lease.id)
    }
}

/// Drains keep-alive responses until the stream closes or the lease is released.
async fn keep_alive_loop(
    mut responses: KeepAliveStream,
    lease: LeaseId,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("stopping keep-alive for lease {lease}");
                return;
            }

            next = responses.next() => match next {
                Some(Ok(response)) => {
                    tracing::trace!("lease {} refreshed, ttl {:?}", response.lease, response.ttl);
                }

                Some(Err(e)) => {
                    tracing::debug!("keep-alive for lease {lease} failed: {e}");
                    return;
                }

                None => {
                    tracing::debug!("keep-alive stream for lease {lease} closed");
                    return;
                }
            },
        }
    }
}
