//! Native name resolution for tonic balance channels.
//!
//! A [`Resolver`] watches the instances of one service and sends
//! `Change::Insert` / `Change::Remove` messages into the sender of a
//! [`Channel::balance_channel`], so unmodified client stubs get the
//! channel's built-in load balancing across live instances.
//!
//! # How It Works
//!
//! 1. Watches `<namespace>/<service>/` and performs an initial full resync
//! 2. Applies put/delete events as they arrive
//! 3. Re-reads the whole prefix every resync interval, so missed events are
//!    repaired within one interval
//! 4. Publishes the resulting address list on a `watch` channel
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tonic_lb_etcd::{DialOptions, MemoryStore, ResolverBuilder};
//!
//! let store = Arc::new(MemoryStore::new());
//! let builder = ResolverBuilder::new(store, "/meet", DialOptions::default());
//! let (channel, resolver) = builder.build("etcd:///room-service").await?;
//!
//! let client = RoomServiceClient::new(channel);
//! ```

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Sender;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::channel::Change;
use tonic::transport::{Channel, Endpoint};

use crate::dial::DialOptions;
use crate::error::{DiscoveryError, Result};
use crate::membership::{Membership, MembershipChange};
use crate::record::service_prefix;
use crate::registry::RegistryClient;
use crate::store::{CoordinationStore, KeyValue};
use crate::watcher::{DEFAULT_RESYNC_INTERVAL, PrefixWatcher, Update};

/// Scheme resolvers answer to unless configured otherwise.
pub const DEFAULT_SCHEME: &str = "etcd";

/// A parsed resolver target such as `etcd:///room-service`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    scheme: String,
    authority: String,
    service: String,
}

impl Target {
    /// Target scheme.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Target authority, usually empty.
    #[must_use]
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Service name to resolve.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }
}

impl FromStr for Target {
    type Err = DiscoveryError;

    fn from_str(target: &str) -> Result<Self> {
        let invalid = || DiscoveryError::InvalidTarget(target.to_string());

        let (scheme, rest) = target.split_once("://").ok_or_else(invalid)?;
        let (authority, service) = rest.split_once('/').ok_or_else(invalid)?;
        let service = service.trim_end_matches('/');

        if scheme.is_empty() || service.is_empty() || service.contains('/') {
            return Err(invalid());
        }

        Ok(Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            service: service.to_string(),
        })
    }
}

/// Builds resolvers bound to one scheme and namespace.
#[derive(Clone)]
pub struct ResolverBuilder {
    scheme: String,
    store: Arc<dyn CoordinationStore>,
    namespace: String,
    options: DialOptions,
    resync_interval: Duration,
}

impl std::fmt::Debug for ResolverBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverBuilder")
            .field("scheme", &self.scheme)
            .field("namespace", &self.namespace)
            .field("options", &self.options)
            .field("resync_interval", &self.resync_interval)
            .finish_non_exhaustive()
    }
}

impl ResolverBuilder {
    /// Creates a builder for the [`DEFAULT_SCHEME`].
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        namespace: impl Into<String>,
        options: DialOptions,
    ) -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            store,
            namespace: namespace.into(),
            options,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        }
    }

    /// Binds the builder to another scheme.
    #[must_use]
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Sets the safety-net resync interval.
    #[must_use]
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Scheme this builder answers to.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Resolves `target` into a load-balanced channel.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidTarget`] for malformed targets or a
    /// foreign scheme, and the store error if the initial resync fails.
    pub async fn build(&self, target: &str) -> Result<(Channel, Resolver)> {
        let parsed: Target = target.parse()?;

        if parsed.scheme() != self.scheme {
            return Err(DiscoveryError::InvalidTarget(format!(
                "{target} does not use scheme {}",
                self.scheme
            )));
        }

        self.channel(parsed.service()).await
    }

    /// Creates a balance channel for `service` and the resolver feeding it.
    ///
    /// # Errors
    ///
    /// Returns the store error if the initial resync fails.
    pub async fn channel(&self, service: &str) -> Result<(Channel, Resolver)> {
        let (channel, tx) = Channel::balance_channel::<String>(self.options.balance_capacity());
        let resolver = self.build_for(service, tx).await?;
        Ok((channel, resolver))
    }

    /// Starts a resolver for `service` that feeds a caller-supplied sender.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidTarget`] for an empty service name and
    /// the store error if the watch or the initial resync fails.
    pub async fn build_for(
        &self,
        service: &str,
        tx: Sender<Change<String, Endpoint>>,
    ) -> Result<Resolver> {
        if service.is_empty() || service.contains('/') {
            return Err(DiscoveryError::InvalidTarget(service.to_string()));
        }

        let registry = RegistryClient::new(Arc::clone(&self.store));
        let prefix = service_prefix(&self.namespace, service);

        // Watch first so nothing between the read and the watch is missed.
        let events = registry.watch_events(&prefix).await?;
        let entries = registry.get(&prefix).await?;

        let (addresses, rx) = watch::channel(Vec::new());
        let cancel = CancellationToken::new();

        let watcher = PrefixWatcher::new(
            Arc::clone(&self.store),
            prefix,
            self.resync_interval,
            cancel.clone(),
            Some(events),
        );

        let task = ResolverTask {
            namespace: self.namespace.clone(),
            service: service.to_string(),
            options: self.options.clone(),
            membership: Membership::new(),
            tx,
            addresses,
            cancel: cancel.clone(),
        };

        // The initial changes are sent from the task: the balance channel
        // only drains its sender once requests flow.
        let handle = tokio::spawn(task.run(entries, watcher));

        Ok(Resolver {
            service: service.to_string(),
            addresses: rx,
            cancel,
            task: Some(handle),
        })
    }
}

/// Handle to a running resolver. Dropping it closes the resolver.
#[derive(Debug)]
pub struct Resolver {
    service: String,
    addresses: watch::Receiver<Vec<String>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Resolver {
    /// Service this resolver resolves.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current address list.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        self.addresses.borrow().clone()
    }

    /// Subscribes to full address-list updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.addresses.clone()
    }

    /// Stops delivering updates. The loop exits at its next scheduling point.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Closes the resolver and waits for its loop to exit.
    pub async fn shutdown(mut self) {
        self.close();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("resolver for {} failed: {e}", self.service);
            }
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ResolverTask {
    namespace: String,
    service: String,
    options: DialOptions,
    membership: Membership,
    tx: Sender<Change<String, Endpoint>>,
    addresses: watch::Sender<Vec<String>>,
    cancel: CancellationToken,
}

impl ResolverTask {
    async fn run(mut self, initial: Vec<KeyValue>, mut watcher: PrefixWatcher) {
        let mut running = self.reconcile(&initial).await;

        tracing::debug!(
            "resolver for {} started with {} addresses",
            watcher.prefix(),
            self.membership.addresses(&self.service).len()
        );

        while running {
            running = match watcher.next().await {
                Some(Update::Snapshot(entries)) => self.reconcile(&entries).await,
                Some(Update::Event(event)) => match self.membership.apply(&self.namespace, &event) {
                    Some(change) => self.publish(vec![change]).await,
                    None => true,
                },
                None => false,
            };
        }

        tracing::debug!("resolver for {} stopped", watcher.prefix());
    }

    /// Publishes the difference between a full read and the held view.
    async fn reconcile(&mut self, entries: &[KeyValue]) -> bool {
        let changes = self.membership.reconcile(&Membership::from_entries(entries));
        self.publish(changes).await
    }

    /// Sends changes to the balance channel, then the full address list.
    ///
    /// Returns `false` once the resolver is closed or the channel is gone.
    async fn publish(&mut self, changes: Vec<MembershipChange>) -> bool {
        let mut published = false;

        for change in changes {
            if self.cancel.is_cancelled() {
                return false;
            }

            let change = match change {
                MembershipChange::Added { service, .. } | MembershipChange::Removed { service, .. }
                    if service != self.service =>
                {
                    continue;
                }

                MembershipChange::Added { address, .. } => match self.options.endpoint(&address) {
                    Ok(endpoint) => Change::Insert(address, endpoint),
                    Err(e) => {
                        tracing::warn!("skipping {} instance {address}: {e}", self.service);
                        continue;
                    }
                },

                MembershipChange::Removed { address, .. } => Change::Remove(address),
            };

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return false,
                sent = self.tx.send(change) => {
                    if sent.is_err() {
                        tracing::warn!("channel closed, stopping resolver for {}", self.service);
                        return false;
                    }
                }
            }

            published = true;
        }

        if self.cancel.is_cancelled() {
            return false;
        }

        if published {
            let current = self.membership.addresses(&self.service).to_vec();
            tracing::debug!("resolver: {} addresses for {}", current.len(), self.service);
            self.addresses.send_replace(current);
        }

        true
    }
}
