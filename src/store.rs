//! Capability interface over the coordination store.
//!
//! Discovery only needs a handful of primitives from an etcd-like store:
//! prefix reads, prefix watches, and lease-bound keys. Backends implement
//! [`CoordinationStore`]; a single backend instance is typically shared as an
//! `Arc<dyn CoordinationStore>` by every registrar, instancer and resolver in
//! the process.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::StoreError;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Stream of watch events. The stream ending means the watch was canceled.
pub type WatchStream = BoxStream<'static, StoreResult<StoreEvent>>;

/// Stream of keep-alive responses for one lease.
pub type KeepAliveStream = BoxStream<'static, StoreResult<KeepAliveResponse>>;

/// Opaque lease identifier issued by the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A key and its current value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    /// Full key.
    pub key: String,
    /// UTF-8 value.
    pub value: String,
}

impl KeyValue {
    /// Creates a key/value pair.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A change observed on a watched prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    /// A key was created or overwritten.
    Put(KeyValue),
    /// A key was deleted, explicitly or through lease expiry.
    Delete {
        /// The deleted key.
        key: String,
    },
}

impl StoreEvent {
    /// Returns the key the event refers to.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put(kv) => &kv.key,
            Self::Delete { key } => key,
        }
    }
}

/// A heartbeat acknowledged by the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepAliveResponse {
    /// The refreshed lease.
    pub lease: LeaseId,
    /// Remaining time to live after the refresh.
    pub ttl: Duration,
}

/// Primitives consumed from an etcd-like coordination store.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Returns every key under `prefix`, ordered by key.
    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>>;

    /// Watches every key under `prefix`.
    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream>;

    /// Grants a new lease with the given time to live.
    async fn grant(&self, ttl: Duration) -> StoreResult<LeaseId>;

    /// Starts refreshing `lease`, yielding one response per heartbeat.
    ///
    /// The store picks the refresh cadence. The stream ends when the store
    /// stops answering, after which the lease expires at its TTL.
    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream>;

    /// Revokes `lease`, deleting every key bound to it.
    async fn revoke(&self, lease: LeaseId) -> StoreResult<()>;

    /// Writes `key`, optionally bound to `lease`.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()>;

    /// Deletes `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StoreResult<()>;
}
