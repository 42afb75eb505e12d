#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Service registration and discovery for [Tonic](https://docs.rs/tonic) gRPC clients,
//! backed by an etcd-style coordination store.
//!
//! Every process of the platform publishes itself under
//! `<namespace>/<service>/<address>`, bound to a lease it keeps alive in the
//! background. Clients find their peers in one of two ways:
//!
//! - **Managed pool**: an [`Instancer`] keeps one ready channel per live
//!   instance of every service in the namespace, so callers pick from a
//!   current list with [`Discovery::get_conns`].
//! - **Native resolution**: a [`Resolver`] feeds `Change` events into a
//!   `Channel::balance_channel`, so unmodified client stubs get tonic's
//!   built-in load balancing.
//!
//! Both paths watch the store and additionally resync on a fixed interval,
//! so a lost event is repaired within one interval instead of leaving a
//! stale view forever.
//!
//! # Features
//!
//! - **In-process store**: [`MemoryStore`] with real lease expiry on the
//!   `tokio` clock, for tests and local development
//! - **etcd store**: `EtcdStore` behind the `etcd` cargo feature
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use tonic_lb_etcd::{DialOption, Discovery, DiscoveryConfig, MemoryStore};
//!
//! let config = DiscoveryConfig::from_env()?;
//! let discovery = Discovery::new(config, Arc::new(MemoryStore::new()))?;
//! discovery.add_option(DialOption::ConnectTimeout(Duration::from_secs(5)))?;
//! discovery.start().await?;
//!
//! // Managed pool
//! let conns = discovery.get_conns("room-service").await?;
//! let client = RoomServiceClient::new(conns[0].channel());
//!
//! // Native resolution
//! let (channel, _resolver) = discovery.balanced_channel("room-service").await?;
//! let client = RoomServiceClient::new(channel);
//!
//! discovery.close().await;
//! ```

mod config;
mod dial;
mod discovery;
mod error;
#[cfg(feature = "etcd")]
mod etcd;
mod instancer;
mod membership;
mod memory;
mod record;
mod registrar;
mod registry;
mod resolver;
mod store;
mod watcher;

pub use config::{
    ConfigError, DEFAULT_ENDPOINT, DEFAULT_LEASE_TTL_SECS, DEFAULT_NAMESPACE, DiscoveryConfig,
};
pub use dial::{DEFAULT_BALANCE_CAPACITY, DialOption, DialOptionSet, DialOptions};
pub use discovery::Discovery;
pub use error::{DiscoveryError, Result, StoreError};
#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;
pub use instancer::{Conn, Connection, Instancer};
pub use membership::{Membership, MembershipChange};
pub use memory::MemoryStore;
pub use record::{InstanceRecord, namespace_prefix, normalize_namespace, service_prefix};
pub use registrar::Registrar;
pub use registry::{RegistryClient, WatchSignal};
pub use resolver::{DEFAULT_SCHEME, Resolver, ResolverBuilder, Target};
pub use store::{
    CoordinationStore, KeepAliveResponse, KeepAliveStream, KeyValue, LeaseId, StoreEvent,
    StoreResult, WatchStream,
};
pub use watcher::DEFAULT_RESYNC_INTERVAL;
