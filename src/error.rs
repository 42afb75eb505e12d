//! Error types shared by the registry, instancer and resolver.

use thiserror::Error;

use crate::store::LeaseId;

/// Errors reported by a coordination store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or the request failed in transit.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The lease is unknown to the store, usually because it already expired.
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    /// The store rejected the request as malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Invalid configuration, fatal at construction time.
    #[error("configuration error: {0}")]
    Config(String),

    /// A coordination store call failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A full read of the watched prefix found no instances at all.
    #[error("no instances registered under {0}")]
    NoInstances(String),

    /// No live instance is known for the requested service.
    #[error("service not found: {0}")]
    NotFound(String),

    /// A stored value or key could not be parsed as an instance record.
    #[error("invalid instance record: {0}")]
    InvalidRecord(String),

    /// The address could not be turned into a gRPC endpoint.
    #[error("invalid endpoint address {addr}: {source}")]
    InvalidAddress {
        /// The offending address.
        addr: String,
        /// Underlying transport error.
        #[source]
        source: tonic::transport::Error,
    },

    /// Dialing an instance failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// The address that could not be reached.
        addr: String,
        /// Underlying transport error.
        #[source]
        source: tonic::transport::Error,
    },

    /// Dial options were modified after the first connection was requested.
    #[error("dial options cannot change once connections have been requested")]
    OptionsFrozen,

    /// A resolver target could not be parsed or uses a foreign scheme.
    #[error("invalid resolver target: {0}")]
    InvalidTarget(String),

    /// The component has been stopped.
    #[error("discovery component stopped")]
    Stopped,
}

/// Result type for discovery operations.
pub type Result<T, E = DiscoveryError> = std::result::Result<T, E>;
