//! Process-wide dial options for discovered instances.
//!
//! Options accumulate in a [`DialOptionSet`] during startup. The first
//! connection request freezes the set into an immutable [`DialOptions`]
//! snapshot; adding options afterwards fails with
//! [`DiscoveryError::OptionsFrozen`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use crate::error::{DiscoveryError, Result};

/// Default capacity of the balance channel fed by a resolver.
pub const DEFAULT_BALANCE_CAPACITY: usize = 1024;

/// A single client option applied to every endpoint built for an instance.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DialOption {
    /// Timeout for establishing a connection.
    ConnectTimeout(Duration),
    /// Timeout applied to each request.
    Timeout(Duration),
    /// Maximum in-flight requests per connection.
    ConcurrencyLimit(usize),
    /// At most `limit` requests per `period`.
    RateLimit {
        /// Requests allowed per period.
        limit: u64,
        /// Rate limiting period.
        period: Duration,
    },
    /// TCP keepalive interval, `None` to disable.
    TcpKeepalive(Option<Duration>),
    /// Whether to set `TCP_NODELAY`.
    TcpNodelay(bool),
    /// HTTP/2 keepalive ping interval.
    Http2KeepAliveInterval(Duration),
    /// How long to wait for an HTTP/2 keepalive acknowledgement.
    KeepAliveTimeout(Duration),
    /// User agent header sent with every request.
    UserAgent(String),
    /// Capacity of the balance channel used by resolvers.
    BalanceCapacity(usize),
    /// Create channels without dialing; connections are made on first use.
    Lazy,
}

/// Append-only option set that freezes on first use.
#[derive(Debug, Default)]
pub struct DialOptionSet {
    state: Mutex<SetState>,
}

#[derive(Debug, Default)]
struct SetState {
    options: Vec<DialOption>,
    frozen: Option<DialOptions>,
}

impl DialOptionSet {
    /// Creates an empty option set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an option.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::OptionsFrozen`] once [`freeze`](Self::freeze)
    /// has been called.
    pub fn push(&self, option: DialOption) -> Result<()> {
        let mut state = self.lock();
        if state.frozen.is_some() {
            return Err(DiscoveryError::OptionsFrozen);
        }

        state.options.push(option);
        Ok(())
    }

    /// Freezes the set, returning the snapshot every later call also returns.
    pub fn freeze(&self) -> DialOptions {
        let mut state = self.lock();
        let SetState { options, frozen } = &mut *state;

        frozen
            .get_or_insert_with(|| DialOptions::new(options.clone()))
            .clone()
    }

    /// Returns `true` once the set has been frozen.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.lock().frozen.is_some()
    }
}

/// Immutable, cheaply cloned set of dial options.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DialOptions {
    options: Arc<[DialOption]>,
}

impl DialOptions {
    /// Creates a snapshot from a list of options.
    #[must_use]
    pub fn new(options: Vec<DialOption>) -> Self {
        Self {
            options: options.into(),
        }
    }

    /// Returns the options in the order they were added.
    #[must_use]
    pub fn as_slice(&self) -> &[DialOption] {
        &self.options
    }

    /// Returns `true` if channels are created without dialing.
    #[must_use]
    pub fn is_lazy(&self) -> bool {
        self.options.iter().any(|o| matches!(o, DialOption::Lazy))
    }

    /// Returns the balance channel capacity; the last option added wins.
    #[must_use]
    pub fn balance_capacity(&self) -> usize {
        self.options
            .iter()
            .rev()
            .find_map(|o| match o {
                DialOption::BalanceCapacity(capacity) => Some((*capacity).max(1)),
                _ => None,
            })
            .unwrap_or(DEFAULT_BALANCE_CAPACITY)
    }

    /// Builds an endpoint for `addr`, defaulting to the `http` scheme.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidAddress`] if `addr` is not a valid URI
    /// authority or an option value is rejected.
    pub fn endpoint(&self, addr: &str) -> Result<Endpoint> {
        let invalid = |source| DiscoveryError::InvalidAddress {
            addr: addr.to_string(),
            source,
        };

        let uri = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };

        let mut endpoint = Endpoint::from_shared(uri).map_err(invalid)?;

        for option in self.options.iter() {
            endpoint = match option {
                DialOption::ConnectTimeout(timeout) => endpoint.connect_timeout(*timeout),
                DialOption::Timeout(timeout) => endpoint.timeout(*timeout),
                DialOption::ConcurrencyLimit(limit) => endpoint.concurrency_limit(*limit),
                DialOption::RateLimit { limit, period } => endpoint.rate_limit(*limit, *period),
                DialOption::TcpKeepalive(interval) => endpoint.tcp_keepalive(*interval),
                DialOption::TcpNodelay(enabled) => endpoint.tcp_nodelay(*enabled),
                DialOption::Http2KeepAliveInterval(interval) => {
                    endpoint.http2_keep_alive_interval(*interval)
                }
                DialOption::KeepAliveTimeout(timeout) => endpoint.keep_alive_timeout(*timeout),
                DialOption::UserAgent(agent) => {
                    endpoint.user_agent(agent.clone()).map_err(invalid)?
                }
                DialOption::BalanceCapacity(_) | DialOption::Lazy => endpoint,
            };
        }

        Ok(endpoint)
    }

    /// Creates a channel to `addr`, dialing eagerly unless [`DialOption::Lazy`] is set.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidAddress`] for unusable addresses and
    /// [`DiscoveryError::Connect`] if dialing fails.
    pub async fn connect(&self, addr: &str) -> Result<Channel> {
        let endpoint = self.endpoint(addr)?;

        if self.is_lazy() {
            return Ok(endpoint.connect_lazy());
        }

        endpoint
            .connect()
            .await
            .map_err(|source| DiscoveryError::Connect {
                addr: addr.to_string(),
                source,
            })
    }
}
