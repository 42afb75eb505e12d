//! Coordination store backed by an etcd v3 cluster.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, DeleteOptions, EventType, GetOptions, PutOptions, WatchOptions,
};
use futures::stream::{self, StreamExt};
use tokio::time::MissedTickBehavior;

use crate::config::DiscoveryConfig;
use crate::error::StoreError;
use crate::store::{
    CoordinationStore, KeepAliveResponse, KeepAliveStream, KeyValue, LeaseId, StoreEvent,
    StoreResult, WatchStream,
};

/// [`CoordinationStore`] talking to etcd through `etcd-client`.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    ttls: Arc<Mutex<HashMap<LeaseId, Duration>>>,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore").finish_non_exhaustive()
    }
}

impl EtcdStore {
    /// Connects to the endpoints of `config`, authenticating if credentials are set.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRequest`] without endpoints and
    /// [`StoreError::Unavailable`] if the cluster cannot be reached.
    pub async fn connect(config: &DiscoveryConfig) -> StoreResult<Self> {
        if config.endpoints.is_empty() {
            return Err(StoreError::InvalidRequest("no etcd endpoints configured".to_string()));
        }

        let options = match (&config.username, &config.password) {
            (Some(user), Some(password)) => {
                Some(ConnectOptions::new().with_user(user.clone(), password.clone()))
            }
            _ => None,
        };

        let client = Client::connect(&config.endpoints, options)
            .await
            .map_err(unavailable)?;

        tracing::info!("connected to etcd at {}", config.endpoints.join(","));
        Ok(Self::from_client(client))
    }

    /// Wraps an already connected client.
    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            ttls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_ttls(&self) -> MutexGuard<'_, HashMap<LeaseId, Duration>> {
        self.ttls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn unavailable(e: etcd_client::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// etcd answers requests on an unknown or expired lease with `NotFound`.
fn lease_error(lease: LeaseId, e: etcd_client::Error) -> StoreError {
    match e {
        etcd_client::Error::GRpcStatus(ref status) if is_not_found(i32::from(status.code())) => {
            StoreError::LeaseNotFound(lease)
        }
        e => unavailable(e),
    }
}

// Compared as raw codes: etcd-client may link another tonic release.
fn is_not_found(code: i32) -> bool {
    code == i32::from(tonic::Code::NotFound)
}

fn convert(event: &etcd_client::Event) -> Option<StoreEvent> {
    let kv = event.kv()?;
    let key = kv.key_str().ok()?.to_string();

    match event.event_type() {
        EventType::Put => Some(StoreEvent::Put(KeyValue::new(key, kv.value_str().ok()?))),
        EventType::Delete => Some(StoreEvent::Delete { key }),
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let mut client = self.client.clone();
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;

        response
            .kvs()
            .iter()
            .map(|kv| {
                let key = kv.key_str().map_err(unavailable)?;
                let value = kv.value_str().map_err(unavailable)?;
                Ok(KeyValue::new(key, value))
            })
            .collect()
    }

    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream> {
        let mut client = self.client.clone();
        let (watcher, responses) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;

        let events = responses
            .take_while(|response| {
                futures::future::ready(!matches!(response, Ok(r) if r.canceled()))
            })
            .flat_map(move |response| {
                // The watch is canceled when the watcher is dropped.
                let _watcher = &watcher;

                let items: Vec<StoreResult<StoreEvent>> = match response {
                    Ok(response) => response.events().iter().filter_map(convert).map(Ok).collect(),
                    Err(e) => vec![Err(unavailable(e))],
                };

                stream::iter(items)
            });

        Ok(events.boxed())
    }

    async fn grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let secs = i64::try_from(ttl.as_secs())
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or_else(|| {
                StoreError::InvalidRequest(format!("unsupported lease TTL {ttl:?}"))
            })?;

        let mut client = self.client.clone();
        let response = client.lease_grant(secs, None).await.map_err(unavailable)?;
        let lease = LeaseId(response.id());

        self.lock_ttls().insert(lease, ttl);
        Ok(lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream> {
        let ttl = self
            .lock_ttls()
            .get(&lease)
            .copied()
            .unwrap_or(Duration::from_secs(3));

        let mut client = self.client.clone();
        let (keeper, responses) = client
            .lease_keep_alive(lease.0)
            .await
            .map_err(|e| lease_error(lease, e))?;

        let period = (ttl / 3).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stream = stream::unfold(
            Some((keeper, responses, ticker)),
            move |state| async move {
                let (mut keeper, mut responses, mut ticker) = state?;
                ticker.tick().await;

                if let Err(e) = keeper.keep_alive().await {
                    return Some((Err(lease_error(lease, e)), None));
                }

                match responses.message().await {
                    Ok(Some(response)) if response.ttl() > 0 => {
                        let ttl = Duration::from_secs(u64::try_from(response.ttl()).unwrap_or(0));
                        let item = Ok(KeepAliveResponse { lease, ttl });
                        Some((item, Some((keeper, responses, ticker))))
                    }
                    Ok(Some(_)) => Some((Err(StoreError::LeaseNotFound(lease)), None)),
                    Ok(None) => None,
                    Err(e) => Some((Err(lease_error(lease, e)), None)),
                }
            },
        );

        Ok(stream.boxed())
    }

    async fn revoke(&self, lease: LeaseId) -> StoreResult<()> {
        self.lock_ttls().remove(&lease);

        let mut client = self.client.clone();
        client
            .lease_revoke(lease.0)
            .await
            .map(|_| ())
            .map_err(|e| lease_error(lease, e))
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()> {
        let options = lease.map(|lease| PutOptions::new().with_lease(lease.0));

        let mut client = self.client.clone();
        client
            .put(key, value, options)
            .await
            .map(|_| ())
            .map_err(unavailable)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut client = self.client.clone();
        client
            .delete(key, None::<DeleteOptions>)
            .await
            .map(|_| ())
            .map_err(unavailable)
    }
}
