//! Watch and resync driver shared by the pool and the resolver.
//!
//! A [`PrefixWatcher`] turns one prefix of the store into a sequence of
//! [`Update`]s: incremental events from the watch, plus a full read every
//! resync interval and right after every (re-)established watch. A lost or
//! canceled watch never ends the sequence; the watch is re-established with
//! exponential backoff while resyncs keep running. Only the stop token ends it.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::registry::RegistryClient;
use crate::store::{CoordinationStore, KeyValue, StoreEvent, StoreResult, WatchStream};

/// Default period of the safety-net full resync.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Initial delay before re-watching after a lost watch.
const WATCH_RETRY_BASE: Duration = Duration::from_secs(1);

/// Maximum delay between re-watch attempts.
const WATCH_RETRY_MAX: Duration = Duration::from_secs(30);

/// One step of membership information for a prefix.
#[derive(Debug)]
pub(crate) enum Update {
    /// A full read of the prefix.
    Snapshot(Vec<KeyValue>),
    /// A single change delivered by the watch.
    Event(StoreEvent),
}

enum Step {
    Stop,
    Resync,
    Rewatch,
    Event(Option<StoreResult<StoreEvent>>),
}

pub(crate) struct PrefixWatcher {
    registry: RegistryClient,
    prefix: String,
    stop: CancellationToken,
    resync: Interval,
    events: Option<WatchStream>,
    retry: Duration,
    rewatch_at: Instant,
    snapshot_due: bool,
}

impl PrefixWatcher {
    /// Creates a driver for `prefix`.
    ///
    /// With `events` set, that watch is used as is. Without, a watch is
    /// established on the first call to [`next`](Self::next), followed by a
    /// snapshot.
    pub(crate) fn new(
        store: Arc<dyn CoordinationStore>,
        prefix: String,
        resync_interval: Duration,
        stop: CancellationToken,
        events: Option<WatchStream>,
    ) -> Self {
        let period = resync_interval.max(Duration::from_millis(1));
        let mut resync = tokio::time::interval_at(Instant::now() + period, period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Self {
            registry: RegistryClient::new(store),
            prefix,
            stop,
            resync,
            events,
            retry: WATCH_RETRY_BASE,
            rewatch_at: Instant::now(),
            snapshot_due: false,
        }
    }

    pub(crate) fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Reads the whole prefix. Failures are logged and yield `None`.
    ///
    /// The future borrows only the registry and the prefix, so it stays
    /// `Send` even though the (non-`Sync`) watch stream lives in `self`.
    pub(crate) fn read(&self) -> impl Future<Output = Option<Vec<KeyValue>>> + Send + '_ {
        let registry = &self.registry;
        let prefix = &self.prefix;
        async move {
            match registry.get(prefix).await {
                Ok(entries) => Some(entries),
                Err(e) => {
                    tracing::warn!("resync of {prefix} failed: {e}");
                    None
                }
            }
        }
    }

    /// Waits for the next update. Returns `None` once stopped.
    pub(crate) async fn next(&mut self) -> Option<Update> {
        loop {
            if self.stop.is_cancelled() {
                return None;
            }

            if self.snapshot_due {
                self.snapshot_due = false;
                if let Some(entries) = self.read().await {
                    return Some(Update::Snapshot(entries));
                }
            }

            let watching = self.events.is_some();

            let step = tokio::select! {
                biased;
                () = self.stop.cancelled() => Step::Stop,
                _ = self.resync.tick() => Step::Resync,
                () = tokio::time::sleep_until(self.rewatch_at), if !watching => Step::Rewatch,
                event = next_event(&mut self.events) => Step::Event(event),
            };

            match step {
                Step::Stop => return None,

                Step::Resync => {
                    if let Some(entries) = self.read().await {
                        return Some(Update::Snapshot(entries));
                    }
                }

                Step::Rewatch => match self.registry.watch_events(&self.prefix).await {
                    Ok(stream) => {
                        tracing::debug!("watching {}", self.prefix);
                        self.events = Some(stream);
                        self.snapshot_due = true;
                    }
                    Err(e) => {
                        tracing::warn!("failed to watch {}: {e}", self.prefix);
                        self.schedule_rewatch();
                    }
                },

                Step::Event(Some(Ok(event))) => {
                    self.retry = WATCH_RETRY_BASE;
                    return Some(Update::Event(event));
                }

                Step::Event(Some(Err(e))) => {
                    tracing::warn!("watch on {} interrupted: {e}", self.prefix);
                    self.schedule_rewatch();
                }

                Step::Event(None) => {
                    tracing::debug!("watch on {} canceled", self.prefix);
                    self.schedule_rewatch();
                }
            }
        }
    }

    fn schedule_rewatch(&mut self) {
        self.events = None;
        self.rewatch_at = Instant::now() + self.retry;
        tracing::debug!("re-watching {} in {:?}", self.prefix, self.retry);
        self.retry = (self.retry * 2).min(WATCH_RETRY_MAX);
    }
}

async fn next_event(events: &mut Option<WatchStream>) -> Option<StoreResult<StoreEvent>> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
