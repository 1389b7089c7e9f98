//! The list/watch loop.
//!
//! ```text
//!   start ──► List ──► Watching ◄──┐
//!              ▲         │  │      │ stream closed: reopen from the
//!              │   410   │  └──────┘ last seen resource version
//!              └─────────┘
//!   every resync period while watching or reopening: re-list, then
//!   re-emit everything paced by rate_wait alongside live watch events
//! ```
//!
//! Objects are routed by their deletion timestamp: set means the delete
//! stream, unset means the update stream. List and watch failures go to the
//! error stream and the loop keeps cycling until its token is cancelled.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{Resource, ResourceExt};
use operon_common::backoff::{BackOff, ExponentialBackOff};
use operon_common::{Error, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::cache::{is_deleting, object_key, Delivery, ObjectCache};
use crate::source::{Lister, WatchEvent, Watcher};

/// Default interval between full re-lists
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(300);

/// Default pause between items re-emitted by a resync
pub const DEFAULT_RATE_WAIT: Duration = Duration::from_secs(1);

/// Default capacity of each output stream
pub const DEFAULT_CHANNEL_CAPACITY: usize = 128;

/// Cap on the pause after a failed list or watch call
const MAX_ERROR_PAUSE: Duration = Duration::from_secs(30);

/// Informer tuning
#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// Interval between full re-lists while watching
    pub resync_period: Duration,
    /// Pause between successive objects re-emitted by a resync
    pub rate_wait: Duration,
    /// Capacity of each output stream
    pub channel_capacity: usize,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            resync_period: DEFAULT_RESYNC_PERIOD,
            rate_wait: DEFAULT_RATE_WAIT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl InformerConfig {
    /// Override the resync period
    pub fn with_resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    /// Override the pause between re-emitted objects
    pub fn with_rate_wait(mut self, wait: Duration) -> Self {
        self.rate_wait = wait;
        self
    }

    /// Override the output stream capacity
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.resync_period.is_zero() {
            return Err(Error::invalid_config(
                "informer",
                "resync period must be greater than zero",
            ));
        }
        if self.channel_capacity == 0 {
            return Err(Error::invalid_config(
                "informer",
                "channel capacity must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Output of [`Informer::watch`]
pub struct InformerStreams<K> {
    /// Objects created or updated, and every object again on each resync
    pub updates: mpsc::Receiver<K>,
    /// Objects being deleted or deleted
    pub deletes: mpsc::Receiver<K>,
    /// List, watch and decode failures
    pub errors: mpsc::Receiver<Error>,
    /// The loop task; finishes after cancellation
    pub handle: JoinHandle<()>,
}

/// Turns a list/watch API into update, delete and error streams.
pub struct Informer<K> {
    config: InformerConfig,
    lister: Arc<dyn Lister<K>>,
    watcher: Arc<dyn Watcher<K>>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Validate `config` and build an informer over the two calls
    pub fn new(
        config: InformerConfig,
        lister: Arc<dyn Lister<K>>,
        watcher: Arc<dyn Watcher<K>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            lister,
            watcher,
        })
    }

    /// Build an informer over one value implementing both calls
    pub fn from_source<S>(config: InformerConfig, source: S) -> Result<Self>
    where
        S: Lister<K> + Watcher<K> + 'static,
    {
        let source = Arc::new(source);
        Self::new(config, source.clone(), source)
    }

    /// Configuration in use
    pub fn config(&self) -> &InformerConfig {
        &self.config
    }

    /// Start the loop; it stops and closes every stream once `token` is
    /// cancelled.
    pub fn watch(&self, token: CancellationToken) -> InformerStreams<K> {
        let capacity = self.config.channel_capacity;
        let (updates_tx, updates) = mpsc::channel(capacity);
        let (deletes_tx, deletes) = mpsc::channel(capacity);
        let (errors_tx, errors) = mpsc::channel(capacity);

        let period = self.config.resync_period;
        let mut resync = tokio::time::interval_at(Instant::now() + period, period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let worker = WatchLoop {
            config: self.config.clone(),
            lister: Arc::clone(&self.lister),
            watcher: Arc::clone(&self.watcher),
            cache: ObjectCache::default(),
            backoff: ExponentialBackOff::new(Duration::from_millis(500), MAX_ERROR_PAUSE, None),
            updates: updates_tx,
            deletes: deletes_tx,
            errors: errors_tx,
            resync,
            paced: VecDeque::new(),
            paced_at: Instant::now(),
            token,
        };

        InformerStreams {
            updates,
            deletes,
            errors,
            handle: tokio::spawn(worker.run()),
        }
    }
}

/// What a list is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListMode {
    /// First list: every object is new
    Seed,
    /// After 410 Gone: only changed objects are emitted
    Relist,
    /// Periodic: every object is queued for paced re-emission
    Resync,
}

enum Next {
    List(ListMode),
    Watch(String),
}

/// Wait on `fut` unless `token` is cancelled first
async fn or_cancelled<T>(
    token: &CancellationToken,
    fut: impl std::future::Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        _ = token.cancelled() => None,
        value = fut => Some(value),
    }
}

struct WatchLoop<K> {
    config: InformerConfig,
    lister: Arc<dyn Lister<K>>,
    watcher: Arc<dyn Watcher<K>>,
    cache: ObjectCache,
    backoff: ExponentialBackOff,
    updates: mpsc::Sender<K>,
    deletes: mpsc::Sender<K>,
    errors: mpsc::Sender<Error>,
    resync: Interval,
    /// Resync output not yet emitted
    paced: VecDeque<K>,
    /// Earliest time the next paced object may go out
    paced_at: Instant,
    token: CancellationToken,
}

impl<K> WatchLoop<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn run(mut self) {
        info!(
            resync_secs = self.config.resync_period.as_secs(),
            "Informer started"
        );
        let mut next = Next::List(ListMode::Seed);
        loop {
            let step = match next {
                Next::List(mode) => self.list(mode).await,
                Next::Watch(version) => self.watch_from(version).await,
            };
            match step {
                Some(step) => next = step,
                None => break,
            }
        }
        info!("Informer stopped");
    }

    async fn list(&mut self, mode: ListMode) -> Option<Next> {
        let listed = or_cancelled(&self.token, self.lister.list()).await?;
        match listed {
            Ok(list) => {
                self.backoff.reset();
                debug!(
                    items = list.items.len(),
                    resource_version = %list.resource_version,
                    "Listed objects"
                );
                self.apply_list(list.items, mode).await?;
                Some(Next::Watch(list.resource_version))
            }
            Err(e) => {
                self.report(e).await?;
                self.pause(false).await?;
                Some(Next::List(mode))
            }
        }
    }

    async fn watch_from(&mut self, mut version: String) -> Option<Next> {
        let opened = or_cancelled(&self.token, self.watcher.watch(&version)).await?;
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) if e.is_gone() => {
                debug!(resource_version = %version, "Resource version expired, re-listing");
                return Some(Next::List(ListMode::Relist));
            }
            Err(e) => {
                self.report(e).await?;
                self.pause(true).await?;
                return Some(Next::Watch(version));
            }
        };
        trace!(resource_version = %version, "Watch opened");

        loop {
            let paced_at = self.paced_at;
            tokio::select! {
                _ = self.token.cancelled() => return None,
                _ = self.resync.tick() => self.resync().await?,
                _ = tokio::time::sleep_until(paced_at), if !self.paced.is_empty() => {
                    self.emit_paced().await?
                }
                item = stream.next() => match item {
                    None => {
                        debug!(resource_version = %version, "Watch closed, reopening");
                        return Some(Next::Watch(version));
                    }
                    Some(Ok(event)) => {
                        self.backoff.reset();
                        self.handle_event(event, &mut version).await?;
                    }
                    Some(Err(e)) if e.is_gone() => {
                        debug!(resource_version = %version, "Resource version expired, re-listing");
                        return Some(Next::List(ListMode::Relist));
                    }
                    Some(Err(e)) => self.report(e).await?,
                },
            }
        }
    }

    async fn resync(&mut self) -> Option<()> {
        debug!(objects = self.cache.len(), "Resyncing");
        let listed = or_cancelled(&self.token, self.lister.list()).await?;
        match listed {
            Ok(list) => self.apply_list(list.items, ListMode::Resync).await,
            Err(e) => self.report(e).await,
        }
    }

    async fn apply_list(&mut self, items: Vec<K>, mode: ListMode) -> Option<()> {
        let keys: HashSet<String> = items.iter().map(object_key).collect();

        if mode == ListMode::Resync {
            if !self.paced.is_empty() {
                debug!(skipped = self.paced.len(), "Previous resync still pending, replaced");
            }
            self.paced.clear();
            self.paced_at = Instant::now();
        }
        for obj in items {
            let delivery = match (self.cache.observe(&obj), mode) {
                (_, ListMode::Resync) => {
                    self.paced.push_back(obj);
                    continue;
                }
                (Delivery::Replay, ListMode::Relist) => continue,
                (Delivery::Replay, _) if is_deleting(&obj) => Delivery::Delete,
                (Delivery::Replay, _) => Delivery::Update,
                (delivery, _) => delivery,
            };
            self.deliver(obj, delivery).await?;
        }

        let dropped = self.cache.retain_keys(&keys);
        if dropped > 0 {
            debug!(dropped, "Forgot objects missing from list");
        }
        Some(())
    }

    /// Emit the next queued resync object unless the watch has delivered a
    /// newer version or the object's removal since it was listed.
    async fn emit_paced(&mut self) -> Option<()> {
        let Some(obj) = self.paced.pop_front() else {
            return Some(());
        };
        let key = object_key(&obj);
        let listed = obj.resource_version().unwrap_or_default();
        let current = self.cache.get(&key).map(|e| e.resource_version.as_str());
        if current != Some(listed.as_str()) {
            trace!(object = %key, "Skipping superseded resync item");
            return Some(());
        }

        self.paced_at = Instant::now() + self.config.rate_wait;
        let delivery = if is_deleting(&obj) {
            Delivery::Delete
        } else {
            Delivery::Update
        };
        self.deliver(obj, delivery).await
    }

    async fn handle_event(&mut self, event: WatchEvent<K>, version: &mut String) -> Option<()> {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                if let Some(v) = obj.resource_version() {
                    *version = v;
                }
                match self.cache.observe(&obj) {
                    Delivery::Replay => {
                        trace!(object = %object_key(&obj), "Skipping replayed event");
                        Some(())
                    }
                    delivery => self.deliver(obj, delivery).await,
                }
            }
            WatchEvent::Deleted(obj) => {
                if let Some(v) = obj.resource_version() {
                    *version = v;
                }
                if self.cache.remove(&obj) {
                    self.deliver(obj, Delivery::Delete).await
                } else {
                    Some(())
                }
            }
            WatchEvent::Bookmark { resource_version } => {
                *version = resource_version;
                Some(())
            }
        }
    }

    async fn deliver(&self, obj: K, delivery: Delivery) -> Option<()> {
        let tx = match delivery {
            Delivery::Update => &self.updates,
            Delivery::Delete => &self.deletes,
            Delivery::Replay => return Some(()),
        };
        let key = object_key(&obj);
        if or_cancelled(&self.token, tx.send(obj)).await?.is_err() {
            trace!(object = %key, "Receiver dropped, event discarded");
        }
        Some(())
    }

    async fn report(&self, err: Error) -> Option<()> {
        warn!(error = %err, "Informer error");
        // A dropped error receiver is not a reason to stop watching
        let _ = or_cancelled(&self.token, self.errors.send(err)).await?;
        Some(())
    }

    /// Back off after a failure. Between watches the resync timer and
    /// paced re-emission keep running through the pause.
    async fn pause(&mut self, watching: bool) -> Option<()> {
        let delay = self.backoff.next_backoff().unwrap_or(MAX_ERROR_PAUSE);
        let deadline = Instant::now() + delay;
        loop {
            let paced_at = self.paced_at;
            tokio::select! {
                _ = self.token.cancelled() => return None,
                _ = tokio::time::sleep_until(deadline) => return Some(()),
                _ = self.resync.tick(), if watching => self.resync().await?,
                _ = tokio::time::sleep_until(paced_at), if watching && !self.paced.is_empty() => {
                    self.emit_paced().await?
                }
            }
        }
    }
}
