//! Query manager: the key → entry table and its coordination lock.
//!
//! # Locking
//!
//! One `std::sync::Mutex` per manager guards the table and every field of
//! every entry. It is held for table bookkeeping and for non-blocking
//! channel sends only: the producer runs inside a spawned task, consumers
//! read from their own channel, and evicted entries are dropped after the
//! lock is released.
//!
//! Fan-out of one emission is O(subscribers) under the lock: one
//! unbounded send of an `Arc<T>` per consumer. Values are cloned out of
//! the `Arc` by each consumer when it polls, outside the lock, so no user
//! code runs while the lock is held.
//!
//! # Lifecycle
//!
//! ```text
//!   attach (miss)          last detach              grace elapsed
//!  ───────────────► Active ───────────► Draining ─────────────────► Evicted
//!                     ▲                    │
//!                     └──── attach ────────┘
//!
//!   producer error ──► Evicted immediately (error delivered first)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::entry::{CacheEntry, EntryStats, ErasedEntry, Phase};
use super::handle::{Query, Subscription};
use super::options::{CacheConfig, QueryOptions};
use crate::key::QueryKey;
use crate::producer::Producer;
use crate::telemetry;
use crate::{QueryError, Result};

type Table = HashMap<QueryKey, Box<dyn ErasedEntry>>;

/// State shared by a manager, its handles, and its background tasks.
///
/// Background tasks hold it weakly, so dropping the last manager clone and
/// the last handle tears everything down.
pub(crate) struct Shared {
    table: Mutex<Table>,
    config: CacheConfig,
    next_id: AtomicU64,
}

/// Owner of the query cache for one SDK client instance.
///
/// Cheap to clone; clones share the same table.
///
/// ```rust,no_run
/// use chain_query::{key, producer, QueryManager, QueryOptions};
///
/// # async fn example() -> chain_query::Result<()> {
/// let manager = QueryManager::with_defaults();
/// let nav = manager.acquire(
///     Some(key!["pool", 7, "nav"]),
///     producer::once(|| async { Ok(1_000_000u64) }),
///     &QueryOptions::default(),
/// )?;
/// assert_eq!(nav.get().await?, 1_000_000);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct QueryManager {
    shared: Arc<Shared>,
}

impl QueryManager {
    /// Create a manager with the given defaults.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                table: Mutex::new(HashMap::new()),
                config,
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Create a manager with [`CacheConfig::default()`].
    pub fn with_defaults() -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(HashMap::new()),
                config: CacheConfig::default(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Build a query handle for `key`.
    ///
    /// Nothing runs until the handle is consumed: each
    /// [`Query::subscribe`] or await attaches to the key's entry (creating
    /// it and invoking `producer` on a miss) and detaches when done.
    ///
    /// With `key == None` or `cache == false` every attachment gets its
    /// own private pipeline.
    ///
    /// Misuse is reported here, before anything is created: invalid
    /// options, or a key already cached with a different value type.
    ///
    /// Values are shared between consumers behind an `Arc`, hence
    /// `T: Sync`; each consumer receives its own clone.
    pub fn acquire<T, P>(
        &self,
        key: Option<QueryKey>,
        producer: P,
        options: &QueryOptions,
    ) -> Result<Query<T>>
    where
        T: Clone + Send + Sync + 'static,
        P: Producer<T>,
    {
        let options = options.resolve(&self.shared.config)?;
        let key = key.filter(|_| options.cache);
        if let Some(key) = &key {
            self.shared.check_type::<T>(key)?;
        }
        Ok(Query::new(
            Arc::clone(&self.shared),
            key,
            Arc::new(producer),
            options,
        ))
    }

    /// Invalidate a single key. See [`invalidate_prefix`](Self::invalidate_prefix).
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        self.shared.invalidate_where(|k| k == key) > 0
    }

    /// Invalidate every entry whose key starts with `prefix`.
    ///
    /// Entries without subscribers are evicted. Entries with subscribers
    /// drop their last value and re-run the producer, so attached
    /// consumers receive fresh values. Returns the number of entries
    /// touched.
    pub fn invalidate_prefix(&self, prefix: &QueryKey) -> usize {
        self.shared.invalidate_where(|k| k.starts_with(prefix))
    }

    /// Evict every entry. Attached consumers receive
    /// [`QueryError::Closed`] and their streams end.
    pub fn clear(&self) {
        let evicted: Vec<_> = self.shared.lock().drain().collect();
        shutdown_all(evicted, "cleared");
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.shared.lock().contains_key(key)
    }

    pub fn stats(&self, key: &QueryKey) -> Option<EntryStats> {
        self.shared.lock().get(key).map(|entry| entry.stats())
    }
}

impl fmt::Debug for QueryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryManager")
            .field("config", &self.shared.config)
            .field("entries", &self.len())
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Table> {
        // Entry bookkeeping stays consistent across a panicking consumer.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_type<T: 'static>(&self, key: &QueryKey) -> Result<()> {
        match self.lock().get(key) {
            Some(entry) if !entry.as_any().is::<CacheEntry<T>>() => {
                Err(QueryError::TypeMismatch { key: key.clone() })
            }
            _ => Ok(()),
        }
    }

    /// Attach one consumer to the entry for `key`.
    pub(crate) fn attach<T: Clone + Send + Sync + 'static>(
        self: &Arc<Self>,
        key: &QueryKey,
        producer: &Arc<dyn Producer<T>>,
        options: &CacheConfig,
    ) -> Subscription<T> {
        let Ok(rt) = Handle::try_current() else {
            return Subscription::failed(QueryError::NoRuntime);
        };
        let (delivery, rx) = mpsc::unbounded_channel();
        let subscriber_id = self.next_id();
        let now = Instant::now();

        let mut table = self.lock();
        let entry_id = match table.get_mut(key) {
            Some(erased) => {
                let Some(entry) = erased.as_any_mut().downcast_mut::<CacheEntry<T>>() else {
                    return Subscription::failed(QueryError::TypeMismatch { key: key.clone() });
                };
                metrics::counter!(telemetry::CACHE_HITS_TOTAL).increment(1);
                if entry.state.cancel_teardown() {
                    debug!(key = %key, "entry reactivated");
                }

                // Replay goes into the channel before any later emission.
                let replayed = match entry.fresh_value(now) {
                    Some(value) => {
                        let _ = delivery.send(Ok(Arc::clone(value)));
                        true
                    }
                    None => false,
                };
                match entry.state.phase {
                    Phase::Running => entry.add_subscriber(subscriber_id, delivery),
                    // Replay then end-of-stream.
                    Phase::Completed if replayed => drop(delivery),
                    Phase::Completed => {
                        entry.add_subscriber(subscriber_id, delivery);
                        entry.start(&rt, Arc::downgrade(self));
                        debug!(key = %key, "stale completed entry restarted");
                    }
                }
                entry.state.subscriber_count += 1;
                entry.state.id
            }
            None => {
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
                let id = self.next_id();
                let mut entry =
                    CacheEntry::new(key.clone(), id, options.clone(), Arc::clone(producer));
                entry.add_subscriber(subscriber_id, delivery);
                entry.state.subscriber_count = 1;
                entry.start(&rt, Arc::downgrade(self));
                table.insert(key.clone(), Box::new(entry));
                debug!(key = %key, "entry created");
                id
            }
        };
        drop(table);

        Subscription::cached(rx, rt, Arc::clone(self), key.clone(), entry_id, subscriber_id)
    }

    /// Detach one consumer; schedule teardown when it was the last.
    ///
    /// `rt` is the runtime the consumer attached on, so the teardown timer
    /// is scheduled even when the subscription is dropped on a thread
    /// outside any runtime.
    pub(crate) fn detach(
        self: &Arc<Self>,
        rt: &Handle,
        key: &QueryKey,
        entry_id: u64,
        subscriber_id: u64,
    ) {
        let mut table = self.lock();
        let Some(entry) = table.get_mut(key) else {
            return;
        };
        if entry.state().id != entry_id {
            return;
        }
        entry.remove_subscriber(subscriber_id);
        let state = entry.state_mut();
        state.subscriber_count = state.subscriber_count.saturating_sub(1);
        if state.subscriber_count > 0 {
            return;
        }

        let grace = state.options.observable_cache_time;
        let deadline = Instant::now() + grace;
        let epoch = state.begin_teardown(deadline);
        let weak = Arc::downgrade(self);
        let timer_key = key.clone();
        let timer = rt.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(shared) = weak.upgrade() {
                shared.expire(&timer_key, entry_id, epoch);
            }
        });
        state.teardown_timer = Some(timer.abort_handle());
        debug!(key = %key, grace_ms = grace.as_millis() as u64, "entry draining");
    }

    /// Teardown timer callback.
    fn expire(&self, key: &QueryKey, entry_id: u64, epoch: u64) {
        let mut table = self.lock();
        let due = table.get(key).is_some_and(|entry| {
            let state = entry.state();
            state.id == entry_id && state.teardown_epoch == epoch && state.subscriber_count == 0
        });
        if !due {
            return;
        }
        let evicted = table.remove(key);
        drop(table);
        shutdown_all(evicted.into_iter().map(|e| (key.clone(), e)), "idle");
    }

    /// Pipeline emission. Returns false when the run is stale (entry
    /// evicted, replaced, or restarted) and the pipeline should stop.
    pub(crate) fn deliver<T: Clone + Send + Sync + 'static>(
        &self,
        key: &QueryKey,
        entry_id: u64,
        run: u64,
        item: Result<T>,
    ) -> bool {
        let mut table = self.lock();
        let Some(entry) = table
            .get_mut(key)
            .and_then(|e| e.as_any_mut().downcast_mut::<CacheEntry<T>>())
        else {
            return false;
        };
        if entry.state.id != entry_id || entry.state.run != run {
            return false;
        }

        match item {
            Ok(value) => {
                trace!(key = %key, receiving = entry.receiving(), "fan out");
                let value = Arc::new(value);
                entry.broadcast(&Ok(Arc::clone(&value)));
                entry.record(value, Instant::now());
            }
            Err(err) => {
                entry.broadcast(&Err(err.clone()));
                let evicted = table.remove(key);
                drop(table);
                warn!(key = %key, error = %err, "producer failed, entry evicted");
                metrics::counter!(telemetry::PRODUCER_ERRORS_TOTAL, "cached" => "true")
                    .increment(1);
                // Error already delivered; dropping the entry ends the streams.
                shutdown_all(evicted.into_iter().map(|e| (key.clone(), e)), "error");
            }
        }
        true
    }

    /// Pipeline ended normally.
    pub(crate) fn complete<T: Clone + Send + Sync + 'static>(&self, key: &QueryKey, entry_id: u64, run: u64) {
        let mut table = self.lock();
        let Some(entry) = table
            .get_mut(key)
            .and_then(|e| e.as_any_mut().downcast_mut::<CacheEntry<T>>())
        else {
            return;
        };
        if entry.state.id != entry_id || entry.state.run != run {
            return;
        }
        entry.complete();
        debug!(key = %key, "pipeline completed");
    }

    fn invalidate_where(self: &Arc<Self>, matches: impl Fn(&QueryKey) -> bool) -> usize {
        let rt = Handle::try_current().ok();
        let mut table = self.lock();
        let keys: Vec<QueryKey> = table.keys().filter(|k| matches(k)).cloned().collect();
        let mut evicted = Vec::new();
        for key in &keys {
            let live = table
                .get(key)
                .is_some_and(|entry| entry.state().subscriber_count > 0);
            match (&rt, live) {
                (Some(rt), true) => {
                    if let Some(entry) = table.get_mut(key) {
                        entry.restart(rt, Arc::downgrade(self));
                        debug!(key = %key, "entry invalidated, pipeline restarted");
                    }
                }
                _ => {
                    if let Some(entry) = table.remove(key) {
                        evicted.push((key.clone(), entry));
                    }
                }
            }
        }
        drop(table);
        shutdown_all(evicted, "invalidated");
        keys.len()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let table = self
            .table
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        let evicted: Vec<_> = table.drain().collect();
        shutdown_all(evicted, "cleared");
    }
}

/// Shut down entries already removed from the table.
///
/// Called without the table lock held. Entries evicted by `clear` or
/// `invalidate` notify their remaining consumers with
/// [`QueryError::Closed`]; idle and failed entries have nobody left to
/// notify.
fn shutdown_all(
    evicted: impl IntoIterator<Item = (QueryKey, Box<dyn ErasedEntry>)>,
    reason: &'static str,
) {
    for (key, mut entry) in evicted {
        let notice = matches!(reason, "cleared" | "invalidated").then_some(QueryError::Closed);
        entry.shutdown(notice);
        metrics::counter!(telemetry::EVICTIONS_TOTAL, "reason" => reason).increment(1);
        debug!(key = %key, reason, "entry evicted");
    }
}

/// Attach a consumer to a private, uncached pipeline.
pub(crate) fn attach_private<T: Clone + Send + Sync + 'static>(
    producer: &Arc<dyn Producer<T>>,
) -> Subscription<T> {
    let Ok(rt) = Handle::try_current() else {
        return Subscription::failed(QueryError::NoRuntime);
    };
    let (delivery, rx) = mpsc::unbounded_channel();
    let producer = Arc::clone(producer);
    let task = rt.spawn(async move {
        metrics::counter!(telemetry::PRODUCER_INVOCATIONS_TOTAL, "cached" => "false").increment(1);
        let mut stream = producer.produce();
        while let Some(item) = stream.next().await {
            let failed = item.is_err();
            if failed {
                metrics::counter!(telemetry::PRODUCER_ERRORS_TOTAL, "cached" => "false")
                    .increment(1);
            }
            if delivery.send(item.map(Arc::new)).is_err() || failed {
                break;
            }
        }
    });
    Subscription::private(rx, task.abort_handle())
}
