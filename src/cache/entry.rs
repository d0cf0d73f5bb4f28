//! Per-key cache entry.
//!
//! Every field here is mutated only while the owning manager's table lock
//! is held. The pipeline task and the teardown timer never touch an entry
//! directly; they go back through the manager, which checks the entry id
//! and run/epoch counters so that a stale task cannot act on an entry
//! that was evicted or restarted in the meantime.

use std::any::Any;
use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Weak};

use futures_util::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::manager::Shared;
use super::options::CacheConfig;
use crate::key::QueryKey;
use crate::producer::Producer;
use crate::telemetry;
use crate::{QueryError, Result};

/// Sending half of one consumer's delivery channel. Values travel as
/// `Arc<T>` so fan-out under the table lock never runs `T::clone`.
pub(crate) type Delivery<T> = UnboundedSender<Result<Arc<T>>>;

/// Whether an entry's pipeline is still producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    /// The producer stream ended normally. Attached consumers have seen
    /// end-of-stream; the last value may still be replayed.
    Completed,
}

/// Point-in-time view of an entry, for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStats {
    pub phase: Phase,
    pub subscriber_count: usize,
    pub has_value: bool,
    /// No subscribers, teardown timer pending.
    pub draining: bool,
}

/// Lifecycle bookkeeping that does not depend on the value type.
pub(crate) struct EntryState {
    pub(crate) key: QueryKey,
    /// Unique per entry instance; a re-created entry for the same key gets
    /// a new id.
    pub(crate) id: u64,
    pub(crate) options: CacheConfig,
    pub(crate) phase: Phase,
    /// Bumped on every pipeline (re)start.
    pub(crate) run: u64,
    pub(crate) pipeline: Option<AbortHandle>,
    pub(crate) subscriber_count: usize,
    pub(crate) teardown_deadline: Option<Instant>,
    pub(crate) teardown_timer: Option<AbortHandle>,
    /// Bumped whenever a teardown is scheduled or cancelled.
    pub(crate) teardown_epoch: u64,
}

impl EntryState {
    fn new(key: QueryKey, id: u64, options: CacheConfig) -> Self {
        Self {
            key,
            id,
            options,
            phase: Phase::Running,
            run: 0,
            pipeline: None,
            subscriber_count: 0,
            teardown_deadline: None,
            teardown_timer: None,
            teardown_epoch: 0,
        }
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.teardown_deadline.is_some()
    }

    /// Cancel a pending teardown. Returns whether one was pending.
    pub(crate) fn cancel_teardown(&mut self) -> bool {
        if let Some(timer) = self.teardown_timer.take() {
            timer.abort();
        }
        self.teardown_epoch += 1;
        self.teardown_deadline.take().is_some()
    }

    /// Enter the draining state; returns the epoch the timer must match.
    pub(crate) fn begin_teardown(&mut self, deadline: Instant) -> u64 {
        self.cancel_teardown();
        self.teardown_deadline = Some(deadline);
        self.teardown_epoch
    }

    fn abort_pipeline(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.abort();
        }
    }
}

/// Cache entry for one key and value type.
pub(crate) struct CacheEntry<T> {
    pub(crate) state: EntryState,
    producer: Arc<dyn Producer<T>>,
    /// Consumers still receiving emissions, by subscriber id.
    subscribers: HashMap<u64, Delivery<T>>,
    last_value: Option<Arc<T>>,
    value_expiry_deadline: Option<Instant>,
}

impl<T: Clone + Send + Sync + 'static> CacheEntry<T> {
    pub(crate) fn new(
        key: QueryKey,
        id: u64,
        options: CacheConfig,
        producer: Arc<dyn Producer<T>>,
    ) -> Self {
        Self {
            state: EntryState::new(key, id, options),
            producer,
            subscribers: HashMap::new(),
            last_value: None,
            value_expiry_deadline: None,
        }
    }

    /// Last value, if still inside its replay window.
    pub(crate) fn fresh_value(&self, now: Instant) -> Option<&Arc<T>> {
        match self.value_expiry_deadline {
            Some(deadline) if now < deadline => self.last_value.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn record(&mut self, value: Arc<T>, now: Instant) {
        self.value_expiry_deadline = now.checked_add(self.state.options.value_cache_time);
        self.last_value = Some(value);
    }

    pub(crate) fn add_subscriber(&mut self, subscriber: u64, delivery: Delivery<T>) {
        self.subscribers.insert(subscriber, delivery);
    }

    pub(crate) fn receiving(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver one emission to every receiving consumer, in table-lock
    /// order. Each send is a refcount bump. Consumers whose receiver is
    /// gone are dropped.
    pub(crate) fn broadcast(&mut self, item: &Result<Arc<T>>) {
        self.subscribers
            .retain(|_, delivery| delivery.send(item.clone()).is_ok());
    }

    /// Mark the pipeline finished and end every consumer's stream.
    pub(crate) fn complete(&mut self) {
        self.state.phase = Phase::Completed;
        self.state.pipeline = None;
        self.subscribers.clear();
    }

    /// Start a new pipeline run, aborting the previous one if any.
    ///
    /// The producer is invoked inside the spawned task, never under the
    /// table lock.
    pub(crate) fn start(&mut self, rt: &Handle, shared: Weak<Shared>) {
        self.state.abort_pipeline();
        self.state.run += 1;
        self.state.phase = Phase::Running;

        let key = self.state.key.clone();
        let id = self.state.id;
        let run = self.state.run;
        let producer = Arc::clone(&self.producer);

        let task = rt.spawn(async move {
            metrics::counter!(telemetry::PRODUCER_INVOCATIONS_TOTAL, "cached" => "true")
                .increment(1);
            let mut stream = producer.produce();
            while let Some(item) = stream.next().await {
                let failed = item.is_err();
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                if !shared.deliver(&key, id, run, item) || failed {
                    return;
                }
            }
            if let Some(shared) = shared.upgrade() {
                shared.complete::<T>(&key, id, run);
            }
        });
        self.state.pipeline = Some(task.abort_handle());
    }
}

/// Type-erased view of a [`CacheEntry`], as stored in the manager table.
pub(crate) trait ErasedEntry: Send {
    fn state(&self) -> &EntryState;

    fn state_mut(&mut self) -> &mut EntryState;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn has_value(&self) -> bool;

    fn remove_subscriber(&mut self, subscriber: u64);

    /// Drop the last value and re-run the producer for the attached
    /// consumers.
    fn restart(&mut self, rt: &Handle, shared: Weak<Shared>);

    /// Stop all work. Consumers still receiving get `notice` (if any)
    /// and then end-of-stream.
    fn shutdown(&mut self, notice: Option<QueryError>);

    fn stats(&self) -> EntryStats {
        let state = self.state();
        EntryStats {
            phase: state.phase,
            subscriber_count: state.subscriber_count,
            has_value: self.has_value(),
            draining: state.is_draining(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ErasedEntry for CacheEntry<T> {
    fn state(&self) -> &EntryState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut EntryState {
        &mut self.state
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn has_value(&self) -> bool {
        self.last_value.is_some()
    }

    fn remove_subscriber(&mut self, subscriber: u64) {
        self.subscribers.remove(&subscriber);
    }

    fn restart(&mut self, rt: &Handle, shared: Weak<Shared>) {
        self.last_value = None;
        self.value_expiry_deadline = None;
        self.start(rt, shared);
    }

    fn shutdown(&mut self, notice: Option<QueryError>) {
        self.state.abort_pipeline();
        self.state.cancel_teardown();
        if let Some(err) = notice {
            self.broadcast(&Err(err));
        }
        drop(mem::take(&mut self.subscribers));
    }
}
