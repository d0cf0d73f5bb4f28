//! Producer contract.
//!
//! A producer is a zero-argument factory returning a fresh stream of
//! `Result<T>` each time it is invoked. The cache invokes it at most once
//! per pipeline and may invoke it again after eviction or invalidation,
//! so it must not assume anything about earlier invocations or about how
//! many consumers are attached.
//!
//! Any `Fn() -> impl Stream<Item = Result<T>>` closure is a [`Producer`].
//! The adapters below cover the common shapes of RPC and indexer reads:
//!
//! - [`once`]: a single async call, e.g. one `eth_call`
//! - [`poll`]: the same call repeated on an interval, e.g. block head
//! - [`from_stream`]: any stream factory, e.g. a websocket subscription
//!
//! Dropping the stream is its teardown hook: the cache drops it only when
//! the owning entry is actually evicted.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future;
use futures_util::stream::{self, Stream, StreamExt};
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;

use crate::Result;

/// Boxed stream returned by every producer invocation.
pub type BoxQueryStream<T> = Pin<Box<dyn Stream<Item = Result<T>> + Send>>;

/// Smallest accepted polling period.
const MIN_POLL_PERIOD: Duration = Duration::from_millis(1);

/// Factory for the stream backing one pipeline.
pub trait Producer<T>: Send + Sync + 'static {
    /// Start a fresh stream.
    fn produce(&self) -> BoxQueryStream<T>;
}

impl<T, F, S> Producer<T> for F
where
    F: Fn() -> S + Send + Sync + 'static,
    S: Stream<Item = Result<T>> + Send + 'static,
{
    fn produce(&self) -> BoxQueryStream<T> {
        Box::pin(self())
    }
}

/// Producer emitting the output of a single async call, then completing.
pub fn once<T, F, Fut>(f: F) -> impl Producer<T>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    move || -> BoxQueryStream<T> { Box::pin(stream::once(f())) }
}

/// Producer repeating an async call every `period`, first call immediate.
///
/// The stream ends after the first error (the error itself is emitted).
/// A period shorter than 1ms is clamped.
pub fn poll<T, F, Fut>(period: Duration, f: F) -> impl Producer<T>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let f = Arc::new(f);
    let period = period.max(MIN_POLL_PERIOD);
    move || -> BoxQueryStream<T> {
        let f = Arc::clone(&f);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let calls = IntervalStream::new(interval).then(move |_| (*f)());
        Box::pin(calls.scan(false, |failed, item| {
            if *failed {
                return future::ready(None);
            }
            *failed = item.is_err();
            future::ready(Some(item))
        }))
    }
}

/// Producer wrapping an arbitrary stream factory.
pub fn from_stream<T, F, S>(f: F) -> impl Producer<T>
where
    T: Send + 'static,
    F: Fn() -> S + Send + Sync + 'static,
    S: Stream<Item = Result<T>> + Send + 'static,
{
    move || -> BoxQueryStream<T> { Box::pin(f()) }
}
