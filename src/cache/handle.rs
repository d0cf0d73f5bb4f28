//! Query handles.
//!
//! [`Query<T>`] is what every domain read returns. It is a lazy
//! description of the read (key, producer, options); consuming it
//! attaches to the shared pipeline:
//!
//! - single value: `query.get().await`, `query.await` or `(&query).await`
//!   attach, resolve with the first observed value (the replayed value
//!   counts) or error, then detach
//! - streaming: [`Query::subscribe`] returns a [`Subscription`] that
//!   yields every emission until dropped
//!
//! Both modes go through the same entry, so they never start a second
//! pipeline for the same key.

use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use pin_project_lite::pin_project;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::AbortHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::manager::{Shared, attach_private};
use super::options::CacheConfig;
use crate::key::QueryKey;
use crate::producer::Producer;
use crate::{QueryError, Result};

/// Dual-mode handle over one cached (or private) pipeline.
pub struct Query<T> {
    shared: Arc<Shared>,
    key: Option<QueryKey>,
    producer: Arc<dyn Producer<T>>,
    options: CacheConfig,
}

impl<T> Query<T> {
    pub(crate) fn new(
        shared: Arc<Shared>,
        key: Option<QueryKey>,
        producer: Arc<dyn Producer<T>>,
        options: CacheConfig,
    ) -> Self {
        Self {
            shared,
            key,
            producer,
            options,
        }
    }

    /// Cache key, or `None` for an uncached query.
    pub fn key(&self) -> Option<&QueryKey> {
        self.key.as_ref()
    }

    pub fn is_cached(&self) -> bool {
        self.key.is_some()
    }

    /// Options resolved against the manager defaults.
    pub fn options(&self) -> &CacheConfig {
        &self.options
    }
}

impl<T: Clone + Send + Sync + 'static> Query<T> {
    /// Attach a streaming consumer.
    ///
    /// Attach-time failures (no tokio runtime, key re-used with another
    /// value type) are delivered as the first and only item.
    pub fn subscribe(&self) -> Subscription<T> {
        match &self.key {
            Some(key) => self.shared.attach(key, &self.producer, &self.options),
            None => attach_private(&self.producer),
        }
    }

    /// Wait for one value.
    ///
    /// Returns [`QueryError::Completed`] if the pipeline ends without
    /// producing anything.
    pub async fn get(&self) -> Result<T> {
        let mut subscription = self.subscribe();
        subscription.next().await.unwrap_or(Err(QueryError::Completed))
    }
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            key: self.key.clone(),
            producer: Arc::clone(&self.producer),
            options: self.options.clone(),
        }
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.key)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for Query<T> {
    type Output = Result<T>;
    type IntoFuture = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.get().await })
    }
}

impl<'a, T: Clone + Send + Sync + 'static> IntoFuture for &'a Query<T> {
    type Output = Result<T>;
    type IntoFuture = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.get())
    }
}

/// How a subscription is tied to its pipeline; dropping it detaches.
enum Attachment {
    Cached {
        /// Runtime the consumer attached on; detach schedules teardown here.
        rt: Handle,
        shared: Arc<Shared>,
        key: QueryKey,
        entry_id: u64,
        subscriber_id: u64,
    },
    /// Private pipeline, torn down with the subscription.
    Private(AbortHandle),
    /// Attach failed; the error is already queued.
    Detached,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        match self {
            Attachment::Cached {
                rt,
                shared,
                key,
                entry_id,
                subscriber_id,
            } => shared.detach(rt, key, *entry_id, *subscriber_id),
            Attachment::Private(task) => task.abort(),
            Attachment::Detached => {}
        }
    }
}

pin_project! {
    /// Streaming attachment to a query pipeline.
    ///
    /// Yields every emission in order while attached. After an error the
    /// stream yields that error and ends. Dropping the subscription
    /// detaches it; other consumers of the same key are unaffected.
    pub struct Subscription<T> {
        #[pin]
        inner: UnboundedReceiverStream<Result<Arc<T>>>,
        attachment: Attachment,
    }
}

impl<T> Subscription<T> {
    pub(crate) fn cached(
        rx: UnboundedReceiver<Result<Arc<T>>>,
        rt: Handle,
        shared: Arc<Shared>,
        key: QueryKey,
        entry_id: u64,
        subscriber_id: u64,
    ) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
            attachment: Attachment::Cached {
                rt,
                shared,
                key,
                entry_id,
                subscriber_id,
            },
        }
    }

    pub(crate) fn private(rx: UnboundedReceiver<Result<Arc<T>>>, task: AbortHandle) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
            attachment: Attachment::Private(task),
        }
    }

    pub(crate) fn failed(err: QueryError) -> Self {
        let (delivery, rx) = mpsc::unbounded_channel();
        let _ = delivery.send(Err(err));
        Self {
            inner: UnboundedReceiverStream::new(rx),
            attachment: Attachment::Detached,
        }
    }

    /// Key of the shared entry this subscription is attached to.
    pub fn key(&self) -> Option<&QueryKey> {
        match &self.attachment {
            Attachment::Cached { key, .. } => Some(key),
            _ => None,
        }
    }
}

impl<T: Clone> Stream for Subscription<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // Shared values are cloned here, outside the manager lock.
        self.project()
            .inner
            .poll_next(cx)
            .map(|item| item.map(|res| res.map(Arc::unwrap_or_clone)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key())
            .finish_non_exhaustive()
    }
}
