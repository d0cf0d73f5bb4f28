//! Query cache engine.
//!
//! - [`QueryManager`]: owns the key → entry table; one per SDK client.
//! - [`Query`] / [`Subscription`]: the dual single-value/streaming
//!   handle returned by every read.
//! - [`CacheConfig`] / [`QueryOptions`]: manager defaults and per-call
//!   overrides for the two cache timers.
//!
//! # Guarantees
//!
//! - At most one live pipeline per key: concurrent consumers of the same
//!   key share one producer invocation.
//! - Consumers of one entry observe the same emissions in the same order,
//!   and never miss an emission made after they attached.
//! - A consumer attaching while the last value is within
//!   `value_cache_time` receives it first, without re-running the producer.
//! - An entry with no consumers survives `observable_cache_time` before it
//!   is evicted; re-attaching in that window reuses the running pipeline.
//! - A producer error reaches every attached consumer and evicts the entry
//!   immediately, so the next read retries.

mod entry;
mod handle;
mod manager;
pub mod options;

pub use entry::{EntryStats, Phase};
pub use handle::{Query, Subscription};
pub use manager::QueryManager;
pub use options::{CacheConfig, QueryOptions};
