//! chain-query - shared query cache for multi-chain protocol SDKs
//!
//! Every read an SDK domain object performs (pool NAV, share class
//! prices, account balances, reports, and their Solana equivalents) goes
//! through one [`QueryManager`]. The manager deduplicates concurrent
//! reads of the same key onto one producer invocation, multicasts its
//! emissions to every consumer, replays the latest value to late
//! consumers, and keeps idle pipelines alive for a grace period to absorb
//! resubscribe churn.
//!
//! The actual RPC, indexer, and websocket calls are external
//! collaborators plugged in through the [`Producer`] contract.
//!
//! # Example
//!
//! ```rust,no_run
//! use chain_query::{Client, QueryOptions, key, producer};
//! use futures_util::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> chain_query::Result<()> {
//!     let client = Client::builder().build()?;
//!     let pool = client.evm(1).child(key!["pool", 7]);
//!
//!     let nav = pool.query(
//!         Some(key!["nav"]),
//!         producer::poll(std::time::Duration::from_secs(12), || async {
//!             // eth_call against the pool contract
//!             Ok(1_000_000u128)
//!         }),
//!         &QueryOptions::default(),
//!     )?;
//!
//!     // Single value
//!     println!("nav: {}", nav.get().await?);
//!
//!     // Stream of updates, sharing the same pipeline
//!     let mut updates = nav.subscribe();
//!     while let Some(value) = updates.next().await {
//!         println!("nav update: {}", value?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod client;
pub mod entity;
pub mod error;
pub mod key;
pub mod producer;
pub mod telemetry;

// Re-export main types at crate root
pub use cache::{
    CacheConfig, EntryStats, Phase, Query, QueryManager, QueryOptions, Subscription,
};
pub use client::{Client, ClientBuilder};
pub use entity::Entity;
pub use error::{QueryError, Result};
pub use key::{KeyPart, QueryKey};
pub use producer::{BoxQueryStream, Producer};
