//! SDK client facade.
//!
//! A [`Client`] owns the [`QueryManager`] for one SDK instance and hands
//! out [`Entity`] namespaces to the domain objects built on top of it.
//! Two clients never share cache state.

mod builder;

pub use builder::ClientBuilder;

use crate::cache::{Query, QueryManager, QueryOptions};
use crate::entity::Entity;
use crate::key::QueryKey;
use crate::producer::Producer;
use crate::{Result, key};

/// One SDK client instance and its query cache.
#[derive(Debug, Clone)]
pub struct Client {
    manager: QueryManager,
}

impl Client {
    /// Create a new builder for configuring the client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(crate) fn from_manager(manager: QueryManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &QueryManager {
        &self.manager
    }

    /// Namespace for a domain object.
    pub fn entity(&self, prefix: QueryKey) -> Entity {
        Entity::new(self.manager.clone(), prefix)
    }

    /// Namespace for reads against one EVM chain.
    pub fn evm(&self, chain_id: u64) -> Entity {
        self.entity(key!["evm", chain_id])
    }

    /// Namespace for reads against the Solana deployment.
    pub fn solana(&self) -> Entity {
        self.entity(key!["solana"])
    }

    /// Un-namespaced read, for client-level queries (e.g. currency
    /// metadata shared by every chain).
    pub fn query<T, P>(
        &self,
        key: Option<QueryKey>,
        producer: P,
        options: &QueryOptions,
    ) -> Result<Query<T>>
    where
        T: Clone + Send + Sync + 'static,
        P: Producer<T>,
    {
        self.manager.acquire(key, producer, options)
    }

    /// Drop all cached state. Attached consumers receive
    /// [`QueryError::Closed`](crate::QueryError::Closed).
    pub fn clear_cache(&self) {
        self.manager.clear();
    }
}
