//! Entity namespacing.
//!
//! Every domain object (pool, share class, account, report, and their
//! Solana counterparts) owns an immutable key prefix and issues its reads
//! through an [`Entity`]. The full cache key is always
//! `prefix ++ local_key`, so two entities never collide on a key even when
//! their local keys coincide, and everything an entity cached can be
//! invalidated with one prefix sweep.
//!
//! ```rust,no_run
//! use chain_query::{key, producer, Entity, QueryManager, QueryOptions};
//!
//! struct Pool {
//!     entity: Entity,
//! }
//!
//! impl Pool {
//!     fn new(manager: QueryManager, pool_id: u64) -> Self {
//!         Self { entity: Entity::new(manager, key!["pool", pool_id]) }
//!     }
//!
//!     fn nav(&self) -> chain_query::Result<chain_query::Query<u128>> {
//!         self.entity.query(
//!             Some(key!["nav"]),
//!             producer::once(|| async { Ok(42u128) }),
//!             &QueryOptions::default(),
//!         )
//!     }
//! }
//! ```

use crate::cache::{Query, QueryManager, QueryOptions};
use crate::key::{KeyPart, QueryKey};
use crate::producer::Producer;
use crate::Result;

/// A namespace prefix bound to a query manager.
#[derive(Debug, Clone)]
pub struct Entity {
    manager: QueryManager,
    prefix: QueryKey,
}

impl Entity {
    pub fn new(manager: QueryManager, prefix: QueryKey) -> Self {
        Self { manager, prefix }
    }

    pub fn prefix(&self) -> &QueryKey {
        &self.prefix
    }

    pub fn manager(&self) -> &QueryManager {
        &self.manager
    }

    /// Full cache key for a local key.
    pub fn key(&self, local: &QueryKey) -> QueryKey {
        self.prefix.join(local)
    }

    /// Issue a read under this entity's namespace.
    ///
    /// `local_key == None` bypasses the cache, like an absent key on
    /// [`QueryManager::acquire`].
    pub fn query<T, P>(
        &self,
        local_key: Option<QueryKey>,
        producer: P,
        options: &QueryOptions,
    ) -> Result<Query<T>>
    where
        T: Clone + Send + Sync + 'static,
        P: Producer<T>,
    {
        let key = local_key.map(|local| self.key(&local));
        self.manager.acquire(key, producer, options)
    }

    /// Nested namespace, e.g. a share class under its pool.
    pub fn child(&self, segment: QueryKey) -> Entity {
        Entity {
            manager: self.manager.clone(),
            prefix: self.prefix.join(&segment),
        }
    }

    /// Nested namespace from a single part.
    pub fn child_part(&self, part: impl Into<KeyPart>) -> Entity {
        self.child(QueryKey::new(vec![part.into()]))
    }

    /// Invalidate everything cached under this namespace, including child
    /// entities. Returns the number of entries touched.
    pub fn invalidate(&self) -> usize {
        self.manager.invalidate_prefix(&self.prefix)
    }
}
