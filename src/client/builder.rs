//! Builder for configuring client instances

use std::path::Path;
use std::time::Duration;

use tracing::info;

use super::Client;
use crate::Result;
use crate::cache::{CacheConfig, QueryManager};

/// Builder for configuring client instances.
///
/// ```rust
/// # use chain_query::Client;
/// # use std::time::Duration;
/// let client = Client::builder()
///     .observable_cache_time(Duration::from_secs(30))
///     .value_cache_time(Duration::from_secs(5))
///     .build()
///     .unwrap();
/// assert_eq!(client.manager().config().value_cache_time, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    config: CacheConfig,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all cache defaults at once.
    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Load cache defaults from the `[cache]` table of a TOML file.
    pub fn load_config(mut self, path: &Path) -> Result<Self> {
        self.config = CacheConfig::load(path)?;
        Ok(self)
    }

    /// Set the grace period before an unused entry is evicted.
    pub fn observable_cache_time(mut self, d: Duration) -> Self {
        self.config.observable_cache_time = d;
        self
    }

    /// Set how long the last value stays eligible for replay.
    pub fn value_cache_time(mut self, d: Duration) -> Self {
        self.config.value_cache_time = d;
        self
    }

    /// Make every query uncached unless it opts back in.
    pub fn disable_cache(mut self) -> Self {
        self.config.cache = false;
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<Client> {
        let manager = QueryManager::new(self.config)?;
        let config = manager.config();
        info!(
            cache = config.cache,
            observable_cache_time_ms = config.observable_cache_time.as_millis() as u64,
            value_cache_time_ms = config.value_cache_time.as_millis() as u64,
            "query client ready"
        );
        Ok(Client::from_manager(manager))
    }
}
