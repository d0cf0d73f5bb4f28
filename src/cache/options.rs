//! Cache timing options.
//!
//! [`CacheConfig`] holds the manager-wide defaults; [`QueryOptions`]
//! overrides them per call. Unset fields in [`QueryOptions`] fall back to
//! the manager's [`CacheConfig`].
//!
//! Configuration can also be loaded from TOML:
//!
//! ```toml
//! [cache]
//! enabled = true
//! observable_cache_time_ms = 5000
//! value_cache_time_ms = 2000
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{QueryError, Result};

/// Default grace period before an entry with no subscribers is evicted.
pub const DEFAULT_OBSERVABLE_CACHE_TIME: Duration = Duration::from_secs(5);

/// Default window during which the last value is replayed to new
/// subscribers.
pub const DEFAULT_VALUE_CACHE_TIME: Duration = Duration::from_secs(2);

/// Upper bound on either duration. Anything above cannot be scheduled
/// reliably as a timer deadline.
pub const MAX_CACHE_TIME: Duration = Duration::from_secs(365 * 24 * 3600);

/// Manager-wide cache defaults.
///
/// ```rust
/// # use chain_query::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .observable_cache_time(Duration::from_secs(30))
///     .value_cache_time(Duration::from_secs(10));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Whether keyed queries are cached at all. Default: true.
    pub cache: bool,
    /// Draining grace period. Default: 5s.
    pub observable_cache_time: Duration,
    /// Replay freshness window. Default: 2s.
    pub value_cache_time: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache: true,
            observable_cache_time: DEFAULT_OBSERVABLE_CACHE_TIME,
            value_cache_time: DEFAULT_VALUE_CACHE_TIME,
        }
    }
}

impl CacheConfig {
    /// Create a config with the default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable caching of keyed queries.
    pub fn cache(mut self, enabled: bool) -> Self {
        self.cache = enabled;
        self
    }

    /// Set the grace period before an unused entry is evicted.
    pub fn observable_cache_time(mut self, d: Duration) -> Self {
        self.observable_cache_time = d;
        self
    }

    /// Set how long the last value stays eligible for replay.
    pub fn value_cache_time(mut self, d: Duration) -> Self {
        self.value_cache_time = d;
        self
    }

    /// Reject durations that cannot be scheduled.
    pub fn validate(&self) -> Result<()> {
        check_duration("observable_cache_time", self.observable_cache_time)?;
        check_duration("value_cache_time", self.value_cache_time)
    }

    /// Parse a `[cache]` table from a TOML document.
    ///
    /// Missing fields keep their defaults. Negative durations are
    /// rejected with [`QueryError::InvalidOptions`].
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| QueryError::Configuration(format!("Failed to parse cache config: {e}")))?;
        file.cache.try_into()
    }

    /// Load the `[cache]` table from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            QueryError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        Self::from_toml_str(&content)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    cache: RawCacheConfig,
}

/// On-disk form of [`CacheConfig`]. Millisecond fields are signed so a
/// negative value is reported as misuse instead of a parse failure.
#[derive(Debug, Default, Deserialize)]
struct RawCacheConfig {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    observable_cache_time_ms: Option<i64>,
    #[serde(default)]
    value_cache_time_ms: Option<i64>,
}

impl TryFrom<RawCacheConfig> for CacheConfig {
    type Error = QueryError;

    fn try_from(raw: RawCacheConfig) -> Result<Self> {
        let defaults = CacheConfig::default();
        let config = CacheConfig {
            cache: raw.enabled.unwrap_or(defaults.cache),
            observable_cache_time: match raw.observable_cache_time_ms {
                Some(ms) => millis("observable_cache_time_ms", ms)?,
                None => defaults.observable_cache_time,
            },
            value_cache_time: match raw.value_cache_time_ms {
                Some(ms) => millis("value_cache_time_ms", ms)?,
                None => defaults.value_cache_time,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

fn millis(field: &str, ms: i64) -> Result<Duration> {
    u64::try_from(ms)
        .map(Duration::from_millis)
        .map_err(|_| QueryError::InvalidOptions(format!("{field} must not be negative, got {ms}")))
}

fn check_duration(field: &str, d: Duration) -> Result<()> {
    if d > MAX_CACHE_TIME {
        return Err(QueryError::InvalidOptions(format!(
            "{field} of {d:?} exceeds the maximum of {MAX_CACHE_TIME:?}"
        )));
    }
    Ok(())
}

/// Per-call overrides for a single query.
///
/// ```rust
/// # use chain_query::QueryOptions;
/// # use std::time::Duration;
/// let opts = QueryOptions::new().value_cache_time(Duration::ZERO);
/// let uncached = QueryOptions::uncached();
/// assert_eq!(uncached.cache, Some(false));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub cache: Option<bool>,
    pub observable_cache_time: Option<Duration>,
    pub value_cache_time: Option<Duration>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options that bypass the cache for this call.
    pub fn uncached() -> Self {
        Self::default().cache(false)
    }

    pub fn cache(mut self, enabled: bool) -> Self {
        self.cache = Some(enabled);
        self
    }

    pub fn observable_cache_time(mut self, d: Duration) -> Self {
        self.observable_cache_time = Some(d);
        self
    }

    pub fn value_cache_time(mut self, d: Duration) -> Self {
        self.value_cache_time = Some(d);
        self
    }

    /// Fill unset fields from `defaults` and validate the result.
    pub(crate) fn resolve(&self, defaults: &CacheConfig) -> Result<CacheConfig> {
        let resolved = CacheConfig {
            cache: self.cache.unwrap_or(defaults.cache),
            observable_cache_time: self
                .observable_cache_time
                .unwrap_or(defaults.observable_cache_time),
            value_cache_time: self.value_cache_time.unwrap_or(defaults.value_cache_time),
        };
        resolved.validate()?;
        Ok(resolved)
    }
}
