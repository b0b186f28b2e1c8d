//! Configuration management for the client.

use harbor_engine::{BackoffPolicy, CacheConfig, QueueConfig, StoreConfig};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Client configuration, loadable from `HARBOR_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Where the persisted document lives; `None` keeps state in memory
    pub state_path: Option<PathBuf>,
    /// Maximum mutations in flight at once
    pub concurrency: usize,
    /// Delivery attempts before a mutation fails terminally
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Periodic sync interval while online
    pub tick_interval: Duration,
    /// Bound on every gateway call
    pub request_timeout: Duration,
    /// Default freshness window of fetched data
    pub stale_time: Duration,
    /// Grace period before unwatched cache entries are collected
    pub gc_time: Duration,
    /// Debounce for cache-only saves
    pub save_debounce: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_path: None,
            concurrency: 4,
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            tick_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(15),
            stale_time: Duration::from_secs(30),
            gc_time: Duration::from_secs(30 * 60),
            save_debounce: Duration::from_secs(2),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let secs = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            parse(&lookup, name).map(|v: Option<u64>| v.map_or(default, Duration::from_secs))
        };
        let ms = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            parse(&lookup, name).map(|v: Option<u64>| v.map_or(default, Duration::from_millis))
        };

        let concurrency = parse(&lookup, "HARBOR_CONCURRENCY")?.unwrap_or(defaults.concurrency);
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                name: "HARBOR_CONCURRENCY",
                value: "0".into(),
            });
        }

        Ok(Self {
            state_path: lookup("HARBOR_STATE_PATH").map(PathBuf::from),
            concurrency,
            max_attempts: parse(&lookup, "HARBOR_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            backoff_base: ms("HARBOR_BACKOFF_BASE_MS", defaults.backoff_base)?,
            backoff_cap: ms("HARBOR_BACKOFF_CAP_MS", defaults.backoff_cap)?,
            tick_interval: secs("HARBOR_TICK_SECS", defaults.tick_interval)?,
            request_timeout: secs("HARBOR_REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            stale_time: secs("HARBOR_STALE_SECS", defaults.stale_time)?,
            gc_time: secs("HARBOR_GC_SECS", defaults.gc_time)?,
            save_debounce: ms("HARBOR_SAVE_DEBOUNCE_MS", defaults.save_debounce)?,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.backoff_base,
            cap: self.backoff_cap,
            max_attempts: self.max_attempts,
            ..BackoffPolicy::default()
        }
    }

    /// The engine-side settings.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            cache: CacheConfig {
                stale_time: self.stale_time,
                gc_time: self.gc_time,
            },
            queue: QueueConfig {
                concurrency: self.concurrency,
                backoff: self.backoff(),
            },
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}
