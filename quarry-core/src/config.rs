//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigError, QuarryResult};
use crate::policy::CachePolicy;

/// Durable store location and sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the store files. Created if absent.
    pub path: PathBuf,
    /// Maximum size of the memory map in megabytes.
    #[serde(default = "default_map_size_mb")]
    pub map_size_mb: usize,
}

fn default_map_size_mb() -> usize {
    64
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            map_size_mb: default_map_size_mb(),
        }
    }

    pub fn with_map_size_mb(mut self, map_size_mb: usize) -> Self {
        self.map_size_mb = map_size_mb;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(".quarry/cache")
    }
}

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarryConfig {
    #[serde(default)]
    pub store: StoreConfig,
    /// Policy used by `fetch_with_default_policy`.
    #[serde(default)]
    pub default_fetch_policy: CachePolicy,
    /// Policy bound to watchers unless one is given explicitly.
    #[serde(default)]
    pub default_watch_policy: CachePolicy,
    /// Upper bound on load/resolve rounds for one cache read.
    #[serde(default = "default_max_resolution_rounds")]
    pub max_resolution_rounds: usize,
    /// Advisory per-request timeout forwarded to the transport.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

fn default_max_resolution_rounds() -> usize {
    16
}

impl Default for QuarryConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            default_fetch_policy: CachePolicy::CacheThenFetch,
            default_watch_policy: CachePolicy::CacheThenFetch,
            max_resolution_rounds: default_max_resolution_rounds(),
            request_timeout_ms: None,
        }
    }
}

impl QuarryConfig {
    pub fn new(store: StoreConfig) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    /// Set the default fetch policy.
    pub fn with_fetch_policy(mut self, policy: CachePolicy) -> Self {
        self.default_fetch_policy = policy;
        self
    }

    /// Set the default watch policy.
    pub fn with_watch_policy(mut self, policy: CachePolicy) -> Self {
        self.default_watch_policy = policy;
        self
    }

    /// Set the resolution round bound.
    pub fn with_max_resolution_rounds(mut self, rounds: usize) -> Self {
        self.max_resolution_rounds = rounds;
        self
    }

    /// Set the advisory request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `QUARRY_STORE_PATH`: Store directory (default: `.quarry/cache`)
    /// - `QUARRY_MAP_SIZE_MB`: Memory map size (default: 64)
    /// - `QUARRY_FETCH_POLICY`: Default fetch policy (default: cache_then_fetch)
    /// - `QUARRY_WATCH_POLICY`: Default watch policy (default: cache_then_fetch)
    /// - `QUARRY_MAX_RESOLUTION_ROUNDS`: Resolution bound (default: 16)
    /// - `QUARRY_REQUEST_TIMEOUT_MS`: Advisory request timeout (default: none)
    ///
    /// Unparseable values fall back to the default; call [`validate`](Self::validate)
    /// afterwards to reject out-of-range ones.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            store: StoreConfig {
                path: lookup("QUARRY_STORE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.store.path),
                map_size_mb: lookup("QUARRY_MAP_SIZE_MB")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.store.map_size_mb),
            },
            default_fetch_policy: lookup("QUARRY_FETCH_POLICY")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.default_fetch_policy),
            default_watch_policy: lookup("QUARRY_WATCH_POLICY")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.default_watch_policy),
            max_resolution_rounds: lookup("QUARRY_MAX_RESOLUTION_ROUNDS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_resolution_rounds),
            request_timeout_ms: lookup("QUARRY_REQUEST_TIMEOUT_MS")
                .and_then(|s| s.parse().ok())
                .or(defaults.request_timeout_ms),
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(source: &str) -> QuarryResult<Self> {
        toml::from_str(source).map_err(|e| {
            ConfigError::InvalidValue {
                field: "toml".to_string(),
                value: source.lines().next().unwrap_or_default().to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Validate the configuration.
    /// Returns Ok(()) if valid, Err(QuarryError::Config) if invalid.
    pub fn validate(&self) -> QuarryResult<()> {
        if self.store.path.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "store.path".to_string(),
            }
            .into());
        }

        if self.store.map_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "store.map_size_mb".to_string(),
                value: self.store.map_size_mb.to_string(),
                reason: "map_size_mb must be greater than 0".to_string(),
            }
            .into());
        }

        if self.max_resolution_rounds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_resolution_rounds".to_string(),
                value: self.max_resolution_rounds.to_string(),
                reason: "max_resolution_rounds must be greater than 0".to_string(),
            }
            .into());
        }

        if self.request_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms".to_string(),
                value: "0".to_string(),
                reason: "request_timeout_ms must be positive when set".to_string(),
            }
            .into());
        }

        Ok(())
    }
}
