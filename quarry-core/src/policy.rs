//! Cache policies governing cache-versus-network precedence for one dispatch.
//!
//! Callers choose a policy per call. The policy is evaluated once when the
//! dispatch starts and never changes while it is in flight.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Strategy for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Emit a cached result if present, then always fetch.
    ///
    /// A fetch failure is only reported when there was no cache hit.
    #[default]
    CacheThenFetch,

    /// Skip the cache read, fetch, and write the result into the cache.
    FetchOnly,

    /// Skip the cache read and the cache write. The cache is untouched.
    FetchOnlyNoStore,

    /// Read the cache only. A miss is reported as an error; the transport is
    /// never contacted.
    CacheOnly,

    /// Like `CacheThenFetch`, but always emits both a cache attempt (hit or
    /// explicit miss) and a fetch attempt (success or failure).
    CacheThenFetchAlways,
}

impl CachePolicy {
    pub const ALL: [CachePolicy; 5] = [
        CachePolicy::CacheThenFetch,
        CachePolicy::FetchOnly,
        CachePolicy::FetchOnlyNoStore,
        CachePolicy::CacheOnly,
        CachePolicy::CacheThenFetchAlways,
    ];

    /// Returns true if this policy reads the cache before fetching.
    pub fn reads_cache(&self) -> bool {
        matches!(
            self,
            Self::CacheThenFetch | Self::CacheOnly | Self::CacheThenFetchAlways
        )
    }

    /// Returns true if this policy contacts the transport.
    pub fn fetches(&self) -> bool {
        !matches!(self, Self::CacheOnly)
    }

    /// Returns true if a successful fetch is merged into the cache.
    pub fn writes_result(&self) -> bool {
        matches!(
            self,
            Self::CacheThenFetch | Self::FetchOnly | Self::CacheThenFetchAlways
        )
    }

    /// Returns true if a cache miss is emitted as an explicit result.
    pub fn reports_cache_miss(&self) -> bool {
        matches!(self, Self::CacheOnly | Self::CacheThenFetchAlways)
    }

    /// Returns true if a fetch failure after a cache hit is suppressed.
    pub fn suppresses_fetch_error_after_hit(&self) -> bool {
        matches!(self, Self::CacheThenFetch)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheThenFetch => "cache_then_fetch",
            Self::FetchOnly => "fetch_only",
            Self::FetchOnlyNoStore => "fetch_only_no_store",
            Self::CacheOnly => "cache_only",
            Self::CacheThenFetchAlways => "cache_then_fetch_always",
        }
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CachePolicy {
    type Err = ConfigError;

    /// Accepts snake_case (`cache_then_fetch`) and camelCase (`cacheThenFetch`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();

        match normalized.as_str() {
            "cachethenfetch" => Ok(Self::CacheThenFetch),
            "fetchonly" => Ok(Self::FetchOnly),
            "fetchonlynostore" => Ok(Self::FetchOnlyNoStore),
            "cacheonly" => Ok(Self::CacheOnly),
            "cachethenfetchalways" => Ok(Self::CacheThenFetchAlways),
            _ => Err(ConfigError::InvalidValue {
                field: "cache_policy".to_string(),
                value: s.to_string(),
                reason: "unknown cache policy".to_string(),
            }),
        }
    }
}
