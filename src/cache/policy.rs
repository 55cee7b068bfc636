//! Per-category cache policies.

use serde::{Deserialize, Serialize};

use crate::error::SdkError;

/// Kind of data a cache entry holds. Each kind has its own freshness policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCategory {
    OraclePrices,
    ProtocolSettings,
    UserBalances,
    AmmQuotes,
}

impl CacheCategory {
    pub const ALL: [CacheCategory; 4] = [
        CacheCategory::OraclePrices,
        CacheCategory::ProtocolSettings,
        CacheCategory::UserBalances,
        CacheCategory::AmmQuotes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCategory::OraclePrices => "oracle_prices",
            CacheCategory::ProtocolSettings => "protocol_settings",
            CacheCategory::UserBalances => "user_balances",
            CacheCategory::AmmQuotes => "amm_quotes",
        }
    }

    pub fn default_options(&self) -> CacheOptions {
        match self {
            CacheCategory::OraclePrices => CacheOptions {
                ttl_ms: 15_000,
                allow_stale_fallback: true,
                max_stale_age_ms: 300_000,
                fallback_on_upstream_staleness: true,
                persist: true,
            },
            CacheCategory::ProtocolSettings => CacheOptions {
                ttl_ms: 60_000,
                allow_stale_fallback: true,
                max_stale_age_ms: 600_000,
                fallback_on_upstream_staleness: true,
                persist: true,
            },
            // Balances are user-specific; showing an old balance is worse than an error.
            CacheCategory::UserBalances => CacheOptions {
                ttl_ms: 12_000,
                allow_stale_fallback: false,
                max_stale_age_ms: 0,
                fallback_on_upstream_staleness: false,
                persist: false,
            },
            CacheCategory::AmmQuotes => CacheOptions {
                ttl_ms: 12_000,
                allow_stale_fallback: true,
                max_stale_age_ms: 60_000,
                fallback_on_upstream_staleness: true,
                persist: false,
            },
        }
    }
}

impl std::fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable freshness policy for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Entries younger than this are served without touching the network.
    pub ttl_ms: u64,
    /// Serve the previous value when a refetch fails with a fetch error.
    #[serde(default)]
    pub allow_stale_fallback: bool,
    /// Absolute ceiling on the age of data served as stale.
    #[serde(default)]
    pub max_stale_age_ms: u64,
    /// Serve the previous value when the source reports its own inputs are stale,
    /// even if `allow_stale_fallback` is off.
    #[serde(default)]
    pub fallback_on_upstream_staleness: bool,
    /// Mirror successful and stale-fallback results into durable storage.
    #[serde(default)]
    pub persist: bool,
}

impl CacheOptions {
    /// Whether `err` may be answered with an entry that is still within `max_stale_age_ms`.
    pub fn permits_fallback(&self, err: &SdkError) -> bool {
        if !err.allows_stale_fallback() {
            return false;
        }
        self.allow_stale_fallback
            || (self.fallback_on_upstream_staleness && err.is_upstream_staleness())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balances_never_fall_back() {
        let opts = CacheCategory::UserBalances.default_options();
        assert!(!opts.permits_fallback(&SdkError::TransientFetch("timeout".into())));
        assert!(!opts.permits_fallback(&SdkError::UpstreamStaleness("stale".into())));
    }

    #[test]
    fn upstream_staleness_flag_is_independent() {
        let opts = CacheOptions {
            ttl_ms: 1_000,
            allow_stale_fallback: false,
            max_stale_age_ms: 10_000,
            fallback_on_upstream_staleness: true,
            persist: false,
        };
        assert!(opts.permits_fallback(&SdkError::UpstreamStaleness("oracle".into())));
        assert!(!opts.permits_fallback(&SdkError::TransientFetch("timeout".into())));
        assert!(!opts.permits_fallback(&SdkError::PolicyViolation("paused".into())));
    }
}
