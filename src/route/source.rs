//! Where the route engine gets its prices, fees and quotes.

use crate::cache::{CacheCategory, CacheOptions, TtlCache};
use crate::error::Result;
use crate::types::{AmmQuote, Direction, OraclePrices, ProtocolState};
use async_trait::async_trait;
use ethers::types::U256;
use std::sync::Arc;

#[async_trait]
pub trait RouteInputs: Send + Sync {
    async fn protocol_state(&self) -> Result<ProtocolState>;
    async fn oracle_prices(&self) -> Result<OraclePrices>;
    /// Venue output for swapping `amount_in` in `direction`.
    async fn amm_quote(&self, direction: Direction, amount_in: U256) -> Result<AmmQuote>;
}

/// Cache policy per category used by [`CachedRouteInputs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteCachePolicies {
    pub protocol_settings: CacheOptions,
    pub oracle_prices: CacheOptions,
    pub amm_quotes: CacheOptions,
}

impl Default for RouteCachePolicies {
    fn default() -> Self {
        Self {
            protocol_settings: CacheCategory::ProtocolSettings.default_options(),
            oracle_prices: CacheCategory::OraclePrices.default_options(),
            amm_quotes: CacheCategory::AmmQuotes.default_options(),
        }
    }
}

/// Caches for the three route input categories.
#[derive(Clone)]
pub struct RouteCaches {
    pub protocol_settings: TtlCache<ProtocolState>,
    pub oracle_prices: TtlCache<OraclePrices>,
    pub amm_quotes: TtlCache<AmmQuote>,
}

/// Reads route inputs through the TTL caches, so concurrent route requests share
/// one fetch per key and oracle hiccups can be answered with recent data.
pub struct CachedRouteInputs {
    upstream: Arc<dyn RouteInputs>,
    caches: RouteCaches,
    policies: RouteCachePolicies,
}

impl CachedRouteInputs {
    pub fn new(
        upstream: Arc<dyn RouteInputs>,
        caches: RouteCaches,
        policies: RouteCachePolicies,
    ) -> Self {
        Self {
            upstream,
            caches,
            policies,
        }
    }

    pub fn caches(&self) -> &RouteCaches {
        &self.caches
    }
}

pub const PROTOCOL_STATE_KEY: &str = "protocol-state";
pub const ORACLE_PRICES_KEY: &str = "oracle-prices";

/// Quotes are keyed by direction and exact input amount.
pub fn amm_quote_key(direction: Direction, amount_in: U256) -> String {
    format!("amm-quote:{}:{}", direction.as_str(), amount_in)
}

#[async_trait]
impl RouteInputs for CachedRouteInputs {
    async fn protocol_state(&self) -> Result<ProtocolState> {
        let upstream = Arc::clone(&self.upstream);
        self.caches
            .protocol_settings
            .get_or_fetch(PROTOCOL_STATE_KEY, &self.policies.protocol_settings, move || {
                async move { upstream.protocol_state().await }
            })
            .await
    }

    async fn oracle_prices(&self) -> Result<OraclePrices> {
        let upstream = Arc::clone(&self.upstream);
        self.caches
            .oracle_prices
            .get_or_fetch(ORACLE_PRICES_KEY, &self.policies.oracle_prices, move || {
                async move { upstream.oracle_prices().await }
            })
            .await
    }

    async fn amm_quote(&self, direction: Direction, amount_in: U256) -> Result<AmmQuote> {
        let upstream = Arc::clone(&self.upstream);
        let key = amm_quote_key(direction, amount_in);
        self.caches
            .amm_quotes
            .get_or_fetch(&key, &self.policies.amm_quotes, move || async move {
                upstream.amm_quote(direction, amount_in).await
            })
            .await
    }
}
