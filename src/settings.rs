use crate::batch::VenueParams;
use crate::cache::{CacheCategory, CacheOptions, DEFAULT_DURABLE_MAX_AGE_MS};
use crate::chain::{ChainConfig, VenueConfig};
use crate::multicall::MULTICALL3_ADDRESS;
use crate::route::{RouteCachePolicies, RouteDefaults};
use crate::scheduler::SchedulerConfig;
use crate::types::{PriceRef, TrackedToken};
use config::{Config, ConfigError, File};
use ethers::types::{Address, H256, U256};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Rpc {
    #[serde(default = "default_http_url")]
    pub http_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_requests_per_second")]
    pub max_requests_per_second: u32,
    #[serde(default = "default_multicall_batch_size")]
    pub multicall_batch_size: usize,
    /// Expected block time, used for history sampling.
    #[serde(default = "default_block_time_secs")]
    pub block_time_secs: u64,
}

fn default_http_url() -> String {
    "http://localhost:8545".to_string()
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_max_requests_per_second() -> u32 {
    25
}
fn default_multicall_batch_size() -> usize {
    100
}
fn default_block_time_secs() -> u64 {
    12
}

impl Default for Rpc {
    fn default() -> Self {
        Self {
            http_url: default_http_url(),
            timeout_ms: default_timeout_ms(),
            max_requests_per_second: default_max_requests_per_second(),
            multicall_batch_size: default_multicall_batch_size(),
            block_time_secs: default_block_time_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Venue {
    #[serde(default)]
    pub address: Address,
    #[serde(default)]
    pub collateral_index: i64,
    #[serde(default = "default_dollar_index")]
    pub dollar_index: i64,
}

fn default_dollar_index() -> i64 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenConfig {
    pub symbol: String,
    pub address: Address,
    #[serde(default = "default_decimals")]
    pub decimals: u8,
    #[serde(default = "default_price_ref")]
    pub price_ref: PriceRef,
}

fn default_decimals() -> u8 {
    18
}
fn default_price_ref() -> PriceRef {
    PriceRef::Pegged
}

#[derive(Debug, Deserialize, Clone)]
pub struct Contracts {
    #[serde(default)]
    pub pool: Address,
    #[serde(default)]
    pub collateral: Address,
    #[serde(default = "default_decimals")]
    pub collateral_decimals: u8,
    #[serde(default)]
    pub venue: Venue,
    #[serde(default = "default_multicall")]
    pub multicall: Address,
    /// Pool storage slots of the mint/redeem price thresholds.
    #[serde(default)]
    pub mint_threshold_slot: H256,
    #[serde(default)]
    pub redeem_threshold_slot: H256,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

fn default_multicall() -> Address {
    MULTICALL3_ADDRESS.parse().unwrap_or_default()
}

impl Default for Contracts {
    fn default() -> Self {
        Self {
            pool: Address::zero(),
            collateral: Address::zero(),
            collateral_decimals: default_decimals(),
            venue: Venue {
                dollar_index: default_dollar_index(),
                ..Venue::default()
            },
            multicall: default_multicall(),
            mint_threshold_slot: H256::zero(),
            redeem_threshold_slot: H256::zero(),
            tokens: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Cache {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Directory for the file-backed durable store. No durable store when unset.
    #[serde(default)]
    pub durable_dir: Option<String>,
    /// Redis URL for the durable store (feature `redis`); takes precedence over `durable_dir`.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_durable_max_age_ms")]
    pub durable_max_age_ms: u64,
    /// Per-category overrides keyed by category name (`oracle_prices`, ...).
    #[serde(default)]
    pub policies: HashMap<String, CachePolicyOverride>,
}

/// Fields left out of a `[cache.policies.<category>]` table keep the category default.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CachePolicyOverride {
    pub ttl_ms: Option<u64>,
    pub allow_stale_fallback: Option<bool>,
    pub max_stale_age_ms: Option<u64>,
    pub fallback_on_upstream_staleness: Option<bool>,
    pub persist: Option<bool>,
}

impl CachePolicyOverride {
    fn apply(&self, mut options: CacheOptions) -> CacheOptions {
        if let Some(v) = self.ttl_ms {
            options.ttl_ms = v;
        }
        if let Some(v) = self.allow_stale_fallback {
            options.allow_stale_fallback = v;
        }
        if let Some(v) = self.max_stale_age_ms {
            options.max_stale_age_ms = v;
        }
        if let Some(v) = self.fallback_on_upstream_staleness {
            options.fallback_on_upstream_staleness = v;
        }
        if let Some(v) = self.persist {
            options.persist = v;
        }
        options
    }
}

fn default_max_entries() -> usize {
    500
}
fn default_durable_max_age_ms() -> u64 {
    DEFAULT_DURABLE_MAX_AGE_MS
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            durable_dir: None,
            redis_url: None,
            durable_max_age_ms: default_durable_max_age_ms(),
            policies: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Scheduler {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Account whose balances are polled from the first tick.
    #[serde(default)]
    pub account: Option<Address>,
}

fn default_interval_ms() -> u64 {
    12_000
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            account: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Aggregator {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    50
}

impl Default for Aggregator {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Route {
    #[serde(default = "default_true")]
    pub governance_discount: bool,
    #[serde(default)]
    pub accept_fractional: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Route {
    fn default() -> Self {
        Self {
            governance_discount: true,
            accept_fractional: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub rpc: Rpc,
    #[serde(default)]
    pub contracts: Contracts,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub scheduler: Scheduler,
    #[serde(default)]
    pub aggregator: Aggregator,
    #[serde(default)]
    pub route: Route,
}

impl Settings {
    /// `Config.toml` in the working directory (optional) plus `SDK_*` env overrides.
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("Config.toml").required(false))
            .build()?;
        let mut settings: Self = s.try_deserialize()?;
        settings.apply_env_overrides(|key| env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?;
        let mut settings: Self = s.try_deserialize()?;
        settings.apply_env_overrides(|key| env::var(key).ok())?;
        Ok(settings)
    }

    /// `SDK_RPC_HTTP_URL` and `SDK_ACCOUNT`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("SDK_RPC_HTTP_URL") {
            let trimmed = url.trim();
            if !trimmed.is_empty() {
                self.rpc.http_url = trimmed.to_string();
            }
        }
        if let Some(raw) = lookup("SDK_ACCOUNT") {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                let account = trimmed.parse::<Address>().map_err(|e| {
                    ConfigError::Message(format!("SDK_ACCOUNT is not an address: {}", e))
                })?;
                self.scheduler.account = Some(account);
            }
        }
        Ok(())
    }

    /// Category defaults with any `[cache.policies.<category>]` override merged in.
    pub fn cache_options(&self, category: CacheCategory) -> CacheOptions {
        let defaults = category.default_options();
        match self.cache.policies.get(category.as_str()) {
            Some(over) => over.apply(defaults),
            None => defaults,
        }
    }

    pub fn route_cache_policies(&self) -> RouteCachePolicies {
        RouteCachePolicies {
            protocol_settings: self.cache_options(CacheCategory::ProtocolSettings),
            oracle_prices: self.cache_options(CacheCategory::OraclePrices),
            amm_quotes: self.cache_options(CacheCategory::AmmQuotes),
        }
    }

    pub fn chain_config(&self) -> ChainConfig {
        let c = &self.contracts;
        ChainConfig {
            pool: c.pool,
            collateral: c.collateral,
            collateral_decimals: c.collateral_decimals,
            venue: VenueConfig {
                address: c.venue.address,
                collateral_index: i128::from(c.venue.collateral_index),
                dollar_index: i128::from(c.venue.dollar_index),
            },
            multicall: c.multicall,
            mint_threshold_slot: c.mint_threshold_slot,
            redeem_threshold_slot: c.redeem_threshold_slot,
            multicall_batch_size: self.rpc.multicall_batch_size,
        }
    }

    pub fn tracked_tokens(&self) -> Vec<TrackedToken> {
        self.contracts
            .tokens
            .iter()
            .map(|t| TrackedToken {
                symbol: t.symbol.clone(),
                address: t.address,
                decimals: t.decimals,
                price_ref: t.price_ref,
            })
            .collect()
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_millis(self.scheduler.interval_ms),
            tokens: self.tracked_tokens(),
        }
    }

    pub fn route_defaults(&self) -> RouteDefaults {
        RouteDefaults {
            governance_discount: self.route.governance_discount,
            accept_fractional: self.route.accept_fractional,
        }
    }

    /// Dollar-to-collateral venue read at one whole dollar, for price history.
    pub fn history_params(&self) -> VenueParams {
        let c = &self.contracts;
        VenueParams {
            venue: c.venue.address,
            i: i128::from(c.venue.dollar_index),
            j: i128::from(c.venue.collateral_index),
            quote_amount: U256::exp10(18),
            input_decimals: 18,
            output_decimals: c.collateral_decimals,
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.aggregator.debounce_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc.timeout_ms)
    }
}
