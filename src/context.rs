//! Composition root: builds every service from [`Settings`] and owns the
//! shared instances. Nothing in the crate is a global; tests assemble their
//! own context around fake sources.

use crate::batch::{BatchAggregator, BatchTransport, HttpBatchTransport};
use crate::cache::{
    CacheCategory, CacheConfig, CacheOptions, CacheStats, DurableStore, FileStore, TtlCache,
};
use crate::chain::{DataSource, RpcDataSource};
use crate::clock::Clock;
use crate::error::{Result, SdkError};
use crate::history::PriceHistory;
use crate::route::{CachedRouteInputs, OptimalRouteResult, RouteCaches, RouteEngine, RoutePolicy};
use crate::scheduler::RefreshScheduler;
use crate::settings::Settings;
use ethers::prelude::{Http, Provider};
use ethers::types::{Address, U256};
use indexmap::IndexMap;
use log::{info, warn};
use std::sync::Arc;
use url::Url;

pub type BalanceMap = IndexMap<Address, U256>;

pub struct SdkContext {
    pub settings: Arc<Settings>,
    pub source: Arc<dyn DataSource>,
    pub route_inputs: Arc<CachedRouteInputs>,
    pub route_engine: RouteEngine,
    pub scheduler: RefreshScheduler,
    pub aggregator: BatchAggregator,
    pub history: PriceHistory,
    balances: TtlCache<BalanceMap>,
    balance_options: CacheOptions,
}

impl SdkContext {
    /// Connect to the configured RPC endpoint and durable store.
    pub async fn from_settings(settings: Settings) -> Result<Self> {
        let url = Url::parse(&settings.rpc.http_url)
            .map_err(|e| SdkError::Config(format!("invalid rpc.http_url: {}", e)))?;
        let client = reqwest::Client::builder()
            .timeout(settings.rpc_timeout())
            .build()
            .map_err(|e| SdkError::Config(format!("failed to build HTTP client: {}", e)))?;
        let provider = Arc::new(Provider::new(Http::new_with_client(url.clone(), client)));
        let source: Arc<dyn DataSource> =
            Arc::new(RpcDataSource::new(provider, settings.chain_config()));
        let transport: Arc<dyn BatchTransport> = Arc::new(HttpBatchTransport::new(
            url,
            settings.rpc_timeout(),
            settings.rpc.max_requests_per_second,
        )?);
        let store = open_store(&settings).await?;

        info!(
            "SDK context ready: rpc={} durable_store={}",
            settings.rpc.http_url,
            store.is_some()
        );
        Ok(Self::assemble(settings, source, transport, store, Clock::system()))
    }

    /// Wire the services around already-built collaborators.
    pub fn assemble(
        settings: Settings,
        source: Arc<dyn DataSource>,
        transport: Arc<dyn BatchTransport>,
        store: Option<Arc<dyn DurableStore>>,
        clock: Clock,
    ) -> Self {
        let cache_config = CacheConfig {
            max_entries: settings.cache.max_entries,
            durable_max_age_ms: settings.cache.durable_max_age_ms,
            store,
            clock,
        };
        let caches = RouteCaches {
            protocol_settings: TtlCache::new(CacheCategory::ProtocolSettings, cache_config.clone()),
            oracle_prices: TtlCache::new(CacheCategory::OraclePrices, cache_config.clone()),
            amm_quotes: TtlCache::new(CacheCategory::AmmQuotes, cache_config.clone()),
        };
        let balances = TtlCache::new(CacheCategory::UserBalances, cache_config);

        let route_inputs = Arc::new(CachedRouteInputs::new(
            source.clone(),
            caches,
            settings.route_cache_policies(),
        ));
        let route_engine = RouteEngine::new(route_inputs.clone(), settings.route_defaults());

        let scheduler = RefreshScheduler::new(source.clone(), settings.scheduler_config(), clock);
        scheduler.set_account(settings.scheduler.account);

        let aggregator = BatchAggregator::new(transport.clone(), settings.debounce());
        let history = PriceHistory::new(
            aggregator.clone(),
            transport,
            settings.history_params(),
            settings.rpc.block_time_secs,
        );

        Self {
            balance_options: settings.cache_options(CacheCategory::UserBalances),
            settings: Arc::new(settings),
            source,
            route_inputs,
            route_engine,
            scheduler,
            aggregator,
            history,
            balances,
        }
    }

    /// Warm the persisted categories from durable storage.
    pub async fn load_persisted(&self) -> usize {
        let caches = self.route_inputs.caches();
        let loaded = caches.protocol_settings.load_persisted().await
            + caches.oracle_prices.load_persisted().await
            + caches.amm_quotes.load_persisted().await
            + self.balances.load_persisted().await;
        info!("Rehydrated {} cache entries from durable storage", loaded);
        loaded
    }

    pub async fn get_optimal_route(
        &self,
        amount: U256,
        policy: RoutePolicy,
    ) -> Result<OptimalRouteResult> {
        self.route_engine.get_optimal_route(amount, policy).await
    }

    pub async fn get_optimal_deposit_route(
        &self,
        amount: U256,
        force_collateral_only: bool,
    ) -> Result<OptimalRouteResult> {
        self.route_engine
            .get_optimal_deposit_route(amount, force_collateral_only)
            .await
    }

    pub async fn get_optimal_withdraw_route(
        &self,
        amount: U256,
        force_swap_only: bool,
    ) -> Result<OptimalRouteResult> {
        self.route_engine
            .get_optimal_withdraw_route(amount, force_swap_only)
            .await
    }

    /// Balances of `account` through the user-balance cache (never served stale by default).
    pub async fn cached_balances(&self, account: Address) -> Result<BalanceMap> {
        let source = self.source.clone();
        let tokens = self.settings.tracked_tokens();
        self.balances
            .get_or_fetch(&balance_key(account), &self.balance_options, move || async move {
                source.balances(account, &tokens).await
            })
            .await
    }

    /// Drop `key` from every cache category.
    pub async fn invalidate(&self, key: &str) {
        let caches = self.route_inputs.caches();
        caches.protocol_settings.invalidate(key).await;
        caches.oracle_prices.invalidate(key).await;
        caches.amm_quotes.invalidate(key).await;
        self.balances.invalidate(key).await;
    }

    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let caches = self.route_inputs.caches();
        caches.protocol_settings.invalidate_pattern(pattern).await
            + caches.oracle_prices.invalidate_pattern(pattern).await
            + caches.amm_quotes.invalidate_pattern(pattern).await
            + self.balances.invalidate_pattern(pattern).await
    }

    pub async fn clear(&self) {
        let caches = self.route_inputs.caches();
        caches.protocol_settings.clear().await;
        caches.oracle_prices.clear().await;
        caches.amm_quotes.clear().await;
        self.balances.clear().await;
    }

    /// Whether the value held for `key` in `category` was served as a stale fallback.
    pub fn is_stale(&self, category: CacheCategory, key: &str) -> bool {
        let caches = self.route_inputs.caches();
        match category {
            CacheCategory::ProtocolSettings => caches.protocol_settings.is_stale(key),
            CacheCategory::OraclePrices => caches.oracle_prices.is_stale(key),
            CacheCategory::AmmQuotes => caches.amm_quotes.is_stale(key),
            CacheCategory::UserBalances => self.balances.is_stale(key),
        }
    }

    pub fn cache_stats(&self) -> Vec<(CacheCategory, CacheStats)> {
        let caches = self.route_inputs.caches();
        vec![
            (CacheCategory::ProtocolSettings, caches.protocol_settings.stats()),
            (CacheCategory::OraclePrices, caches.oracle_prices.stats()),
            (CacheCategory::AmmQuotes, caches.amm_quotes.stats()),
            (CacheCategory::UserBalances, self.balances.stats()),
        ]
    }
}

pub fn balance_key(account: Address) -> String {
    format!("balances:{:?}", account)
}

async fn open_store(settings: &Settings) -> Result<Option<Arc<dyn DurableStore>>> {
    if let Some(store) = open_redis(settings).await? {
        return Ok(Some(store));
    }
    match &settings.cache.durable_dir {
        Some(dir) => Ok(Some(Arc::new(FileStore::open(dir).await?))),
        None => Ok(None),
    }
}

#[cfg(feature = "redis")]
async fn open_redis(settings: &Settings) -> Result<Option<Arc<dyn DurableStore>>> {
    match &settings.cache.redis_url {
        Some(url) => {
            let store = crate::cache::durable::RedisStore::connect(url, "sdk").await?;
            Ok(Some(Arc::new(store)))
        }
        None => Ok(None),
    }
}

#[cfg(not(feature = "redis"))]
async fn open_redis(settings: &Settings) -> Result<Option<Arc<dyn DurableStore>>> {
    if settings.cache.redis_url.is_some() {
        warn!("cache.redis_url is set but the `redis` feature is disabled; ignoring it");
    }
    Ok(None)
}
