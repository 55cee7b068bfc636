//! Integration tests for the assembled SDK context
//!
//! Tests cover:
//! - Route requests served through the category caches
//! - Single-flight fetches across concurrent route requests
//! - Stale fallback for oracle data, never for balances
//! - Invalidation fan-out across categories
//! - Durable rehydration into a fresh context
//! - Scheduler snapshots with account balances
//!
//! Note: every chain read is faked; no node is required

use async_trait::async_trait;
use dollar_route_sdk::batch::{BatchTransport, JsonRpcRequest, JsonRpcResponse};
use dollar_route_sdk::cache::{CacheCategory, DurableStore, MemoryStore};
use dollar_route_sdk::chain::DataSource;
use dollar_route_sdk::clock::Clock;
use dollar_route_sdk::route::source::{ORACLE_PRICES_KEY, PROTOCOL_STATE_KEY};
use dollar_route_sdk::route::{RouteInputs, RouteType};
use dollar_route_sdk::settings::TokenConfig;
use dollar_route_sdk::types::{
    AmmQuote, Direction, OraclePrices, PriceRef, ProtocolReadout, ProtocolState, TrackedToken,
    VenueReadout,
};
use dollar_route_sdk::{Result, SdkContext, SdkError, Settings};
use ethers::types::{Address, U256};
use indexmap::IndexMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const START_MS: u64 = 1_700_000_000_000;

fn e18(n: u64) -> U256 {
    U256::from(n) * U256::exp10(18)
}

fn dollar_token() -> Address {
    Address::repeat_byte(0xd0)
}

/// Chain double with per-read call counters and a global failure switch.
#[derive(Default)]
struct FakeChain {
    protocol_calls: AtomicUsize,
    oracle_calls: AtomicUsize,
    quote_calls: AtomicUsize,
    balance_calls: AtomicUsize,
    failing: AtomicBool,
}

impl FakeChain {
    async fn read(&self, counter: &AtomicUsize) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(SdkError::TransientFetch("connection reset".to_string()));
        }
        Ok(())
    }

    fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RouteInputs for FakeChain {
    async fn protocol_state(&self) -> Result<ProtocolState> {
        self.read(&self.protocol_calls).await?;
        Ok(ProtocolState {
            collateral_ratio: U256::from(1_000_000u64),
            minting_fee: U256::zero(),
            redemption_fee: U256::zero(),
            mint_paused: false,
            redeem_paused: false,
            mint_price_threshold: U256::zero(),
            redeem_price_threshold: U256::zero(),
            collateral_decimals: 18,
        })
    }

    async fn oracle_prices(&self) -> Result<OraclePrices> {
        self.read(&self.oracle_calls).await?;
        Ok(OraclePrices {
            collateral_price: U256::from(1_000_000u64),
            dollar_price: U256::from(1_000_000u64),
            governance_price: U256::from(2_000_000u64),
        })
    }

    async fn amm_quote(&self, _direction: Direction, amount_in: U256) -> Result<AmmQuote> {
        self.read(&self.quote_calls).await?;
        // Venue pays 0.5% over par.
        Ok(AmmQuote {
            amount_in,
            amount_out: amount_in * 1005 / 1000,
            is_paused: false,
        })
    }
}

#[async_trait]
impl DataSource for FakeChain {
    async fn protocol_readout(&self) -> Result<ProtocolReadout> {
        self.read(&self.protocol_calls).await?;
        Ok(ProtocolReadout {
            collateral_ratio: U256::from(1_000_000u64),
            dollar_price: U256::from(990_000u64),
            governance_price: U256::from(2_000_000u64),
            collateral_price: U256::from(1_000_000u64),
            collaterals: vec![Address::repeat_byte(0xc0)],
        })
    }

    async fn balances(
        &self,
        _account: Address,
        tokens: &[TrackedToken],
    ) -> Result<IndexMap<Address, U256>> {
        self.read(&self.balance_calls).await?;
        Ok(tokens.iter().map(|t| (t.address, e18(250))).collect())
    }

    async fn venue_readout(&self) -> Result<VenueReadout> {
        Ok(VenueReadout {
            exchange_rate: U256::from(1_010_000_000_000_000_000u64),
            mint_price_threshold: U256::zero(),
            redeem_price_threshold: U256::zero(),
        })
    }
}

/// Transport that is never expected to be used by these tests.
struct UnusedTransport;

#[async_trait]
impl BatchTransport for UnusedTransport {
    async fn send_batch(&self, _requests: Vec<JsonRpcRequest>) -> Result<Vec<JsonRpcResponse>> {
        Err(SdkError::TransientFetch("no transport in tests".to_string()))
    }
}

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.contracts.tokens = vec![TokenConfig {
        symbol: "DOLLAR".to_string(),
        address: dollar_token(),
        decimals: 18,
        price_ref: PriceRef::Dollar,
    }];
    settings
}

fn context_with(
    chain: Arc<FakeChain>,
    store: Option<Arc<dyn DurableStore>>,
    settings: Settings,
) -> SdkContext {
    SdkContext::assemble(
        settings,
        chain,
        Arc::new(UnusedTransport),
        store,
        Clock::starting_at(START_MS),
    )
}

#[tokio::test(start_paused = true)]
async fn test_route_requests_are_served_from_cache() {
    let chain = Arc::new(FakeChain::default());
    let ctx = context_with(chain.clone(), None, test_settings());

    let first = ctx.get_optimal_deposit_route(e18(1_000), false).await.unwrap();
    let second = ctx.get_optimal_deposit_route(e18(1_000), false).await.unwrap();

    assert_eq!(first.route_type, RouteType::Swap);
    assert_eq!(first.expected_output, e18(1_005));
    assert_eq!(first, second);
    assert_eq!(FakeChain::calls(&chain.protocol_calls), 1);
    assert_eq!(FakeChain::calls(&chain.oracle_calls), 1);
    assert_eq!(FakeChain::calls(&chain.quote_calls), 1);

    // A different amount is a different quote key; protocol data stays cached.
    ctx.get_optimal_deposit_route(e18(2_000), false).await.unwrap();
    assert_eq!(FakeChain::calls(&chain.quote_calls), 2);
    assert_eq!(FakeChain::calls(&chain.protocol_calls), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_routes_share_one_fetch_per_key() {
    let chain = Arc::new(FakeChain::default());
    let ctx = context_with(chain.clone(), None, test_settings());

    let amount = e18(500);
    let (a, b, c) = tokio::join!(
        ctx.get_optimal_deposit_route(amount, false),
        ctx.get_optimal_deposit_route(amount, false),
        ctx.get_optimal_deposit_route(amount, true),
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(c.unwrap().route_type, RouteType::Mint);

    assert_eq!(FakeChain::calls(&chain.protocol_calls), 1);
    assert_eq!(FakeChain::calls(&chain.oracle_calls), 1);
    assert_eq!(FakeChain::calls(&chain.quote_calls), 1);
    let stats = ctx.cache_stats();
    let deduplicated: u64 = stats.iter().map(|(_, s)| s.deduplicated).sum();
    assert_eq!(deduplicated, 6);
}

#[tokio::test(start_paused = true)]
async fn test_oracle_failure_serves_stale_but_balances_fail() {
    let chain = Arc::new(FakeChain::default());
    let ctx = context_with(chain.clone(), None, test_settings());
    let account = Address::repeat_byte(0xaa);

    let fresh = ctx.get_optimal_deposit_route(e18(1_000), false).await.unwrap();
    let balances = ctx.cached_balances(account).await.unwrap();
    assert_eq!(balances.get(&dollar_token()), Some(&e18(250)));

    tokio::time::advance(Duration::from_secs(20)).await;
    chain.failing.store(true, Ordering::SeqCst);

    let stale = ctx.get_optimal_deposit_route(e18(1_000), false).await.unwrap();
    assert_eq!(stale.expected_output, fresh.expected_output);
    assert!(ctx.is_stale(CacheCategory::OraclePrices, ORACLE_PRICES_KEY));
    // Still inside its own TTL, so served fresh without a refetch.
    assert!(!ctx.is_stale(CacheCategory::ProtocolSettings, PROTOCOL_STATE_KEY));
    assert_eq!(FakeChain::calls(&chain.protocol_calls), 1);

    let err = ctx.cached_balances(account).await.unwrap_err();
    assert!(matches!(err, SdkError::TransientFetch(_)));
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_fans_out_across_categories() {
    let chain = Arc::new(FakeChain::default());
    let ctx = context_with(chain.clone(), None, test_settings());
    let account = Address::repeat_byte(0xaa);

    ctx.get_optimal_deposit_route(e18(1_000), false).await.unwrap();
    ctx.cached_balances(account).await.unwrap();

    assert_eq!(ctx.invalidate_pattern("amm-quote").await, 1);
    ctx.get_optimal_deposit_route(e18(1_000), false).await.unwrap();
    assert_eq!(FakeChain::calls(&chain.quote_calls), 2);
    assert_eq!(FakeChain::calls(&chain.oracle_calls), 1);

    ctx.invalidate(ORACLE_PRICES_KEY).await;
    ctx.get_optimal_deposit_route(e18(1_000), false).await.unwrap();
    assert_eq!(FakeChain::calls(&chain.oracle_calls), 2);
    assert_eq!(FakeChain::calls(&chain.protocol_calls), 1);

    ctx.clear().await;
    assert!(ctx.cache_stats().iter().all(|(_, s)| s.entries == 0));
    ctx.cached_balances(account).await.unwrap();
    assert_eq!(FakeChain::calls(&chain.balance_calls), 2);
}

#[tokio::test(start_paused = true)]
async fn test_persisted_entries_warm_a_new_context() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());

    let first_chain = Arc::new(FakeChain::default());
    let first = context_with(first_chain.clone(), Some(store.clone()), test_settings());
    first.get_optimal_deposit_route(e18(1_000), false).await.unwrap();
    first.cached_balances(Address::repeat_byte(0xaa)).await.unwrap();

    let second_chain = Arc::new(FakeChain::default());
    let second = context_with(second_chain.clone(), Some(store), test_settings());
    // Protocol settings and oracle prices persist; quotes and balances do not.
    assert_eq!(second.load_persisted().await, 2);

    let route = second.get_optimal_deposit_route(e18(1_000), false).await.unwrap();
    assert_eq!(route.route_type, RouteType::Swap);
    assert_eq!(FakeChain::calls(&second_chain.protocol_calls), 0);
    assert_eq!(FakeChain::calls(&second_chain.oracle_calls), 0);
    assert_eq!(FakeChain::calls(&second_chain.quote_calls), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_snapshot_values_account_balances() {
    let chain = Arc::new(FakeChain::default());
    let mut settings = test_settings();
    settings.scheduler.account = Some(Address::repeat_byte(0xaa));
    let ctx = context_with(chain.clone(), None, settings);

    let snapshot = ctx.scheduler.force_refresh().await.unwrap();
    assert_eq!(snapshot.tick, 1);
    assert_eq!(snapshot.taken_at_ms, START_MS + 5);
    // 1.00 / 1.01
    assert_eq!(snapshot.synthetic_dollar_price, U256::from(990_099u64));

    let balances = snapshot.balances.as_ref().unwrap();
    let dollar = &balances[&dollar_token()];
    assert_eq!(dollar.balance, e18(250));
    assert_eq!(dollar.usd_value, U256::from(247_500_000u64));
    assert_eq!(snapshot.total_usd_value(), U256::from(247_500_000u64));
    assert_eq!(ctx.scheduler.last_snapshot(), Some(snapshot));
}
