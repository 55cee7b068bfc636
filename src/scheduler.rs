//! # Refresh scheduler
//!
//! One poller for everything the UI shows: every tick reads the protocol,
//! the connected account's balances and the venue, derives prices, and
//! publishes one immutable [`RefreshSnapshot`].
//!
//! A tick is all-or-nothing. If any phase fails the previous snapshot stays
//! in place and subscribers hear nothing. After `stop()` no snapshot is
//! published, including by a tick that was already in flight.

use crate::chain::DataSource;
use crate::clock::Clock;
use crate::error::{Result, SdkError};
use crate::metrics;
use crate::task::CancelableTask;
use crate::types::{PriceRef, ProtocolReadout, TrackedToken, VenueReadout, PRICE_PRECISION};
use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::DashMap;
use ethers::types::{Address, U256};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Roughly one mainnet block.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(12);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub symbol: String,
    pub decimals: u8,
    pub balance: U256,
    /// USD value in `PRICE_PRECISION` units, from this tick's prices.
    pub usd_value: U256,
}

/// One consistent reading of the chain. Never mutated after publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSnapshot {
    pub tick: u64,
    pub taken_at_ms: u64,
    pub protocol: ProtocolReadout,
    pub venue: VenueReadout,
    /// Collateral price divided by the venue exchange rate, `PRICE_PRECISION` scale.
    pub synthetic_dollar_price: U256,
    pub account: Option<Address>,
    /// Present only when an account was set for the tick.
    pub balances: Option<IndexMap<Address, TokenBalance>>,
}

impl RefreshSnapshot {
    pub fn total_usd_value(&self) -> U256 {
        self.balances
            .as_ref()
            .map(|b| b.values().fold(U256::zero(), |acc, t| acc + t.usd_value))
            .unwrap_or_default()
    }
}

pub type SubscriptionId = u64;
pub type SnapshotCallback = Arc<dyn Fn(Arc<RefreshSnapshot>) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub tokens: Vec<TrackedToken>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REFRESH_INTERVAL,
            tokens: Vec::new(),
        }
    }
}

struct Inner {
    source: Arc<dyn DataSource>,
    config: SchedulerConfig,
    clock: Clock,
    last: ArcSwapOption<RefreshSnapshot>,
    account: ArcSwap<Option<Address>>,
    subscribers: DashMap<SubscriptionId, SnapshotCallback>,
    next_subscription: AtomicU64,
    tick: AtomicU64,
    // Highest tick published so far; guards publication so snapshots never go backwards.
    published: StdMutex<u64>,
    // Bumped by stop(); a tick publishes only if the epoch it started in is still current.
    epoch: AtomicU64,
    watch_tx: watch::Sender<Option<Arc<RefreshSnapshot>>>,
    task: Mutex<CancelableTask>,
}

/// Cloning is cheap and clones drive the same scheduler.
#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<Inner>,
}

impl RefreshScheduler {
    pub fn new(source: Arc<dyn DataSource>, config: SchedulerConfig, clock: Clock) -> Self {
        let (watch_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                source,
                config,
                clock,
                last: ArcSwapOption::empty(),
                account: ArcSwap::from_pointee(None),
                subscribers: DashMap::new(),
                next_subscription: AtomicU64::new(1),
                tick: AtomicU64::new(0),
                published: StdMutex::new(0),
                epoch: AtomicU64::new(0),
                watch_tx,
                task: Mutex::new(CancelableTask::new()),
            }),
        }
    }

    /// Refresh now, then every `interval`. No-op if already running.
    pub async fn start(&self) {
        let mut task = self.inner.task.lock().await;
        if task.is_running() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let interval = inner.config.interval;
        info!(interval_ms = interval.as_millis() as u64, "starting refresh scheduler");
        task.start(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                // The first tick completes immediately.
                ticker.tick().await;
                let epoch = inner.epoch.load(Ordering::SeqCst);
                inner.refresh(epoch).await;
            }
        });
    }

    /// Cancel the timer. Results of a tick still in flight are discarded.
    pub async fn stop(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        if self.inner.task.lock().await.cancel() {
            info!("refresh scheduler stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.task.lock().await.is_running()
    }

    /// Run one tick now. Returns the published snapshot, or `None` if the tick
    /// failed or was discarded by `stop()`.
    pub async fn force_refresh(&self) -> Option<Arc<RefreshSnapshot>> {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.inner.refresh(epoch).await
    }

    /// Register `callback`; it is called right away with the last snapshot, if any.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(Arc<RefreshSnapshot>) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let callback: SnapshotCallback = Arc::new(callback);
        self.inner.subscribers.insert(id, Arc::clone(&callback));
        if let Some(snapshot) = self.inner.last.load_full() {
            callback(snapshot);
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    pub fn last_snapshot(&self) -> Option<Arc<RefreshSnapshot>> {
        self.inner.last.load_full()
    }

    /// Snapshot stream for async consumers. Starts at the last snapshot.
    pub fn watch(&self) -> watch::Receiver<Option<Arc<RefreshSnapshot>>> {
        self.inner.watch_tx.subscribe()
    }

    /// Account whose balances phase 2 reads. `None` skips the phase.
    pub fn set_account(&self, account: Option<Address>) {
        self.inner.account.store(Arc::new(account));
    }

    pub fn account(&self) -> Option<Address> {
        **self.inner.account.load()
    }
}

/// Which read failed, for the tick log.
type PhaseError = (&'static str, SdkError);

impl Inner {
    async fn refresh(&self, epoch: u64) -> Option<Arc<RefreshSnapshot>> {
        let tick = self.tick.fetch_add(1, Ordering::SeqCst) + 1;
        let started = tokio::time::Instant::now();

        let snapshot = match self.collect(tick).await {
            Ok(snapshot) => snapshot,
            Err((phase, e)) => {
                warn!(tick, phase, error = %e, "refresh tick failed, keeping previous snapshot");
                metrics::record_scheduler_tick("error", started.elapsed());
                return None;
            }
        };

        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(tick, "scheduler stopped during tick, discarding result");
            metrics::record_scheduler_tick("discarded", started.elapsed());
            return None;
        }

        let snapshot = Arc::new(snapshot);
        if !self.publish(Arc::clone(&snapshot)) {
            debug!(tick, "a newer snapshot was already published, discarding result");
            metrics::record_scheduler_tick("superseded", started.elapsed());
            return None;
        }
        metrics::record_scheduler_tick("ok", started.elapsed());
        debug!(tick, elapsed_ms = started.elapsed().as_millis() as u64, "snapshot published");
        Some(snapshot)
    }

    async fn collect(&self, tick: u64) -> std::result::Result<RefreshSnapshot, PhaseError> {
        let account = **self.account.load();
        let source = &self.source;
        let tokens = &self.config.tokens;

        let protocol = async { source.protocol_readout().await.map_err(|e| ("protocol", e)) };
        let balances = async {
            match account {
                Some(owner) => source
                    .balances(owner, tokens)
                    .await
                    .map(Some)
                    .map_err(|e| ("balances", e)),
                None => Ok(None),
            }
        };
        let venue = async { source.venue_readout().await.map_err(|e| ("venue", e)) };

        let (protocol, raw_balances, venue) = tokio::try_join!(protocol, balances, venue)?;

        // Derived values only once every phase has resolved.
        let synthetic_dollar_price =
            synthetic_price(&protocol, &venue).map_err(|e| ("derive", e))?;
        let balances = raw_balances
            .map(|raw| value_balances(tokens, &raw, &protocol))
            .transpose()
            .map_err(|e| ("derive", e))?;

        Ok(RefreshSnapshot {
            tick,
            taken_at_ms: self.clock.now_ms(),
            protocol,
            venue,
            synthetic_dollar_price,
            account,
            balances,
        })
    }

    /// Publish unless a later tick got there first. Ticks may overlap when
    /// `force_refresh` runs alongside the loop.
    fn publish(&self, snapshot: Arc<RefreshSnapshot>) -> bool {
        let mut published = self.published.lock().unwrap_or_else(|e| e.into_inner());
        if *published >= snapshot.tick {
            return false;
        }
        *published = snapshot.tick;
        self.last.store(Some(Arc::clone(&snapshot)));
        self.watch_tx.send_replace(Some(Arc::clone(&snapshot)));
        // Call outside the map so a callback may unsubscribe itself.
        let callbacks: Vec<SnapshotCallback> = self
            .subscribers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for callback in callbacks {
            callback(Arc::clone(&snapshot));
        }
        true
    }
}

/// `collateral_price * 1e18 / exchange_rate`: what the dollar is worth if the
/// venue rate is the market.
pub fn synthetic_price(protocol: &ProtocolReadout, venue: &VenueReadout) -> Result<U256> {
    if venue.exchange_rate.is_zero() {
        return Err(SdkError::TransientFetch(
            "venue exchange rate is zero".to_string(),
        ));
    }
    protocol
        .collateral_price
        .checked_mul(U256::exp10(18))
        .map(|scaled| scaled / venue.exchange_rate)
        .ok_or_else(|| SdkError::PolicyViolation("amount too large".to_string()))
}

fn price_of(price_ref: PriceRef, protocol: &ProtocolReadout) -> U256 {
    match price_ref {
        PriceRef::Dollar => protocol.dollar_price,
        PriceRef::Governance => protocol.governance_price,
        PriceRef::Collateral => protocol.collateral_price,
        PriceRef::Pegged => U256::from(PRICE_PRECISION),
    }
}

fn value_balances(
    tokens: &[TrackedToken],
    raw: &IndexMap<Address, U256>,
    protocol: &ProtocolReadout,
) -> Result<IndexMap<Address, TokenBalance>> {
    tokens
        .iter()
        .map(|token| {
            let balance = raw.get(&token.address).copied().unwrap_or_default();
            let usd_value = balance
                .checked_mul(price_of(token.price_ref, protocol))
                .map(|v| v / U256::exp10(usize::from(token.decimals)))
                .ok_or_else(|| SdkError::PolicyViolation("amount too large".to_string()))?;
            Ok((
                token.address,
                TokenBalance {
                    symbol: token.symbol.clone(),
                    decimals: token.decimals,
                    balance,
                    usd_value,
                },
            ))
        })
        .collect()
}
