//! # Route decision engine
//!
//! Chooses between the protocol route (mint on deposit, redeem on withdraw)
//! and a swap on the stable-swap venue, for a given input amount and a
//! [`RoutePolicy`].
//!
//! Eligibility comes first: price thresholds, force flags and fractional
//! redemption acceptance decide which routes may be compared. Among eligible
//! routes the one with the larger primary output wins. A route whose venue
//! reports itself paused is still returned, flagged `is_enabled = false`.
//!
//! All math stays in token units; floats only appear in `savings.percentage`
//! and the `reason` text.

pub mod math;
pub mod source;

use crate::error::{Result, SdkError};
use crate::metrics;
use crate::types::conversions::format_amount;
use crate::types::{AmmQuote, Direction, OraclePrices, ProtocolState};
use ethers::types::U256;
use log::debug;
use math::DOLLAR_DECIMALS;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use math::Savings;
pub use source::{CachedRouteInputs, RouteCachePolicies, RouteCaches, RouteInputs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteType {
    Mint,
    Redeem,
    Swap,
}

impl RouteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteType::Mint => "mint",
            RouteType::Redeem => "redeem",
            RouteType::Swap => "swap",
        }
    }
}

impl std::fmt::Display for RouteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DepositPolicy {
    /// Mint one-to-one against collateral only, even when a swap pays more.
    pub force_collateral_only: bool,
    /// In fractional mode, cover the uncollateralized share with governance tokens.
    pub governance_discount: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WithdrawPolicy {
    pub force_swap_only: bool,
    /// Accept part of a fractional redemption in governance tokens.
    pub accept_fractional: bool,
}

/// Per-request routing policy. The variant fixes the direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum RoutePolicy {
    Deposit(DepositPolicy),
    Withdraw(WithdrawPolicy),
}

impl RoutePolicy {
    pub fn direction(&self) -> Direction {
        match self {
            RoutePolicy::Deposit(_) => Direction::Deposit,
            RoutePolicy::Withdraw(_) => Direction::Withdraw,
        }
    }
}

/// Defaults applied by the convenience entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDefaults {
    pub governance_discount: bool,
    pub accept_fractional: bool,
}

impl Default for RouteDefaults {
    fn default() -> Self {
        Self {
            governance_discount: true,
            accept_fractional: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimalRouteResult {
    pub route_type: RouteType,
    pub direction: Direction,
    pub input_amount: U256,
    pub expected_output: U256,
    /// Oracle dollar price, `PRICE_PRECISION` scale.
    pub market_price: U256,
    pub is_enabled: bool,
    pub disabled_reason: Option<String>,
    /// The selected protocol route settles part of the value in governance tokens.
    pub is_governance_operation: bool,
    /// Governance tokens supplied (mint) or received (redeem) on that route.
    pub bonus_amount: Option<U256>,
    pub savings: Savings,
    pub reason: String,
}

/// One computed route before selection.
struct Candidate {
    route_type: RouteType,
    output: U256,
    paused_reason: Option<&'static str>,
    governance: Option<U256>,
}

pub struct RouteEngine {
    inputs: Arc<dyn RouteInputs>,
    defaults: RouteDefaults,
}

impl RouteEngine {
    pub fn new(inputs: Arc<dyn RouteInputs>, defaults: RouteDefaults) -> Self {
        Self { inputs, defaults }
    }

    pub fn defaults(&self) -> RouteDefaults {
        self.defaults
    }

    pub async fn get_optimal_deposit_route(
        &self,
        amount: U256,
        force_collateral_only: bool,
    ) -> Result<OptimalRouteResult> {
        let policy = DepositPolicy {
            force_collateral_only,
            governance_discount: self.defaults.governance_discount,
        };
        self.get_optimal_route(amount, RoutePolicy::Deposit(policy))
            .await
    }

    pub async fn get_optimal_withdraw_route(
        &self,
        amount: U256,
        force_swap_only: bool,
    ) -> Result<OptimalRouteResult> {
        let policy = WithdrawPolicy {
            force_swap_only,
            accept_fractional: self.defaults.accept_fractional,
        };
        self.get_optimal_route(amount, RoutePolicy::Withdraw(policy))
            .await
    }

    /// Compute both sides and select a route. Any input failure fails the whole
    /// request; there is no fallback to the other side.
    pub async fn get_optimal_route(
        &self,
        amount: U256,
        policy: RoutePolicy,
    ) -> Result<OptimalRouteResult> {
        if amount.is_zero() {
            return Err(SdkError::PolicyViolation(
                "amount must be greater than zero".to_string(),
            ));
        }
        let direction = policy.direction();
        let (state, prices, quote) = tokio::try_join!(
            self.inputs.protocol_state(),
            self.inputs.oracle_prices(),
            self.inputs.amm_quote(direction, amount),
        )?;

        let result = match policy {
            RoutePolicy::Deposit(p) => deposit_route(amount, &p, &state, &prices, &quote)?,
            RoutePolicy::Withdraw(p) => withdraw_route(amount, &p, &state, &prices, &quote)?,
        };
        metrics::increment_route_selected(result.route_type.as_str());
        debug!(
            "{} route for {}: {} -> {} ({})",
            direction, amount, result.route_type, result.expected_output, result.reason
        );
        Ok(result)
    }
}

fn swap_candidate(quote: &AmmQuote) -> Candidate {
    Candidate {
        route_type: RouteType::Swap,
        output: quote.amount_out,
        paused_reason: quote.is_paused.then_some("AMM pool is paused"),
        governance: None,
    }
}

fn deposit_route(
    amount: U256,
    policy: &DepositPolicy,
    state: &ProtocolState,
    prices: &OraclePrices,
    quote: &AmmQuote,
) -> Result<OptimalRouteResult> {
    let use_governance = policy.governance_discount && !policy.force_collateral_only;
    let mint = math::mint_output(amount, state, prices, use_governance)?;
    let mint = Candidate {
        route_type: RouteType::Mint,
        output: mint.dollar_out,
        paused_reason: state.mint_paused.then_some("Minting is paused for this collateral"),
        governance: (!mint.governance_in.is_zero()).then_some(mint.governance_in),
    };
    let swap = swap_candidate(quote);

    let threshold = state.mint_price_threshold;
    let (selected, other, reason) = if !threshold.is_zero() && prices.dollar_price < threshold {
        let reason = format!(
            "Minting disabled: dollar price {} is below the mint threshold {}",
            format_amount(prices.dollar_price, 6, 4),
            format_amount(threshold, 6, 4)
        );
        (swap, None, reason)
    } else if policy.force_collateral_only {
        (mint, Some(swap), "Collateral-only mint requested".to_string())
    } else {
        pick_better(mint, swap, "minting", "swapping", DOLLAR_DECIMALS)
    };

    Ok(finish(amount, Direction::Deposit, prices, selected, other, reason))
}

fn withdraw_route(
    amount: U256,
    policy: &WithdrawPolicy,
    state: &ProtocolState,
    prices: &OraclePrices,
    quote: &AmmQuote,
) -> Result<OptimalRouteResult> {
    let redeem = math::redeem_output(amount, state, prices)?;
    let redeem = Candidate {
        route_type: RouteType::Redeem,
        output: redeem.collateral_out,
        paused_reason: state.redeem_paused.then_some("Redemptions are paused for this collateral"),
        governance: (!redeem.governance_out.is_zero()).then_some(redeem.governance_out),
    };
    let swap = swap_candidate(quote);

    let threshold = state.redeem_price_threshold;
    let (selected, other, reason) = if policy.force_swap_only {
        (swap, Some(redeem), "Swap-only requested".to_string())
    } else if !threshold.is_zero() && prices.dollar_price > threshold {
        let reason = format!(
            "Redemptions disabled: dollar price {} is above the redeem threshold {}",
            format_amount(prices.dollar_price, 6, 4),
            format_amount(threshold, 6, 4)
        );
        (swap, None, reason)
    } else if !math::is_fully_collateralized(state) && !policy.accept_fractional {
        let reason =
            "Fractional redemption not accepted while the protocol is partially collateralized"
                .to_string();
        (swap, None, reason)
    } else {
        pick_better(
            redeem,
            swap,
            "redeeming",
            "swapping",
            state.collateral_decimals,
        )
    };

    Ok(finish(amount, Direction::Withdraw, prices, selected, other, reason))
}

/// Larger output wins; ties go to the protocol route.
fn pick_better(
    protocol: Candidate,
    swap: Candidate,
    protocol_verb: &str,
    swap_verb: &str,
    decimals: u8,
) -> (Candidate, Option<Candidate>, String) {
    let (selected, other, winner, loser) = if swap.output > protocol.output {
        (swap, protocol, swap_verb, protocol_verb)
    } else {
        (protocol, swap, protocol_verb, swap_verb)
    };
    let diff = selected.output - other.output;
    let pct = math::savings(selected.output, other.output).percentage;
    let reason = format!(
        "{}{} returns {} more than {} ({:.3}%)",
        winner[..1].to_uppercase(),
        &winner[1..],
        format_amount(diff, decimals, 6),
        loser,
        pct
    );
    (selected, Some(other), reason)
}

fn finish(
    amount: U256,
    direction: Direction,
    prices: &OraclePrices,
    selected: Candidate,
    other: Option<Candidate>,
    reason: String,
) -> OptimalRouteResult {
    let savings = other
        .as_ref()
        .map_or_else(Savings::none, |o| math::savings(selected.output, o.output));
    let is_governance_operation = selected.governance.is_some();
    OptimalRouteResult {
        route_type: selected.route_type,
        direction,
        input_amount: amount,
        expected_output: selected.output,
        market_price: prices.dollar_price,
        is_enabled: selected.paused_reason.is_none(),
        disabled_reason: selected.paused_reason.map(str::to_string),
        is_governance_operation,
        bonus_amount: selected.governance,
        savings,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedInputs {
        state: Mutex<ProtocolState>,
        prices: OraclePrices,
        quote_out: U256,
        quote_paused: bool,
        fail_prices: bool,
    }

    #[async_trait]
    impl RouteInputs for FixedInputs {
        async fn protocol_state(&self) -> Result<ProtocolState> {
            Ok(self.state.lock().unwrap().clone())
        }

        async fn oracle_prices(&self) -> Result<OraclePrices> {
            if self.fail_prices {
                return Err(SdkError::classify("collateral price feed is stale"));
            }
            Ok(self.prices.clone())
        }

        async fn amm_quote(&self, _direction: Direction, amount_in: U256) -> Result<AmmQuote> {
            Ok(AmmQuote {
                amount_in,
                amount_out: self.quote_out,
                is_paused: self.quote_paused,
            })
        }
    }

    fn tokens(n: u64) -> U256 {
        U256::from(n) * U256::exp10(18)
    }

    fn fixed(quote_out: U256) -> FixedInputs {
        FixedInputs {
            state: Mutex::new(ProtocolState {
                collateral_ratio: U256::from(1_000_000u64),
                minting_fee: U256::from(2_000u64),
                redemption_fee: U256::from(2_000u64),
                mint_paused: false,
                redeem_paused: false,
                mint_price_threshold: U256::from(990_000u64),
                redeem_price_threshold: U256::from(1_010_000u64),
                collateral_decimals: 18,
            }),
            prices: OraclePrices {
                collateral_price: U256::from(1_000_000u64),
                dollar_price: U256::from(1_000_000u64),
                governance_price: U256::from(500_000u64),
            },
            quote_out,
            quote_paused: false,
            fail_prices: false,
        }
    }

    fn engine(inputs: FixedInputs) -> RouteEngine {
        RouteEngine::new(Arc::new(inputs), RouteDefaults::default())
    }

    #[tokio::test]
    async fn picks_swap_when_it_pays_more() {
        let route = engine(fixed(tokens(1005)))
            .get_optimal_deposit_route(tokens(1000), false)
            .await
            .unwrap();
        assert_eq!(route.route_type, RouteType::Swap);
        assert_eq!(route.expected_output, tokens(1005));
        assert!(route.is_enabled);
        assert!(!route.is_governance_operation);
        assert!((route.savings.percentage - 0.701_402_805_6).abs() < 1e-6);
        assert!(route.reason.starts_with("Swapping returns 7"));
        assert!(route.reason.ends_with("than minting (0.701%)"));
    }

    #[tokio::test]
    async fn picks_mint_when_it_pays_more() {
        let route = engine(fixed(tokens(990)))
            .get_optimal_deposit_route(tokens(1000), false)
            .await
            .unwrap();
        assert_eq!(route.route_type, RouteType::Mint);
        assert_eq!(route.expected_output, tokens(998));
        assert!(route.savings.amount > ethers::types::I256::zero());
    }

    #[tokio::test]
    async fn collateral_only_forces_mint() {
        let route = engine(fixed(tokens(1005)))
            .get_optimal_deposit_route(tokens(1000), true)
            .await
            .unwrap();
        assert_eq!(route.route_type, RouteType::Mint);
        assert_eq!(route.expected_output, tokens(998));
        assert!(route.savings.percentage < 0.0);
    }

    #[tokio::test]
    async fn mint_below_threshold_uses_swap() {
        let mut inputs = fixed(tokens(900));
        inputs.prices.dollar_price = U256::from(980_000u64);
        let route = engine(inputs)
            .get_optimal_deposit_route(tokens(1000), true)
            .await
            .unwrap();
        assert_eq!(route.route_type, RouteType::Swap);
        assert_eq!(route.savings, Savings::none());
        assert!(route.reason.contains("below the mint threshold"));
    }

    #[tokio::test]
    async fn paused_selection_is_surfaced_not_replaced() {
        let inputs = fixed(tokens(990));
        inputs.state.lock().unwrap().mint_paused = true;
        let route = engine(inputs)
            .get_optimal_deposit_route(tokens(1000), false)
            .await
            .unwrap();
        assert_eq!(route.route_type, RouteType::Mint);
        assert!(!route.is_enabled);
        assert!(route.disabled_reason.unwrap().contains("paused"));

        let mut inputs = fixed(tokens(1005));
        inputs.quote_paused = true;
        let route = engine(inputs)
            .get_optimal_deposit_route(tokens(1000), false)
            .await
            .unwrap();
        assert_eq!(route.route_type, RouteType::Swap);
        assert_eq!(route.disabled_reason.as_deref(), Some("AMM pool is paused"));
    }

    #[tokio::test]
    async fn redeem_above_threshold_uses_swap() {
        let mut inputs = fixed(tokens(990));
        inputs.prices.dollar_price = U256::from(1_020_000u64);
        let route = engine(inputs)
            .get_optimal_withdraw_route(tokens(1000), false)
            .await
            .unwrap();
        assert_eq!(route.route_type, RouteType::Swap);
        assert_eq!(route.expected_output, tokens(990));
        assert_eq!(route.savings, Savings::none());
        assert!(route.reason.contains("above the redeem threshold"));
    }

    #[tokio::test]
    async fn paused_redeem_is_surfaced_not_replaced() {
        let inputs = fixed(tokens(990));
        inputs.state.lock().unwrap().redeem_paused = true;
        let route = engine(inputs)
            .get_optimal_withdraw_route(tokens(1000), false)
            .await
            .unwrap();
        assert_eq!(route.route_type, RouteType::Redeem);
        assert!(!route.is_enabled);
        assert_eq!(
            route.disabled_reason.as_deref(),
            Some("Redemptions are paused for this collateral")
        );
    }

    #[tokio::test]
    async fn oversized_deposit_is_rejected() {
        let inputs = fixed(tokens(1));
        inputs.state.lock().unwrap().collateral_decimals = 6;
        let err = engine(inputs)
            .get_optimal_deposit_route(U256::exp10(60), true)
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::PolicyViolation(_)));
        assert_eq!(err.to_string(), "amount too large");
    }

    #[tokio::test]
    async fn fractional_mint_reports_governance_bonus() {
        let inputs = fixed(tokens(990));
        inputs.state.lock().unwrap().collateral_ratio = U256::from(950_000u64);
        let route = engine(inputs)
            .get_optimal_deposit_route(tokens(950), false)
            .await
            .unwrap();
        assert_eq!(route.route_type, RouteType::Mint);
        assert!(route.is_governance_operation);
        assert_eq!(route.bonus_amount, Some(tokens(100)));
    }

    #[tokio::test]
    async fn withdraw_compares_redeem_and_swap() {
        let route = engine(fixed(tokens(990)))
            .get_optimal_withdraw_route(tokens(1000), false)
            .await
            .unwrap();
        assert_eq!(route.route_type, RouteType::Redeem);
        assert_eq!(route.expected_output, tokens(998));

        let route = engine(fixed(tokens(990)))
            .get_optimal_withdraw_route(tokens(1000), true)
            .await
            .unwrap();
        assert_eq!(route.route_type, RouteType::Swap);
    }

    #[tokio::test]
    async fn fractional_redeem_needs_acceptance() {
        let inputs = fixed(tokens(500));
        inputs.state.lock().unwrap().collateral_ratio = U256::from(900_000u64);
        let inputs = Arc::new(inputs);

        let strict = RouteEngine::new(inputs.clone(), RouteDefaults::default());
        let route = strict
            .get_optimal_withdraw_route(tokens(1000), false)
            .await
            .unwrap();
        assert_eq!(route.route_type, RouteType::Swap);

        let accepting = RouteEngine::new(
            inputs,
            RouteDefaults {
                accept_fractional: true,
                ..RouteDefaults::default()
            },
        );
        let route = accepting
            .get_optimal_withdraw_route(tokens(1000), false)
            .await
            .unwrap();
        assert_eq!(route.route_type, RouteType::Redeem);
        assert!(route.is_governance_operation);
    }

    #[tokio::test]
    async fn input_failures_propagate() {
        let mut inputs = fixed(tokens(1005));
        inputs.fail_prices = true;
        let err = engine(inputs)
            .get_optimal_deposit_route(tokens(1000), false)
            .await
            .unwrap_err();
        assert!(err.is_upstream_staleness());
    }

    #[tokio::test]
    async fn zero_amount_is_rejected() {
        let err = engine(fixed(tokens(1)))
            .get_optimal_route(U256::zero(), RoutePolicy::Withdraw(WithdrawPolicy::default()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "amount must be greater than zero");
    }
}
