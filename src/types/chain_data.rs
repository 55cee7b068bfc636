use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

/// Precision of prices, ratios and fees read from the pool (1e6 == 1.0).
pub const PRICE_PRECISION: u64 = 1_000_000;

/// Result of the protocol multicall: collateral ratio, oracle prices, collaterals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolReadout {
    /// 1e6 == fully collateralized.
    pub collateral_ratio: U256,
    pub dollar_price: U256,
    pub governance_price: U256,
    pub collateral_price: U256,
    pub collaterals: Vec<Address>,
}

/// External venue exchange rate plus two raw storage slots holding policy thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueReadout {
    /// Dollar tokens received for one whole collateral token, 18 decimals.
    pub exchange_rate: U256,
    pub mint_price_threshold: U256,
    pub redeem_price_threshold: U256,
}

/// Inputs the route engine needs about the protocol itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolState {
    pub collateral_ratio: U256,
    /// Fees in PRICE_PRECISION units (10_000 == 1%).
    pub minting_fee: U256,
    pub redemption_fee: U256,
    pub mint_paused: bool,
    pub redeem_paused: bool,
    /// Minting is only allowed while the dollar trades at or above this price.
    pub mint_price_threshold: U256,
    /// Redeeming is only allowed while the dollar trades at or below this price.
    pub redeem_price_threshold: U256,
    pub collateral_decimals: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OraclePrices {
    pub collateral_price: U256,
    pub dollar_price: U256,
    pub governance_price: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmmQuote {
    pub amount_in: U256,
    pub amount_out: U256,
    /// The pool reports itself as killed/paused.
    pub is_paused: bool,
}

/// Which price values a tracked token in USD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceRef {
    Dollar,
    Governance,
    Collateral,
    /// Fixed at $1.
    Pegged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedToken {
    pub symbol: String,
    pub address: Address,
    pub decimals: u8,
    pub price_ref: PriceRef,
}

/// Conversion direction between the collateral and the dollar token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Collateral in, dollar out (mint or swap).
    Deposit,
    /// Dollar in, collateral out (redeem or swap).
    Withdraw,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Deposit => "deposit",
            Direction::Withdraw => "withdraw",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
