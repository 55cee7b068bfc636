//! On-chain reads behind the scheduler and the route engine.
//!
//! [`DataSource`] is the seam: the scheduler and the route engine only see the
//! trait, tests plug in fakes, and [`RpcDataSource`] implements it over any
//! ethers `Middleware` using Multicall3 plus raw storage reads.

use crate::contracts::{Erc20, ICurvePool, IDollarPool};
use crate::error::Result;
use crate::multicall::{Call, CallOutcome, Multicall};
use crate::route::source::RouteInputs;
use crate::types::{
    AmmQuote, Direction, OraclePrices, ProtocolReadout, ProtocolState, TrackedToken, VenueReadout,
};
use async_trait::async_trait;
use ethers::abi::Token;
use ethers::prelude::*;
use indexmap::IndexMap;
use log::debug;
use std::sync::Arc;

/// Reads the scheduler performs every tick. Route inputs come from the
/// [`RouteInputs`] supertrait so one source can feed both.
#[async_trait]
pub trait DataSource: RouteInputs {
    /// Phase 1: collateral ratio, the three oracle prices and the collateral list.
    async fn protocol_readout(&self) -> Result<ProtocolReadout>;

    /// Phase 2: balances of `account` for every tracked token, keyed by token address.
    async fn balances(
        &self,
        account: Address,
        tokens: &[TrackedToken],
    ) -> Result<IndexMap<Address, U256>>;

    /// Phase 3: venue exchange rate plus the two threshold storage slots.
    async fn venue_readout(&self) -> Result<VenueReadout>;
}

/// Stable-swap venue the dollar trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VenueConfig {
    pub address: Address,
    /// Coin index of the collateral inside the venue.
    pub collateral_index: i128,
    /// Coin index of the dollar inside the venue.
    pub dollar_index: i128,
}

impl VenueConfig {
    /// `(i, j)` for a `get_dy` call in `direction`.
    pub fn indices(&self, direction: Direction) -> (i128, i128) {
        match direction {
            Direction::Deposit => (self.collateral_index, self.dollar_index),
            Direction::Withdraw => (self.dollar_index, self.collateral_index),
        }
    }
}

/// Addresses and storage layout the RPC data source reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub pool: Address,
    pub collateral: Address,
    pub collateral_decimals: u8,
    pub venue: VenueConfig,
    pub multicall: Address,
    /// Pool storage slot holding the mint price threshold.
    pub mint_threshold_slot: H256,
    /// Pool storage slot holding the redeem price threshold.
    pub redeem_threshold_slot: H256,
    pub multicall_batch_size: usize,
}

/// `DataSource` over a JSON-RPC provider.
pub struct RpcDataSource<M: Middleware> {
    provider: Arc<M>,
    config: ChainConfig,
    multicall: Multicall<M>,
    pool: IDollarPool<M>,
    venue: ICurvePool<M>,
    erc20: Erc20<M>,
}

impl<M: Middleware + 'static> RpcDataSource<M> {
    pub fn new(provider: Arc<M>, config: ChainConfig) -> Self {
        let multicall = Multicall::new(
            provider.clone(),
            config.multicall,
            config.multicall_batch_size,
        );
        let pool = IDollarPool::new(config.pool, provider.clone());
        let venue = ICurvePool::new(config.venue.address, provider.clone());
        // Used only for its ABI; the target is set per call.
        let erc20 = Erc20::new(Address::zero(), provider.clone());
        Self {
            provider,
            config,
            multicall,
            pool,
            venue,
            erc20,
        }
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    async fn read_threshold_slots(&self) -> anyhow::Result<(U256, U256)> {
        let (mint, redeem) = tokio::try_join!(
            self.provider
                .get_storage_at(self.config.pool, self.config.mint_threshold_slot, None),
            self.provider
                .get_storage_at(self.config.pool, self.config.redeem_threshold_slot, None),
        )?;
        Ok((
            U256::from_big_endian(mint.as_bytes()),
            U256::from_big_endian(redeem.as_bytes()),
        ))
    }

    async fn read_protocol(&self) -> anyhow::Result<ProtocolReadout> {
        let abi = self.pool.abi();
        let ratio_fn = abi.function("collateralRatio")?;
        let dollar_fn = abi.function("getDollarPriceUsd")?;
        let governance_fn = abi.function("getGovernancePriceUsd")?;
        let collaterals_fn = abi.function("allCollaterals")?;
        let info_fn = abi.function("collateralInformation")?;

        let pool = self.config.pool;
        let calls = vec![
            Call::encode(pool, ratio_fn, &[])?,
            Call::encode(pool, dollar_fn, &[])?,
            Call::encode(pool, governance_fn, &[])?,
            Call::encode(pool, collaterals_fn, &[])?,
            Call::encode(pool, info_fn, &[Token::Address(self.config.collateral)])?,
        ];
        let outcomes = self.multicall.run(calls, None).await?;

        let collaterals = first_token(&outcomes[3], collaterals_fn)?
            .into_array()
            .ok_or_else(|| anyhow::anyhow!("allCollaterals: expected address[]"))?
            .into_iter()
            .filter_map(Token::into_address)
            .collect();
        let info = CollateralInfo::decode(&outcomes[4], info_fn)?;

        Ok(ProtocolReadout {
            collateral_ratio: decode_uint(&outcomes[0], ratio_fn)?,
            dollar_price: decode_uint(&outcomes[1], dollar_fn)?,
            governance_price: decode_uint(&outcomes[2], governance_fn)?,
            collateral_price: info.price,
            collaterals,
        })
    }

    async fn read_balances(
        &self,
        account: Address,
        tokens: &[TrackedToken],
    ) -> anyhow::Result<IndexMap<Address, U256>> {
        let balance_fn = self.erc20.abi().function("balanceOf")?;
        let calls = tokens
            .iter()
            .map(|t| Call::encode(t.address, balance_fn, &[Token::Address(account)]))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let outcomes = self.multicall.run(calls, None).await?;

        let mut balances = IndexMap::with_capacity(tokens.len());
        for (token, outcome) in tokens.iter().zip(outcomes.iter()) {
            balances.insert(token.address, decode_uint(outcome, balance_fn)?);
        }
        debug!("Read {} balances for {:?}", balances.len(), account);
        Ok(balances)
    }

    async fn read_venue(&self) -> anyhow::Result<VenueReadout> {
        let (i, j) = self.config.venue.indices(Direction::Deposit);
        let one_collateral = U256::exp10(usize::from(self.config.collateral_decimals));
        let rate = async {
            self.venue
                .get_dy(i, j, one_collateral)
                .call()
                .await
                .map_err(|e| anyhow::anyhow!("get_dy failed: {}", e))
        };
        let (exchange_rate, (mint_price_threshold, redeem_price_threshold)) =
            tokio::try_join!(rate, self.read_threshold_slots())?;
        Ok(VenueReadout {
            exchange_rate,
            mint_price_threshold,
            redeem_price_threshold,
        })
    }

    async fn read_protocol_state(&self) -> anyhow::Result<ProtocolState> {
        let abi = self.pool.abi();
        let ratio_fn = abi.function("collateralRatio")?;
        let info_fn = abi.function("collateralInformation")?;
        let pool = self.config.pool;
        let calls = vec![
            Call::encode(pool, ratio_fn, &[])?,
            Call::encode(pool, info_fn, &[Token::Address(self.config.collateral)])?,
        ];
        let (outcomes, (mint_price_threshold, redeem_price_threshold)) =
            tokio::try_join!(self.multicall.run(calls, None), self.read_threshold_slots())?;
        let info = CollateralInfo::decode(&outcomes[1], info_fn)?;

        Ok(ProtocolState {
            collateral_ratio: decode_uint(&outcomes[0], ratio_fn)?,
            minting_fee: info.minting_fee,
            redemption_fee: info.redemption_fee,
            mint_paused: info.is_mint_paused || !info.is_enabled,
            redeem_paused: info.is_redeem_paused || !info.is_enabled,
            mint_price_threshold,
            redeem_price_threshold,
            collateral_decimals: info.decimals(),
        })
    }

    async fn read_oracle_prices(&self) -> anyhow::Result<OraclePrices> {
        let abi = self.pool.abi();
        let dollar_fn = abi.function("getDollarPriceUsd")?;
        let governance_fn = abi.function("getGovernancePriceUsd")?;
        let info_fn = abi.function("collateralInformation")?;
        let pool = self.config.pool;
        let calls = vec![
            Call::encode(pool, dollar_fn, &[])?,
            Call::encode(pool, governance_fn, &[])?,
            Call::encode(pool, info_fn, &[Token::Address(self.config.collateral)])?,
        ];
        let outcomes = self.multicall.run(calls, None).await?;
        Ok(OraclePrices {
            dollar_price: decode_uint(&outcomes[0], dollar_fn)?,
            governance_price: decode_uint(&outcomes[1], governance_fn)?,
            collateral_price: CollateralInfo::decode(&outcomes[2], info_fn)?.price,
        })
    }

    async fn read_amm_quote(&self, direction: Direction, amount_in: U256) -> anyhow::Result<AmmQuote> {
        let abi = self.venue.abi();
        let get_dy_fn = abi.function("get_dy")?;
        let killed_fn = abi.function("is_killed")?;
        let (i, j) = self.config.venue.indices(direction);
        let venue = self.config.venue.address;
        let calls = vec![
            Call::encode(
                venue,
                get_dy_fn,
                &[Token::Int(i128_token(i)), Token::Int(i128_token(j)), Token::Uint(amount_in)],
            )?,
            Call::encode(venue, killed_fn, &[])?,
        ];
        let outcomes = self.multicall.run(calls, None).await?;
        // Newer stable-swap pools have no `is_killed`; a failed read means not killed.
        let is_paused = first_token(&outcomes[1], killed_fn)
            .ok()
            .and_then(Token::into_bool)
            .unwrap_or(false);
        Ok(AmmQuote {
            amount_in,
            amount_out: decode_uint(&outcomes[0], get_dy_fn)?,
            is_paused,
        })
    }
}

#[async_trait]
impl<M: Middleware + 'static> RouteInputs for RpcDataSource<M> {
    async fn protocol_state(&self) -> Result<ProtocolState> {
        Ok(self.read_protocol_state().await?)
    }

    async fn oracle_prices(&self) -> Result<OraclePrices> {
        Ok(self.read_oracle_prices().await?)
    }

    async fn amm_quote(&self, direction: Direction, amount_in: U256) -> Result<AmmQuote> {
        Ok(self.read_amm_quote(direction, amount_in).await?)
    }
}

#[async_trait]
impl<M: Middleware + 'static> DataSource for RpcDataSource<M> {
    async fn protocol_readout(&self) -> Result<ProtocolReadout> {
        Ok(self.read_protocol().await?)
    }

    async fn balances(
        &self,
        account: Address,
        tokens: &[TrackedToken],
    ) -> Result<IndexMap<Address, U256>> {
        if tokens.is_empty() {
            return Ok(IndexMap::new());
        }
        Ok(self.read_balances(account, tokens).await?)
    }

    async fn venue_readout(&self) -> Result<VenueReadout> {
        Ok(self.read_venue().await?)
    }
}

/// Fields of the pool's `collateralInformation` struct the SDK uses.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CollateralInfo {
    is_enabled: bool,
    missing_decimals: U256,
    price: U256,
    is_mint_paused: bool,
    is_redeem_paused: bool,
    minting_fee: U256,
    redemption_fee: U256,
}

impl CollateralInfo {
    fn decode(outcome: &CallOutcome, function: &ethers::abi::Function) -> anyhow::Result<Self> {
        let fields = first_token(outcome, function)?
            .into_tuple()
            .ok_or_else(|| anyhow::anyhow!("collateralInformation: expected tuple"))?;
        Self::from_fields(fields)
    }

    fn from_fields(fields: Vec<Token>) -> anyhow::Result<Self> {
        if fields.len() < 14 {
            anyhow::bail!("collateralInformation: expected 14 fields, got {}", fields.len());
        }
        let uint = |i: usize| {
            fields[i]
                .clone()
                .into_uint()
                .ok_or_else(|| anyhow::anyhow!("collateralInformation: field {} is not uint", i))
        };
        let flag = |i: usize| {
            fields[i]
                .clone()
                .into_bool()
                .ok_or_else(|| anyhow::anyhow!("collateralInformation: field {} is not bool", i))
        };
        Ok(Self {
            is_enabled: flag(5)?,
            missing_decimals: uint(6)?,
            price: uint(7)?,
            is_mint_paused: flag(9)?,
            is_redeem_paused: flag(10)?,
            minting_fee: uint(12)?,
            redemption_fee: uint(13)?,
        })
    }

    fn decimals(&self) -> u8 {
        18u8.saturating_sub(self.missing_decimals.min(U256::from(18u8)).as_u32() as u8)
    }
}

fn first_token(outcome: &CallOutcome, function: &ethers::abi::Function) -> anyhow::Result<Token> {
    outcome
        .decode(function)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("{} returned no values", function.name))
}

fn decode_uint(outcome: &CallOutcome, function: &ethers::abi::Function) -> anyhow::Result<U256> {
    first_token(outcome, function)?
        .into_uint()
        .ok_or_else(|| anyhow::anyhow!("{} did not return a uint", function.name))
}

/// Two's-complement `int128` as an ABI word.
fn i128_token(value: i128) -> U256 {
    let word = I256::from(value);
    word.into_raw()
}
