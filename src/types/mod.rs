//! Shared data types.

pub mod chain_data;
pub mod conversions;

pub use chain_data::{
    AmmQuote, Direction, OraclePrices, PriceRef, ProtocolReadout, ProtocolState, TrackedToken, VenueReadout,
    PRICE_PRECISION,
};
