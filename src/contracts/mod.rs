// Contracts Module - Public ABIs Only (read paths)

pub mod erc20;
pub mod i_curve_pool;
pub mod i_dollar_pool;

pub use erc20::Erc20;
pub use i_curve_pool::ICurvePool;
pub use i_dollar_pool::IDollarPool;
