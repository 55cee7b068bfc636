//! # Dollar Route SDK
//!
//! Route selection and data freshness for a collateral-backed dollar token. For a
//! deposit or withdrawal the SDK compares the protocol path (mint / redeem against
//! the collateral pool) with the market path (swap on the AMM venue) and reports
//! the better one together with its savings.
//!
//! ## Overview
//!
//! - **Routing**: fixed-point mint/redeem math, price-threshold gates and caller policies
//! - **Caching**: per-category TTL caches with stale fallback, single-flight fetches
//!   and optional durable persistence
//! - **Batching**: historical venue reads coalesced into one JSON-RPC batch per debounce window
//! - **Refresh**: a periodic scheduler that reads protocol, venue and balance state in
//!   parallel and publishes immutable snapshots to subscribers
//!
//! ## Architecture
//!
//! ### Chain Layer
//! Contract bindings and Multicall3 batching behind the [`chain::DataSource`] trait.
//!
//! ### Route Layer
//! [`route::RouteEngine`] consumes [`route::RouteInputs`]; in production the inputs are
//! served through [`route::CachedRouteInputs`].
//!
//! ### Service Layer
//! [`context::SdkContext`] is the composition root that wires every service from
//! [`settings::Settings`].

// Core Types
/// Common types and data structures
pub mod types;
/// Error taxonomy shared by every service
pub mod error;
/// Wall clock anchored to the tokio timer
pub mod clock;

// Chain Layer
/// Smart contract ABIs (read-only)
pub mod contracts;
/// Multicall3 batch RPC utilities
pub mod multicall;
/// On-chain data sources
pub mod chain;

// Routing
/// Optimal route selection between protocol and AMM paths
pub mod route;

// Caching & Batching
/// TTL cache with stale fallback and durable persistence
pub mod cache;
/// Debounced JSON-RPC batch aggregation
pub mod batch;
/// Venue price history over block ranges
pub mod history;

// Background Services
/// Periodic batched refresh with snapshot subscribers
pub mod scheduler;
/// Cancelable background task handles
pub mod task;

// Infrastructure
/// Metrics and observability
pub mod metrics;
/// Block sampling utilities
pub mod utils;
/// Configuration management
pub mod settings;
/// Service composition root
pub mod context;

// Re-exports for convenience
pub use cache::TtlCache;
pub use context::SdkContext;
pub use error::{Result, SdkError};
pub use route::{OptimalRouteResult, RouteEngine, RoutePolicy};
pub use scheduler::{RefreshScheduler, RefreshSnapshot};
pub use settings::Settings;
