//! Error taxonomy shared by the cache, aggregator, scheduler and route engine.
//!
//! Every variant carries plain strings so a single failure can be cloned out to
//! all waiters of a deduplicated fetch or a coalesced batch.

use thiserror::Error;

/// Phrases an upstream source uses when its own inputs are out of date.
const STALENESS_PHRASES: [&str; 3] = ["stale", "oracle", "price feed"];

pub type Result<T> = std::result::Result<T, SdkError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdkError {
    /// Network or transport failure. Eligible for stale fallback.
    #[error("transient fetch failure: {0}")]
    TransientFetch(String),

    /// The data source reported that its own inputs are stale.
    #[error("upstream data is stale: {0}")]
    UpstreamStaleness(String),

    /// The requested operation is disabled or the request violates a precondition.
    /// Never retried, shown verbatim.
    #[error("{0}")]
    PolicyViolation(String),

    /// The wire-level batch call failed; every caller of the flush receives this.
    #[error("batch request failed: {0}")]
    AggregationFailure(String),

    #[error("durable storage error: {0}")]
    Storage(String),

    /// Durable storage has no room left for the write.
    #[error("durable storage quota exceeded")]
    QuotaExceeded,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Coarse failure class used for diagnostics and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Transient,
    UpstreamStaleness,
    Policy,
    Aggregation,
    Other,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::UpstreamStaleness => "upstream_staleness",
            FailureKind::Policy => "policy",
            FailureKind::Aggregation => "aggregation",
            FailureKind::Other => "other",
        }
    }
}

impl SdkError {
    /// Map a raw upstream failure message to a fetch error.
    ///
    /// Messages mentioning a known staleness phrase become `UpstreamStaleness`,
    /// everything else is `TransientFetch`.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_staleness_message(&message) {
            SdkError::UpstreamStaleness(message)
        } else {
            SdkError::TransientFetch(message)
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            SdkError::TransientFetch(_) => FailureKind::Transient,
            SdkError::UpstreamStaleness(_) => FailureKind::UpstreamStaleness,
            SdkError::PolicyViolation(_) => FailureKind::Policy,
            SdkError::AggregationFailure(_) => FailureKind::Aggregation,
            _ => FailureKind::Other,
        }
    }

    /// Whether a cache may answer this failure with previously stored data.
    pub fn allows_stale_fallback(&self) -> bool {
        matches!(
            self,
            SdkError::TransientFetch(_) | SdkError::UpstreamStaleness(_)
        )
    }

    pub fn is_upstream_staleness(&self) -> bool {
        matches!(self, SdkError::UpstreamStaleness(_))
    }
}

fn is_staleness_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    STALENESS_PHRASES.iter().any(|p| lower.contains(p))
}

impl From<anyhow::Error> for SdkError {
    fn from(err: anyhow::Error) -> Self {
        // `{:#}` keeps the context chain, which is where revert reasons end up.
        SdkError::classify(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::Decode(err.to_string())
    }
}

impl From<std::io::Error> for SdkError {
    fn from(err: std::io::Error) -> Self {
        SdkError::Storage(err.to_string())
    }
}
