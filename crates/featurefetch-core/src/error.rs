//! Error types for featurefetch
//!
//! Every failure that can happen while answering a single request is a
//! [`FetchError`]. Errors are data: the dispatcher attaches them to the
//! offending response instead of aborting the batch, so the type is `Clone`
//! (one failed store lookup can fan out to several requests) and carries its
//! context as plain strings.

use thiserror::Error;

/// Result type alias for operations that can fail
pub type Result<T> = std::result::Result<T, FetchError>;

/// All possible errors that can occur while fetching features
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// The metadata source has no GroupBy or Join with this name
    #[error("Unknown GroupBy or Join '{0}'")]
    UnknownName(String),

    /// Entity keys are missing or do not match the key schema
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A Join references itself, directly or through nested Joins
    ///
    /// The payload is the dependency path that closes the cycle,
    /// e.g. `["a", "b", "a"]`.
    #[error("Cyclic definition: {}", .0.join(" -> "))]
    CyclicDefinition(Vec<String>),

    /// No retained snapshot is old enough to answer the as-of timestamp
    #[error("Cannot serve as of {at_millis}: earliest retained checkpoint is {earliest_checkpoint}")]
    StaleRequest {
        at_millis: i64,
        earliest_checkpoint: i64,
    },

    /// Partial-aggregate state could not be decoded or merged
    #[error("Aggregation error: {0}")]
    Aggregation(String),

    /// A store call or the batch deadline was exceeded
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Transport or connection failure talking to the store
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to encode or decode a stored value
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FetchError {
    pub fn unknown_name(name: impl Into<String>) -> Self {
        Self::UnknownName(name.into())
    }

    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    pub fn aggregation(msg: impl Into<String>) -> Self {
        Self::Aggregation(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a Serialization error from any error type
    pub fn serialization<E: std::error::Error>(err: E) -> Self {
        Self::Serialization(err.to_string())
    }

    /// Stable snake_case label, used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownName(_) => "unknown_name",
            Self::InvalidKey(_) => "invalid_key",
            Self::CyclicDefinition(_) => "cyclic_definition",
            Self::StaleRequest { .. } => "stale_request",
            Self::Aggregation(_) => "aggregation",
            Self::Timeout(_) => "timeout",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Config(_) => "config",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Whether a store client may retry the call that produced this error
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}
