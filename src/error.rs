//! Error types for all tokengate operations.
//!
//! Two planes share one enum. The caller-visible kinds are the seven
//! variants from [`RateLimitExceeded`](LimiterError::RateLimitExceeded)
//! through [`ConfigMissing`](LimiterError::ConfigMissing); they are what
//! `acquire` and the admin operations surface. The internal plane
//! ([`ConditionFailed`](LimiterError::ConditionFailed) and
//! [`Storage`](LimiterError::Storage)) drives write-path selection and the
//! retry policy inside the repository and is never returned raw by the
//! engine.

use thiserror::Error;

/// A single limit that blocked an acquire.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitViolation {
    /// Entity whose bucket rejected the consumption (the child or, under
    /// cascade, the parent).
    pub entity_id: String,
    /// Limit name within the bucket.
    pub limit: String,
    /// Tokens requested, in millitokens.
    pub requested_milli: i64,
    /// Tokens available at decision time, in millitokens.
    pub available_milli: i64,
    /// Seconds until the deficit refills for this limit alone.
    pub retry_after_seconds: f64,
}

/// Error type for all tokengate operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// A limit would go below zero after the requested consumption.
    #[error("rate limit exceeded, retry after {retry_after_seconds:.3}s")]
    RateLimitExceeded {
        /// Minimum wait for the deficit to refill, across failing limits.
        retry_after_seconds: f64,
        /// Per-limit deficits.
        violations: Vec<LimitViolation>,
    },

    /// The store was throttled or unreachable beyond the retry budget,
    /// under the `block` unavailability policy.
    #[error("rate limiter unavailable: {0}")]
    Unavailable(String),

    /// An operation referenced an entity that does not exist.
    #[error("entity not found: {0}")]
    EntityNotFound(String),

    /// `create_entity` duplicated an existing entity.
    #[error("entity already exists: {0}")]
    EntityExists(String),

    /// An identifier failed the grammar or a parameter was out of range.
    #[error("validation error: {0}")]
    Validation(String),

    /// The stored schema or minimum client version is incompatible with
    /// this client.
    #[error("version mismatch: {0}")]
    VersionMismatch(String),

    /// No limits were resolvable for the pair and no override was
    /// supplied.
    #[error("no limits configured for entity '{entity_id}' resource '{resource}'")]
    ConfigMissing { entity_id: String, resource: String },

    /// Internal: a conditional write was rejected by the store. The engine
    /// turns this into the Retry path (or a rate-limit failure after the
    /// re-read); it never reaches callers.
    #[error("conditional write rejected")]
    ConditionFailed,

    /// Internal: a store-level failure, classified by retryability.
    #[error("storage error: {message}")]
    Storage { message: String, retryable: bool },
}

impl LimiterError {
    /// Whether the repository retry loop may re-attempt the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LimiterError::Storage { retryable: true, .. })
    }

    /// Whether this is the internal conditional-check failure.
    pub fn is_condition_failed(&self) -> bool {
        matches!(self, LimiterError::ConditionFailed)
    }

    /// `Retry-After` header value for a rate-limit rejection: the wait in
    /// whole seconds, rounded up and never below 1.
    pub fn retry_after_header(&self) -> Option<String> {
        match self {
            LimiterError::RateLimitExceeded {
                retry_after_seconds,
                ..
            } => Some((retry_after_seconds.ceil().max(1.0) as u64).to_string()),
            _ => None,
        }
    }

    pub(crate) fn storage(message: impl Into<String>, retryable: bool) -> Self {
        LimiterError::Storage {
            message: message.into(),
            retryable,
        }
    }
}

/// Result type alias for tokengate operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
