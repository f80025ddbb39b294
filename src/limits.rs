//! Limit definitions and millitoken conversions.
//!
//! A [`LimitSpec`] is the static shape of one limit: steady-state
//! `capacity`, an optional `burst` ceiling (defaults to capacity), and a
//! refill of `refill_amount` tokens every `refill_period`. A bucket for an
//! `(entity, resource)` pair holds one token count per named limit; the
//! mapping from limit name to spec is a [`LimitSet`].
//!
//! Token arithmetic inside the crate is integer millitokens (token ×
//! 1000); these types own the boundary conversions.

use crate::error::{LimiterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Millitokens per token.
pub const MILLI: i64 = 1000;

/// Converts whole tokens to millitokens.
pub fn to_milli(tokens: u64) -> i64 {
    tokens as i64 * MILLI
}

/// Converts a signed whole-token delta to millitokens.
pub fn delta_to_milli(tokens: i64) -> i64 {
    tokens * MILLI
}

/// Static definition of a single limit.
///
/// # Example
///
/// ```rust
/// use tokengate::limits::LimitSpec;
///
/// // 100 requests per minute, bursting to 150.
/// let rpm = LimitSpec::per_minute(100).with_burst(150);
/// assert_eq!(rpm.burst(), 150);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSpec {
    /// Steady-state capacity in whole tokens.
    pub capacity: u64,
    /// Burst ceiling in whole tokens; `None` means equal to `capacity`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u64>,
    /// Tokens restored per refill period.
    pub refill_amount: u64,
    /// Length of one refill period.
    #[serde(with = "humantime_serde")]
    pub refill_period: Duration,
}

impl LimitSpec {
    pub fn new(capacity: u64, refill_amount: u64, refill_period: Duration) -> Self {
        Self {
            capacity,
            burst: None,
            refill_amount,
            refill_period,
        }
    }

    /// A limit that restores its full capacity every minute.
    pub fn per_minute(capacity: u64) -> Self {
        Self::new(capacity, capacity, Duration::from_secs(60))
    }

    /// A limit that restores its full capacity every second.
    pub fn per_second(capacity: u64) -> Self {
        Self::new(capacity, capacity, Duration::from_secs(1))
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    /// Effective burst ceiling in whole tokens.
    pub fn burst(&self) -> u64 {
        self.burst.unwrap_or(self.capacity)
    }

    /// Refill period in whole seconds.
    pub fn refill_period_secs(&self) -> u64 {
        self.refill_period.as_secs()
    }

    /// Checks the spec parameters.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(LimiterError::Validation(
                "limit capacity must be greater than 0".to_string(),
            ));
        }
        if self.refill_amount == 0 {
            return Err(LimiterError::Validation(
                "limit refill amount must be greater than 0".to_string(),
            ));
        }
        if self.refill_period.as_secs() == 0 {
            return Err(LimiterError::Validation(
                "limit refill period must be at least 1 second".to_string(),
            ));
        }
        if self.burst() < self.capacity {
            return Err(LimiterError::Validation(
                "limit burst must not be below capacity".to_string(),
            ));
        }
        Ok(())
    }
}

/// Named limits of one `(entity, resource)` bucket or config record.
///
/// A `BTreeMap` keeps attribute ordering deterministic in rendered store
/// expressions.
pub type LimitSet = BTreeMap<String, LimitSpec>;

/// Whole-token consumption request: limit name to amount.
pub type ConsumeMap = BTreeMap<String, u64>;

/// Signed whole-token adjustment: positive means additional consumption,
/// negative means refund.
pub type AdjustMap = BTreeMap<String, i64>;

/// Validates every spec in a set.
pub fn validate_limit_set(limits: &LimitSet) -> Result<()> {
    for (limit, spec) in limits {
        spec.validate()
            .map_err(|e| LimiterError::Validation(format!("limit '{limit}': {e}")))?;
    }
    Ok(())
}

/// Total whole tokens requested across all limits of a consume map.
pub fn total_requested(consume: &ConsumeMap) -> u64 {
    consume.values().sum()
}
