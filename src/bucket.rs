//! Token-bucket state and millitoken math.
//!
//! All limits of one `(entity, resource)` pair live in a single bucket
//! record. Refill is lazy: acquire writes never store refilled tokens
//! directly. Instead the record carries one refill baseline `rf` (unix
//! seconds) shared by every limit, and a writer *claims* refill by
//! advancing `rf` under an optimistic-lock condition while adding the
//! corresponding millitokens in the same write.
//!
//! ```text
//! windows(n)   = floor((now - rf) / refill_period(n))
//! rf_new       = rf + windows(min-period limit) * min_period
//! claimable(n) = floor((rf_new - rf) / refill_period(n)) * refill_amount(n) * 1000
//! effective(n) = min(tokens(n) + claimable(n), burst(n) * 1000)
//! ```
//!
//! Decisions are made against `effective`, computed from the same
//! `rf_new` the subsequent write will set, so a write never subtracts
//! tokens the store cannot cover with the claimed refill. `retry_after`
//! for a deficit uses the continuous rate (`deficit × period / amount`),
//! the minimum wall-clock wait until the deficit has accrued.
//!
//! Millitokens are `i64`; token arithmetic is integer throughout. Only
//! the adjust path may take a token count negative.

use crate::error::LimitViolation;
use crate::limits::{to_milli, ConsumeMap, LimitSet, LimitSpec, MILLI};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in fractional seconds.
pub fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Per-limit slice of a bucket record.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitState {
    /// Current tokens in millitokens (`tk`).
    pub tokens_milli: i64,
    /// Steady-state capacity in whole tokens (`cp`).
    pub capacity: u64,
    /// Burst ceiling in whole tokens (`bx`).
    pub burst: u64,
    /// Tokens restored per refill period (`ra`).
    pub refill_amount: u64,
    /// Refill period in whole seconds (`rp`).
    pub refill_period_secs: u64,
    /// Monotonic total consumed in millitokens (`tc`).
    pub total_consumed_milli: i64,
}

impl LimitState {
    /// A freshly seeded limit: full burst, nothing consumed.
    pub fn seeded(spec: &LimitSpec) -> Self {
        Self {
            tokens_milli: to_milli(spec.burst()),
            capacity: spec.capacity,
            burst: spec.burst(),
            refill_amount: spec.refill_amount,
            refill_period_secs: spec.refill_period_secs(),
            total_consumed_milli: 0,
        }
    }

    /// The static spec this state was created from.
    pub fn spec(&self) -> LimitSpec {
        LimitSpec {
            capacity: self.capacity,
            burst: Some(self.burst),
            refill_amount: self.refill_amount,
            refill_period: std::time::Duration::from_secs(self.refill_period_secs),
        }
    }

    /// Millitokens this limit may claim when the baseline advances from
    /// `rf` to `rf_new`. Whole refill periods only.
    pub fn claimable_milli(&self, rf: f64, rf_new: f64) -> i64 {
        if rf_new <= rf || self.refill_period_secs == 0 {
            return 0;
        }
        let windows = ((rf_new - rf) / self.refill_period_secs as f64).floor() as i64;
        windows.saturating_mul(self.refill_amount as i64 * MILLI)
    }

    /// Tokens available to a write that advances the baseline to
    /// `rf_new`, capped at the burst ceiling.
    pub fn effective_milli(&self, rf: f64, rf_new: f64) -> i64 {
        let ceiling = to_milli(self.burst);
        (self.tokens_milli + self.claimable_milli(rf, rf_new)).min(ceiling)
    }

    /// The refill delta a write may add without overshooting the burst
    /// ceiling. Clamped client-side; the store only sees the final `ADD`.
    pub fn clamped_refill_milli(&self, rf: f64, rf_new: f64) -> i64 {
        let headroom = (to_milli(self.burst) - self.tokens_milli).max(0);
        self.claimable_milli(rf, rf_new).min(headroom)
    }

    /// Minimum wait in seconds until `deficit_milli` more millitokens
    /// have accrued at this limit's refill rate.
    pub fn retry_after_seconds(&self, deficit_milli: i64) -> f64 {
        if self.refill_amount == 0 {
            return f64::INFINITY;
        }
        (deficit_milli as f64 * self.refill_period_secs as f64)
            / (self.refill_amount as f64 * MILLI as f64)
    }
}

/// In-process snapshot of one `#STATE` record. The store owns the
/// authoritative copy; this is what one read observed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BucketState {
    /// Shared refill baseline, unix seconds. Doubles as the optimistic
    /// lock for refill claims.
    pub rf: f64,
    /// Record expiry, unix seconds, when the backing config is
    /// sync-owned or level-derived.
    pub ttl: Option<u64>,
    /// Per-limit state keyed by limit name.
    pub limits: BTreeMap<String, LimitState>,
}

impl BucketState {
    /// Seeds a new bucket from resolved limits: `rf = now`, every limit
    /// at full burst.
    pub fn seeded(limits: &LimitSet, now: f64, ttl: Option<u64>) -> Self {
        Self {
            rf: now,
            ttl,
            limits: limits
                .iter()
                .map(|(name, spec)| (name.clone(), LimitState::seeded(spec)))
                .collect(),
        }
    }

    /// Shortest refill period across the bucket's limits. The shared
    /// baseline advances in multiples of this granularity.
    pub fn min_refill_period_secs(&self) -> Option<u64> {
        self.limits
            .values()
            .map(|l| l.refill_period_secs)
            .filter(|&rp| rp > 0)
            .min()
    }

    /// The baseline a Normal write of this snapshot would set:
    /// `rf + floor((now - rf) / rp_min) * rp_min`. Equal to `rf` when no
    /// full window has elapsed.
    pub fn advanced_rf(&self, now: f64) -> f64 {
        let Some(rp) = self.min_refill_period_secs() else {
            return self.rf;
        };
        if now <= self.rf {
            return self.rf;
        }
        let windows = ((now - self.rf) / rp as f64).floor();
        self.rf + windows * rp as f64
    }

    /// Whether advancing to `rf_new` claims refill for any limit.
    pub fn claims_refill(&self, rf_new: f64) -> bool {
        self.limits
            .values()
            .any(|l| l.claimable_milli(self.rf, rf_new) > 0)
    }
}

/// Outcome of checking a consume map against one bucket snapshot.
#[derive(Debug, Clone, Default)]
pub struct Decision {
    /// Limits that could not cover the request.
    pub violations: Vec<LimitViolation>,
}

impl Decision {
    pub fn allowed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Minimum wait for every failing limit to refill its deficit.
    pub fn retry_after_seconds(&self) -> f64 {
        self.violations
            .iter()
            .map(|v| v.retry_after_seconds)
            .fold(0.0, f64::max)
    }
}

/// Checks whether `consume` fits within the bucket as of the baseline
/// `rf_new` the write would set. Limits absent from the snapshot are
/// treated as freshly seeded from `resolved` (they will be introduced by
/// the write).
pub fn decide(
    entity_id: &str,
    bucket: &BucketState,
    resolved: &LimitSet,
    rf_new: f64,
    consume: &ConsumeMap,
) -> Decision {
    let mut violations = Vec::new();
    for (limit, &amount) in consume {
        if amount == 0 {
            continue;
        }
        let requested_milli = to_milli(amount);
        let available_milli = match bucket.limits.get(limit) {
            Some(state) => state.effective_milli(bucket.rf, rf_new),
            None => match resolved.get(limit) {
                Some(spec) => to_milli(spec.burst()),
                None => 0,
            },
        };
        if available_milli < requested_milli {
            let deficit = requested_milli - available_milli;
            let retry_after = match bucket.limits.get(limit) {
                Some(state) => state.retry_after_seconds(deficit),
                None => match resolved.get(limit) {
                    Some(spec) => LimitState::seeded(spec).retry_after_seconds(deficit),
                    None => f64::INFINITY,
                },
            };
            violations.push(LimitViolation {
                entity_id: entity_id.to_string(),
                limit: limit.clone(),
                requested_milli,
                available_milli,
                retry_after_seconds: retry_after,
            });
        }
    }
    Decision { violations }
}
