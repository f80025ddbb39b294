//! Limit configuration records and the 4-level resolution hierarchy.
//!
//! Limits for an `(entity, resource)` pair resolve through strict
//! precedence, first non-empty level wins:
//!
//! 1. entity config for the specific resource (`#CONFIG#{resource}`)
//! 2. entity-wide default (`#CONFIG#_default_`)
//! 3. resource config
//! 4. system config
//!
//! A config record carrying a `ttl` attribute is sync-owned and
//! auto-expires; one without is operator-owned and persists. That
//! ownership bit decides whether buckets created under the config get a
//! TTL of their own.

use crate::error::{LimiterError, Result};
use crate::limits::LimitSet;
use crate::schema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default bucket-TTL multiplier: a bucket lives this many full-refill
/// horizons past its last write.
pub const DEFAULT_TTL_MULTIPLIER: u32 = 7;

/// What to do when the store is unreachable beyond the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnUnavailable {
    /// Fail open: grant a degraded lease and log a warning.
    Allow,
    /// Fail closed: reject with `RateLimiterUnavailable`.
    Block,
}

impl OnUnavailable {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnUnavailable::Allow => "allow",
            OnUnavailable::Block => "block",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "allow" => Ok(OnUnavailable::Allow),
            "block" => Ok(OnUnavailable::Block),
            other => Err(LimiterError::Validation(format!(
                "invalid on_unavailable value '{other}' (expected 'allow' or 'block')"
            ))),
        }
    }
}

/// Which hierarchy level supplied the effective limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    EntitySpecific,
    EntityDefault,
    Resource,
    System,
    None,
}

impl ConfigSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigSource::EntitySpecific => "entity_specific",
            ConfigSource::EntityDefault => "entity_default",
            ConfigSource::Resource => "resource",
            ConfigSource::System => "system",
            ConfigSource::None => "none",
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored config record at any level.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Named limit specs.
    pub limits: LimitSet,
    /// Unavailability policy override at this level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_unavailable: Option<OnUnavailable>,
    /// Record expiry, unix seconds. Present on sync-owned records only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

/// Address of a config record in the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigLevel {
    /// Entity config for one resource; operator-owned, no TTL.
    EntityResource { entity_id: String, resource: String },
    /// Entity-wide default (`#CONFIG#_default_`).
    EntityDefault { entity_id: String },
    /// Resource-level defaults.
    Resource { resource: String },
    /// Global defaults.
    System,
}

impl ConfigLevel {
    /// `(PK, SK)` of the record under `ns`.
    pub fn key(&self, ns: &schema::Namespace) -> (String, String) {
        match self {
            ConfigLevel::EntityResource {
                entity_id,
                resource,
            } => (
                schema::pk_entity(ns, entity_id),
                schema::sk_entity_config(resource),
            ),
            ConfigLevel::EntityDefault { entity_id } => (
                schema::pk_entity(ns, entity_id),
                schema::sk_entity_config(schema::DEFAULT_CONFIG_RESOURCE),
            ),
            ConfigLevel::Resource { resource } => (
                schema::pk_resource(ns, resource),
                schema::SK_CONFIG.to_string(),
            ),
            ConfigLevel::System => (schema::pk_system(ns), schema::SK_CONFIG.to_string()),
        }
    }

    /// Audit subject for mutations of this record.
    pub fn audit_subject(&self) -> String {
        match self {
            ConfigLevel::EntityResource { entity_id, .. }
            | ConfigLevel::EntityDefault { entity_id } => entity_id.clone(),
            ConfigLevel::Resource { resource } => schema::audit_subject_resource(resource),
            ConfigLevel::System => schema::AUDIT_SUBJECT_SYSTEM.to_string(),
        }
    }

}

/// Result of resolving limits for an `(entity, resource)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub limits: LimitSet,
    /// Unavailability policy from the winning level, or the nearest lower
    /// level that sets one.
    pub on_unavailable: Option<OnUnavailable>,
    pub source: ConfigSource,
    /// Whether buckets created under this config get a TTL.
    pub ttl_eligible: bool,
}

impl Resolution {
    /// The empty resolution: nothing configured at any level.
    pub fn none() -> Self {
        Self {
            limits: LimitSet::new(),
            on_unavailable: None,
            source: ConfigSource::None,
            ttl_eligible: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}

/// Applies the precedence rule to the four fetched records. The
/// unavailability policy falls through to lower levels when the winning
/// level does not set one.
pub fn resolve_from_levels(
    entity_specific: Option<LimitConfig>,
    entity_default: Option<LimitConfig>,
    resource: Option<LimitConfig>,
    system: Option<LimitConfig>,
) -> Resolution {
    let levels = [
        (ConfigSource::EntitySpecific, entity_specific),
        (ConfigSource::EntityDefault, entity_default),
        (ConfigSource::Resource, resource),
        (ConfigSource::System, system),
    ];

    let on_unavailable = levels
        .iter()
        .find_map(|(_, cfg)| cfg.as_ref().and_then(|c| c.on_unavailable));

    for (source, cfg) in levels {
        let Some(cfg) = cfg else { continue };
        if cfg.limits.is_empty() {
            continue;
        }
        // Operator-owned entity-specific config pins the bucket forever;
        // every other winning level makes it expire.
        let ttl_eligible = !(source == ConfigSource::EntitySpecific && cfg.ttl.is_none());
        return Resolution {
            limits: cfg.limits,
            on_unavailable,
            source,
            ttl_eligible,
        };
    }

    Resolution {
        on_unavailable,
        ..Resolution::none()
    }
}

/// Bucket lifetime in seconds: the slowest limit's full-refill horizon
/// times `multiplier`.
pub fn bucket_ttl_secs(limits: &LimitSet, multiplier: u32) -> Option<u64> {
    limits
        .values()
        .map(|spec| {
            let horizon = (spec.capacity as f64 / spec.refill_amount.max(1) as f64)
                * spec.refill_period_secs() as f64;
            (horizon * multiplier as f64).ceil() as u64
        })
        .max()
}
