//! Flat-record encoding for the single-table layout.
//!
//! Every record is top-level attributes only: strings, numbers, bools.
//! No nested maps. Bucket records pack per-limit state into prefixed
//! attributes with two-letter field codes:
//!
//! ```text
//! rf             shared refill baseline (number, unix seconds)
//! ttl            optional expiry (number, unix seconds)
//! b_{limit}_tk   tokens, millitokens
//! b_{limit}_cp   capacity, whole tokens
//! b_{limit}_bx   burst ceiling, whole tokens
//! b_{limit}_ra   refill amount, whole tokens
//! b_{limit}_rp   refill period, seconds
//! b_{limit}_tc   total consumed, millitokens
//! ```
//!
//! Decoders ignore attributes they do not recognize, so newer writers
//! can add fields without breaking older readers.
//!
//! The [`Attr`] value type mirrors the store's scalar attribute shapes
//! (numbers travel as decimal strings, exactly as the wire carries
//! them), which lets the in-memory backend and the DynamoDB backend
//! share one codec.

use crate::audit::AuditEvent;
use crate::bucket::{BucketState, LimitState};
use crate::config::{LimitConfig, OnUnavailable};
use crate::entity::Entity;
use crate::error::{LimiterError, Result};
use crate::limits::{LimitSet, LimitSpec};
use crate::version::VersionRecord;
use std::collections::BTreeMap;
use std::time::Duration;

/// Scalar attribute value. Numbers are decimal strings, as stored.
#[derive(Debug, Clone, PartialEq)]
pub enum Attr {
    S(String),
    N(String),
    Bool(bool),
}

impl Attr {
    pub fn s(v: impl Into<String>) -> Self {
        Attr::S(v.into())
    }

    pub fn n_i64(v: i64) -> Self {
        Attr::N(v.to_string())
    }

    pub fn n_u64(v: u64) -> Self {
        Attr::N(v.to_string())
    }

    pub fn n_f64(v: f64) -> Self {
        Attr::N(format!("{v}"))
    }

    pub fn as_s(&self) -> Option<&str> {
        match self {
            Attr::S(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Attr::N(v) => v.parse().ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Attr::N(v) => v.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Attr::N(v) => v.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Attr::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// One flat record, attribute name to value. `BTreeMap` keeps encoded
/// output and rendered expressions deterministic.
pub type Item = BTreeMap<String, Attr>;

pub const ATTR_PK: &str = "PK";
pub const ATTR_SK: &str = "SK";
pub const ATTR_RF: &str = "rf";
pub const ATTR_TTL: &str = "ttl";
pub const ATTR_ENTITY_ID: &str = "entity_id";
pub const ATTR_NAME: &str = "name";
pub const ATTR_PARENT_ID: &str = "parent_id";
pub const ATTR_CASCADE: &str = "cascade";
pub const ATTR_METADATA: &str = "metadata_json";
pub const ATTR_ON_UNAVAILABLE: &str = "on_unavailable";
pub const ATTR_SCHEMA_VERSION: &str = "schema_version";
pub const ATTR_MIN_CLIENT_VERSION: &str = "min_client_version";
pub const ATTR_UPDATED_BY: &str = "updated_by";
pub const ATTR_UPDATED_AT: &str = "updated_at";
pub const ATTR_ACTION: &str = "action";
pub const ATTR_ACTOR: &str = "actor";
pub const ATTR_TIMESTAMP: &str = "timestamp";
pub const ATTR_DETAIL: &str = "detail_json";

const BUCKET_PREFIX: &str = "b_";

/// Per-limit field codes.
pub const CODE_TOKENS: &str = "tk";
pub const CODE_CAPACITY: &str = "cp";
pub const CODE_BURST: &str = "bx";
pub const CODE_REFILL_AMOUNT: &str = "ra";
pub const CODE_REFILL_PERIOD: &str = "rp";
pub const CODE_TOTAL_CONSUMED: &str = "tc";

/// `b_{limit}_{code}`
pub fn bucket_attr(limit: &str, code: &str) -> String {
    format!("{BUCKET_PREFIX}{limit}_{code}")
}

/// Splits a `b_{limit}_{code}` attribute name. Limit names may contain
/// underscores; field codes never do, so the split is on the last one.
pub fn parse_bucket_attr(attr: &str) -> Option<(&str, &str)> {
    attr.strip_prefix(BUCKET_PREFIX)?.rsplit_once('_')
}

fn missing(attr: &str) -> LimiterError {
    LimiterError::storage(format!("record is missing attribute '{attr}'"), false)
}

// ---------------------------------------------------------------------------
// Bucket state
// ---------------------------------------------------------------------------

/// Encodes a bucket snapshot to its flat attributes. Key attributes are
/// the repository's job.
pub fn encode_bucket_state(state: &BucketState) -> Item {
    let mut item = Item::new();
    item.insert(ATTR_RF.to_string(), Attr::n_f64(state.rf));
    if let Some(ttl) = state.ttl {
        item.insert(ATTR_TTL.to_string(), Attr::n_u64(ttl));
    }
    for (limit, ls) in &state.limits {
        item.insert(
            bucket_attr(limit, CODE_TOKENS),
            Attr::n_i64(ls.tokens_milli),
        );
        item.insert(bucket_attr(limit, CODE_CAPACITY), Attr::n_u64(ls.capacity));
        item.insert(bucket_attr(limit, CODE_BURST), Attr::n_u64(ls.burst));
        item.insert(
            bucket_attr(limit, CODE_REFILL_AMOUNT),
            Attr::n_u64(ls.refill_amount),
        );
        item.insert(
            bucket_attr(limit, CODE_REFILL_PERIOD),
            Attr::n_u64(ls.refill_period_secs),
        );
        item.insert(
            bucket_attr(limit, CODE_TOTAL_CONSUMED),
            Attr::n_i64(ls.total_consumed_milli),
        );
    }
    item
}

/// Reconstructs a bucket snapshot by enumerating `b_*_*` attributes.
/// Unknown attributes and unknown field codes are ignored.
pub fn decode_bucket_state(item: &Item) -> Result<BucketState> {
    let rf = item
        .get(ATTR_RF)
        .and_then(Attr::as_f64)
        .ok_or_else(|| missing(ATTR_RF))?;
    let ttl = item.get(ATTR_TTL).and_then(Attr::as_u64);

    let mut limits: BTreeMap<String, LimitState> = BTreeMap::new();
    for (attr, value) in item {
        let Some((limit, code)) = parse_bucket_attr(attr) else {
            continue;
        };
        let state = limits.entry(limit.to_string()).or_insert(LimitState {
            tokens_milli: 0,
            capacity: 0,
            burst: 0,
            refill_amount: 0,
            refill_period_secs: 0,
            total_consumed_milli: 0,
        });
        match code {
            CODE_TOKENS => state.tokens_milli = value.as_i64().ok_or_else(|| missing(attr))?,
            CODE_CAPACITY => state.capacity = value.as_u64().ok_or_else(|| missing(attr))?,
            CODE_BURST => state.burst = value.as_u64().ok_or_else(|| missing(attr))?,
            CODE_REFILL_AMOUNT => {
                state.refill_amount = value.as_u64().ok_or_else(|| missing(attr))?
            }
            CODE_REFILL_PERIOD => {
                state.refill_period_secs = value.as_u64().ok_or_else(|| missing(attr))?
            }
            CODE_TOTAL_CONSUMED => {
                state.total_consumed_milli = value.as_i64().ok_or_else(|| missing(attr))?
            }
            _ => {}
        }
    }

    Ok(BucketState { rf, ttl, limits })
}

// ---------------------------------------------------------------------------
// Entity metadata
// ---------------------------------------------------------------------------

pub fn encode_entity(entity: &Entity) -> Item {
    let mut item = Item::new();
    item.insert(ATTR_ENTITY_ID.to_string(), Attr::s(&entity.entity_id));
    if let Some(name) = &entity.name {
        item.insert(ATTR_NAME.to_string(), Attr::s(name));
    }
    if let Some(parent) = &entity.parent_id {
        item.insert(ATTR_PARENT_ID.to_string(), Attr::s(parent));
    }
    item.insert(ATTR_CASCADE.to_string(), Attr::Bool(entity.cascade));
    if !entity.metadata.is_empty() {
        // serde_json can always serialize a string map.
        let json = serde_json::to_string(&entity.metadata).unwrap_or_default();
        item.insert(ATTR_METADATA.to_string(), Attr::s(json));
    }
    item
}

pub fn decode_entity(item: &Item) -> Result<Entity> {
    let entity_id = item
        .get(ATTR_ENTITY_ID)
        .and_then(Attr::as_s)
        .ok_or_else(|| missing(ATTR_ENTITY_ID))?
        .to_string();
    let metadata = match item.get(ATTR_METADATA).and_then(Attr::as_s) {
        Some(json) => serde_json::from_str(json).map_err(|e| {
            LimiterError::storage(format!("bad metadata_json for entity {entity_id}: {e}"), false)
        })?,
        None => BTreeMap::new(),
    };
    Ok(Entity {
        entity_id,
        name: item.get(ATTR_NAME).and_then(Attr::as_s).map(str::to_string),
        parent_id: item
            .get(ATTR_PARENT_ID)
            .and_then(Attr::as_s)
            .map(str::to_string),
        cascade: item
            .get(ATTR_CASCADE)
            .and_then(Attr::as_bool)
            .unwrap_or(false),
        metadata,
    })
}

// ---------------------------------------------------------------------------
// Config records
// ---------------------------------------------------------------------------

/// Config records reuse the bucket prefix scheme for their static limit
/// fields (`cp`/`bx`/`ra`/`rp`); they carry no token state.
pub fn encode_config(config: &LimitConfig) -> Item {
    let mut item = Item::new();
    for (limit, spec) in &config.limits {
        item.insert(bucket_attr(limit, CODE_CAPACITY), Attr::n_u64(spec.capacity));
        item.insert(bucket_attr(limit, CODE_BURST), Attr::n_u64(spec.burst()));
        item.insert(
            bucket_attr(limit, CODE_REFILL_AMOUNT),
            Attr::n_u64(spec.refill_amount),
        );
        item.insert(
            bucket_attr(limit, CODE_REFILL_PERIOD),
            Attr::n_u64(spec.refill_period_secs()),
        );
    }
    if let Some(policy) = config.on_unavailable {
        item.insert(ATTR_ON_UNAVAILABLE.to_string(), Attr::s(policy.as_str()));
    }
    if let Some(ttl) = config.ttl {
        item.insert(ATTR_TTL.to_string(), Attr::n_u64(ttl));
    }
    item
}

pub fn decode_config(item: &Item) -> Result<LimitConfig> {
    #[derive(Default)]
    struct Partial {
        capacity: Option<u64>,
        burst: Option<u64>,
        refill_amount: Option<u64>,
        refill_period_secs: Option<u64>,
    }

    let mut partials: BTreeMap<String, Partial> = BTreeMap::new();
    for (attr, value) in item {
        let Some((limit, code)) = parse_bucket_attr(attr) else {
            continue;
        };
        let partial = partials.entry(limit.to_string()).or_default();
        match code {
            CODE_CAPACITY => partial.capacity = value.as_u64(),
            CODE_BURST => partial.burst = value.as_u64(),
            CODE_REFILL_AMOUNT => partial.refill_amount = value.as_u64(),
            CODE_REFILL_PERIOD => partial.refill_period_secs = value.as_u64(),
            _ => {}
        }
    }

    let mut limits = LimitSet::new();
    for (limit, partial) in partials {
        let capacity = partial
            .capacity
            .ok_or_else(|| missing(&bucket_attr(&limit, CODE_CAPACITY)))?;
        let refill_amount = partial
            .refill_amount
            .ok_or_else(|| missing(&bucket_attr(&limit, CODE_REFILL_AMOUNT)))?;
        let refill_period_secs = partial
            .refill_period_secs
            .ok_or_else(|| missing(&bucket_attr(&limit, CODE_REFILL_PERIOD)))?;
        limits.insert(
            limit,
            LimitSpec {
                capacity,
                burst: partial.burst.filter(|&b| b != capacity),
                refill_amount,
                refill_period: Duration::from_secs(refill_period_secs),
            },
        );
    }

    let on_unavailable = item
        .get(ATTR_ON_UNAVAILABLE)
        .and_then(Attr::as_s)
        .map(OnUnavailable::parse)
        .transpose()
        .map_err(|_| LimiterError::storage("bad on_unavailable attribute", false))?;

    Ok(LimitConfig {
        limits,
        on_unavailable,
        ttl: item.get(ATTR_TTL).and_then(Attr::as_u64),
    })
}

// ---------------------------------------------------------------------------
// Version record
// ---------------------------------------------------------------------------

pub fn encode_version(record: &VersionRecord) -> Item {
    let mut item = Item::new();
    item.insert(
        ATTR_SCHEMA_VERSION.to_string(),
        Attr::n_u64(record.schema_version as u64),
    );
    item.insert(
        ATTR_MIN_CLIENT_VERSION.to_string(),
        Attr::s(&record.min_client_version),
    );
    if let Some(by) = &record.updated_by {
        item.insert(ATTR_UPDATED_BY.to_string(), Attr::s(by));
    }
    item.insert(ATTR_UPDATED_AT.to_string(), Attr::s(&record.updated_at));
    item
}

pub fn decode_version(item: &Item) -> Result<VersionRecord> {
    Ok(VersionRecord {
        schema_version: item
            .get(ATTR_SCHEMA_VERSION)
            .and_then(Attr::as_u64)
            .ok_or_else(|| missing(ATTR_SCHEMA_VERSION))? as u32,
        min_client_version: item
            .get(ATTR_MIN_CLIENT_VERSION)
            .and_then(Attr::as_s)
            .ok_or_else(|| missing(ATTR_MIN_CLIENT_VERSION))?
            .to_string(),
        updated_by: item
            .get(ATTR_UPDATED_BY)
            .and_then(Attr::as_s)
            .map(str::to_string),
        updated_at: item
            .get(ATTR_UPDATED_AT)
            .and_then(Attr::as_s)
            .unwrap_or_default()
            .to_string(),
    })
}

// ---------------------------------------------------------------------------
// Audit events
// ---------------------------------------------------------------------------

pub fn encode_audit(event: &AuditEvent) -> Item {
    let mut item = Item::new();
    item.insert(ATTR_ACTION.to_string(), Attr::s(event.action.as_str()));
    if let Some(actor) = &event.actor {
        item.insert(ATTR_ACTOR.to_string(), Attr::s(actor));
    }
    item.insert(ATTR_TIMESTAMP.to_string(), Attr::s(&event.timestamp));
    if !event.detail.is_null() {
        item.insert(
            ATTR_DETAIL.to_string(),
            Attr::s(event.detail.to_string()),
        );
    }
    item.insert(ATTR_TTL.to_string(), Attr::n_u64(event.ttl));
    item
}
