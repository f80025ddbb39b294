//! Storage abstraction: every store access goes through [`Repository`].
//!
//! The trait is the full capability set of the single-table layout:
//! config resolution (with its cache), entity CRUD, batched bucket
//! reads, the four bucket write paths, multi-item transactions, audit
//! append, version record access, ping. The engine is written against
//! this trait only; [`DynamoRepository`](dynamo::DynamoRepository) is
//! the production backend and [`MemoryRepository`](memory::MemoryRepository)
//! serves tests and local development with identical semantics.
//!
//! # Write paths
//!
//! All bucket mutations are described by [`BucketWrite`] and applied by
//! the backend with the store's own atomicity:
//!
//! - **Create**: put the seeded record, conditioned on the item not
//!   existing yet.
//! - **Normal**, the hot path: claim refill by advancing the shared
//!   baseline `rf` under the optimistic-lock condition `rf = expected`,
//!   while adding refill and subtracting consumption through atomic
//!   `ADD`s in the same write.
//! - **Consume**: consumption only, each limit conditioned on having
//!   the tokens (`tk >= amount`); `rf` is not touched, so the write can
//!   never over-claim refill. Used after a lock conflict and whenever no
//!   refill window has elapsed.
//! - **Adjust**: unconditional `ADD`s from a lease (commit delta or
//!   compensating rollback). The only path allowed to take `tk`
//!   negative.
//!
//! A rejected condition surfaces as
//! [`LimiterError::ConditionFailed`](crate::error::LimiterError::ConditionFailed);
//! everything else store-shaped is classified into retryable or fatal
//! [`Storage`](crate::error::LimiterError::Storage) errors.

pub mod dynamo;
pub mod expression;
pub mod memory;

use crate::audit::AuditEvent;
use crate::bucket::BucketState;
use crate::cache::TtlCache;
use crate::config::{ConfigLevel, LimitConfig, Resolution};
use crate::entity::Entity;
use crate::error::Result;
use crate::limits::LimitSpec;
use crate::schema::{self, Namespace};
use crate::version::VersionRecord;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Address of one bucket record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub entity_id: String,
    pub resource: String,
    pub shard: u32,
}

impl BucketKey {
    /// Key on the default shard.
    pub fn new(entity_id: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            resource: resource.into(),
            shard: schema::DEFAULT_SHARD,
        }
    }

    /// Partition key of the record under `ns`.
    pub fn pk(&self, ns: &Namespace) -> String {
        schema::pk_bucket(ns, &self.entity_id, &self.resource, self.shard)
    }
}

/// Per-limit change within one bucket write.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LimitDelta {
    /// Millitokens added to `tk`. Negative for consumption; for a Normal
    /// write this is clamped refill minus consumption.
    pub tokens_milli: i64,
    /// Millitokens added to `tc` (negative only on a reconciling
    /// adjust).
    pub consumed_milli: i64,
    /// Present when the limit does not exist in the record yet: the
    /// write sets the static fields and seeds `tk` at full burst before
    /// applying `tokens_milli`, and sets `tc = consumed_milli`.
    pub seed: Option<LimitSpec>,
}

impl LimitDelta {
    /// Plain consumption of `amount_milli`.
    pub fn consume(amount_milli: i64) -> Self {
        Self {
            tokens_milli: -amount_milli,
            consumed_milli: amount_milli,
            seed: None,
        }
    }

    /// The per-limit floor a Consume write conditions on.
    pub fn required_milli(&self) -> i64 {
        (-self.tokens_milli).max(0)
    }
}

/// One bucket mutation, by write path.
#[derive(Debug, Clone, PartialEq)]
pub enum BucketWrite {
    /// Seed a new record; condition: item does not exist.
    Create { state: BucketState },
    /// Refill-claiming write; condition: `rf = expected_rf`.
    Normal {
        expected_rf: f64,
        new_rf: f64,
        /// Refreshed expiry for TTL-tagged buckets.
        ttl: Option<u64>,
        deltas: BTreeMap<String, LimitDelta>,
    },
    /// Consumption-only write; per-limit condition `tk >= required`.
    Consume { deltas: BTreeMap<String, LimitDelta> },
    /// Unconditional lease adjustment.
    Adjust { deltas: BTreeMap<String, LimitDelta> },
}

/// Store access contract. All methods take the namespace explicitly;
/// repositories are namespace-agnostic and tenant scoping lives in the
/// keys.
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    /// Cheap connectivity check.
    async fn ping(&self) -> Result<()>;

    async fn get_version(&self, ns: &Namespace) -> Result<Option<VersionRecord>>;
    async fn put_version(
        &self,
        ns: &Namespace,
        record: &VersionRecord,
        principal: Option<&str>,
    ) -> Result<()>;

    /// Entity metadata, cached with the same TTL as config resolutions.
    async fn get_entity(&self, ns: &Namespace, entity_id: &str) -> Result<Option<Entity>>;
    async fn create_entity(
        &self,
        ns: &Namespace,
        entity: &Entity,
        principal: Option<&str>,
    ) -> Result<()>;
    /// Deletes the entity and every record under its partitions
    /// (metadata, configs, buckets). Returns the number of deleted
    /// records.
    async fn delete_entity(
        &self,
        ns: &Namespace,
        entity_id: &str,
        principal: Option<&str>,
    ) -> Result<u64>;
    async fn get_children(&self, ns: &Namespace, parent_id: &str) -> Result<Vec<Entity>>;

    /// 4-level hierarchy resolution for the pair, served from the
    /// process-local cache when fresh.
    async fn resolve_limits(
        &self,
        ns: &Namespace,
        entity_id: &str,
        resource: &str,
    ) -> Result<Resolution>;
    /// Drops cached resolutions (and entity metadata) matching the
    /// filters; `None`/`None` drops everything.
    fn invalidate_config_cache(&self, entity_id: Option<&str>, resource: Option<&str>);

    async fn get_config(&self, ns: &Namespace, level: &ConfigLevel) -> Result<Option<LimitConfig>>;
    async fn put_config(
        &self,
        ns: &Namespace,
        level: &ConfigLevel,
        config: &LimitConfig,
        principal: Option<&str>,
    ) -> Result<()>;
    async fn delete_config(
        &self,
        ns: &Namespace,
        level: &ConfigLevel,
        principal: Option<&str>,
    ) -> Result<()>;

    /// One batched, eventually consistent read of every bucket an
    /// acquire needs. Missing records are simply absent from the map.
    async fn read_buckets(
        &self,
        ns: &Namespace,
        keys: &[BucketKey],
    ) -> Result<HashMap<BucketKey, BucketState>>;
    async fn write_bucket(&self, ns: &Namespace, key: &BucketKey, write: BucketWrite)
        -> Result<()>;
    /// Applies all writes atomically, or none of them. A cancelled
    /// transaction surfaces as `ConditionFailed`.
    async fn transact_buckets(
        &self,
        ns: &Namespace,
        writes: Vec<(BucketKey, BucketWrite)>,
    ) -> Result<()>;

    async fn put_audit(&self, ns: &Namespace, event: &AuditEvent) -> Result<()>;
}

// A shared repository handle is a repository: lets several engines
// (e.g. one per tenant namespace) drive one backend instance.
#[async_trait]
impl<R: Repository> Repository for std::sync::Arc<R> {
    async fn ping(&self) -> Result<()> {
        (**self).ping().await
    }
    async fn get_version(&self, ns: &Namespace) -> Result<Option<VersionRecord>> {
        (**self).get_version(ns).await
    }
    async fn put_version(
        &self,
        ns: &Namespace,
        record: &VersionRecord,
        principal: Option<&str>,
    ) -> Result<()> {
        (**self).put_version(ns, record, principal).await
    }
    async fn get_entity(&self, ns: &Namespace, entity_id: &str) -> Result<Option<Entity>> {
        (**self).get_entity(ns, entity_id).await
    }
    async fn create_entity(
        &self,
        ns: &Namespace,
        entity: &Entity,
        principal: Option<&str>,
    ) -> Result<()> {
        (**self).create_entity(ns, entity, principal).await
    }
    async fn delete_entity(
        &self,
        ns: &Namespace,
        entity_id: &str,
        principal: Option<&str>,
    ) -> Result<u64> {
        (**self).delete_entity(ns, entity_id, principal).await
    }
    async fn get_children(&self, ns: &Namespace, parent_id: &str) -> Result<Vec<Entity>> {
        (**self).get_children(ns, parent_id).await
    }
    async fn resolve_limits(
        &self,
        ns: &Namespace,
        entity_id: &str,
        resource: &str,
    ) -> Result<Resolution> {
        (**self).resolve_limits(ns, entity_id, resource).await
    }
    fn invalidate_config_cache(&self, entity_id: Option<&str>, resource: Option<&str>) {
        (**self).invalidate_config_cache(entity_id, resource)
    }
    async fn get_config(&self, ns: &Namespace, level: &ConfigLevel) -> Result<Option<LimitConfig>> {
        (**self).get_config(ns, level).await
    }
    async fn put_config(
        &self,
        ns: &Namespace,
        level: &ConfigLevel,
        config: &LimitConfig,
        principal: Option<&str>,
    ) -> Result<()> {
        (**self).put_config(ns, level, config, principal).await
    }
    async fn delete_config(
        &self,
        ns: &Namespace,
        level: &ConfigLevel,
        principal: Option<&str>,
    ) -> Result<()> {
        (**self).delete_config(ns, level, principal).await
    }
    async fn read_buckets(
        &self,
        ns: &Namespace,
        keys: &[BucketKey],
    ) -> Result<HashMap<BucketKey, BucketState>> {
        (**self).read_buckets(ns, keys).await
    }
    async fn write_bucket(
        &self,
        ns: &Namespace,
        key: &BucketKey,
        write: BucketWrite,
    ) -> Result<()> {
        (**self).write_bucket(ns, key, write).await
    }
    async fn transact_buckets(
        &self,
        ns: &Namespace,
        writes: Vec<(BucketKey, BucketWrite)>,
    ) -> Result<()> {
        (**self).transact_buckets(ns, writes).await
    }
    async fn put_audit(&self, ns: &Namespace, event: &AuditEvent) -> Result<()> {
        (**self).put_audit(ns, event).await
    }
}

/// Shared process-local caches: config resolutions and entity metadata,
/// both with negative entries. Owned by the repository, not the engine,
/// so backends with native caching can substitute their own.
pub(crate) struct RepoCaches {
    resolutions: TtlCache<(String, String, String), Resolution>,
    entities: TtlCache<(String, String), Option<Entity>>,
}

impl RepoCaches {
    pub fn new(ttl: Duration) -> Self {
        Self {
            resolutions: TtlCache::new(ttl),
            entities: TtlCache::new(ttl),
        }
    }

    pub async fn resolution<F, Fut>(
        &self,
        ns: &Namespace,
        entity_id: &str,
        resource: &str,
        fetch: F,
    ) -> Result<Resolution>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Resolution>>,
    {
        self.resolutions
            .get_or_fetch(
                (
                    ns.as_str().to_string(),
                    entity_id.to_string(),
                    resource.to_string(),
                ),
                fetch,
            )
            .await
    }

    pub async fn entity<F, Fut>(
        &self,
        ns: &Namespace,
        entity_id: &str,
        fetch: F,
    ) -> Result<Option<Entity>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Option<Entity>>>,
    {
        self.entities
            .get_or_fetch(
                (ns.as_str().to_string(), entity_id.to_string()),
                fetch,
            )
            .await
    }

    pub fn invalidate(&self, entity_id: Option<&str>, resource: Option<&str>) {
        match (entity_id, resource) {
            (None, None) => {
                self.resolutions.invalidate_all();
                self.entities.invalidate_all();
            }
            _ => {
                self.resolutions.invalidate_if(|(_, entity, res)| {
                    entity_id.map_or(true, |e| e == entity)
                        && resource.map_or(true, |r| r == res)
                });
                if let Some(entity) = entity_id {
                    self.entities.invalidate_if(|(_, e)| e == entity);
                }
            }
        }
    }

    pub fn invalidate_entity(&self, ns: &Namespace, entity_id: &str) {
        let ns = ns.as_str().to_string();
        self.entities
            .invalidate_if(|(n, e)| *n == ns && e == entity_id);
    }
}
