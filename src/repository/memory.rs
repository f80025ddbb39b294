//! In-memory repository for tests and local development.
//!
//! One flat `(PK, SK)` table behind a mutex, applying the same
//! conditions and `ADD` semantics as the DynamoDB backend: create is
//! guarded on non-existence, Normal writes on the `rf` lock, Consume
//! writes on per-limit floors, transactions are all-or-nothing. Records
//! whose `ttl` has passed read as absent, mirroring native TTL
//! expiry.

use crate::audit::AuditEvent;
use crate::bucket::{now_unix, BucketState};
use crate::cache::DEFAULT_CACHE_TTL;
use crate::codec::{self, Attr, Item};
use crate::config::{ConfigLevel, LimitConfig, Resolution};
use crate::entity::Entity;
use crate::error::{LimiterError, Result};
use crate::limits::to_milli;
use crate::repository::{BucketKey, BucketWrite, RepoCaches, Repository};
use crate::schema::{self, Namespace};
use crate::version::VersionRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// In-process implementation of the repository contract.
pub struct MemoryRepository {
    table: Mutex<BTreeMap<(String, String), Item>>,
    caches: RepoCaches,
    unavailable: AtomicBool,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::with_cache_ttl(DEFAULT_CACHE_TTL)
    }

    pub fn with_cache_ttl(cache_ttl: Duration) -> Self {
        Self {
            table: Mutex::new(BTreeMap::new()),
            caches: RepoCaches::new(cache_ttl),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Makes every store operation fail with a retryable storage error,
    /// for exercising the unavailability policies.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live (unexpired) records whose partition key starts
    /// with `pk_prefix`. Diagnostic helper for tests.
    pub fn items_under(&self, pk_prefix: &str) -> usize {
        let now = now_unix() as u64;
        let table = self.table.lock();
        table
            .iter()
            .filter(|((pk, _), item)| pk.starts_with(pk_prefix) && !expired(item, now))
            .count()
    }

    /// Raw bucket snapshot, bypassing any engine path. Diagnostic helper
    /// for tests.
    pub fn bucket_snapshot(&self, ns: &Namespace, key: &BucketKey) -> Option<BucketState> {
        let item = self.get_item(&key.pk(ns), schema::SK_STATE)?;
        codec::decode_bucket_state(&item).ok()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LimiterError::storage("store is unavailable", true))
        } else {
            Ok(())
        }
    }

    fn get_item(&self, pk: &str, sk: &str) -> Option<Item> {
        let now = now_unix() as u64;
        let table = self.table.lock();
        table
            .get(&(pk.to_string(), sk.to_string()))
            .filter(|item| !expired(item, now))
            .cloned()
    }

    fn put_item(&self, pk: String, sk: String, item: Item) {
        self.table.lock().insert((pk, sk), item);
    }

    fn fetch_config(&self, ns: &Namespace, level: &ConfigLevel) -> Result<Option<LimitConfig>> {
        let (pk, sk) = level.key(ns);
        match self.get_item(&pk, &sk) {
            Some(item) => Ok(Some(codec::decode_config(&item)?)),
            None => Ok(None),
        }
    }

    fn append_audit(&self, ns: &Namespace, event: &AuditEvent) {
        let pk = schema::pk_audit(ns, &event.subject);
        let sk = schema::sk_audit(&event.sortable_ts());
        self.put_item(pk, sk, codec::encode_audit(event));
    }
}

/// Whether a record's `ttl` attribute has passed.
fn expired(item: &Item, now: u64) -> bool {
    item.get(codec::ATTR_TTL)
        .and_then(Attr::as_u64)
        .is_some_and(|ttl| ttl <= now)
}

fn add_to(item: &mut Item, attr: String, delta: i64) {
    let current = item.get(&attr).and_then(Attr::as_i64).unwrap_or(0);
    item.insert(attr, Attr::n_i64(current + delta));
}

/// Applies one bucket write to the table, enforcing its conditions.
/// Runs entirely under the table lock, which stands in for the store's
/// per-item serialization.
fn apply_bucket_write(
    table: &mut BTreeMap<(String, String), Item>,
    ns: &Namespace,
    key: &BucketKey,
    write: &BucketWrite,
    now: u64,
) -> Result<()> {
    let record_key = (key.pk(ns), schema::SK_STATE.to_string());

    match write {
        BucketWrite::Create { state } => {
            let live = table
                .get(&record_key)
                .is_some_and(|item| !expired(item, now));
            if live {
                return Err(LimiterError::ConditionFailed);
            }
            let mut item = codec::encode_bucket_state(state);
            item.insert(
                codec::ATTR_ENTITY_ID.to_string(),
                Attr::s(&key.entity_id),
            );
            table.insert(record_key, item);
            Ok(())
        }

        BucketWrite::Normal {
            expected_rf,
            new_rf,
            ttl,
            deltas,
        } => {
            let item = table
                .get_mut(&record_key)
                .filter(|item| !expired(item, now))
                .ok_or(LimiterError::ConditionFailed)?;
            let stored_rf = item
                .get(codec::ATTR_RF)
                .and_then(Attr::as_f64)
                .ok_or(LimiterError::ConditionFailed)?;
            if stored_rf != *expected_rf {
                return Err(LimiterError::ConditionFailed);
            }

            item.insert(codec::ATTR_RF.to_string(), Attr::n_f64(*new_rf));
            if let Some(ttl) = ttl {
                item.insert(codec::ATTR_TTL.to_string(), Attr::n_u64(*ttl));
            }
            for (limit, delta) in deltas {
                if let Some(spec) = &delta.seed {
                    item.insert(
                        codec::bucket_attr(limit, codec::CODE_CAPACITY),
                        Attr::n_u64(spec.capacity),
                    );
                    item.insert(
                        codec::bucket_attr(limit, codec::CODE_BURST),
                        Attr::n_u64(spec.burst()),
                    );
                    item.insert(
                        codec::bucket_attr(limit, codec::CODE_REFILL_AMOUNT),
                        Attr::n_u64(spec.refill_amount),
                    );
                    item.insert(
                        codec::bucket_attr(limit, codec::CODE_REFILL_PERIOD),
                        Attr::n_u64(spec.refill_period_secs()),
                    );
                    item.insert(
                        codec::bucket_attr(limit, codec::CODE_TOKENS),
                        Attr::n_i64(to_milli(spec.burst()) + delta.tokens_milli),
                    );
                    item.insert(
                        codec::bucket_attr(limit, codec::CODE_TOTAL_CONSUMED),
                        Attr::n_i64(delta.consumed_milli),
                    );
                } else {
                    add_to(
                        item,
                        codec::bucket_attr(limit, codec::CODE_TOKENS),
                        delta.tokens_milli,
                    );
                    add_to(
                        item,
                        codec::bucket_attr(limit, codec::CODE_TOTAL_CONSUMED),
                        delta.consumed_milli,
                    );
                }
            }
            Ok(())
        }

        BucketWrite::Consume { deltas } => {
            let item = table
                .get_mut(&record_key)
                .filter(|item| !expired(item, now))
                .ok_or(LimiterError::ConditionFailed)?;
            for (limit, delta) in deltas {
                let required = delta.required_milli();
                if required > 0 {
                    let current = item
                        .get(&codec::bucket_attr(limit, codec::CODE_TOKENS))
                        .and_then(Attr::as_i64)
                        .unwrap_or(0);
                    if current < required {
                        return Err(LimiterError::ConditionFailed);
                    }
                }
            }
            for (limit, delta) in deltas {
                add_to(
                    item,
                    codec::bucket_attr(limit, codec::CODE_TOKENS),
                    delta.tokens_milli,
                );
                add_to(
                    item,
                    codec::bucket_attr(limit, codec::CODE_TOTAL_CONSUMED),
                    delta.consumed_milli,
                );
            }
            Ok(())
        }

        BucketWrite::Adjust { deltas } => {
            let item = table.entry(record_key).or_default();
            for (limit, delta) in deltas {
                add_to(
                    item,
                    codec::bucket_attr(limit, codec::CODE_TOKENS),
                    delta.tokens_milli,
                );
                add_to(
                    item,
                    codec::bucket_attr(limit, codec::CODE_TOTAL_CONSUMED),
                    delta.consumed_milli,
                );
            }
            Ok(())
        }
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn get_version(&self, ns: &Namespace) -> Result<Option<VersionRecord>> {
        self.check_available()?;
        match self.get_item(&schema::pk_system(ns), schema::SK_VERSION) {
            Some(item) => Ok(Some(codec::decode_version(&item)?)),
            None => Ok(None),
        }
    }

    async fn put_version(
        &self,
        ns: &Namespace,
        record: &VersionRecord,
        principal: Option<&str>,
    ) -> Result<()> {
        self.check_available()?;
        self.put_item(
            schema::pk_system(ns),
            schema::SK_VERSION.to_string(),
            codec::encode_version(record),
        );
        self.append_audit(
            ns,
            &AuditEvent::new(
                schema::AUDIT_SUBJECT_SYSTEM,
                crate::audit::AuditAction::PutVersion,
                principal,
                serde_json::json!({ "schema_version": record.schema_version }),
                now_unix() as u64,
            ),
        );
        Ok(())
    }

    async fn get_entity(&self, ns: &Namespace, entity_id: &str) -> Result<Option<Entity>> {
        // Cache first: a fresh entry keeps serving while the store is
        // down.
        self.caches
            .entity(ns, entity_id, || async {
                self.check_available()?;
                match self.get_item(&schema::pk_entity(ns, entity_id), schema::SK_META) {
                    Some(item) => Ok(Some(codec::decode_entity(&item)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    async fn create_entity(
        &self,
        ns: &Namespace,
        entity: &Entity,
        principal: Option<&str>,
    ) -> Result<()> {
        self.check_available()?;
        let pk = schema::pk_entity(ns, &entity.entity_id);
        {
            let mut table = self.table.lock();
            let record_key = (pk.clone(), schema::SK_META.to_string());
            if table.contains_key(&record_key) {
                return Err(LimiterError::EntityExists(entity.entity_id.clone()));
            }
            table.insert(record_key, codec::encode_entity(entity));
        }
        self.caches.invalidate_entity(ns, &entity.entity_id);
        self.append_audit(
            ns,
            &AuditEvent::new(
                &entity.entity_id,
                crate::audit::AuditAction::CreateEntity,
                principal,
                serde_json::json!({
                    "parent_id": entity.parent_id,
                    "cascade": entity.cascade,
                }),
                now_unix() as u64,
            ),
        );
        Ok(())
    }

    async fn delete_entity(
        &self,
        ns: &Namespace,
        entity_id: &str,
        principal: Option<&str>,
    ) -> Result<u64> {
        self.check_available()?;
        let entity_pk = schema::pk_entity(ns, entity_id);
        let bucket_prefix = format!("{ns}/BUCKET#{entity_id}#");

        let deleted = {
            let mut table = self.table.lock();
            if !table.contains_key(&(entity_pk.clone(), schema::SK_META.to_string())) {
                return Err(LimiterError::EntityNotFound(entity_id.to_string()));
            }
            let before = table.len();
            table.retain(|(pk, _), _| *pk != entity_pk && !pk.starts_with(&bucket_prefix));
            (before - table.len()) as u64
        };

        self.caches.invalidate(Some(entity_id), None);
        self.append_audit(
            ns,
            &AuditEvent::new(
                entity_id,
                crate::audit::AuditAction::DeleteEntity,
                principal,
                serde_json::json!({ "records_deleted": deleted }),
                now_unix() as u64,
            ),
        );
        Ok(deleted)
    }

    async fn get_children(&self, ns: &Namespace, parent_id: &str) -> Result<Vec<Entity>> {
        self.check_available()?;
        let prefix = format!("{ns}/ENTITY#");
        let table = self.table.lock();
        let mut children = Vec::new();
        for ((pk, sk), item) in table.iter() {
            if !pk.starts_with(&prefix) || sk != schema::SK_META {
                continue;
            }
            let entity = codec::decode_entity(item)?;
            if entity.parent_id.as_deref() == Some(parent_id) {
                children.push(entity);
            }
        }
        Ok(children)
    }

    async fn resolve_limits(
        &self,
        ns: &Namespace,
        entity_id: &str,
        resource: &str,
    ) -> Result<Resolution> {
        self.caches
            .resolution(ns, entity_id, resource, || async {
                self.check_available()?;
                let specific = self.fetch_config(
                    ns,
                    &ConfigLevel::EntityResource {
                        entity_id: entity_id.to_string(),
                        resource: resource.to_string(),
                    },
                )?;
                let entity_default = self.fetch_config(
                    ns,
                    &ConfigLevel::EntityDefault {
                        entity_id: entity_id.to_string(),
                    },
                )?;
                let resource_cfg = self.fetch_config(
                    ns,
                    &ConfigLevel::Resource {
                        resource: resource.to_string(),
                    },
                )?;
                let system = self.fetch_config(ns, &ConfigLevel::System)?;
                Ok(crate::config::resolve_from_levels(
                    specific,
                    entity_default,
                    resource_cfg,
                    system,
                ))
            })
            .await
    }

    fn invalidate_config_cache(&self, entity_id: Option<&str>, resource: Option<&str>) {
        self.caches.invalidate(entity_id, resource);
    }

    async fn get_config(&self, ns: &Namespace, level: &ConfigLevel) -> Result<Option<LimitConfig>> {
        self.check_available()?;
        self.fetch_config(ns, level)
    }

    async fn put_config(
        &self,
        ns: &Namespace,
        level: &ConfigLevel,
        config: &LimitConfig,
        principal: Option<&str>,
    ) -> Result<()> {
        self.check_available()?;
        let (pk, sk) = level.key(ns);
        self.put_item(pk, sk, codec::encode_config(config));
        invalidate_for_level(&self.caches, level);
        self.append_audit(
            ns,
            &AuditEvent::new(
                level.audit_subject(),
                crate::audit::AuditAction::PutConfig,
                principal,
                serde_json::json!({ "limits": config.limits.keys().collect::<Vec<_>>() }),
                now_unix() as u64,
            ),
        );
        Ok(())
    }

    async fn delete_config(
        &self,
        ns: &Namespace,
        level: &ConfigLevel,
        principal: Option<&str>,
    ) -> Result<()> {
        self.check_available()?;
        let (pk, sk) = level.key(ns);
        self.table.lock().remove(&(pk, sk));
        invalidate_for_level(&self.caches, level);
        self.append_audit(
            ns,
            &AuditEvent::new(
                level.audit_subject(),
                crate::audit::AuditAction::DeleteConfig,
                principal,
                serde_json::Value::Null,
                now_unix() as u64,
            ),
        );
        Ok(())
    }

    async fn read_buckets(
        &self,
        ns: &Namespace,
        keys: &[BucketKey],
    ) -> Result<HashMap<BucketKey, BucketState>> {
        self.check_available()?;
        let mut found = HashMap::new();
        for key in keys {
            if let Some(item) = self.get_item(&key.pk(ns), schema::SK_STATE) {
                found.insert(key.clone(), codec::decode_bucket_state(&item)?);
            }
        }
        Ok(found)
    }

    async fn write_bucket(
        &self,
        ns: &Namespace,
        key: &BucketKey,
        write: BucketWrite,
    ) -> Result<()> {
        self.check_available()?;
        let now = now_unix() as u64;
        let mut table = self.table.lock();
        apply_bucket_write(&mut table, ns, key, &write, now)
    }

    async fn transact_buckets(
        &self,
        ns: &Namespace,
        writes: Vec<(BucketKey, BucketWrite)>,
    ) -> Result<()> {
        self.check_available()?;
        let now = now_unix() as u64;
        let mut table = self.table.lock();
        // All-or-nothing: run against a scratch copy, swap on success.
        let mut scratch = table.clone();
        for (key, write) in &writes {
            apply_bucket_write(&mut scratch, ns, key, write, now)?;
        }
        *table = scratch;
        Ok(())
    }

    async fn put_audit(&self, ns: &Namespace, event: &AuditEvent) -> Result<()> {
        self.check_available()?;
        self.append_audit(ns, event);
        Ok(())
    }
}

/// Drops cache entries made stale by a config mutation at `level`.
fn invalidate_for_level(caches: &RepoCaches, level: &ConfigLevel) {
    match level {
        ConfigLevel::EntityResource {
            entity_id,
            resource,
        } => caches.invalidate(Some(entity_id), Some(resource)),
        ConfigLevel::EntityDefault { entity_id } => caches.invalidate(Some(entity_id), None),
        ConfigLevel::Resource { resource } => caches.invalidate(None, Some(resource)),
        ConfigLevel::System => caches.invalidate(None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{LimitSet, LimitSpec};
    use crate::repository::LimitDelta;

    fn ns() -> Namespace {
        Namespace::default()
    }

    fn rpm_limits(capacity: u64) -> LimitSet {
        let mut limits = LimitSet::new();
        limits.insert("rpm".to_string(), LimitSpec::per_minute(capacity));
        limits
    }

    async fn seed_bucket(repo: &MemoryRepository, key: &BucketKey, rf: f64) {
        let state = BucketState::seeded(&rpm_limits(100), rf, None);
        repo.write_bucket(&ns(), key, BucketWrite::Create { state })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_is_guarded_on_existence() {
        let repo = MemoryRepository::new();
        let key = BucketKey::new("u1", "api");
        seed_bucket(&repo, &key, 1_000.0).await;

        let state = BucketState::seeded(&rpm_limits(100), 2_000.0, None);
        let err = repo
            .write_bucket(&ns(), &key, BucketWrite::Create { state })
            .await
            .unwrap_err();
        assert!(err.is_condition_failed());
    }

    #[tokio::test]
    async fn test_normal_write_enforces_rf_lock() {
        let repo = MemoryRepository::new();
        let key = BucketKey::new("u1", "api");
        seed_bucket(&repo, &key, 1_000.0).await;

        let write = BucketWrite::Normal {
            expected_rf: 999.0,
            new_rf: 1_060.0,
            ttl: None,
            deltas: BTreeMap::from([("rpm".to_string(), LimitDelta::consume(1_000))]),
        };
        let err = repo.write_bucket(&ns(), &key, write).await.unwrap_err();
        assert!(err.is_condition_failed());

        let write = BucketWrite::Normal {
            expected_rf: 1_000.0,
            new_rf: 1_060.0,
            ttl: None,
            deltas: BTreeMap::from([("rpm".to_string(), LimitDelta::consume(1_000))]),
        };
        repo.write_bucket(&ns(), &key, write).await.unwrap();

        let state = repo.bucket_snapshot(&ns(), &key).unwrap();
        assert_eq!(state.rf, 1_060.0);
        assert_eq!(state.limits["rpm"].tokens_milli, 99_000);
        assert_eq!(state.limits["rpm"].total_consumed_milli, 1_000);
    }

    #[tokio::test]
    async fn test_consume_write_enforces_floor() {
        let repo = MemoryRepository::new();
        let key = BucketKey::new("u1", "api");
        seed_bucket(&repo, &key, 1_000.0).await;

        let write = BucketWrite::Consume {
            deltas: BTreeMap::from([("rpm".to_string(), LimitDelta::consume(100_001))]),
        };
        let err = repo.write_bucket(&ns(), &key, write).await.unwrap_err();
        assert!(err.is_condition_failed());

        // Nothing applied on a failed condition.
        let state = repo.bucket_snapshot(&ns(), &key).unwrap();
        assert_eq!(state.limits["rpm"].tokens_milli, 100_000);
    }

    #[tokio::test]
    async fn test_adjust_can_go_negative() {
        let repo = MemoryRepository::new();
        let key = BucketKey::new("u1", "api");
        seed_bucket(&repo, &key, 1_000.0).await;

        let write = BucketWrite::Adjust {
            deltas: BTreeMap::from([(
                "rpm".to_string(),
                LimitDelta {
                    tokens_milli: -150_000,
                    consumed_milli: 150_000,
                    seed: None,
                },
            )]),
        };
        repo.write_bucket(&ns(), &key, write).await.unwrap();
        let state = repo.bucket_snapshot(&ns(), &key).unwrap();
        assert_eq!(state.limits["rpm"].tokens_milli, -50_000);
    }

    #[tokio::test]
    async fn test_transaction_is_all_or_nothing() {
        let repo = MemoryRepository::new();
        let child = BucketKey::new("child", "api");
        let parent = BucketKey::new("parent", "api");
        seed_bucket(&repo, &child, 1_000.0).await;
        seed_bucket(&repo, &parent, 1_000.0).await;

        let ok_write = BucketWrite::Consume {
            deltas: BTreeMap::from([("rpm".to_string(), LimitDelta::consume(1_000))]),
        };
        let failing_write = BucketWrite::Consume {
            deltas: BTreeMap::from([("rpm".to_string(), LimitDelta::consume(999_000))]),
        };

        let err = repo
            .transact_buckets(
                &ns(),
                vec![(child.clone(), ok_write), (parent.clone(), failing_write)],
            )
            .await
            .unwrap_err();
        assert!(err.is_condition_failed());

        // The child write was rolled back with the parent's failure.
        let state = repo.bucket_snapshot(&ns(), &child).unwrap();
        assert_eq!(state.limits["rpm"].tokens_milli, 100_000);
    }

    #[tokio::test]
    async fn test_entity_round_trip_and_duplicate() {
        let repo = MemoryRepository::new();
        let entity = Entity::new("u1").with_name("User One");
        repo.create_entity(&ns(), &entity, Some("ops")).await.unwrap();

        let fetched = repo.get_entity(&ns(), "u1").await.unwrap().unwrap();
        assert_eq!(fetched, entity);

        let err = repo.create_entity(&ns(), &entity, None).await.unwrap_err();
        assert!(matches!(err, LimiterError::EntityExists(_)));
    }

    #[tokio::test]
    async fn test_delete_entity_cascades() {
        let repo = MemoryRepository::new();
        repo.create_entity(&ns(), &Entity::new("u1"), None)
            .await
            .unwrap();
        repo.put_config(
            &ns(),
            &ConfigLevel::EntityDefault {
                entity_id: "u1".to_string(),
            },
            &LimitConfig {
                limits: rpm_limits(50),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
        seed_bucket(&repo, &BucketKey::new("u1", "api"), 1_000.0).await;

        let deleted = repo.delete_entity(&ns(), "u1", None).await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(repo.items_under("default/ENTITY#u1"), 0);
        assert_eq!(repo.items_under("default/BUCKET#u1#"), 0);

        let err = repo.delete_entity(&ns(), "u1", None).await.unwrap_err();
        assert!(matches!(err, LimiterError::EntityNotFound(_)));
    }

    #[tokio::test]
    async fn test_get_children() {
        let repo = MemoryRepository::new();
        repo.create_entity(&ns(), &Entity::new("parent"), None)
            .await
            .unwrap();
        repo.create_entity(&ns(), &Entity::new("c1").with_parent("parent", true), None)
            .await
            .unwrap();
        repo.create_entity(&ns(), &Entity::new("c2").with_parent("parent", false), None)
            .await
            .unwrap();
        repo.create_entity(&ns(), &Entity::new("other"), None)
            .await
            .unwrap();

        let mut children = repo.get_children(&ns(), "parent").await.unwrap();
        children.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].entity_id, "c1");
        assert_eq!(children[1].entity_id, "c2");
    }

    #[tokio::test]
    async fn test_resolution_is_cached_including_negatives() {
        let repo = MemoryRepository::new();
        repo.put_config(
            &ns(),
            &ConfigLevel::System,
            &LimitConfig {
                limits: rpm_limits(100),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();

        let first = repo.resolve_limits(&ns(), "u_new", "api").await.unwrap();
        assert_eq!(first.source, crate::config::ConfigSource::System);

        // A config written behind the cache's back is not observed until
        // invalidation: the negative entity-level result was cached.
        let (pk, sk) = ConfigLevel::EntityDefault {
            entity_id: "u_new".to_string(),
        }
        .key(&ns());
        repo.put_item(
            pk,
            sk,
            codec::encode_config(&LimitConfig {
                limits: rpm_limits(5),
                ..Default::default()
            }),
        );
        let second = repo.resolve_limits(&ns(), "u_new", "api").await.unwrap();
        assert_eq!(second.source, crate::config::ConfigSource::System);

        repo.invalidate_config_cache(Some("u_new"), None);
        let third = repo.resolve_limits(&ns(), "u_new", "api").await.unwrap();
        assert_eq!(third.source, crate::config::ConfigSource::EntityDefault);
        assert_eq!(third.limits["rpm"].capacity, 5);
    }

    #[tokio::test]
    async fn test_put_config_invalidates_cache() {
        let repo = MemoryRepository::new();
        repo.put_config(
            &ns(),
            &ConfigLevel::System,
            &LimitConfig {
                limits: rpm_limits(100),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
        let first = repo.resolve_limits(&ns(), "u1", "api").await.unwrap();
        assert_eq!(first.limits["rpm"].capacity, 100);

        repo.put_config(
            &ns(),
            &ConfigLevel::Resource {
                resource: "api".to_string(),
            },
            &LimitConfig {
                limits: rpm_limits(30),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
        let second = repo.resolve_limits(&ns(), "u1", "api").await.unwrap();
        assert_eq!(second.limits["rpm"].capacity, 30);
    }

    #[tokio::test]
    async fn test_version_round_trip() {
        let repo = MemoryRepository::new();
        assert!(repo.get_version(&ns()).await.unwrap().is_none());
        let record = VersionRecord::current(Some("provisioner"));
        repo.put_version(&ns(), &record, Some("provisioner"))
            .await
            .unwrap();
        assert_eq!(repo.get_version(&ns()).await.unwrap().unwrap(), record);
    }

    #[tokio::test]
    async fn test_unavailable_mode_fails_retryably() {
        let repo = MemoryRepository::new();
        repo.set_unavailable(true);
        assert!(repo.ping().await.unwrap_err().is_retryable());
        repo.set_unavailable(false);
        assert!(repo.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_records_read_as_absent() {
        let repo = MemoryRepository::new();
        let key = BucketKey::new("u1", "api");
        let state = BucketState::seeded(&rpm_limits(100), 1_000.0, Some(1));
        repo.write_bucket(&ns(), &key, BucketWrite::Create { state })
            .await
            .unwrap();
        assert!(repo.bucket_snapshot(&ns(), &key).is_none());
        let read = repo.read_buckets(&ns(), &[key]).await.unwrap();
        assert!(read.is_empty());
    }
}
