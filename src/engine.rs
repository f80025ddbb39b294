//! The limit engine: `acquire` orchestration and the admin surface.
//!
//! An acquire runs resolve → read → decide → write → lease:
//!
//! 1. Validate identifiers, resolve limits through the 4-level
//!    hierarchy (or take the caller's override), fetch entity metadata
//!    for `cascade`/`parent_id`.
//! 2. One batched read of the child bucket (plus the parent bucket when
//!    cascading); missing buckets are created seeded at full burst.
//! 3. Decide against the refill baseline the write would set; any
//!    deficit fails with `RateLimitExceeded` and the minimum wait.
//! 4. Write-path selection: a Normal write when refill is claimable (or
//!    a limit must be introduced), otherwise the consumption-only
//!    write. A lock conflict triggers exactly one re-read followed by
//!    the consumption-only Retry. Cascades put child and parent in one
//!    transaction, so either both buckets absorb the consumption or
//!    neither does.
//! 5. Return a [`Lease`] holding the consumption.
//!
//! Store unavailability beyond the retry budget consults the resolved
//! `on_unavailable` policy: `allow` logs a warning and fails open with
//! a degraded lease, `block` rejects with `RateLimiterUnavailable`.

use crate::bucket::{decide, now_unix, BucketState};
use crate::config::{
    bucket_ttl_secs, ConfigLevel, ConfigSource, LimitConfig, OnUnavailable, Resolution,
    DEFAULT_TTL_MULTIPLIER,
};
use crate::entity::Entity;
use crate::error::{LimiterError, LimitViolation, Result};
use crate::lease::{Lease, ParentBucket};
use crate::limits::{self, to_milli, ConsumeMap, LimitSet};
use crate::repository::{BucketKey, BucketWrite, LimitDelta, Repository};
use crate::schema::Namespace;
use crate::validation;
use crate::version::VersionRecord;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Tenant namespace every key is scoped to.
    pub namespace: Namespace,
    /// Limits used when no config level resolves and the caller passed
    /// no override.
    pub default_limits: Option<LimitSet>,
    /// Unavailability policy when no config level sets one. Fail closed
    /// unless told otherwise.
    pub default_on_unavailable: OnUnavailable,
    /// Bucket TTL multiplier over the slowest limit's full-refill
    /// horizon.
    pub ttl_multiplier: u32,
    /// Default per-acquire deadline.
    pub deadline: Option<Duration>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            namespace: Namespace::default(),
            default_limits: None,
            default_on_unavailable: OnUnavailable::Block,
            ttl_multiplier: DEFAULT_TTL_MULTIPLIER,
            deadline: None,
        }
    }
}

/// Parameters of one acquire.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub entity_id: String,
    pub resource: String,
    /// Whole tokens to consume per limit.
    pub consume: ConsumeMap,
    /// Overrides stored config when set.
    pub limits: Option<LimitSet>,
    /// Caller identity, for diagnostics.
    pub principal: Option<String>,
    /// Overrides the engine-wide deadline when set.
    pub deadline: Option<Duration>,
}

impl AcquireRequest {
    pub fn new(
        entity_id: impl Into<String>,
        resource: impl Into<String>,
        consume: ConsumeMap,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            resource: resource.into(),
            consume,
            limits: None,
            principal: None,
            deadline: None,
        }
    }

    pub fn with_limits(mut self, limits: LimitSet) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Distributed rate limiter over one repository.
///
/// # Example
///
/// ```rust,no_run
/// use tokengate::engine::RateLimiter;
/// use tokengate::limits::ConsumeMap;
/// use tokengate::repository::memory::MemoryRepository;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let limiter = RateLimiter::new(MemoryRepository::new());
/// let lease = limiter
///     .acquire("u1", "api", ConsumeMap::from([("rpm".to_string(), 1)]))
///     .await?;
/// // ... do the work ...
/// lease.commit().await?;
/// # Ok(())
/// # }
/// ```
pub struct RateLimiter<R: Repository> {
    repo: Arc<R>,
    opts: EngineOptions,
}

/// Per-call deadline, checked between store calls. In-flight store
/// writes are never cancelled mid-request; the store is authoritative.
struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    fn new(limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    fn check(&self) -> Result<()> {
        match self.limit {
            Some(limit) if self.started.elapsed() > limit => Err(LimiterError::storage(
                "per-call deadline exceeded",
                false,
            )),
            _ => Ok(()),
        }
    }
}

/// Whether an error means "the store did not serve us", which is what
/// the `on_unavailable` policy governs.
fn is_unavailability(err: &LimiterError) -> bool {
    matches!(
        err,
        LimiterError::Storage { .. } | LimiterError::Unavailable(_)
    )
}

fn rate_limit_error(violations: Vec<LimitViolation>) -> LimiterError {
    let retry_after_seconds = violations
        .iter()
        .map(|v| v.retry_after_seconds)
        .fold(0.0, f64::max);
    LimiterError::RateLimitExceeded {
        retry_after_seconds,
        violations,
    }
}

/// Outcome of planning one bucket's write.
struct Plan {
    write: Option<BucketWrite>,
    violations: Vec<LimitViolation>,
}

/// Plans the write for one bucket snapshot: decides, then builds the
/// Normal or consumption-only descriptor. `consume_only` is the
/// post-conflict Retry mode, which never touches `rf`.
fn plan_bucket(
    entity_id: &str,
    state: &BucketState,
    resolution: &Resolution,
    consume: &ConsumeMap,
    now: f64,
    consume_only: bool,
    ttl_multiplier: u32,
) -> Plan {
    // Zero consumption writes nothing; the lease can still adjust
    // later.
    if consume.values().all(|&amount| amount == 0) {
        return Plan {
            write: None,
            violations: Vec::new(),
        };
    }

    // A consumed limit absent from the record must be introduced, which
    // only the Normal write can express.
    let needs_seed = consume
        .iter()
        .any(|(limit, &amount)| amount > 0 && !state.limits.contains_key(limit));

    let rf_new = if consume_only && !needs_seed {
        state.rf
    } else {
        state.advanced_rf(now)
    };

    let decision = decide(entity_id, state, &resolution.limits, rf_new, consume);
    if !decision.allowed() {
        return Plan {
            write: None,
            violations: decision.violations,
        };
    }

    let mut deltas: BTreeMap<String, LimitDelta> = BTreeMap::new();

    if needs_seed || rf_new > state.rf {
        // Normal path: every limit in the record gets its clamped
        // refill in the same write that claims the baseline.
        for (limit, ls) in &state.limits {
            let refill = ls.clamped_refill_milli(state.rf, rf_new);
            let amount_milli = to_milli(*consume.get(limit).unwrap_or(&0));
            let delta = LimitDelta {
                tokens_milli: refill - amount_milli,
                consumed_milli: amount_milli,
                seed: None,
            };
            if delta.tokens_milli != 0 || delta.consumed_milli != 0 {
                deltas.insert(limit.clone(), delta);
            }
        }
        for (limit, &amount) in consume {
            if amount == 0 || state.limits.contains_key(limit) {
                continue;
            }
            let Some(spec) = resolution.limits.get(limit) else {
                continue;
            };
            deltas.insert(
                limit.clone(),
                LimitDelta {
                    tokens_milli: -to_milli(amount),
                    consumed_milli: to_milli(amount),
                    seed: Some(spec.clone()),
                },
            );
        }
        let ttl = if resolution.ttl_eligible {
            bucket_ttl_secs(&resolution.limits, ttl_multiplier).map(|secs| now as u64 + secs)
        } else {
            None
        };
        Plan {
            write: Some(BucketWrite::Normal {
                expected_rf: state.rf,
                new_rf: rf_new,
                ttl,
                deltas,
            }),
            violations: Vec::new(),
        }
    } else {
        for (limit, &amount) in consume {
            if amount > 0 {
                deltas.insert(limit.clone(), LimitDelta::consume(to_milli(amount)));
            }
        }
        Plan {
            write: if deltas.is_empty() {
                None
            } else {
                Some(BucketWrite::Consume { deltas })
            },
            violations: Vec::new(),
        }
    }
}

impl<R: Repository> RateLimiter<R> {
    pub fn new(repo: R) -> Self {
        Self::with_options(repo, EngineOptions::default())
    }

    pub fn with_options(repo: R, opts: EngineOptions) -> Self {
        Self {
            repo: Arc::new(repo),
            opts,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.opts.namespace
    }

    /// Shared handle to the underlying repository.
    pub fn repository(&self) -> Arc<R> {
        Arc::clone(&self.repo)
    }

    /// Consumes `consume` whole tokens per limit from the
    /// `(entity_id, resource)` bucket. See [`acquire_with`](Self::acquire_with).
    pub async fn acquire(
        &self,
        entity_id: &str,
        resource: &str,
        consume: ConsumeMap,
    ) -> Result<Lease<R>> {
        self.acquire_with(AcquireRequest::new(entity_id, resource, consume))
            .await
    }

    /// Full-control acquire. On success the returned [`Lease`] holds
    /// the consumption; the caller commits it on the success path or
    /// rolls it back on failure.
    pub async fn acquire_with(&self, req: AcquireRequest) -> Result<Lease<R>> {
        validation::validate_entity_id(&req.entity_id)?;
        validation::validate_resource(&req.resource)?;
        for limit in req.consume.keys() {
            validation::validate_limit_name(limit)?;
        }

        let ns = self.opts.namespace.clone();
        let key = BucketKey::new(&req.entity_id, &req.resource);
        let deadline = Deadline::new(req.deadline.or(self.opts.deadline));

        // Resolve limits; until a resolution lands, unavailability is
        // judged by the engine-wide default policy.
        let resolution = match &req.limits {
            Some(limits) => {
                limits::validate_limit_set(limits)?;
                Resolution {
                    limits: limits.clone(),
                    on_unavailable: None,
                    source: ConfigSource::None,
                    ttl_eligible: true,
                }
            }
            None => {
                match self
                    .repo
                    .resolve_limits(&ns, &req.entity_id, &req.resource)
                    .await
                {
                    Ok(resolution) => resolution,
                    Err(err) if is_unavailability(&err) => {
                        return self.fail_open_or(self.opts.default_on_unavailable, err, &ns, &key)
                    }
                    Err(err) => return Err(err),
                }
            }
        };
        let resolution = self.apply_fallback(resolution, &req.entity_id, &req.resource)?;
        let policy = resolution
            .on_unavailable
            .unwrap_or(self.opts.default_on_unavailable);

        for limit in req.consume.keys() {
            if !resolution.limits.contains_key(limit) {
                return Err(LimiterError::Validation(format!(
                    "limit '{limit}' is not configured for entity '{}' resource '{}'",
                    req.entity_id, req.resource
                )));
            }
        }

        // Entity metadata; an unregistered entity is a standalone leaf.
        let entity = match self.repo.get_entity(&ns, &req.entity_id).await {
            Ok(entity) => entity,
            Err(err) if is_unavailability(&err) => {
                return self.fail_open_or(policy, err, &ns, &key)
            }
            Err(err) => return Err(err),
        };
        if let Err(err) = deadline.check() {
            return self.fail_open_or(policy, err, &ns, &key);
        }

        let parent_ctx = match self.parent_context(&ns, entity.as_ref(), &req.resource).await {
            Ok(ctx) => ctx,
            Err(err) if is_unavailability(&err) => {
                return self.fail_open_or(policy, err, &ns, &key)
            }
            Err(err) => return Err(err),
        };

        // One batched read of everything the decision needs.
        let mut read_keys = vec![key.clone()];
        if let Some((parent_key, _)) = &parent_ctx {
            read_keys.push(parent_key.clone());
        }
        let mut states = match self.repo.read_buckets(&ns, &read_keys).await {
            Ok(states) => states,
            Err(err) if is_unavailability(&err) => {
                return self.fail_open_or(policy, err, &ns, &key)
            }
            Err(err) => return Err(err),
        };

        // Seed any missing bucket before deciding.
        let now = now_unix();
        for (bucket_key, bucket_resolution) in
            std::iter::once((&key, &resolution)).chain(parent_ctx.iter().map(|(k, r)| (k, r)))
        {
            if states.contains_key(bucket_key) {
                continue;
            }
            match self
                .create_bucket(&ns, bucket_key, bucket_resolution, now)
                .await
            {
                Ok(state) => {
                    states.insert(bucket_key.clone(), state);
                }
                Err(err) if is_unavailability(&err) => {
                    return self.fail_open_or(policy, err, &ns, &key)
                }
                Err(err) => return Err(err),
            }
        }

        // The parent only absorbs limits it actually defines.
        let parent_consume: ConsumeMap = match &parent_ctx {
            Some((parent_key, parent_resolution)) => {
                let parent_state = &states[parent_key];
                req.consume
                    .iter()
                    .filter(|(limit, _)| {
                        parent_state.limits.contains_key(*limit)
                            || parent_resolution.limits.contains_key(*limit)
                    })
                    .map(|(limit, &amount)| (limit.clone(), amount))
                    .collect()
            }
            None => ConsumeMap::new(),
        };

        // Decide and write; one consumption-only retry after a lock
        // conflict.
        let mut consume_only = false;
        for attempt in 0..2 {
            if let Err(err) = deadline.check() {
                return self.fail_open_or(policy, err, &ns, &key);
            }
            let now = now_unix();

            let child_plan = plan_bucket(
                &req.entity_id,
                &states[&key],
                &resolution,
                &req.consume,
                now,
                consume_only,
                self.opts.ttl_multiplier,
            );
            let parent_plan = parent_ctx.as_ref().and_then(|(parent_key, parent_resolution)| {
                if parent_consume.is_empty() {
                    return None;
                }
                Some((
                    parent_key,
                    plan_bucket(
                        &parent_key.entity_id,
                        &states[parent_key],
                        parent_resolution,
                        &parent_consume,
                        now,
                        consume_only,
                        self.opts.ttl_multiplier,
                    ),
                ))
            });

            let mut violations = child_plan.violations;
            if let Some((_, plan)) = &parent_plan {
                violations.extend(plan.violations.iter().cloned());
            }
            if !violations.is_empty() {
                return Err(rate_limit_error(violations));
            }

            let mut writes: Vec<(BucketKey, BucketWrite)> = Vec::new();
            if let Some(write) = child_plan.write {
                writes.push((key.clone(), write));
            }
            if let Some((parent_key, plan)) = parent_plan {
                if let Some(write) = plan.write {
                    writes.push(((*parent_key).clone(), write));
                }
            }

            let result = match writes.len() {
                0 => Ok(()),
                1 => {
                    let (write_key, write) = writes.pop().expect("one write");
                    self.repo.write_bucket(&ns, &write_key, write).await
                }
                _ => self.repo.transact_buckets(&ns, writes).await,
            };

            match result {
                Ok(()) => {
                    // The lease's release writes must know which limits
                    // the parent tracks, so the parent's half of an
                    // adjust or rollback stays within them.
                    let parent = parent_ctx
                        .as_ref()
                        .filter(|_| !parent_consume.is_empty())
                        .map(|(parent_key, parent_resolution)| ParentBucket {
                            key: parent_key.clone(),
                            limits: states[parent_key]
                                .limits
                                .keys()
                                .chain(parent_resolution.limits.keys())
                                .cloned()
                                .collect(),
                        });
                    return Ok(Lease::new(
                        Arc::clone(&self.repo),
                        ns,
                        key,
                        parent,
                        req.consume,
                    ));
                }
                Err(err) if err.is_condition_failed() && attempt == 0 => {
                    // Another writer advanced `rf` (or drained a limit).
                    // Re-read and fall back to the consumption-only path.
                    states = match self.repo.read_buckets(&ns, &read_keys).await {
                        Ok(states) => states,
                        Err(err) if is_unavailability(&err) => {
                            return self.fail_open_or(policy, err, &ns, &key)
                        }
                        Err(err) => return Err(err),
                    };
                    for read_key in &read_keys {
                        if !states.contains_key(read_key) {
                            return Err(LimiterError::Unavailable(
                                "bucket disappeared during acquire".to_string(),
                            ));
                        }
                    }
                    consume_only = true;
                }
                Err(err) if err.is_condition_failed() => {
                    // The retry's per-limit floor failed: re-read once
                    // more to report the exact deficit.
                    return match self.repo.read_buckets(&ns, &read_keys).await {
                        Ok(states) => {
                            let now = now_unix();
                            let mut violations = decide(
                                &req.entity_id,
                                states.get(&key).unwrap_or(&BucketState::default()),
                                &resolution.limits,
                                states.get(&key).map(|s| s.rf).unwrap_or(now),
                                &req.consume,
                            )
                            .violations;
                            if let Some((parent_key, parent_resolution)) = &parent_ctx {
                                if let Some(parent_state) = states.get(parent_key) {
                                    violations.extend(
                                        decide(
                                            &parent_key.entity_id,
                                            parent_state,
                                            &parent_resolution.limits,
                                            parent_state.rf,
                                            &parent_consume,
                                        )
                                        .violations,
                                    );
                                }
                            }
                            if violations.is_empty() {
                                Err(LimiterError::Unavailable(
                                    "persistent write contention on bucket".to_string(),
                                ))
                            } else {
                                Err(rate_limit_error(violations))
                            }
                        }
                        Err(err) => Err(LimiterError::Unavailable(err.to_string())),
                    };
                }
                Err(err) if is_unavailability(&err) => {
                    return self.fail_open_or(policy, err, &ns, &key)
                }
                Err(err) => return Err(err),
            }
        }

        Err(LimiterError::Unavailable(
            "acquire retries exhausted".to_string(),
        ))
    }

    /// Creates a bucket seeded at full burst; a lost creation race
    /// falls back to reading what the winner wrote.
    async fn create_bucket(
        &self,
        ns: &Namespace,
        key: &BucketKey,
        resolution: &Resolution,
        now: f64,
    ) -> Result<BucketState> {
        let ttl = if resolution.ttl_eligible {
            bucket_ttl_secs(&resolution.limits, self.opts.ttl_multiplier).map(|secs| now as u64 + secs)
        } else {
            None
        };
        let seeded = BucketState::seeded(&resolution.limits, now, ttl);
        match self
            .repo
            .write_bucket(ns, key, BucketWrite::Create {
                state: seeded.clone(),
            })
            .await
        {
            Ok(()) => Ok(seeded),
            Err(err) if err.is_condition_failed() => {
                let read = self.repo.read_buckets(ns, std::slice::from_ref(key)).await?;
                read.get(key).cloned().ok_or_else(|| {
                    LimiterError::storage("bucket creation raced and record is gone", true)
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Resolves the parent bucket and its limits when the entity
    /// cascades.
    async fn parent_context(
        &self,
        ns: &Namespace,
        entity: Option<&Entity>,
        resource: &str,
    ) -> Result<Option<(BucketKey, Resolution)>> {
        let Some(entity) = entity.filter(|e| e.cascades()) else {
            return Ok(None);
        };
        let parent_id = entity.parent_id.as_deref().expect("cascades implies parent");
        let resolution = self
            .repo
            .resolve_limits(ns, parent_id, resource)
            .await?;
        let resolution = self.apply_fallback(resolution, parent_id, resource)?;
        Ok(Some((BucketKey::new(parent_id, resource), resolution)))
    }

    /// Falls back to constructor-supplied defaults; no limits anywhere
    /// is `ConfigMissing`.
    fn apply_fallback(
        &self,
        resolution: Resolution,
        entity_id: &str,
        resource: &str,
    ) -> Result<Resolution> {
        if !resolution.is_empty() {
            return Ok(resolution);
        }
        match &self.opts.default_limits {
            Some(limits) => Ok(Resolution {
                limits: limits.clone(),
                ..resolution
            }),
            None => Err(LimiterError::ConfigMissing {
                entity_id: entity_id.to_string(),
                resource: resource.to_string(),
            }),
        }
    }

    /// Applies the unavailability policy: fail open with a degraded
    /// lease, or fail closed with `RateLimiterUnavailable`.
    fn fail_open_or(
        &self,
        policy: OnUnavailable,
        err: LimiterError,
        ns: &Namespace,
        key: &BucketKey,
    ) -> Result<Lease<R>> {
        match policy {
            OnUnavailable::Allow => {
                tracing::warn!(
                    entity_id = %key.entity_id,
                    resource = %key.resource,
                    error = %err,
                    "store unavailable, failing open with a degraded lease"
                );
                Ok(Lease::degraded(
                    Arc::clone(&self.repo),
                    ns.clone(),
                    key.clone(),
                ))
            }
            OnUnavailable::Block => Err(match err {
                LimiterError::Unavailable(message) => LimiterError::Unavailable(message),
                other => LimiterError::Unavailable(other.to_string()),
            }),
        }
    }

    // -- admin surface ------------------------------------------------------

    /// Registers an entity. The parent, when named, must already exist.
    pub async fn create_entity(&self, entity: Entity, principal: Option<&str>) -> Result<()> {
        entity.validate()?;
        let ns = &self.opts.namespace;
        if let Some(parent_id) = &entity.parent_id {
            if self.repo.get_entity(ns, parent_id).await?.is_none() {
                return Err(LimiterError::EntityNotFound(parent_id.clone()));
            }
        }
        self.repo.create_entity(ns, &entity, principal).await
    }

    pub async fn get_entity(&self, entity_id: &str) -> Result<Entity> {
        validation::validate_entity_id(entity_id)?;
        self.repo
            .get_entity(&self.opts.namespace, entity_id)
            .await?
            .ok_or_else(|| LimiterError::EntityNotFound(entity_id.to_string()))
    }

    /// Deletes the entity and everything under it; returns the record
    /// count removed.
    pub async fn delete_entity(&self, entity_id: &str, principal: Option<&str>) -> Result<u64> {
        validation::validate_entity_id(entity_id)?;
        self.repo
            .delete_entity(&self.opts.namespace, entity_id, principal)
            .await
    }

    pub async fn get_children(&self, parent_id: &str) -> Result<Vec<Entity>> {
        validation::validate_entity_id(parent_id)?;
        self.repo
            .get_children(&self.opts.namespace, parent_id)
            .await
    }

    /// Writes a config record after validating its level identifiers
    /// and limit specs.
    pub async fn put_config(
        &self,
        level: ConfigLevel,
        config: LimitConfig,
        principal: Option<&str>,
    ) -> Result<()> {
        validate_level(&level)?;
        limits::validate_limit_set(&config.limits)?;
        for limit in config.limits.keys() {
            validation::validate_limit_name(limit)?;
        }
        self.repo
            .put_config(&self.opts.namespace, &level, &config, principal)
            .await
    }

    pub async fn get_config(&self, level: ConfigLevel) -> Result<Option<LimitConfig>> {
        validate_level(&level)?;
        self.repo.get_config(&self.opts.namespace, &level).await
    }

    pub async fn delete_config(&self, level: ConfigLevel, principal: Option<&str>) -> Result<()> {
        validate_level(&level)?;
        self.repo
            .delete_config(&self.opts.namespace, &level, principal)
            .await
    }

    /// Resolved limits for a pair, exactly as `acquire` would see them.
    pub async fn resolve_limits(&self, entity_id: &str, resource: &str) -> Result<Resolution> {
        validation::validate_entity_id(entity_id)?;
        validation::validate_resource(resource)?;
        self.repo
            .resolve_limits(&self.opts.namespace, entity_id, resource)
            .await
    }

    pub fn invalidate_config_cache(&self, entity_id: Option<&str>, resource: Option<&str>) {
        self.repo.invalidate_config_cache(entity_id, resource);
    }

    /// Startup check against the stored `#VERSION` record. A table with
    /// no version record passes (nothing provisioned yet).
    pub async fn verify_compatibility(&self) -> Result<()> {
        match self.repo.get_version(&self.opts.namespace).await? {
            Some(record) => record.check_compatibility(),
            None => Ok(()),
        }
    }

    /// Stamps the current schema/client version, for provisioning
    /// flows.
    pub async fn put_version(&self, principal: Option<&str>) -> Result<()> {
        self.repo
            .put_version(
                &self.opts.namespace,
                &VersionRecord::current(principal),
                principal,
            )
            .await
    }

    pub async fn ping(&self) -> Result<()> {
        self.repo.ping().await
    }
}

fn validate_level(level: &ConfigLevel) -> Result<()> {
    match level {
        ConfigLevel::EntityResource {
            entity_id,
            resource,
        } => {
            validation::validate_entity_id(entity_id)?;
            validation::validate_resource(resource)
        }
        ConfigLevel::EntityDefault { entity_id } => validation::validate_entity_id(entity_id),
        ConfigLevel::Resource { resource } => validation::validate_resource(resource),
        ConfigLevel::System => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::LimitSpec;

    fn rpm_resolution(capacity: u64) -> Resolution {
        let mut limits = LimitSet::new();
        limits.insert("rpm".to_string(), LimitSpec::per_minute(capacity));
        Resolution {
            limits,
            on_unavailable: None,
            source: ConfigSource::System,
            ttl_eligible: true,
        }
    }

    fn consume(amount: u64) -> ConsumeMap {
        ConsumeMap::from([("rpm".to_string(), amount)])
    }

    #[test]
    fn test_plan_uses_consume_path_within_a_window() {
        let resolution = rpm_resolution(100);
        let state = BucketState::seeded(&resolution.limits, 1_000.0, None);
        let plan = plan_bucket("u1", &state, &resolution, &consume(1), 1_030.0, false, 7);
        assert!(plan.violations.is_empty());
        match plan.write.unwrap() {
            BucketWrite::Consume { deltas } => {
                assert_eq!(deltas["rpm"].tokens_milli, -1_000);
                assert_eq!(deltas["rpm"].consumed_milli, 1_000);
            }
            other => panic!("expected a consume write, got {other:?}"),
        }
    }

    #[test]
    fn test_plan_claims_refill_with_normal_path() {
        let resolution = rpm_resolution(100);
        let mut state = BucketState::seeded(&resolution.limits, 1_000.0, None);
        state.limits.get_mut("rpm").unwrap().tokens_milli = 40_000;

        let plan = plan_bucket("u1", &state, &resolution, &consume(10), 1_125.0, false, 7);
        match plan.write.unwrap() {
            BucketWrite::Normal {
                expected_rf,
                new_rf,
                ttl,
                deltas,
            } => {
                assert_eq!(expected_rf, 1_000.0);
                assert_eq!(new_rf, 1_120.0);
                // Two windows at 100 tokens each, clamped to the 60
                // tokens of headroom, minus the 10 consumed.
                assert_eq!(deltas["rpm"].tokens_milli, 60_000 - 10_000);
                assert_eq!(deltas["rpm"].consumed_milli, 10_000);
                // TTL-eligible resolution refreshes the expiry.
                assert_eq!(ttl, Some(1_125 + 60 * 7));
            }
            other => panic!("expected a normal write, got {other:?}"),
        }
    }

    #[test]
    fn test_plan_consume_only_never_touches_rf() {
        let resolution = rpm_resolution(100);
        let mut state = BucketState::seeded(&resolution.limits, 1_000.0, None);
        state.limits.get_mut("rpm").unwrap().tokens_milli = 40_000;

        // Two windows have elapsed, but the post-conflict retry must
        // stay consumption-only.
        let plan = plan_bucket("u1", &state, &resolution, &consume(10), 1_125.0, true, 7);
        assert!(matches!(plan.write.unwrap(), BucketWrite::Consume { .. }));
    }

    #[test]
    fn test_plan_rejects_deficit_with_retry_after() {
        let resolution = rpm_resolution(100);
        let mut state = BucketState::seeded(&resolution.limits, 1_000.0, None);
        state.limits.get_mut("rpm").unwrap().tokens_milli = 0;

        let plan = plan_bucket("u1", &state, &resolution, &consume(1), 1_030.0, false, 7);
        assert!(plan.write.is_none());
        assert_eq!(plan.violations.len(), 1);
        assert!((plan.violations[0].retry_after_seconds - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_plan_seeds_missing_limit_via_normal() {
        let mut resolution = rpm_resolution(100);
        resolution.limits.insert(
            "tpm".to_string(),
            LimitSpec::new(1_000, 1_000, Duration::from_secs(60)),
        );
        let mut seeded_set = LimitSet::new();
        seeded_set.insert("rpm".to_string(), LimitSpec::per_minute(100));
        let state = BucketState::seeded(&seeded_set, 1_000.0, None);

        let request = ConsumeMap::from([("tpm".to_string(), 400)]);
        let plan = plan_bucket("u1", &state, &resolution, &request, 1_010.0, false, 7);
        match plan.write.unwrap() {
            BucketWrite::Normal { deltas, new_rf, .. } => {
                assert_eq!(new_rf, 1_000.0);
                let tpm = &deltas["tpm"];
                assert_eq!(tpm.seed.as_ref().unwrap().capacity, 1_000);
                assert_eq!(tpm.tokens_milli, -400_000);
            }
            other => panic!("expected a normal write, got {other:?}"),
        }
    }

    #[test]
    fn test_plan_zero_consumption_writes_nothing() {
        let resolution = rpm_resolution(100);
        let state = BucketState::seeded(&resolution.limits, 1_000.0, None);
        let plan = plan_bucket("u1", &state, &resolution, &consume(0), 1_010.0, false, 7);
        assert!(plan.write.is_none());
        assert!(plan.violations.is_empty());
    }

    #[test]
    fn test_operator_owned_config_gets_no_ttl() {
        let mut resolution = rpm_resolution(100);
        resolution.ttl_eligible = false;
        let mut state = BucketState::seeded(&resolution.limits, 1_000.0, None);
        state.limits.get_mut("rpm").unwrap().tokens_milli = 0;

        let plan = plan_bucket("u1", &state, &resolution, &consume(10), 1_120.0, false, 7);
        match plan.write.unwrap() {
            BucketWrite::Normal { ttl, .. } => assert_eq!(ttl, None),
            other => panic!("expected a normal write, got {other:?}"),
        }
    }
}
