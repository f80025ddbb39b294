//! End-to-end acquire scenarios against the in-memory repository.

use std::collections::BTreeMap;
use std::time::Duration;
use tokengate::config::{ConfigLevel, LimitConfig, OnUnavailable};
use tokengate::engine::{AcquireRequest, EngineOptions, RateLimiter};
use tokengate::limits::{ConsumeMap, LimitSet, LimitSpec};
use tokengate::repository::memory::MemoryRepository;
use tokengate::repository::{BucketKey, BucketWrite, LimitDelta, Repository};
use tokengate::schema::Namespace;
use tokengate::{AdjustMap, LimiterError};

/// Best-effort tracing setup; `RUST_LOG=tokengate=debug` shows the
/// engine's decisions while debugging a failing test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn rpm(amount: u64) -> ConsumeMap {
    ConsumeMap::from([("rpm".to_string(), amount)])
}

fn limit_set(pairs: &[(&str, LimitSpec)]) -> LimitSet {
    pairs
        .iter()
        .map(|(name, spec)| (name.to_string(), spec.clone()))
        .collect()
}

/// A limiter over a fresh store with one system-level config.
async fn limiter_with_system(limits: LimitSet) -> RateLimiter<MemoryRepository> {
    let limiter = RateLimiter::new(MemoryRepository::new());
    limiter
        .put_config(
            ConfigLevel::System,
            LimitConfig {
                limits,
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    limiter
}

#[tokio::test]
async fn acquire_sequence_exhausts_capacity_with_retry_after() {
    init_tracing();
    let limiter = limiter_with_system(limit_set(&[("rpm", LimitSpec::per_minute(100))])).await;

    for _ in 0..100 {
        let lease = limiter.acquire("u1", "api", rpm(1)).await.unwrap();
        lease.commit().await.unwrap();
    }

    let err = limiter.acquire("u1", "api", rpm(1)).await.unwrap_err();
    match err {
        LimiterError::RateLimitExceeded {
            retry_after_seconds,
            ref violations,
        } => {
            // 1-token deficit at 100 tokens per 60 s.
            assert!((retry_after_seconds - 0.6).abs() < 1e-6);
            assert_eq!(violations.len(), 1);
            assert_eq!(violations[0].limit, "rpm");
            assert_eq!(violations[0].requested_milli, 1_000);
            assert_eq!(violations[0].available_milli, 0);
            assert_eq!(err.retry_after_header().as_deref(), Some("1"));
        }
        other => panic!("expected RateLimitExceeded, got {other:?}"),
    }
}

#[tokio::test]
async fn acquire_at_exact_balance_leaves_zero_tokens() {
    let limiter = limiter_with_system(limit_set(&[("rpm", LimitSpec::per_minute(100))])).await;

    let lease = limiter.acquire("u1", "api", rpm(100)).await.unwrap();
    lease.commit().await.unwrap();

    let repo = limiter.repository();
    let state = repo
        .bucket_snapshot(&Namespace::default(), &BucketKey::new("u1", "api"))
        .unwrap();
    assert_eq!(state.limits["rpm"].tokens_milli, 0);
    assert_eq!(state.limits["rpm"].total_consumed_milli, 100_000);

    assert!(limiter.acquire("u1", "api", rpm(1)).await.is_err());
}

#[tokio::test]
async fn cascade_consumes_child_and_parent_in_one_transaction() {
    let limiter = RateLimiter::new(MemoryRepository::new());
    limiter
        .create_entity(tokengate::Entity::new("parent"), None)
        .await
        .unwrap();
    limiter
        .create_entity(
            tokengate::Entity::new("child").with_parent("parent", true),
            None,
        )
        .await
        .unwrap();
    limiter
        .put_config(
            ConfigLevel::EntityResource {
                entity_id: "parent".to_string(),
                resource: "api".to_string(),
            },
            LimitConfig {
                limits: limit_set(&[("rpm", LimitSpec::per_minute(100))]),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    limiter
        .put_config(
            ConfigLevel::EntityResource {
                entity_id: "child".to_string(),
                resource: "api".to_string(),
            },
            LimitConfig {
                limits: limit_set(&[("rpm", LimitSpec::per_minute(10))]),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();

    for _ in 0..10 {
        let lease = limiter.acquire("child", "api", rpm(1)).await.unwrap();
        lease.commit().await.unwrap();
    }

    let repo = limiter.repository();
    let ns = Namespace::default();
    let child = repo
        .bucket_snapshot(&ns, &BucketKey::new("child", "api"))
        .unwrap();
    let parent = repo
        .bucket_snapshot(&ns, &BucketKey::new("parent", "api"))
        .unwrap();
    assert_eq!(child.limits["rpm"].tokens_milli, 0);
    assert_eq!(parent.limits["rpm"].tokens_milli, 90_000);
    assert_eq!(parent.limits["rpm"].total_consumed_milli, 10_000);

    // The child is exhausted; the parent still serves its own traffic.
    let err = limiter.acquire("child", "api", rpm(1)).await.unwrap_err();
    assert!(matches!(err, LimiterError::RateLimitExceeded { .. }));
    for _ in 0..90 {
        let lease = limiter.acquire("parent", "api", rpm(1)).await.unwrap();
        lease.commit().await.unwrap();
    }
    assert!(limiter.acquire("parent", "api", rpm(1)).await.is_err());
}

#[tokio::test]
async fn cascade_failure_on_parent_leaves_child_untouched() {
    let limiter = RateLimiter::new(MemoryRepository::new());
    limiter
        .create_entity(tokengate::Entity::new("parent"), None)
        .await
        .unwrap();
    limiter
        .create_entity(
            tokengate::Entity::new("child").with_parent("parent", true),
            None,
        )
        .await
        .unwrap();
    // Parent is the tighter limit.
    limiter
        .put_config(
            ConfigLevel::EntityResource {
                entity_id: "parent".to_string(),
                resource: "api".to_string(),
            },
            LimitConfig {
                limits: limit_set(&[("rpm", LimitSpec::per_minute(5))]),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    limiter
        .put_config(
            ConfigLevel::EntityResource {
                entity_id: "child".to_string(),
                resource: "api".to_string(),
            },
            LimitConfig {
                limits: limit_set(&[("rpm", LimitSpec::per_minute(100))]),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();

    for _ in 0..5 {
        let lease = limiter.acquire("child", "api", rpm(1)).await.unwrap();
        lease.commit().await.unwrap();
    }
    let err = limiter.acquire("child", "api", rpm(1)).await.unwrap_err();
    match err {
        LimiterError::RateLimitExceeded { violations, .. } => {
            assert_eq!(violations[0].entity_id, "parent");
        }
        other => panic!("expected RateLimitExceeded, got {other:?}"),
    }

    // Transaction atomicity: the child bucket did not absorb the
    // rejected consumption.
    let repo = limiter.repository();
    let child = repo
        .bucket_snapshot(&Namespace::default(), &BucketKey::new("child", "api"))
        .unwrap();
    assert_eq!(child.limits["rpm"].tokens_milli, 95_000);
    assert_eq!(child.limits["rpm"].total_consumed_milli, 5_000);
}

#[tokio::test]
async fn cascade_release_skips_limits_the_parent_does_not_track() {
    let limiter = RateLimiter::new(MemoryRepository::new());
    limiter
        .create_entity(tokengate::Entity::new("parent"), None)
        .await
        .unwrap();
    limiter
        .create_entity(
            tokengate::Entity::new("child").with_parent("parent", true),
            None,
        )
        .await
        .unwrap();
    // The parent only tracks rpm; the child tracks rpm and tpm.
    limiter
        .put_config(
            ConfigLevel::EntityResource {
                entity_id: "parent".to_string(),
                resource: "api".to_string(),
            },
            LimitConfig {
                limits: limit_set(&[("rpm", LimitSpec::per_minute(100))]),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    limiter
        .put_config(
            ConfigLevel::EntityResource {
                entity_id: "child".to_string(),
                resource: "api".to_string(),
            },
            LimitConfig {
                limits: limit_set(&[
                    ("rpm", LimitSpec::per_minute(50)),
                    ("tpm", LimitSpec::new(10_000, 10_000, Duration::from_secs(60))),
                ]),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();

    let repo = limiter.repository();
    let ns = Namespace::default();
    let child_key = BucketKey::new("child", "api");
    let parent_key = BucketKey::new("parent", "api");
    let consume = ConsumeMap::from([("rpm".to_string(), 1), ("tpm".to_string(), 500)]);

    // Rollback: the compensating write reverses rpm on both buckets but
    // must not plant a phantom tpm entry on the parent.
    let lease = limiter.acquire("child", "api", consume.clone()).await.unwrap();
    lease.rollback().await.unwrap();

    let parent = repo.bucket_snapshot(&ns, &parent_key).unwrap();
    assert!(!parent.limits.contains_key("tpm"));
    assert_eq!(parent.limits["rpm"].tokens_milli, 100_000);
    assert_eq!(parent.limits["rpm"].total_consumed_milli, 0);
    let child = repo.bucket_snapshot(&ns, &child_key).unwrap();
    assert_eq!(child.limits["tpm"].tokens_milli, 10_000_000);
    assert_eq!(child.limits["rpm"].tokens_milli, 50_000);

    // Adjust-then-commit: the shared rpm delta lands on both, the
    // child-only tpm delta lands on the child alone.
    let mut lease = limiter.acquire("child", "api", consume).await.unwrap();
    lease
        .adjust(AdjustMap::from([
            ("rpm".to_string(), 1),
            ("tpm".to_string(), 250),
        ]))
        .unwrap();
    lease.commit().await.unwrap();

    let parent = repo.bucket_snapshot(&ns, &parent_key).unwrap();
    assert!(!parent.limits.contains_key("tpm"));
    assert_eq!(parent.limits["rpm"].tokens_milli, 98_000);
    assert_eq!(parent.limits["rpm"].total_consumed_milli, 2_000);
    let child = repo.bucket_snapshot(&ns, &child_key).unwrap();
    assert_eq!(child.limits["rpm"].tokens_milli, 48_000);
    assert_eq!(child.limits["tpm"].tokens_milli, 10_000_000 - 750_000);
    assert_eq!(child.limits["tpm"].total_consumed_milli, 750_000);
}

#[tokio::test]
async fn lease_adjust_reconciles_estimate_on_commit() {
    let limiter = limiter_with_system(limit_set(&[(
        "tpm",
        LimitSpec::new(10_000, 10_000, Duration::from_secs(60)),
    )]))
    .await;

    let mut lease = limiter
        .acquire("u1", "api", ConsumeMap::from([("tpm".to_string(), 500)]))
        .await
        .unwrap();
    // Actual usage came in at 1250: 750 beyond the estimate.
    lease
        .adjust(AdjustMap::from([("tpm".to_string(), 750)]))
        .unwrap();
    lease.commit().await.unwrap();

    let repo = limiter.repository();
    let state = repo
        .bucket_snapshot(&Namespace::default(), &BucketKey::new("u1", "api"))
        .unwrap();
    assert_eq!(state.limits["tpm"].tokens_milli, (10_000 - 1_250) * 1_000);
    assert_eq!(state.limits["tpm"].total_consumed_milli, 1_250_000);
}

#[tokio::test]
async fn lease_rollback_restores_pre_acquire_state() {
    let limiter = limiter_with_system(limit_set(&[
        ("rpm", LimitSpec::per_minute(100)),
        ("tpm", LimitSpec::new(10_000, 10_000, Duration::from_secs(60))),
    ]))
    .await;

    let consume = ConsumeMap::from([("rpm".to_string(), 1), ("tpm".to_string(), 500)]);
    let lease = limiter.acquire("u1", "api", consume).await.unwrap();

    let repo = limiter.repository();
    let ns = Namespace::default();
    let key = BucketKey::new("u1", "api");
    let during = repo.bucket_snapshot(&ns, &key).unwrap();
    assert_eq!(during.limits["rpm"].tokens_milli, 99_000);
    assert_eq!(during.limits["tpm"].tokens_milli, 9_500_000);

    // Caller failed: the compensating adjust reverses both limits.
    lease.rollback().await.unwrap();
    let after = repo.bucket_snapshot(&ns, &key).unwrap();
    assert_eq!(after.limits["rpm"].tokens_milli, 100_000);
    assert_eq!(after.limits["rpm"].total_consumed_milli, 0);
    assert_eq!(after.limits["tpm"].tokens_milli, 10_000_000);
    assert_eq!(after.limits["tpm"].total_consumed_milli, 0);
}

#[tokio::test]
async fn zero_consumption_acquire_writes_nothing_but_can_adjust() {
    let limiter = limiter_with_system(limit_set(&[("rpm", LimitSpec::per_minute(100))])).await;

    let mut lease = limiter.acquire("u1", "api", rpm(0)).await.unwrap();

    let repo = limiter.repository();
    let ns = Namespace::default();
    let key = BucketKey::new("u1", "api");
    // The bucket exists (seeded for later adjusts) but nothing was
    // consumed.
    let state = repo.bucket_snapshot(&ns, &key).unwrap();
    assert_eq!(state.limits["rpm"].tokens_milli, 100_000);
    assert_eq!(state.limits["rpm"].total_consumed_milli, 0);

    lease
        .adjust(AdjustMap::from([("rpm".to_string(), 2)]))
        .unwrap();
    lease.commit().await.unwrap();

    let state = repo.bucket_snapshot(&ns, &key).unwrap();
    assert_eq!(state.limits["rpm"].tokens_milli, 98_000);
    assert_eq!(state.limits["rpm"].total_consumed_milli, 2_000);
}

#[tokio::test]
async fn override_limits_bypass_stored_config() {
    let limiter = RateLimiter::new(MemoryRepository::new());
    let request = AcquireRequest::new("u1", "api", rpm(1))
        .with_limits(limit_set(&[("rpm", LimitSpec::per_minute(2))]))
        .with_principal("tester");

    let lease = limiter.acquire_with(request.clone()).await.unwrap();
    lease.commit().await.unwrap();
    let lease = limiter.acquire_with(request.clone()).await.unwrap();
    lease.commit().await.unwrap();
    let err = limiter.acquire_with(request).await.unwrap_err();
    assert!(matches!(err, LimiterError::RateLimitExceeded { .. }));
}

#[tokio::test]
async fn missing_config_fails_or_uses_engine_default() {
    let limiter = RateLimiter::new(MemoryRepository::new());
    let err = limiter.acquire("u1", "api", rpm(1)).await.unwrap_err();
    assert!(matches!(err, LimiterError::ConfigMissing { .. }));

    let opts = EngineOptions {
        default_limits: Some(limit_set(&[("rpm", LimitSpec::per_minute(3))])),
        ..Default::default()
    };
    let limiter = RateLimiter::with_options(MemoryRepository::new(), opts);
    for _ in 0..3 {
        let lease = limiter.acquire("u1", "api", rpm(1)).await.unwrap();
        lease.commit().await.unwrap();
    }
    assert!(limiter.acquire("u1", "api", rpm(1)).await.is_err());
}

#[tokio::test]
async fn unknown_limit_and_bad_identifiers_are_validation_errors() {
    let limiter = limiter_with_system(limit_set(&[("rpm", LimitSpec::per_minute(100))])).await;

    let err = limiter
        .acquire("u1", "api", ConsumeMap::from([("tpm".to_string(), 1)]))
        .await
        .unwrap_err();
    assert!(matches!(err, LimiterError::Validation(_)));

    let err = limiter.acquire("u#1", "api", rpm(1)).await.unwrap_err();
    assert!(matches!(err, LimiterError::Validation(_)));

    let err = limiter.acquire("u1", "bad#resource", rpm(1)).await.unwrap_err();
    assert!(matches!(err, LimiterError::Validation(_)));
}

#[tokio::test]
async fn fail_open_policy_grants_degraded_lease() {
    let limiter = RateLimiter::new(MemoryRepository::new());
    limiter
        .put_config(
            ConfigLevel::System,
            LimitConfig {
                limits: limit_set(&[("rpm", LimitSpec::per_minute(100))]),
                on_unavailable: Some(OnUnavailable::Allow),
                ttl: None,
            },
            None,
        )
        .await
        .unwrap();

    // Warm the bucket and the config cache, then take the store down.
    let lease = limiter.acquire("u1", "api", rpm(1)).await.unwrap();
    lease.commit().await.unwrap();
    limiter.repository().set_unavailable(true);

    let mut lease = limiter.acquire("u1", "api", rpm(1)).await.unwrap();
    assert!(lease.is_degraded());
    // Degraded leases swallow adjust/commit quietly.
    lease
        .adjust(AdjustMap::from([("rpm".to_string(), 5)]))
        .unwrap();
    lease.commit().await.unwrap();

    limiter.repository().set_unavailable(false);
    let state = limiter
        .repository()
        .bucket_snapshot(&Namespace::default(), &BucketKey::new("u1", "api"))
        .unwrap();
    assert_eq!(state.limits["rpm"].total_consumed_milli, 1_000);
}

#[tokio::test]
async fn fail_closed_policy_rejects_when_store_is_down() {
    let limiter = limiter_with_system(limit_set(&[("rpm", LimitSpec::per_minute(100))])).await;
    let lease = limiter.acquire("u1", "api", rpm(1)).await.unwrap();
    lease.commit().await.unwrap();

    limiter.repository().set_unavailable(true);
    let err = limiter.acquire("u1", "api", rpm(1)).await.unwrap_err();
    assert!(matches!(err, LimiterError::Unavailable(_)));
}

#[tokio::test]
async fn ttl_follows_config_ownership() {
    // System-level config: the bucket expires.
    let limiter = limiter_with_system(limit_set(&[("rpm", LimitSpec::per_minute(100))])).await;
    let lease = limiter.acquire("u1", "api", rpm(1)).await.unwrap();
    lease.commit().await.unwrap();
    let state = limiter
        .repository()
        .bucket_snapshot(&Namespace::default(), &BucketKey::new("u1", "api"))
        .unwrap();
    assert!(state.ttl.is_some());

    // Operator-owned entity-specific config: the bucket persists.
    let limiter = RateLimiter::new(MemoryRepository::new());
    limiter
        .put_config(
            ConfigLevel::EntityResource {
                entity_id: "u2".to_string(),
                resource: "api".to_string(),
            },
            LimitConfig {
                limits: limit_set(&[("rpm", LimitSpec::per_minute(100))]),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    let lease = limiter.acquire("u2", "api", rpm(1)).await.unwrap();
    lease.commit().await.unwrap();
    let state = limiter
        .repository()
        .bucket_snapshot(&Namespace::default(), &BucketKey::new("u2", "api"))
        .unwrap();
    assert!(state.ttl.is_none());
}

#[tokio::test]
async fn double_exit_is_a_no_op() {
    let limiter = limiter_with_system(limit_set(&[("rpm", LimitSpec::per_minute(100))])).await;
    let lease = limiter.acquire("u1", "api", rpm(1)).await.unwrap();
    lease.commit().await.unwrap();
    // `commit`/`rollback` consume the lease, so a double exit cannot
    // even be expressed; dropping a committed lease must not roll back.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let state = limiter
        .repository()
        .bucket_snapshot(&Namespace::default(), &BucketKey::new("u1", "api"))
        .unwrap();
    assert_eq!(state.limits["rpm"].total_consumed_milli, 1_000);
}

#[tokio::test]
async fn dropped_open_lease_rolls_back_via_backstop() {
    let limiter = limiter_with_system(limit_set(&[("rpm", LimitSpec::per_minute(100))])).await;
    {
        let _lease = limiter.acquire("u1", "api", rpm(5)).await.unwrap();
        // Dropped without an explicit exit.
    }
    // The backstop task runs on the runtime; give it a beat.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let state = limiter
        .repository()
        .bucket_snapshot(&Namespace::default(), &BucketKey::new("u1", "api"))
        .unwrap();
    assert_eq!(state.limits["rpm"].tokens_milli, 100_000);
    assert_eq!(state.limits["rpm"].total_consumed_milli, 0);
}

/// The write-protocol race from two concurrent workers: both read the
/// same baseline, one Normal write wins the lock, the loser lands its
/// consumption through the consumption-only retry. One refill claim,
/// both consumptions.
#[tokio::test]
async fn concurrent_normal_writes_conflict_then_retry() {
    let repo = MemoryRepository::new();
    let ns = Namespace::default();
    let key = BucketKey::new("u1", "api");

    // A bucket one full window in the past with a drained balance.
    let mut limits = LimitSet::new();
    limits.insert("rpm".to_string(), LimitSpec::per_minute(100));
    let t0 = tokengate::bucket::now_unix() - 61.0;
    let mut state = tokengate::bucket::BucketState::seeded(&limits, t0, None);
    state.limits.get_mut("rpm").unwrap().tokens_milli = 10_000;
    state.limits.get_mut("rpm").unwrap().total_consumed_milli = 90_000;
    repo.write_bucket(&ns, &key, BucketWrite::Create { state })
        .await
        .unwrap();

    // Both workers observed rf = t0 and plan to claim the same window.
    let worker_write = |amount_milli: i64| BucketWrite::Normal {
        expected_rf: t0,
        new_rf: t0 + 60.0,
        ttl: None,
        deltas: BTreeMap::from([(
            "rpm".to_string(),
            LimitDelta {
                // One window of refill clamped to the 90-token headroom,
                // minus the consumption.
                tokens_milli: 90_000 - amount_milli,
                consumed_milli: amount_milli,
                seed: None,
            },
        )]),
    };

    // Worker A wins the rf lock.
    repo.write_bucket(&ns, &key, worker_write(2_000)).await.unwrap();
    // Worker B conflicts...
    let err = repo
        .write_bucket(&ns, &key, worker_write(3_000))
        .await
        .unwrap_err();
    assert!(err.is_condition_failed());
    // ...re-reads, sees plenty of tokens, and issues the
    // consumption-only retry.
    let re_read = repo
        .read_buckets(&ns, std::slice::from_ref(&key))
        .await
        .unwrap();
    assert!(re_read[&key].limits["rpm"].tokens_milli >= 3_000);
    repo.write_bucket(
        &ns,
        &key,
        BucketWrite::Consume {
            deltas: BTreeMap::from([("rpm".to_string(), LimitDelta::consume(3_000))]),
        },
    )
    .await
    .unwrap();

    let state = repo.bucket_snapshot(&ns, &key).unwrap();
    // Exactly one refill was claimed; both consumptions landed.
    assert_eq!(state.rf, t0 + 60.0);
    assert_eq!(state.limits["rpm"].tokens_milli, 10_000 + 90_000 - 5_000);
    assert_eq!(state.limits["rpm"].total_consumed_milli, 95_000);
}

#[tokio::test]
async fn parallel_acquires_conserve_tokens() {
    let limiter = std::sync::Arc::new(
        limiter_with_system(limit_set(&[("rpm", LimitSpec::per_minute(100))])).await,
    );

    let mut handles = Vec::new();
    for _ in 0..20 {
        let limiter = std::sync::Arc::clone(&limiter);
        handles.push(tokio::spawn(async move {
            match limiter.acquire("u1", "api", rpm(1)).await {
                Ok(lease) => {
                    lease.commit().await.unwrap();
                    true
                }
                Err(LimiterError::RateLimitExceeded { .. }) => false,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }));
    }
    let mut granted = 0_i64;
    for handle in handles {
        if handle.await.unwrap() {
            granted += 1;
        }
    }

    let state = limiter
        .repository()
        .bucket_snapshot(&Namespace::default(), &BucketKey::new("u1", "api"))
        .unwrap();
    // Conservation: granted consumptions equal the token decrease and
    // the `tc` increase.
    assert_eq!(state.limits["rpm"].total_consumed_milli, granted * 1_000);
    assert_eq!(state.limits["rpm"].tokens_milli, 100_000 - granted * 1_000);
}
