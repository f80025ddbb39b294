//! Leases: scoped consumptions with guaranteed cleanup.
//!
//! `acquire` returns a [`Lease`] holding what was consumed. While the
//! lease is open the caller may [`adjust`](Lease::adjust) the estimate
//! (positive deltas consume more, negative refund); nothing touches the
//! store until the lease exits. The two exits are:
//!
//! - [`commit`](Lease::commit) is the success path. Flushes the
//!   accumulated adjustments as one Adjust write (child and parent in
//!   one transaction when the acquire cascaded).
//! - [`rollback`](Lease::rollback) is the failure path. Issues a
//!   compensating Adjust reversing the initial consumption; pending
//!   adjustments are discarded.
//!
//! State machine: `Open → (adjusted)* → Committed | RolledBack`; only
//! `Open` permits `adjust`, and a second exit is a no-op. Rust has no
//! async drop, so the guaranteed-release rule is rendered as explicit
//! exits plus a `Drop` backstop: a lease dropped while still open
//! spawns its compensating write on the current runtime (and logs an
//! error when there is none).
//!
//! A *degraded* lease, granted because the store was unavailable under
//! the `allow` policy, carries no consumption and ignores every
//! operation.

use crate::error::{LimiterError, Result};
use crate::limits::{delta_to_milli, to_milli, AdjustMap, ConsumeMap};
use crate::repository::{BucketKey, BucketWrite, LimitDelta, Repository};
use crate::schema::Namespace;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseState {
    Open,
    Committed,
    RolledBack,
}

/// Parent half of a cascaded acquire: the parent's bucket and the limit
/// names it tracks. Parent and child limit sets may diverge, and the
/// acquire only consumed the overlap from the parent, so release writes
/// restrict the parent's deltas to this set. A blind Adjust on a limit
/// the parent never defined would fabricate a malformed entry there.
#[derive(Debug, Clone)]
pub(crate) struct ParentBucket {
    pub key: BucketKey,
    pub limits: BTreeSet<String>,
}

/// An acquired consumption, released on every exit path.
pub struct Lease<R: Repository> {
    repo: Arc<R>,
    ns: Namespace,
    key: BucketKey,
    parent: Option<ParentBucket>,
    consumed: ConsumeMap,
    pending: AdjustMap,
    state: LeaseState,
    degraded: bool,
}

impl<R: Repository> std::fmt::Debug for Lease<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("ns", &self.ns)
            .field("key", &self.key)
            .field("parent", &self.parent)
            .field("consumed", &self.consumed)
            .field("pending", &self.pending)
            .field("state", &self.state)
            .field("degraded", &self.degraded)
            .finish()
    }
}

impl<R: Repository> Lease<R> {
    pub(crate) fn new(
        repo: Arc<R>,
        ns: Namespace,
        key: BucketKey,
        parent: Option<ParentBucket>,
        consumed: ConsumeMap,
    ) -> Self {
        Self {
            repo,
            ns,
            key,
            parent,
            consumed,
            pending: AdjustMap::new(),
            state: LeaseState::Open,
            degraded: false,
        }
    }

    /// A lease granted because the store was unavailable under the
    /// `allow` policy. Holds no consumption; every operation is a
    /// no-op.
    pub(crate) fn degraded(repo: Arc<R>, ns: Namespace, key: BucketKey) -> Self {
        Self {
            repo,
            ns,
            key,
            parent: None,
            consumed: ConsumeMap::new(),
            pending: AdjustMap::new(),
            state: LeaseState::Open,
            degraded: true,
        }
    }

    /// Whether this lease was granted degraded (fail-open).
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// The amounts acquired, in whole tokens.
    pub fn consumed(&self) -> &ConsumeMap {
        &self.consumed
    }

    /// The accumulated, not-yet-flushed adjustments.
    pub fn pending_adjust(&self) -> &AdjustMap {
        &self.pending
    }

    pub fn entity_id(&self) -> &str {
        &self.key.entity_id
    }

    pub fn resource(&self) -> &str {
        &self.key.resource
    }

    /// Records a whole-token adjustment per limit: positive means the
    /// caller used more than estimated, negative refunds. The store is
    /// not contacted until the lease exits.
    pub fn adjust(&mut self, deltas: AdjustMap) -> Result<()> {
        if self.degraded {
            tracing::debug!(entity_id = %self.key.entity_id, "adjust on degraded lease ignored");
            return Ok(());
        }
        if self.state != LeaseState::Open {
            return Err(LimiterError::Validation(
                "lease is already closed".to_string(),
            ));
        }
        for (limit, delta) in deltas {
            *self.pending.entry(limit).or_insert(0) += delta;
        }
        Ok(())
    }

    /// Success exit: flushes pending adjustments (one Adjust write,
    /// parent included in the same transaction when cascaded) and
    /// closes the lease.
    pub async fn commit(mut self) -> Result<()> {
        if self.degraded || self.state != LeaseState::Open {
            self.state = LeaseState::Committed;
            return Ok(());
        }
        // Close before the store call: a failed flush must not arm the
        // drop backstop into reversing a consumption that stands.
        self.state = LeaseState::Committed;

        let deltas = adjust_deltas(&self.pending);
        if deltas.is_empty() {
            return Ok(());
        }
        let parent = parent_share(self.parent.as_ref(), &deltas);
        apply_release(&self.repo, &self.ns, &self.key, deltas, parent).await
    }

    /// Failure exit: reverses the initial consumption with a
    /// compensating Adjust and discards pending adjustments.
    pub async fn rollback(mut self) -> Result<()> {
        if self.degraded || self.state != LeaseState::Open {
            self.state = LeaseState::RolledBack;
            return Ok(());
        }
        self.state = LeaseState::RolledBack;

        let deltas = compensating_deltas(&self.consumed);
        if deltas.is_empty() {
            return Ok(());
        }
        let parent = parent_share(self.parent.as_ref(), &deltas);
        apply_release(&self.repo, &self.ns, &self.key, deltas, parent).await
    }
}

impl<R: Repository> Drop for Lease<R> {
    fn drop(&mut self) {
        if self.state != LeaseState::Open || self.degraded {
            return;
        }
        let deltas = compensating_deltas(&self.consumed);
        if deltas.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(
                    entity_id = %self.key.entity_id,
                    resource = %self.key.resource,
                    "lease dropped while open, rolling back consumption"
                );
                let repo = Arc::clone(&self.repo);
                let ns = self.ns.clone();
                let key = self.key.clone();
                let parent = self.parent.take();
                handle.spawn(async move {
                    let parent = parent_share(parent.as_ref(), &deltas);
                    if let Err(err) = apply_release(&repo, &ns, &key, deltas, parent).await {
                        tracing::error!(
                            entity_id = %key.entity_id,
                            error = %err,
                            "compensating adjust failed"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::error!(
                    entity_id = %self.key.entity_id,
                    "lease dropped outside a runtime; consumption was not rolled back"
                );
            }
        }
    }
}

/// Adjust deltas from accumulated whole-token adjustments: a positive
/// adjustment consumes (`tk -= d`, `tc += d`), a negative one refunds.
fn adjust_deltas(pending: &AdjustMap) -> BTreeMap<String, LimitDelta> {
    pending
        .iter()
        .filter(|(_, &delta)| delta != 0)
        .map(|(limit, &delta)| {
            let milli = delta_to_milli(delta);
            (
                limit.clone(),
                LimitDelta {
                    tokens_milli: -milli,
                    consumed_milli: milli,
                    seed: None,
                },
            )
        })
        .collect()
}

/// Compensating deltas reversing an initial consumption: tokens go back
/// to `tk`, `tc` is walked back by the same amount.
fn compensating_deltas(consumed: &ConsumeMap) -> BTreeMap<String, LimitDelta> {
    consumed
        .iter()
        .filter(|(_, &amount)| amount != 0)
        .map(|(limit, &amount)| {
            let milli = to_milli(amount);
            (
                limit.clone(),
                LimitDelta {
                    tokens_milli: milli,
                    consumed_milli: -milli,
                    seed: None,
                },
            )
        })
        .collect()
}

/// The parent's slice of a release: the deltas restricted to the limit
/// names the parent tracks. `None` when nothing applies to the parent.
fn parent_share(
    parent: Option<&ParentBucket>,
    deltas: &BTreeMap<String, LimitDelta>,
) -> Option<(BucketKey, BTreeMap<String, LimitDelta>)> {
    let parent = parent?;
    let filtered: BTreeMap<String, LimitDelta> = deltas
        .iter()
        .filter(|(limit, _)| parent.limits.contains(*limit))
        .map(|(limit, delta)| (limit.clone(), delta.clone()))
        .collect();
    if filtered.is_empty() {
        None
    } else {
        Some((parent.key.clone(), filtered))
    }
}

/// One Adjust write, or one transaction when a parent bucket rides
/// along.
async fn apply_release<R: Repository>(
    repo: &R,
    ns: &Namespace,
    key: &BucketKey,
    deltas: BTreeMap<String, LimitDelta>,
    parent: Option<(BucketKey, BTreeMap<String, LimitDelta>)>,
) -> Result<()> {
    match parent {
        Some((parent_key, parent_deltas)) => {
            repo.transact_buckets(
                ns,
                vec![
                    (key.clone(), BucketWrite::Adjust { deltas }),
                    (
                        parent_key,
                        BucketWrite::Adjust {
                            deltas: parent_deltas,
                        },
                    ),
                ],
            )
            .await
        }
        None => {
            repo.write_bucket(ns, key, BucketWrite::Adjust { deltas })
                .await
        }
    }
}
