//! Coupon service: flash-sale issuance, coupon use and rollback.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use chrono::Utc;
use common::events::{
    CompensationCompleted, CompensationType, CouponApplied, CouponApplyFailed, CouponCompensationRequested,
    CouponUseRequested,
};
use common::{CouponId, OrderId, PolicyId, UserId};
use domain::{CouponPolicy, DomainError, TransactionLedger, TransactionRecord, TransactionType, UserCoupon};
use messaging::MessageRelay;
use resource_lock::{LockGuard, LockManager, LockOptions, QuotaCounter, QuotaRestorePolicy};

use crate::context::{ServiceContext, ServiceStore, StepOutcome, acquire_all, release_all};
use crate::error::Result;
use crate::product::take_outage;

/// Tables owned by the coupon service.
#[derive(Debug, Clone, Default)]
pub struct CouponTables {
    pub policies: HashMap<PolicyId, CouponPolicy>,
    pub coupons: HashMap<CouponId, UserCoupon>,
    /// One coupon per user and policy.
    pub issued: HashSet<(PolicyId, UserId)>,
    pub history: TransactionLedger,
}

/// Owns coupon policies and user coupons. Consumes `coupon-use` and
/// `coupon-compensation-request`; serves `issue_coupon` synchronously.
pub struct CouponService {
    store: ServiceStore<CouponTables>,
    locks: Arc<dyn LockManager>,
    lock_options: LockOptions,
    quota: Arc<dyn QuotaCounter>,
    restore_policy: QuotaRestorePolicy,
    compensation_outages: AtomicUsize,
}

fn quota_key(policy_id: PolicyId) -> String {
    format!("coupon:quota:{policy_id}")
}

fn issue_lock_key(policy_id: PolicyId, user_id: UserId) -> String {
    format!("coupon:issue:{policy_id}:{user_id}")
}

fn coupon_lock_key(coupon_id: CouponId) -> String {
    format!("coupon:{coupon_id}")
}

impl CouponService {
    pub fn new(ctx: &ServiceContext, quota: Arc<dyn QuotaCounter>, restore_policy: QuotaRestorePolicy) -> Self {
        Self {
            store: ServiceStore::open("coupon", CouponTables::default(), ctx),
            locks: ctx.locks.clone(),
            lock_options: ctx.lock_options,
            quota,
            restore_policy,
            compensation_outages: AtomicUsize::new(0),
        }
    }

    pub fn relay(&self) -> &Arc<MessageRelay> {
        self.store.relay()
    }

    pub fn store(&self) -> &ServiceStore<CouponTables> {
        &self.store
    }

    /// Stores a policy and seeds its quota counter with the remaining quantity.
    pub async fn create_policy(&self, policy: CouponPolicy) -> Result<PolicyId> {
        let policy_id = policy.policy_id;
        let remaining = policy.remaining();
        self.store
            .commit(|tx| {
                tx.policies.insert(policy_id, policy);
                Ok(())
            })
            .await?;
        self.quota.initialize(&quota_key(policy_id), i64::from(remaining)).await?;
        Ok(policy_id)
    }

    /// Re-seeds every quota counter from the authoritative policy rows.
    pub async fn warm_up_quota(&self) -> Result<usize> {
        let remaining: Vec<(PolicyId, u32)> = self
            .store
            .read(|t| t.policies.values().map(|p| (p.policy_id, p.remaining())).collect())
            .await;
        for (policy_id, left) in &remaining {
            self.quota.initialize(&quota_key(*policy_id), i64::from(*left)).await?;
        }
        tracing::info!(policies = remaining.len(), "coupon quota counters initialized");
        Ok(remaining.len())
    }

    pub async fn policy(&self, policy_id: PolicyId) -> Option<CouponPolicy> {
        self.store.read(|t| t.policies.get(&policy_id).cloned()).await
    }

    pub async fn coupon(&self, coupon_id: CouponId) -> Option<UserCoupon> {
        self.store.read(|t| t.coupons.get(&coupon_id).cloned()).await
    }

    pub async fn coupons_of(&self, user_id: UserId) -> Vec<UserCoupon> {
        self.store
            .read(|t| t.coupons.values().filter(|c| c.user_id == user_id).cloned().collect())
            .await
    }

    pub async fn history(&self, order_id: OrderId) -> Vec<TransactionRecord> {
        self.store
            .read(|t| t.history.for_order(order_id).into_iter().cloned().collect())
            .await
    }

    /// See [`crate::ProductService::fail_next_compensations`].
    pub fn fail_next_compensations(&self, count: usize) {
        self.compensation_outages
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }

    /// Issues one coupon of `policy_id` to `user_id`.
    ///
    /// The quota counter is decremented first, without a lock; a negative
    /// result means the policy is sold out. Only then is the per-user lock
    /// taken to reject duplicate issues and check the validity window.
    #[tracing::instrument(skip(self))]
    pub async fn issue_coupon(&self, policy_id: PolicyId, user_id: UserId) -> Result<UserCoupon> {
        let key = quota_key(policy_id);
        let left = self.quota.decrement_and_get(&key).await?;
        if left < 0 {
            metrics::counter!("coupon_issue_total", "result" => "exhausted").increment(1);
            return Err(DomainError::QuotaExhausted(policy_id.to_string()).into());
        }

        let result = self.issue_locked(policy_id, user_id).await;
        match &result {
            Ok(_) => {
                metrics::counter!("coupon_issue_total", "result" => "issued").increment(1);
            }
            Err(e) => {
                metrics::counter!("coupon_issue_total", "result" => "rejected").increment(1);
                tracing::debug!(error = %e, "coupon issue failed after quota decrement");
                self.restore_policy
                    .settle_failed_attempt(self.quota.as_ref(), &key)
                    .await?;
            }
        }
        result
    }

    async fn issue_locked(&self, policy_id: PolicyId, user_id: UserId) -> Result<UserCoupon> {
        let guard = LockGuard::acquire(
            self.locks.as_ref(),
            &issue_lock_key(policy_id, user_id),
            self.lock_options,
        )
        .await?;

        let result = self
            .store
            .commit(|tx| {
                if tx.issued.contains(&(policy_id, user_id)) {
                    return Err(DomainError::AlreadyIssued {
                        policy_id: policy_id.to_string(),
                        user_id: user_id.to_string(),
                    }
                    .into());
                }
                let policy = tx
                    .policies
                    .get_mut(&policy_id)
                    .ok_or_else(|| DomainError::PolicyNotFound(policy_id.to_string()))?;
                policy.check_window(Utc::now())?;
                policy.record_issue()?;

                let coupon = UserCoupon::issue(policy_id, user_id);
                tx.issued.insert((policy_id, user_id));
                tx.coupons.insert(coupon.coupon_id, coupon.clone());
                Ok(coupon)
            })
            .await;

        if let Err(e) = guard.release().await {
            tracing::warn!(error = %e, "issue lock release failed");
        }
        result
    }

    /// Marks every coupon of the order as used, under per-coupon locks.
    /// Publishes `coupon-applied` or `coupon-apply-failed`.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, saga_id = %cmd.saga_id))]
    pub async fn use_coupons(&self, cmd: CouponUseRequested) -> Result<StepOutcome> {
        let keys = cmd.coupon_ids.iter().copied().map(coupon_lock_key).collect();
        let guards = acquire_all(self.locks.as_ref(), keys, self.lock_options).await?;

        let result = self
            .store
            .commit(|tx| {
                let already = cmd.coupon_ids.iter().all(|id| {
                    tx.history
                        .contains(cmd.order_id, TransactionType::Reserve, Some(&id.to_string()))
                });
                if already {
                    return Ok(StepOutcome::AlreadyApplied);
                }

                let now = Utc::now();
                let tables = &mut **tx;
                for coupon_id in &cmd.coupon_ids {
                    let coupon = tables
                        .coupons
                        .get_mut(coupon_id)
                        .ok_or_else(|| DomainError::CouponNotFound(coupon_id.to_string()))?;
                    let policy = tables
                        .policies
                        .get(&coupon.policy_id)
                        .ok_or_else(|| DomainError::PolicyNotFound(coupon.policy_id.to_string()))?;
                    policy.check_window(now)?;
                    coupon.use_for(cmd.order_id, cmd.user_id)?;
                    tables
                        .history
                        .record(cmd.order_id, TransactionType::Reserve, Some(&coupon_id.to_string()), 1);
                }

                tx.publish(&CouponApplied {
                    saga_id: cmd.saga_id,
                    order_id: cmd.order_id,
                    coupon_ids: cmd.coupon_ids.clone(),
                })?;
                Ok(StepOutcome::Applied)
            })
            .await;
        release_all(guards).await;

        self.store
            .finish_step(common::topics::COUPON_USE, result, |reason| CouponApplyFailed {
                saga_id: cmd.saga_id,
                order_id: cmd.order_id,
                reason,
            })
            .await
    }

    /// Makes one coupon available again and reports on `compensation-completed`.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, saga_id = %cmd.saga_id, coupon_id = %cmd.coupon_id))]
    pub async fn compensate_coupon(&self, cmd: CouponCompensationRequested) -> Result<StepOutcome> {
        let entity = cmd.coupon_id.to_string();

        if take_outage(&self.compensation_outages) {
            self.store
                .publish(&CompensationCompleted::failed(
                    cmd.saga_id,
                    cmd.order_id,
                    CompensationType::Coupon,
                    entity,
                    "coupon store unavailable",
                    true,
                ))
                .await?;
            return Ok(StepOutcome::Rejected("coupon store unavailable".into()));
        }

        let guards = acquire_all(self.locks.as_ref(), vec![coupon_lock_key(cmd.coupon_id)], self.lock_options).await?;
        let result = self
            .store
            .commit(|tx| {
                let tables = &mut **tx;
                let outcome = if !tables
                    .history
                    .contains(cmd.order_id, TransactionType::Reserve, Some(&entity))
                    || tables
                        .history
                        .contains(cmd.order_id, TransactionType::RollbackReserve, Some(&entity))
                {
                    StepOutcome::AlreadyApplied
                } else {
                    let coupon = tables
                        .coupons
                        .get_mut(&cmd.coupon_id)
                        .ok_or_else(|| DomainError::CouponNotFound(entity.clone()))?;
                    coupon.restore(cmd.order_id);
                    tables
                        .history
                        .record(cmd.order_id, TransactionType::RollbackReserve, Some(&entity), 1);
                    StepOutcome::Applied
                };
                tx.publish(&CompensationCompleted::succeeded(
                    cmd.saga_id,
                    cmd.order_id,
                    CompensationType::Coupon,
                    entity.clone(),
                ))?;
                Ok(outcome)
            })
            .await;
        release_all(guards).await;

        self.store
            .finish_step(common::topics::COUPON_COMPENSATION_REQUEST, result, |reason| {
                CompensationCompleted::failed(
                    cmd.saga_id,
                    cmd.order_id,
                    CompensationType::Coupon,
                    entity.clone(),
                    reason,
                    false,
                )
            })
            .await
    }
}
