//! Quota Enforcer
//!
//! Single entry point for "may this user consume one unit of this
//! resource right now". Admission and the counter increment are one
//! atomic storage operation; there is no check-then-write window for
//! concurrent requests to slip through.

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;
use veridea_shared::{PeriodKey, ResourceKind, ResourceLimit};

use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::store::{BillingStore, CounterUpdate};

/// Headroom left after a decision. Serializes as a number, or the string
/// `"unlimited"`, mirroring how limits render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    Count(u64),
    Unlimited,
}

impl Serialize for Remaining {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Count(n) => serializer.serialize_u64(*n),
            Self::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

/// What the enforcer decided for one unit of consumption.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub resource: ResourceKind,
    pub period: String,
    pub remaining: Remaining,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Per-resource usage line in a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub resource: ResourceKind,
    pub used: i64,
    pub limit: ResourceLimit,
    pub remaining: Remaining,
}

/// Read-only usage report for one user and period.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub user_id: Uuid,
    pub plan_id: String,
    pub period: String,
    pub resources: Vec<ResourceUsage>,
}

/// Admission control over plan-scoped resource limits.
#[derive(Clone)]
pub struct QuotaEnforcer {
    store: Arc<dyn BillingStore>,
}

impl QuotaEnforcer {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Consume one unit of `resource` for `user_id` in the current period,
    /// or deny without writing anything.
    ///
    /// The plan is re-read from the user row on every call so a plan
    /// change reflected by the reconciler takes effect immediately.
    pub async fn enforce(
        &self,
        user_id: Uuid,
        resource: ResourceKind,
    ) -> BillingResult<QuotaDecision> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or(BillingError::UserNotFound(user_id))?;

        let period = PeriodKey::current();
        let limit = PlanCatalog::limit_for(&user.plan_id, resource);

        let update = self
            .store
            .try_increment_usage(user_id, &period, resource, limit)
            .await?;

        let decision = match update {
            CounterUpdate::Admitted { count } => QuotaDecision {
                allowed: true,
                resource,
                period: period.to_string(),
                remaining: remaining_after(limit, count),
                reason: None,
            },
            CounterUpdate::Denied => {
                tracing::info!(
                    user_id = %user_id,
                    resource = %resource,
                    plan_id = %user.plan_id,
                    "Quota exhausted, request denied"
                );
                QuotaDecision {
                    allowed: false,
                    resource,
                    period: period.to_string(),
                    remaining: Remaining::Count(0),
                    reason: Some("limit_reached".to_string()),
                }
            }
        };

        Ok(decision)
    }

    /// Counter snapshot for the current period, one line per known
    /// resource. Resources never consumed read as zero.
    pub async fn current_usage(&self, user_id: Uuid) -> BillingResult<UsageSnapshot> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or(BillingError::UserNotFound(user_id))?;

        let period = PeriodKey::current();
        let counters = self.store.usage_for_period(user_id, &period).await?;

        let resources = ResourceKind::ALL
            .iter()
            .map(|&resource| {
                let used = counters
                    .iter()
                    .find(|(r, _)| *r == resource)
                    .map(|(_, count)| *count)
                    .unwrap_or(0);
                let limit = PlanCatalog::limit_for(&user.plan_id, resource);
                ResourceUsage {
                    resource,
                    used,
                    limit,
                    remaining: remaining_after(limit, used),
                }
            })
            .collect();

        Ok(UsageSnapshot {
            user_id,
            plan_id: user.plan_id,
            period: period.to_string(),
            resources,
        })
    }
}

fn remaining_after(limit: ResourceLimit, count: i64) -> Remaining {
    match limit {
        ResourceLimit::Unlimited => Remaining::Unlimited,
        ResourceLimit::Limited(max) => {
            Remaining::Count((i64::from(max) - count).max(0) as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_counts_down() {
        let limit = ResourceLimit::Limited(3);
        assert_eq!(remaining_after(limit, 1), Remaining::Count(2));
        assert_eq!(remaining_after(limit, 3), Remaining::Count(0));
    }

    #[test]
    fn test_remaining_never_negative() {
        assert_eq!(
            remaining_after(ResourceLimit::Limited(2), 5),
            Remaining::Count(0)
        );
    }

    #[test]
    fn test_unlimited_remaining() {
        assert_eq!(
            remaining_after(ResourceLimit::Unlimited, 1_000_000),
            Remaining::Unlimited
        );
    }
}
