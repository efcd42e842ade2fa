//! Common types used across Veridea

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use time::OffsetDateTime;

// =============================================================================
// Plan tiers
// =============================================================================

/// Subscription plan tier. Free is the trial tier; Enterprise is unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Pro,
    Team,
    Enterprise,
}

impl Default for PlanTier {
    fn default() -> Self {
        Self::Free
    }
}

impl PlanTier {
    /// Whether trial fields on a user are meaningful for this tier.
    pub fn is_trial_tier(&self) -> bool {
        matches!(self, Self::Free)
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Pro => write!(f, "pro"),
            Self::Team => write!(f, "team"),
            Self::Enterprise => write!(f, "enterprise"),
        }
    }
}

impl FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "team" => Ok(Self::Team),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(format!("unknown plan tier: {}", other)),
        }
    }
}

// =============================================================================
// Metered resources
// =============================================================================

/// A metered resource kind gated by per-period quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// AI idea generations
    Ideas,
    /// Validation runs against an idea
    Validations,
    /// Content drafts
    Drafts,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [Self::Ideas, Self::Validations, Self::Drafts];
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ideas => write!(f, "ideas"),
            Self::Validations => write!(f, "validations"),
            Self::Drafts => write!(f, "drafts"),
        }
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ideas" => Ok(Self::Ideas),
            "validations" => Ok(Self::Validations),
            "drafts" => Ok(Self::Drafts),
            other => Err(format!("unknown resource kind: {}", other)),
        }
    }
}

// =============================================================================
// Subscription status
// =============================================================================

/// Subscription lifecycle status. `canceled` is terminal; a fresh
/// `subscription.created` event with a new provider subscription id starts
/// a new lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
}

impl SubscriptionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trialing => write!(f, "trialing"),
            Self::Active => write!(f, "active"),
            Self::PastDue => write!(f, "past_due"),
            Self::Canceled => write!(f, "canceled"),
            Self::Unpaid => write!(f, "unpaid"),
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trialing" => Ok(Self::Trialing),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            "unpaid" => Ok(Self::Unpaid),
            other => Err(format!("unknown subscription status: {}", other)),
        }
    }
}

// =============================================================================
// Resource limits
// =============================================================================

/// A per-period entitlement for one resource kind. Stored and transported
/// as an integer with `-1` meaning unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLimit {
    Limited(u32),
    Unlimited,
}

impl ResourceLimit {
    pub fn from_raw(raw: i64) -> Self {
        if raw < 0 {
            Self::Unlimited
        } else {
            Self::Limited(raw.min(u32::MAX as i64) as u32)
        }
    }

    pub fn as_raw(&self) -> i64 {
        match self {
            Self::Limited(n) => *n as i64,
            Self::Unlimited => -1,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }
}

impl Serialize for ResourceLimit {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Limited(n) => serializer.serialize_u32(*n),
            Self::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

// =============================================================================
// Period keys
// =============================================================================

/// Billing-cycle bucket a usage counter belongs to, e.g. `2026-08`.
/// Counters for a new key start at zero, so period rollover needs no
/// reset job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeriodKey(String);

impl PeriodKey {
    /// Calendar-month bucket for the given instant (UTC).
    pub fn for_month(at: OffsetDateTime) -> Self {
        Self(format!("{:04}-{:02}", at.year(), u8::from(at.month())))
    }

    /// Bucket for the current instant.
    pub fn current() -> Self {
        Self::for_month(OffsetDateTime::now_utc())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PeriodKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_plan_tier_round_trip() {
        for tier in [
            PlanTier::Free,
            PlanTier::Pro,
            PlanTier::Team,
            PlanTier::Enterprise,
        ] {
            assert_eq!(tier.to_string().parse::<PlanTier>(), Ok(tier));
        }
        assert!("platinum".parse::<PlanTier>().is_err());
    }

    #[test]
    fn test_subscription_status_round_trip() {
        for status in [
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Unpaid,
        ] {
            assert_eq!(
                status.to_string().parse::<SubscriptionStatus>(),
                Ok(status)
            );
        }
        assert!(SubscriptionStatus::Canceled.is_terminal());
        assert!(!SubscriptionStatus::PastDue.is_terminal());
    }

    #[test]
    fn test_resource_limit_raw_encoding() {
        assert_eq!(ResourceLimit::from_raw(-1), ResourceLimit::Unlimited);
        assert_eq!(ResourceLimit::from_raw(3), ResourceLimit::Limited(3));
        assert_eq!(ResourceLimit::Unlimited.as_raw(), -1);
        assert_eq!(ResourceLimit::Limited(50).as_raw(), 50);
    }

    #[test]
    fn test_period_key_format() {
        let key = PeriodKey::for_month(datetime!(2026-08-30 12:00 UTC));
        assert_eq!(key.as_str(), "2026-08");
        let january = PeriodKey::for_month(datetime!(2027-01-01 00:00 UTC));
        assert_eq!(january.as_str(), "2027-01");
    }
}
