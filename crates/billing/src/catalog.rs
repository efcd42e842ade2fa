//! Plan Catalog
//!
//! Static mapping from plan tier to per-resource monthly limits and
//! feature flags. Pure lookup, no mutable state; versioned by deployment.
//! An unknown plan id resolves to zero entitlement (fail closed).

use veridea_shared::{PlanTier, ResourceKind, ResourceLimit};

/// Feature flags based on tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PlanFeatures {
    /// Trend report access
    pub trend_reports: bool,
    /// Export of validation results and drafts
    pub export: bool,
    /// Priority support
    pub priority_support: bool,
}

/// Static plan catalog
pub struct PlanCatalog;

impl PlanCatalog {
    /// Resolve the monthly limit for a plan id and resource kind.
    ///
    /// The plan id comes from the user row as stored; an id the catalog
    /// does not recognize yields `Limited(0)` so a misconfigured user can
    /// never consume resources.
    pub fn limit_for(plan_id: &str, resource: ResourceKind) -> ResourceLimit {
        match plan_id.parse::<PlanTier>() {
            Ok(tier) => Self::tier_limit(tier, resource),
            Err(_) => ResourceLimit::Limited(0),
        }
    }

    /// Monthly limit for a known tier.
    pub fn tier_limit(tier: PlanTier, resource: ResourceKind) -> ResourceLimit {
        use ResourceKind::*;
        use ResourceLimit::*;
        match (tier, resource) {
            (PlanTier::Free, Ideas) => Limited(3),
            (PlanTier::Free, Validations) => Limited(1),
            (PlanTier::Free, Drafts) => Limited(2),

            (PlanTier::Pro, Ideas) => Limited(100),
            (PlanTier::Pro, Validations) => Limited(25),
            (PlanTier::Pro, Drafts) => Limited(50),

            (PlanTier::Team, Ideas) => Limited(500),
            (PlanTier::Team, Validations) => Limited(100),
            (PlanTier::Team, Drafts) => Limited(200),

            (PlanTier::Enterprise, _) => Unlimited,
        }
    }

    /// Get features for a tier
    pub fn features(tier: PlanTier) -> PlanFeatures {
        match tier {
            PlanTier::Free => PlanFeatures {
                trend_reports: false,
                export: false,
                priority_support: false,
            },
            PlanTier::Pro => PlanFeatures {
                trend_reports: true,
                export: true,
                priority_support: false,
            },
            PlanTier::Team | PlanTier::Enterprise => PlanFeatures {
                trend_reports: true,
                export: true,
                priority_support: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_tier_limits() {
        assert_eq!(
            PlanCatalog::limit_for("free", ResourceKind::Ideas),
            ResourceLimit::Limited(3)
        );
        assert_eq!(
            PlanCatalog::limit_for("free", ResourceKind::Validations),
            ResourceLimit::Limited(1)
        );
        assert_eq!(
            PlanCatalog::limit_for("free", ResourceKind::Drafts),
            ResourceLimit::Limited(2)
        );
    }

    #[test]
    fn test_enterprise_is_unlimited() {
        for resource in ResourceKind::ALL {
            assert_eq!(
                PlanCatalog::limit_for("enterprise", resource),
                ResourceLimit::Unlimited
            );
        }
    }

    #[test]
    fn test_unknown_plan_fails_closed() {
        assert_eq!(
            PlanCatalog::limit_for("platinum", ResourceKind::Ideas),
            ResourceLimit::Limited(0)
        );
        assert_eq!(
            PlanCatalog::limit_for("", ResourceKind::Drafts),
            ResourceLimit::Limited(0)
        );
    }

    #[test]
    fn test_features_by_tier() {
        assert!(!PlanCatalog::features(PlanTier::Free).export);
        assert!(PlanCatalog::features(PlanTier::Pro).trend_reports);
        assert!(!PlanCatalog::features(PlanTier::Pro).priority_support);
        assert!(PlanCatalog::features(PlanTier::Team).priority_support);
    }
}
