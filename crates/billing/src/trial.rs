//! Trial Clock
//!
//! Derives trial status from stored timestamps and the plan id. Pure and
//! re-derivable at any time; never cached as authoritative state.

use serde::Serialize;
use time::OffsetDateTime;
use veridea_shared::PlanTier;

use crate::store::UserRecord;

const SECONDS_PER_DAY: i64 = 86_400;

/// Trial window status for a user
#[derive(Debug, Clone, Serialize)]
pub struct TrialStatus {
    pub plan_type: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    pub is_trial_active: bool,
    /// Days remaining, rounded up. None unless the trial is active.
    pub days_remaining: Option<i64>,
}

/// Compute trial status from stored fields.
///
/// The trial is active only while the plan is the trial tier, a
/// `trial_ends_at` is set, and that instant is still in the future.
pub fn trial_status(
    plan_id: &str,
    trial_ends_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> TrialStatus {
    let on_trial_tier = plan_id
        .parse::<PlanTier>()
        .map(|t| t.is_trial_tier())
        .unwrap_or(false);

    let active_until = match (on_trial_tier, trial_ends_at) {
        (true, Some(ends_at)) if ends_at > now => Some(ends_at),
        _ => None,
    };

    let days_remaining = active_until.map(|ends_at| {
        let seconds = (ends_at - now).whole_seconds();
        // ceil division: any partial day counts as a full day
        (seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
    });

    TrialStatus {
        plan_type: plan_id.to_string(),
        trial_ends_at,
        is_trial_active: days_remaining.is_some(),
        days_remaining,
    }
}

/// Trial status for a loaded user row.
pub fn trial_status_for_user(user: &UserRecord, now: OffsetDateTime) -> TrialStatus {
    trial_status(&user.plan_id, user.trial_ends_at, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    #[test]
    fn test_trial_active_five_days() {
        let status = trial_status("free", Some(now() + Duration::days(5)), now());
        assert!(status.is_trial_active);
        assert_eq!(status.days_remaining, Some(5));
    }

    #[test]
    fn test_partial_day_rounds_up() {
        let status = trial_status(
            "free",
            Some(now() + Duration::days(2) + Duration::hours(3)),
            now(),
        );
        assert_eq!(status.days_remaining, Some(3));
    }

    #[test]
    fn test_expired_trial_inactive() {
        let status = trial_status("free", Some(now() - Duration::hours(1)), now());
        assert!(!status.is_trial_active);
        assert_eq!(status.days_remaining, None);
    }

    #[test]
    fn test_paid_plan_never_on_trial() {
        let status = trial_status("pro", Some(now() + Duration::days(5)), now());
        assert!(!status.is_trial_active);
        assert_eq!(status.days_remaining, None);
    }

    #[test]
    fn test_missing_end_date_inactive() {
        let status = trial_status("free", None, now());
        assert!(!status.is_trial_active);
        assert_eq!(status.days_remaining, None);
    }

    #[test]
    fn test_unknown_plan_inactive() {
        let status = trial_status("platinum", Some(now() + Duration::days(5)), now());
        assert!(!status.is_trial_active);
    }
}
