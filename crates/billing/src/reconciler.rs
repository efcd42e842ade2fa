//! Subscription Reconciler
//!
//! Applies a validated provider event to subscription and user state.
//! The transition table lives in [`plan_transition`], a pure function so
//! every edge is unit-testable without storage.
//!
//! Conflict rule: an event is applied only if its provider-side
//! `payload_timestamp` is strictly newer than the `updated_at` of the
//! subscription it targets. Redeliveries and reordered deliveries resolve
//! to [`ReconcileOutcome::Stale`], which the caller records as processed
//! so the provider never retries them.

use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;
use veridea_shared::{PlanTier, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};
use crate::ingest::WebhookDelivery;
use crate::store::{
    ApplyOutcome, BillingStore, NewTransaction, SubscriptionChange, SubscriptionRecord,
    TransactionStatus,
};

// =============================================================================
// Normalized events
// =============================================================================

/// Provider event types the reconciler understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SubscriptionCreated,
    PaymentSucceeded,
    PaymentFailed,
    SubscriptionCanceled,
    SubscriptionUpdated,
}

impl FromStr for EventKind {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscription.created" => Ok(Self::SubscriptionCreated),
            "payment.succeeded" => Ok(Self::PaymentSucceeded),
            "payment.failed" => Ok(Self::PaymentFailed),
            "subscription.canceled" => Ok(Self::SubscriptionCanceled),
            "subscription.updated" => Ok(Self::SubscriptionUpdated),
            other => Err(BillingError::UnknownEventType(other.to_string())),
        }
    }
}

/// How the payload identifies the affected user.
#[derive(Debug, Clone)]
pub enum UserRef {
    ById(Uuid),
    ByCustomer(String),
}

/// A provider event after payload validation.
#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub payload_timestamp: OffsetDateTime,
    pub user_ref: UserRef,
    pub provider_subscription_id: String,
    /// Target status carried by `subscription.updated`.
    pub status_override: Option<SubscriptionStatus>,
    /// Plan accompanying the event, when present.
    pub plan: Option<PlanTier>,
    pub amount_cents: Option<i64>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
}

fn payload_str(payload: &serde_json::Value, key: &str) -> Option<String> {
    payload.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn payload_timestamp_field(
    payload: &serde_json::Value,
    key: &str,
) -> BillingResult<Option<OffsetDateTime>> {
    match payload.get(key).and_then(|v| v.as_str()) {
        Some(raw) => OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
            .map(Some)
            .map_err(|e| BillingError::Validation(format!("invalid {}: {}", key, e))),
        None => Ok(None),
    }
}

impl NormalizedEvent {
    /// Validate and normalize a raw delivery. Every failure here is a
    /// `Validation` (or `UnknownEventType`) error that the ingestor
    /// records on the event row for later replay.
    pub fn from_delivery(delivery: &WebhookDelivery) -> BillingResult<Self> {
        let kind: EventKind = delivery.event_type.parse()?;
        let payload = &delivery.payload;

        let user_ref = if let Some(raw) = payload_str(payload, "user_id") {
            let id = Uuid::parse_str(&raw)
                .map_err(|e| BillingError::Validation(format!("invalid user_id: {}", e)))?;
            UserRef::ById(id)
        } else if let Some(customer) = payload_str(payload, "customer_id") {
            UserRef::ByCustomer(customer)
        } else {
            return Err(BillingError::Validation(
                "payload carries neither user_id nor customer_id".into(),
            ));
        };

        let provider_subscription_id = payload_str(payload, "subscription_id").ok_or_else(|| {
            BillingError::Validation("payload missing subscription_id".into())
        })?;

        let status_override = match payload_str(payload, "status") {
            Some(raw) => Some(
                raw.parse::<SubscriptionStatus>()
                    .map_err(BillingError::Validation)?,
            ),
            None => None,
        };

        let plan = match payload_str(payload, "plan") {
            Some(raw) => Some(raw.parse::<PlanTier>().map_err(BillingError::Validation)?),
            None => None,
        };

        let amount_cents = payload.get("amount_cents").and_then(|v| v.as_i64());

        Ok(Self {
            event_id: delivery.event_id.clone(),
            kind,
            payload_timestamp: delivery.payload_timestamp,
            user_ref,
            provider_subscription_id,
            status_override,
            plan,
            amount_cents,
            current_period_start: payload_timestamp_field(payload, "period_start")?,
            current_period_end: payload_timestamp_field(payload, "period_end")?,
        })
    }

    fn payment(&self, status: TransactionStatus) -> BillingResult<NewTransaction> {
        let amount_cents = self.amount_cents.ok_or_else(|| {
            BillingError::Validation(format!(
                "{} event missing amount_cents",
                self.event_id
            ))
        })?;
        Ok(NewTransaction {
            provider_event_id: self.event_id.clone(),
            amount_cents,
            status,
        })
    }
}

// =============================================================================
// Transition planning
// =============================================================================

/// What the state machine decided for one event.
#[derive(Debug)]
pub(crate) enum Transition {
    Apply(SubscriptionChange),
    /// Payload timestamp at or behind the stored state.
    Stale,
    /// Definitive no-op (e.g. an event targeting a terminal
    /// subscription). Marked processed, never replayed.
    Ignored(&'static str),
}

/// Pure transition table. `current` is the subscription on record, if any.
///
/// Out-of-order deliveries that cannot apply *yet* (a `payment.succeeded`
/// racing ahead of its `subscription.created`) surface as `Validation`
/// errors so the event stays unprocessed and the replay worker can retry
/// it once the missing state has arrived.
pub(crate) fn plan_transition(
    user_id: Uuid,
    current: Option<&SubscriptionRecord>,
    event: &NormalizedEvent,
) -> BillingResult<Transition> {
    if let Some(sub) = current {
        if event.payload_timestamp <= sub.updated_at {
            return Ok(Transition::Stale);
        }
    }

    let source = current.map(|s| s.status);

    let change = |new_status: SubscriptionStatus,
                  new_plan: Option<PlanTier>,
                  transaction: Option<NewTransaction>| {
        SubscriptionChange {
            user_id,
            provider_subscription_id: event.provider_subscription_id.clone(),
            new_status,
            new_plan,
            current_period_start: event
                .current_period_start
                .or_else(|| current.and_then(|s| s.current_period_start)),
            current_period_end: event
                .current_period_end
                .or_else(|| current.and_then(|s| s.current_period_end)),
            payload_timestamp: event.payload_timestamp,
            transaction,
        }
    };

    match event.kind {
        EventKind::SubscriptionCreated => match (source, current) {
            (None, _) | (Some(SubscriptionStatus::Trialing), _) => Ok(Transition::Apply(change(
                SubscriptionStatus::Active,
                event.plan,
                None,
            ))),
            // A fresh lifecycle after cancellation needs a new provider
            // subscription object.
            (Some(SubscriptionStatus::Canceled), Some(sub))
                if sub.provider_subscription_id != event.provider_subscription_id =>
            {
                Ok(Transition::Apply(change(
                    SubscriptionStatus::Active,
                    event.plan,
                    None,
                )))
            }
            (Some(SubscriptionStatus::Canceled), _) => {
                Ok(Transition::Ignored("created targets the canceled lifecycle"))
            }
            (Some(other), _) => Err(BillingError::Validation(format!(
                "subscription.created not applicable from status {}",
                other
            ))),
        },

        EventKind::PaymentSucceeded => match source {
            Some(
                SubscriptionStatus::Active
                | SubscriptionStatus::PastDue
                | SubscriptionStatus::Unpaid,
            ) => {
                let txn = event.payment(TransactionStatus::Succeeded)?;
                Ok(Transition::Apply(change(
                    SubscriptionStatus::Active,
                    event.plan,
                    Some(txn),
                )))
            }
            Some(SubscriptionStatus::Canceled) => {
                Ok(Transition::Ignored("payment targets a canceled subscription"))
            }
            Some(SubscriptionStatus::Trialing) => Err(BillingError::Validation(
                "payment.succeeded not applicable while trialing".into(),
            )),
            None => Err(BillingError::Validation(
                "payment.succeeded with no subscription on record".into(),
            )),
        },

        EventKind::PaymentFailed => match source {
            Some(SubscriptionStatus::Active) => {
                let txn = event.payment(TransactionStatus::Failed)?;
                Ok(Transition::Apply(change(
                    SubscriptionStatus::PastDue,
                    None,
                    Some(txn),
                )))
            }
            Some(SubscriptionStatus::Canceled) => {
                Ok(Transition::Ignored("payment targets a canceled subscription"))
            }
            Some(other) => Err(BillingError::Validation(format!(
                "payment.failed not applicable from status {}",
                other
            ))),
            None => Err(BillingError::Validation(
                "payment.failed with no subscription on record".into(),
            )),
        },

        EventKind::SubscriptionCanceled => match source {
            Some(status) if !status.is_terminal() => {
                // Cancellation drops the user back to the free tier.
                Ok(Transition::Apply(change(
                    SubscriptionStatus::Canceled,
                    Some(PlanTier::Free),
                    None,
                )))
            }
            Some(_) => Ok(Transition::Ignored("subscription already canceled")),
            None => Err(BillingError::Validation(
                "subscription.canceled with no subscription on record".into(),
            )),
        },

        EventKind::SubscriptionUpdated => {
            let status = event.status_override.ok_or_else(|| {
                BillingError::Validation("subscription.updated missing status".into())
            })?;
            match source {
                Some(SubscriptionStatus::Canceled) => {
                    Ok(Transition::Ignored("update targets a canceled subscription"))
                }
                _ => Ok(Transition::Apply(change(status, event.plan, None))),
            }
        }
    }
}

// =============================================================================
// Service
// =============================================================================

/// Result of reconciling one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied {
        from: Option<SubscriptionStatus>,
        to: SubscriptionStatus,
    },
    /// Older than the state on record; a domain no-op.
    Stale,
    /// Definitive no-op for a terminal subscription.
    Ignored { reason: String },
}

/// Applies validated events to subscription/user state.
#[derive(Clone)]
pub struct SubscriptionReconciler {
    store: Arc<dyn BillingStore>,
}

impl SubscriptionReconciler {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn reconcile(&self, delivery: &WebhookDelivery) -> BillingResult<ReconcileOutcome> {
        let event = NormalizedEvent::from_delivery(delivery)?;

        let user = match &event.user_ref {
            UserRef::ById(id) => self.store.get_user(*id).await?,
            UserRef::ByCustomer(customer) => self.store.find_user_by_customer(customer).await?,
        }
        .ok_or_else(|| {
            BillingError::Validation(format!(
                "no matching user for event {}",
                delivery.event_id
            ))
        })?;

        let current = self.store.get_subscription(user.id).await?;
        let from = current.as_ref().map(|s| s.status);

        match plan_transition(user.id, current.as_ref(), &event)? {
            Transition::Stale => {
                tracing::info!(
                    event_id = %event.event_id,
                    user_id = %user.id,
                    "Stale event ignored: payload older than subscription state"
                );
                Ok(ReconcileOutcome::Stale)
            }
            Transition::Ignored(reason) => {
                tracing::info!(
                    event_id = %event.event_id,
                    user_id = %user.id,
                    reason = reason,
                    "Event ignored"
                );
                Ok(ReconcileOutcome::Ignored {
                    reason: reason.to_string(),
                })
            }
            Transition::Apply(subscription_change) => {
                match self
                    .store
                    .apply_subscription_change(&subscription_change)
                    .await?
                {
                    ApplyOutcome::Applied => {
                        tracing::info!(
                            event_id = %event.event_id,
                            user_id = %user.id,
                            from = ?from,
                            to = %subscription_change.new_status,
                            "Subscription transition applied"
                        );
                        Ok(ReconcileOutcome::Applied {
                            from,
                            to: subscription_change.new_status,
                        })
                    }
                    // Lost the race to a newer event between our read and
                    // the guarded write.
                    ApplyOutcome::Stale => Ok(ReconcileOutcome::Stale),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn sub(status: SubscriptionStatus, updated_at: OffsetDateTime) -> SubscriptionRecord {
        SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            provider_subscription_id: "psub_1".into(),
            status,
            current_period_start: None,
            current_period_end: None,
            updated_at,
        }
    }

    fn event(kind: &str, ts: OffsetDateTime) -> NormalizedEvent {
        NormalizedEvent {
            event_id: "evt_1".into(),
            kind: kind.parse().unwrap(),
            payload_timestamp: ts,
            user_ref: UserRef::ById(Uuid::new_v4()),
            provider_subscription_id: "psub_1".into(),
            status_override: None,
            plan: None,
            amount_cents: Some(2900),
            current_period_start: None,
            current_period_end: None,
        }
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    #[test]
    fn test_created_from_nothing_activates() {
        let ev = event("subscription.created", now());
        let plan = plan_transition(Uuid::new_v4(), None, &ev).unwrap();
        match plan {
            Transition::Apply(change) => assert_eq!(change.new_status, SubscriptionStatus::Active),
            other => panic!("expected Apply, got {:?}", other),
        }
    }

    #[test]
    fn test_created_from_trialing_activates() {
        let current = sub(SubscriptionStatus::Trialing, now() - Duration::days(1));
        let ev = event("subscription.created", now());
        match plan_transition(current.user_id, Some(&current), &ev).unwrap() {
            Transition::Apply(change) => assert_eq!(change.new_status, SubscriptionStatus::Active),
            other => panic!("expected Apply, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_event_is_noop() {
        let current = sub(SubscriptionStatus::Canceled, now());
        let ev = event("payment.succeeded", now() - Duration::hours(1));
        assert!(matches!(
            plan_transition(current.user_id, Some(&current), &ev).unwrap(),
            Transition::Stale
        ));
    }

    #[test]
    fn test_equal_timestamp_is_stale() {
        let ts = now();
        let current = sub(SubscriptionStatus::Active, ts);
        let ev = event("payment.failed", ts);
        assert!(matches!(
            plan_transition(current.user_id, Some(&current), &ev).unwrap(),
            Transition::Stale
        ));
    }

    #[test]
    fn test_payment_succeeded_recovers_past_due() {
        let current = sub(SubscriptionStatus::PastDue, now() - Duration::days(1));
        let ev = event("payment.succeeded", now());
        match plan_transition(current.user_id, Some(&current), &ev).unwrap() {
            Transition::Apply(change) => {
                assert_eq!(change.new_status, SubscriptionStatus::Active);
                assert!(change.transaction.is_some());
            }
            other => panic!("expected Apply, got {:?}", other),
        }
    }

    #[test]
    fn test_payment_succeeded_before_created_is_validation_error() {
        let ev = event("payment.succeeded", now());
        let err = plan_transition(Uuid::new_v4(), None, &ev).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[test]
    fn test_payment_failed_moves_active_to_past_due() {
        let current = sub(SubscriptionStatus::Active, now() - Duration::days(1));
        let ev = event("payment.failed", now());
        match plan_transition(current.user_id, Some(&current), &ev).unwrap() {
            Transition::Apply(change) => {
                assert_eq!(change.new_status, SubscriptionStatus::PastDue);
                let txn = change.transaction.unwrap();
                assert_eq!(txn.status, TransactionStatus::Failed);
            }
            other => panic!("expected Apply, got {:?}", other),
        }
    }

    #[test]
    fn test_canceled_is_terminal_for_newer_payments() {
        let current = sub(SubscriptionStatus::Canceled, now() - Duration::days(1));
        let ev = event("payment.succeeded", now());
        assert!(matches!(
            plan_transition(current.user_id, Some(&current), &ev).unwrap(),
            Transition::Ignored(_)
        ));
    }

    #[test]
    fn test_cancel_drops_user_to_free() {
        let current = sub(SubscriptionStatus::Active, now() - Duration::days(1));
        let ev = event("subscription.canceled", now());
        match plan_transition(current.user_id, Some(&current), &ev).unwrap() {
            Transition::Apply(change) => {
                assert_eq!(change.new_status, SubscriptionStatus::Canceled);
                assert_eq!(change.new_plan, Some(PlanTier::Free));
            }
            other => panic!("expected Apply, got {:?}", other),
        }
    }

    #[test]
    fn test_new_lifecycle_after_cancellation() {
        let current = sub(SubscriptionStatus::Canceled, now() - Duration::days(1));
        let mut ev = event("subscription.created", now());
        ev.provider_subscription_id = "psub_2".into();
        match plan_transition(current.user_id, Some(&current), &ev).unwrap() {
            Transition::Apply(change) => {
                assert_eq!(change.new_status, SubscriptionStatus::Active);
                assert_eq!(change.provider_subscription_id, "psub_2");
            }
            other => panic!("expected Apply, got {:?}", other),
        }
    }

    #[test]
    fn test_created_for_same_canceled_lifecycle_ignored() {
        let current = sub(SubscriptionStatus::Canceled, now() - Duration::days(1));
        let ev = event("subscription.created", now());
        assert!(matches!(
            plan_transition(current.user_id, Some(&current), &ev).unwrap(),
            Transition::Ignored(_)
        ));
    }

    #[test]
    fn test_updated_overrides_status() {
        let current = sub(SubscriptionStatus::Active, now() - Duration::days(1));
        let mut ev = event("subscription.updated", now());
        ev.status_override = Some(SubscriptionStatus::Unpaid);
        match plan_transition(current.user_id, Some(&current), &ev).unwrap() {
            Transition::Apply(change) => assert_eq!(change.new_status, SubscriptionStatus::Unpaid),
            other => panic!("expected Apply, got {:?}", other),
        }
    }

    #[test]
    fn test_updated_without_status_is_validation_error() {
        let current = sub(SubscriptionStatus::Active, now() - Duration::days(1));
        let ev = event("subscription.updated", now());
        assert!(matches!(
            plan_transition(current.user_id, Some(&current), &ev),
            Err(BillingError::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        assert!(matches!(
            "invoice.finalized".parse::<EventKind>(),
            Err(BillingError::UnknownEventType(_))
        ));
    }

    #[test]
    fn test_payment_event_requires_amount() {
        let current = sub(SubscriptionStatus::Active, now() - Duration::days(1));
        let mut ev = event("payment.succeeded", now());
        ev.amount_cents = None;
        assert!(matches!(
            plan_transition(current.user_id, Some(&current), &ev),
            Err(BillingError::Validation(_))
        ));
    }
}
