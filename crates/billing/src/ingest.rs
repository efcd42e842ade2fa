//! Webhook Ingestor
//!
//! Orchestrates one delivery end to end: claim the event id in the
//! idempotency ledger, reconcile, record the outcome. Signature
//! verification happens at the HTTP edge before this module runs, so
//! everything arriving here is authenticated.
//!
//! Failure split:
//! - storage errors propagate, the caller answers the provider with a
//!   retryable status and nothing durable claims the event id;
//! - domain errors (validation, unknown event type) are recorded on the
//!   claimed event row and acknowledged, so the provider stops
//!   redelivering and the replay worker owns further attempts.

use std::sync::Arc;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::reconciler::{ReconcileOutcome, SubscriptionReconciler};
use crate::store::{BillingStore, EventClaim, WebhookEventRecord};

/// One authenticated delivery, parsed from the request body.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WebhookDelivery {
    pub event_id: String,
    pub event_type: String,
    /// Provider-side time of the underlying state change.
    #[serde(with = "time::serde::rfc3339")]
    pub payload_timestamp: OffsetDateTime,
    pub payload: serde_json::Value,
}

/// What the ingestor tells the HTTP layer (and the replay worker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Reconciled to completion (including stale/ignored no-ops).
    Processed,
    /// Event id seen before and already processed; nothing happened.
    Duplicate,
    /// Claimed but reconciliation hit a domain error; the failure is
    /// recorded and the event awaits replay.
    Deferred { error: String },
}

/// Entry point for provider deliveries.
#[derive(Clone)]
pub struct WebhookIngestor {
    store: Arc<dyn BillingStore>,
    reconciler: SubscriptionReconciler,
}

impl WebhookIngestor {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        let reconciler = SubscriptionReconciler::new(Arc::clone(&store));
        Self { store, reconciler }
    }

    pub async fn ingest(&self, delivery: &WebhookDelivery) -> BillingResult<IngestOutcome> {
        if delivery.event_id.is_empty() {
            return Err(BillingError::Validation("empty event_id".into()));
        }

        let record = WebhookEventRecord {
            event_id: delivery.event_id.clone(),
            event_type: delivery.event_type.clone(),
            payload_timestamp: delivery.payload_timestamp,
            payload: delivery.payload.clone(),
            processed: false,
            error_message: None,
            attempts: 0,
            last_attempt_at: None,
            received_at: OffsetDateTime::now_utc(),
        };

        match self.store.claim_event(&record).await? {
            EventClaim::AlreadyProcessed => {
                tracing::info!(event_id = %delivery.event_id, "Duplicate delivery ignored");
                return Ok(IngestOutcome::Duplicate);
            }
            EventClaim::RetryUnprocessed => {
                tracing::info!(
                    event_id = %delivery.event_id,
                    "Redelivery of unprocessed event, reprocessing"
                );
            }
            EventClaim::Claimed => {}
        }

        match self.reconciler.reconcile(delivery).await {
            Ok(outcome) => {
                self.store.mark_event_processed(&delivery.event_id).await?;
                if let ReconcileOutcome::Ignored { ref reason } = outcome {
                    tracing::debug!(
                        event_id = %delivery.event_id,
                        reason = %reason,
                        "Event processed as no-op"
                    );
                }
                Ok(IngestOutcome::Processed)
            }
            Err(err) if err.is_retryable() => Err(err),
            Err(err) => {
                let message = err.to_string();
                tracing::warn!(
                    event_id = %delivery.event_id,
                    error = %message,
                    "Reconciliation failed, event deferred for replay"
                );
                self.store
                    .mark_event_failed(&delivery.event_id, &message)
                    .await?;
                Ok(IngestOutcome::Deferred { error: message })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use time::Duration;
    use uuid::Uuid;
    use veridea_shared::{PeriodKey, ResourceKind, ResourceLimit, SubscriptionStatus};

    use crate::store::{
        ApplyOutcome, CounterUpdate, MemoryBillingStore, PaymentTransactionRecord,
        SubscriptionChange, SubscriptionRecord, UserRecord,
    };

    /// Store whose event claim fails like a lost database connection.
    /// Everything else passes through so the ledger can be inspected.
    #[derive(Default)]
    struct FlakyClaimStore {
        inner: MemoryBillingStore,
        fail_claims: AtomicBool,
    }

    #[async_trait]
    impl BillingStore for FlakyClaimStore {
        async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<UserRecord>> {
            self.inner.get_user(user_id).await
        }

        async fn create_user(&self, user: &UserRecord) -> BillingResult<()> {
            self.inner.create_user(user).await
        }

        async fn find_user_by_customer(
            &self,
            external_customer_id: &str,
        ) -> BillingResult<Option<UserRecord>> {
            self.inner.find_user_by_customer(external_customer_id).await
        }

        async fn get_subscription(
            &self,
            user_id: Uuid,
        ) -> BillingResult<Option<SubscriptionRecord>> {
            self.inner.get_subscription(user_id).await
        }

        async fn apply_subscription_change(
            &self,
            change: &SubscriptionChange,
        ) -> BillingResult<ApplyOutcome> {
            self.inner.apply_subscription_change(change).await
        }

        async fn try_increment_usage(
            &self,
            user_id: Uuid,
            period: &PeriodKey,
            resource: ResourceKind,
            limit: ResourceLimit,
        ) -> BillingResult<CounterUpdate> {
            self.inner
                .try_increment_usage(user_id, period, resource, limit)
                .await
        }

        async fn usage_for_period(
            &self,
            user_id: Uuid,
            period: &PeriodKey,
        ) -> BillingResult<Vec<(ResourceKind, i64)>> {
            self.inner.usage_for_period(user_id, period).await
        }

        async fn claim_event(&self, event: &WebhookEventRecord) -> BillingResult<EventClaim> {
            if self.fail_claims.load(Ordering::SeqCst) {
                return Err(BillingError::Database("connection reset".into()));
            }
            self.inner.claim_event(event).await
        }

        async fn mark_event_processed(&self, event_id: &str) -> BillingResult<()> {
            self.inner.mark_event_processed(event_id).await
        }

        async fn mark_event_failed(&self, event_id: &str, error: &str) -> BillingResult<()> {
            self.inner.mark_event_failed(event_id, error).await
        }

        async fn get_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
            self.inner.get_event(event_id).await
        }

        async fn unprocessed_events(
            &self,
            cooldown: Duration,
            max_attempts: i32,
            limit: i64,
        ) -> BillingResult<Vec<WebhookEventRecord>> {
            self.inner
                .unprocessed_events(cooldown, max_attempts, limit)
                .await
        }

        async fn delete_processed_events_before(
            &self,
            cutoff: OffsetDateTime,
        ) -> BillingResult<u64> {
            self.inner.delete_processed_events_before(cutoff).await
        }

        async fn transactions_page(
            &self,
            user_id: Uuid,
            limit: i64,
            offset: i64,
        ) -> BillingResult<Vec<PaymentTransactionRecord>> {
            self.inner.transactions_page(user_id, limit, offset).await
        }
    }

    fn created_delivery(user_id: Uuid) -> WebhookDelivery {
        WebhookDelivery {
            event_id: "evt_claim_1".to_string(),
            event_type: "subscription.created".to_string(),
            payload_timestamp: OffsetDateTime::now_utc(),
            payload: serde_json::json!({
                "user_id": user_id.to_string(),
                "subscription_id": "psub_1",
                "plan": "pro",
            }),
        }
    }

    #[tokio::test]
    async fn test_claim_storage_failure_propagates_without_side_effects() {
        let store = Arc::new(FlakyClaimStore::default());
        let user_id = Uuid::new_v4();
        store
            .create_user(&UserRecord {
                id: user_id,
                plan_id: "free".to_string(),
                subscription_status: SubscriptionStatus::Trialing,
                trial_ends_at: None,
                external_customer_id: None,
                created_at: OffsetDateTime::now_utc(),
            })
            .await
            .unwrap();
        store.fail_claims.store(true, Ordering::SeqCst);

        let ingestor = WebhookIngestor::new(store.clone() as Arc<dyn BillingStore>);
        let delivery = created_delivery(user_id);

        // The provider must see a retryable failure, and the event id
        // must not have been claimed.
        let err = ingestor.ingest(&delivery).await.unwrap_err();
        assert!(err.is_retryable());
        store.fail_claims.store(false, Ordering::SeqCst);
        assert!(store.get_event("evt_claim_1").await.unwrap().is_none());
        assert!(store.get_subscription(user_id).await.unwrap().is_none());

        // Redelivery after the outage processes normally.
        let outcome = ingestor.ingest(&delivery).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Processed);
        let event = store.get_event("evt_claim_1").await.unwrap().unwrap();
        assert!(event.processed);
    }

    #[tokio::test]
    async fn test_empty_event_id_rejected_before_claim() {
        let store = Arc::new(MemoryBillingStore::new());
        let ingestor = WebhookIngestor::new(store.clone() as Arc<dyn BillingStore>);

        let mut delivery = created_delivery(Uuid::new_v4());
        delivery.event_id = String::new();

        let err = ingestor.ingest(&delivery).await.unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }
}
