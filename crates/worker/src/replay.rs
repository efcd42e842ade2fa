//! Replay of deferred webhook events.
//!
//! Events that failed reconciliation stay in the ledger with
//! `processed = false` and an error message. This worker re-runs them
//! through the same ingest path on a timer; the claim step sees the
//! existing unprocessed row and reprocesses, so replay needs no logic
//! of its own beyond selection.

use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use veridea_billing::store::BillingStore;
use veridea_billing::{BillingResult, IngestOutcome, WebhookDelivery, WebhookIngestor};

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Minimum quiet time since the last failed attempt.
    pub cooldown: Duration,
    /// Events at or past this attempt count are left for manual
    /// inspection.
    pub max_attempts: i32,
    /// Events fetched per pass.
    pub batch_size: i64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::minutes(5),
            max_attempts: 5,
            batch_size: 50,
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub fetched: usize,
    pub processed: usize,
    pub deferred: usize,
    pub errored: usize,
}

pub struct ReplayWorker {
    store: Arc<dyn BillingStore>,
    ingestor: WebhookIngestor,
    config: ReplayConfig,
}

impl ReplayWorker {
    pub fn new(store: Arc<dyn BillingStore>, config: ReplayConfig) -> Self {
        let ingestor = WebhookIngestor::new(Arc::clone(&store));
        Self {
            store,
            ingestor,
            config,
        }
    }

    /// One replay pass. A failing event is recorded and skipped; the
    /// pass keeps going.
    pub async fn run_once(&self) -> BillingResult<ReplayStats> {
        let events = self
            .store
            .unprocessed_events(
                self.config.cooldown,
                self.config.max_attempts,
                self.config.batch_size,
            )
            .await?;

        let mut stats = ReplayStats {
            fetched: events.len(),
            ..ReplayStats::default()
        };

        for event in events {
            let delivery = WebhookDelivery {
                event_id: event.event_id.clone(),
                event_type: event.event_type.clone(),
                payload_timestamp: event.payload_timestamp,
                payload: event.payload.clone(),
            };

            match self.ingestor.ingest(&delivery).await {
                Ok(IngestOutcome::Processed) => {
                    tracing::info!(
                        event_id = %event.event_id,
                        attempts = event.attempts,
                        "Replayed event processed"
                    );
                    stats.processed += 1;
                }
                Ok(IngestOutcome::Duplicate) => stats.processed += 1,
                Ok(IngestOutcome::Deferred { error }) => {
                    tracing::warn!(
                        event_id = %event.event_id,
                        attempts = event.attempts + 1,
                        error = %error,
                        "Replay deferred again"
                    );
                    stats.deferred += 1;
                }
                Err(err) => {
                    tracing::error!(
                        event_id = %event.event_id,
                        error = %err,
                        "Replay attempt errored"
                    );
                    stats.errored += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Drop processed events older than `retention`. Returns rows
    /// deleted.
    pub async fn cleanup(&self, retention: Duration) -> BillingResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - retention;
        let deleted = self.store.delete_processed_events_before(cutoff).await?;
        if deleted > 0 {
            tracing::info!(deleted, "Cleaned up processed webhook events");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use uuid::Uuid;
    use veridea_billing::store::{MemoryBillingStore, UserRecord};
    use veridea_shared::SubscriptionStatus;

    fn config_no_cooldown() -> ReplayConfig {
        ReplayConfig {
            cooldown: Duration::ZERO,
            ..ReplayConfig::default()
        }
    }

    async fn seed_user(store: &Arc<MemoryBillingStore>) -> Uuid {
        let id = Uuid::new_v4();
        store
            .create_user(&UserRecord {
                id,
                plan_id: "free".to_string(),
                subscription_status: SubscriptionStatus::Trialing,
                trial_ends_at: None,
                external_customer_id: None,
                created_at: OffsetDateTime::now_utc(),
            })
            .await
            .unwrap();
        id
    }

    fn payment_delivery(user_id: Uuid, at: OffsetDateTime) -> WebhookDelivery {
        WebhookDelivery {
            event_id: "evt_replay_1".to_string(),
            event_type: "payment.succeeded".to_string(),
            payload_timestamp: at,
            payload: serde_json::json!({
                "user_id": user_id.to_string(),
                "subscription_id": "psub_1",
                "amount_cents": 2900,
            }),
        }
    }

    #[tokio::test]
    async fn test_replay_succeeds_once_missing_state_arrives() {
        let store = Arc::new(MemoryBillingStore::new());
        let user_id = seed_user(&store).await;
        let ingestor = WebhookIngestor::new(store.clone() as Arc<dyn BillingStore>);

        let t0 = OffsetDateTime::now_utc() - Duration::hours(1);

        // Payment ahead of its subscription.created: deferred.
        let payment = payment_delivery(user_id, t0 + Duration::minutes(5));
        assert!(matches!(
            ingestor.ingest(&payment).await.unwrap(),
            IngestOutcome::Deferred { .. }
        ));

        let worker = ReplayWorker::new(store.clone(), config_no_cooldown());

        // Still nothing to apply it to; the pass defers it again.
        let stats = worker.run_once().await.unwrap();
        assert_eq!(stats.fetched, 1);
        assert_eq!(stats.deferred, 1);

        // The missing subscription arrives out of band.
        ingestor
            .ingest(&WebhookDelivery {
                event_id: "evt_created".to_string(),
                event_type: "subscription.created".to_string(),
                payload_timestamp: t0,
                payload: serde_json::json!({
                    "user_id": user_id.to_string(),
                    "subscription_id": "psub_1",
                    "plan": "pro",
                }),
            })
            .await
            .unwrap();

        let stats = worker.run_once().await.unwrap();
        assert_eq!(stats.fetched, 1);
        assert_eq!(stats.processed, 1);
        assert_eq!(store.transaction_count().await, 1);

        // Nothing left to replay.
        let stats = worker.run_once().await.unwrap();
        assert_eq!(stats.fetched, 0);
    }

    #[tokio::test]
    async fn test_exhausted_events_are_not_fetched() {
        let store = Arc::new(MemoryBillingStore::new());
        let user_id = seed_user(&store).await;
        let ingestor = WebhookIngestor::new(store.clone() as Arc<dyn BillingStore>);

        let payment = payment_delivery(user_id, OffsetDateTime::now_utc());
        ingestor.ingest(&payment).await.unwrap();

        let worker = ReplayWorker::new(
            store.clone(),
            ReplayConfig {
                cooldown: Duration::ZERO,
                max_attempts: 2,
                ..ReplayConfig::default()
            },
        );

        // First replay bumps attempts to 2, the cap.
        let stats = worker.run_once().await.unwrap();
        assert_eq!(stats.deferred, 1);

        let stats = worker.run_once().await.unwrap();
        assert_eq!(stats.fetched, 0, "capped event stays parked");

        let event = store.get_event("evt_replay_1").await.unwrap().unwrap();
        assert!(!event.processed);
        assert_eq!(event.attempts, 2);
    }
}
