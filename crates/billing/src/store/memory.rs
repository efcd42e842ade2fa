//! In-memory store (for tests and development without Postgres)
//!
//! A single mutex over all tables makes every trait operation a critical
//! section, which satisfies the same atomicity contract the Postgres
//! implementation gets from conditional updates and unique constraints.

use async_trait::async_trait;
use std::collections::HashMap;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;
use veridea_shared::{PeriodKey, ResourceKind, ResourceLimit};

use crate::error::{BillingError, BillingResult};

use super::{
    ApplyOutcome, BillingStore, CounterUpdate, EventClaim, PaymentTransactionRecord,
    SubscriptionChange, SubscriptionRecord, UserRecord, WebhookEventRecord,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, UserRecord>,
    /// Keyed by user_id: one active subscription per user.
    subscriptions: HashMap<Uuid, SubscriptionRecord>,
    counters: HashMap<(Uuid, String, ResourceKind), i64>,
    events: HashMap<String, WebhookEventRecord>,
    transactions: Vec<PaymentTransactionRecord>,
}

/// In-memory [`BillingStore`] implementation.
#[derive(Default)]
pub struct MemoryBillingStore {
    tables: Mutex<Tables>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of payment transactions, across all users. Test hook.
    pub async fn transaction_count(&self) -> usize {
        self.tables.lock().await.transactions.len()
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<UserRecord>> {
        Ok(self.tables.lock().await.users.get(&user_id).cloned())
    }

    async fn create_user(&self, user: &UserRecord) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.users.contains_key(&user.id) {
            return Err(BillingError::InvalidInput(format!(
                "user {} already exists",
                user.id
            )));
        }
        tables.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn find_user_by_customer(
        &self,
        external_customer_id: &str,
    ) -> BillingResult<Option<UserRecord>> {
        Ok(self
            .tables
            .lock()
            .await
            .users
            .values()
            .find(|u| u.external_customer_id.as_deref() == Some(external_customer_id))
            .cloned())
    }

    async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.tables.lock().await.subscriptions.get(&user_id).cloned())
    }

    async fn apply_subscription_change(
        &self,
        change: &SubscriptionChange,
    ) -> BillingResult<ApplyOutcome> {
        let mut tables = self.tables.lock().await;

        if let Some(existing) = tables.subscriptions.get(&change.user_id) {
            // Strictly-newer rule: redelivery of an already-applied event
            // carries an equal timestamp and lands here.
            if change.payload_timestamp <= existing.updated_at {
                return Ok(ApplyOutcome::Stale);
            }
        }

        let id = tables
            .subscriptions
            .get(&change.user_id)
            .map(|s| s.id)
            .unwrap_or_else(Uuid::new_v4);

        tables.subscriptions.insert(
            change.user_id,
            SubscriptionRecord {
                id,
                user_id: change.user_id,
                provider_subscription_id: change.provider_subscription_id.clone(),
                status: change.new_status,
                current_period_start: change.current_period_start,
                current_period_end: change.current_period_end,
                updated_at: change.payload_timestamp,
            },
        );

        let user = tables
            .users
            .get_mut(&change.user_id)
            .ok_or(BillingError::UserNotFound(change.user_id))?;
        user.subscription_status = change.new_status;
        if let Some(plan) = change.new_plan {
            user.plan_id = plan.to_string();
        }

        if let Some(txn) = &change.transaction {
            // Unique on provider_event_id, same as the Postgres schema.
            let duplicate = tables
                .transactions
                .iter()
                .any(|t| t.provider_event_id == txn.provider_event_id);
            if !duplicate {
                tables.transactions.push(PaymentTransactionRecord {
                    id: Uuid::new_v4(),
                    user_id: change.user_id,
                    provider_event_id: txn.provider_event_id.clone(),
                    amount_cents: txn.amount_cents,
                    status: txn.status,
                    // Provider-side time of the payment, not receipt time;
                    // keeps history ordering stable under redelivery.
                    created_at: change.payload_timestamp,
                });
            }
        }

        Ok(ApplyOutcome::Applied)
    }

    async fn try_increment_usage(
        &self,
        user_id: Uuid,
        period: &PeriodKey,
        resource: ResourceKind,
        limit: ResourceLimit,
    ) -> BillingResult<CounterUpdate> {
        let mut tables = self.tables.lock().await;
        let key = (user_id, period.as_str().to_string(), resource);
        let count = tables.counters.entry(key).or_insert(0);

        match limit {
            ResourceLimit::Unlimited => {
                *count += 1;
                Ok(CounterUpdate::Admitted { count: *count })
            }
            ResourceLimit::Limited(max) => {
                if *count < max as i64 {
                    *count += 1;
                    Ok(CounterUpdate::Admitted { count: *count })
                } else {
                    Ok(CounterUpdate::Denied)
                }
            }
        }
    }

    async fn usage_for_period(
        &self,
        user_id: Uuid,
        period: &PeriodKey,
    ) -> BillingResult<Vec<(ResourceKind, i64)>> {
        Ok(self
            .tables
            .lock()
            .await
            .counters
            .iter()
            .filter(|((uid, pk, _), _)| *uid == user_id && pk == period.as_str())
            .map(|((_, _, resource), count)| (*resource, *count))
            .collect())
    }

    async fn claim_event(&self, event: &WebhookEventRecord) -> BillingResult<EventClaim> {
        let mut tables = self.tables.lock().await;
        match tables.events.get(&event.event_id) {
            Some(existing) if existing.processed => Ok(EventClaim::AlreadyProcessed),
            Some(_) => Ok(EventClaim::RetryUnprocessed),
            None => {
                let mut record = event.clone();
                record.processed = false;
                record.error_message = None;
                record.attempts = 0;
                record.last_attempt_at = None;
                tables.events.insert(event.event_id.clone(), record);
                Ok(EventClaim::Claimed)
            }
        }
    }

    async fn mark_event_processed(&self, event_id: &str) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;
        let event = tables
            .events
            .get_mut(event_id)
            .ok_or_else(|| BillingError::InvalidInput(format!("unknown event: {}", event_id)))?;
        event.processed = true;
        event.error_message = None;
        Ok(())
    }

    async fn mark_event_failed(&self, event_id: &str, error: &str) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;
        let event = tables
            .events
            .get_mut(event_id)
            .ok_or_else(|| BillingError::InvalidInput(format!("unknown event: {}", event_id)))?;
        event.error_message = Some(error.to_string());
        event.attempts += 1;
        event.last_attempt_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        Ok(self.tables.lock().await.events.get(event_id).cloned())
    }

    async fn unprocessed_events(
        &self,
        cooldown: Duration,
        max_attempts: i32,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let now = OffsetDateTime::now_utc();
        let tables = self.tables.lock().await;
        let mut pending: Vec<WebhookEventRecord> = tables
            .events
            .values()
            .filter(|e| {
                !e.processed
                    && e.error_message.is_some()
                    && e.attempts < max_attempts
                    && e.last_attempt_at
                        .map(|at| now - at >= cooldown)
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.received_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn delete_processed_events_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> BillingResult<u64> {
        let mut tables = self.tables.lock().await;
        let before = tables.events.len();
        tables
            .events
            .retain(|_, e| !(e.processed && e.received_at < cutoff));
        Ok((before - tables.events.len()) as u64)
    }

    async fn transactions_page(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<PaymentTransactionRecord>> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<PaymentTransactionRecord> = tables
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}
