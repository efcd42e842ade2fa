//! Storage layer for the billing engine
//!
//! The whole concurrency contract of the engine lives behind this trait:
//! a conditional counter increment that is atomic with respect to all
//! concurrent callers, and a claim-insert that is atomic under a unique
//! constraint on the event id. Everything above this layer is free of
//! read-then-write patterns.
//!
//! Two implementations: [`postgres::PgBillingStore`] for production and
//! [`memory::MemoryBillingStore`] for tests and development without
//! Postgres.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::str::FromStr;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;
use veridea_shared::{PeriodKey, PlanTier, ResourceKind, ResourceLimit, SubscriptionStatus};

use crate::error::BillingResult;

pub use memory::MemoryBillingStore;
pub use postgres::PgBillingStore;

// =============================================================================
// Records
// =============================================================================

/// A user row as the engine sees it. `plan_id` is kept as stored and
/// resolved against the catalog at the moment of use, never cached.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    pub plan_id: String,
    pub subscription_status: SubscriptionStatus,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub external_customer_id: Option<String>,
    pub created_at: OffsetDateTime,
}

/// The single active subscription for a user, upsert-keyed on `user_id`.
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_subscription_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    /// Provider-side timestamp of the last applied change. The stale-event
    /// guard compares incoming payload timestamps against this.
    pub updated_at: OffsetDateTime,
}

/// Idempotency ledger row for one provider delivery.
#[derive(Debug, Clone)]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub payload_timestamp: OffsetDateTime,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub error_message: Option<String>,
    pub attempts: i32,
    /// Set on each failed reconciliation attempt; drives the replay
    /// cooldown.
    pub last_attempt_at: Option<OffsetDateTime>,
    pub received_at: OffsetDateTime,
}

/// Outcome status of a payment transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Succeeded,
    Failed,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown transaction status: {}", other)),
        }
    }
}

/// Append-only payment record produced by the reconciler.
#[derive(Debug, Clone)]
pub struct PaymentTransactionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_event_id: String,
    pub amount_cents: i64,
    pub status: TransactionStatus,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Operation results
// =============================================================================

/// Result of the atomic conditional increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterUpdate {
    /// The increment happened; `count` is the post-increment value.
    Admitted { count: i64 },
    /// The pre-increment value had already reached the limit; nothing
    /// was written.
    Denied,
}

/// Result of the atomic claim-insert on the idempotency ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClaim {
    /// First time this event id has been seen; row inserted unprocessed.
    Claimed,
    /// Row exists with `processed = true`: the delivery is a duplicate.
    AlreadyProcessed,
    /// Row exists with `processed = false`: an earlier attempt crashed or
    /// failed mid-processing. Reprocessing is safe because reconciliation
    /// is idempotent under the stale-event guard.
    RetryUnprocessed,
}

/// A payment row to append alongside a subscription change.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub provider_event_id: String,
    pub amount_cents: i64,
    pub status: TransactionStatus,
}

/// Everything the reconciler decided for one event, applied as a single
/// atomic write: subscription upsert, user plan/status update, and the
/// optional payment transaction, all guarded by the stale-event rule.
#[derive(Debug, Clone)]
pub struct SubscriptionChange {
    pub user_id: Uuid,
    pub provider_subscription_id: String,
    pub new_status: SubscriptionStatus,
    /// Plan accompanying the change, when the event carries one.
    pub new_plan: Option<PlanTier>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    /// Provider-side timestamp of the change. Becomes the subscription's
    /// `updated_at`; the write only happens if it is strictly newer than
    /// the stored one.
    pub payload_timestamp: OffsetDateTime,
    pub transaction: Option<NewTransaction>,
}

/// Whether an atomic subscription write took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The stored `updated_at` was at or past the payload timestamp;
    /// nothing was written.
    Stale,
}

// =============================================================================
// Trait
// =============================================================================

/// Durable state the engine runs on.
#[async_trait]
pub trait BillingStore: Send + Sync {
    // --- users ----------------------------------------------------------

    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<UserRecord>>;

    async fn create_user(&self, user: &UserRecord) -> BillingResult<()>;

    async fn find_user_by_customer(
        &self,
        external_customer_id: &str,
    ) -> BillingResult<Option<UserRecord>>;

    // --- subscriptions --------------------------------------------------

    async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>>;

    /// Apply a reconciled change atomically, honoring the stale guard.
    async fn apply_subscription_change(
        &self,
        change: &SubscriptionChange,
    ) -> BillingResult<ApplyOutcome>;

    // --- usage counters -------------------------------------------------

    /// Increment the counter for `(user, period, resource)` only if the
    /// pre-increment value is strictly below `limit`. Must be atomic with
    /// respect to every concurrent caller for the same key. Callers
    /// resolve `limit` from the catalog immediately before this call.
    ///
    /// `Unlimited` increments unconditionally.
    async fn try_increment_usage(
        &self,
        user_id: Uuid,
        period: &PeriodKey,
        resource: ResourceKind,
        limit: ResourceLimit,
    ) -> BillingResult<CounterUpdate>;

    /// Read-only counter snapshot for one period. Missing counters are
    /// simply absent (they read as zero).
    async fn usage_for_period(
        &self,
        user_id: Uuid,
        period: &PeriodKey,
    ) -> BillingResult<Vec<(ResourceKind, i64)>>;

    // --- webhook events -------------------------------------------------

    /// Insert-or-inspect keyed on `event_id`. Concurrent deliveries of
    /// the same event race on this; exactly one observes `Claimed`.
    async fn claim_event(&self, event: &WebhookEventRecord) -> BillingResult<EventClaim>;

    async fn mark_event_processed(&self, event_id: &str) -> BillingResult<()>;

    /// Record a reconciliation failure; leaves `processed = false` and
    /// bumps the attempt counter so the replay worker can bound retries.
    async fn mark_event_failed(&self, event_id: &str, error: &str) -> BillingResult<()>;

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>>;

    /// Events awaiting replay: unprocessed, below the attempt cap, and not
    /// touched within the cooldown window.
    async fn unprocessed_events(
        &self,
        cooldown: Duration,
        max_attempts: i32,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;

    /// Retention cleanup for processed events. Returns rows deleted.
    async fn delete_processed_events_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> BillingResult<u64>;

    // --- payment transactions -------------------------------------------

    async fn transactions_page(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<PaymentTransactionRecord>>;
}
