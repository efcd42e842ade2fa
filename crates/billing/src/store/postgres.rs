//! Postgres store
//!
//! The two primitives the engine's correctness rests on map directly to
//! SQL: the quota conditional increment is a single
//! `INSERT ... ON CONFLICT ... DO UPDATE ... WHERE count < limit`, and
//! event de-duplication is an `INSERT ... ON CONFLICT DO NOTHING` against
//! the unique `event_id` key. Neither path ever reads then writes.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;
use veridea_shared::{PeriodKey, ResourceKind, ResourceLimit};

use crate::error::{BillingError, BillingResult};

use super::{
    ApplyOutcome, BillingStore, CounterUpdate, EventClaim, PaymentTransactionRecord,
    SubscriptionChange, SubscriptionRecord, UserRecord, WebhookEventRecord,
};

/// Postgres-backed [`BillingStore`].
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for UserRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            plan_id: row.try_get("plan_id")?,
            subscription_status: row.try_get("subscription_status")?,
            trial_ends_at: row.try_get("trial_ends_at")?,
            external_customer_id: row.try_get("external_customer_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for SubscriptionRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            provider_subscription_id: row.try_get("provider_subscription_id")?,
            status: row.try_get("status")?,
            current_period_start: row.try_get("current_period_start")?,
            current_period_end: row.try_get("current_period_end")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for WebhookEventRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            payload_timestamp: row.try_get("payload_timestamp")?,
            payload: row.try_get("payload")?,
            processed: row.try_get("processed")?,
            error_message: row.try_get("error_message")?,
            attempts: row.try_get("attempts")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            received_at: row.try_get("received_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for PaymentTransactionRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            provider_event_id: row.try_get("provider_event_id")?,
            amount_cents: row.try_get("amount_cents")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<UserRecord>> {
        let user: Option<UserRecord> = sqlx::query_as(
            r#"
            SELECT id, plan_id, subscription_status, trial_ends_at,
                   external_customer_id, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn create_user(&self, user: &UserRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, plan_id, subscription_status, trial_ends_at,
                               external_customer_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(user.id)
        .bind(&user.plan_id)
        .bind(user.subscription_status)
        .bind(user.trial_ends_at)
        .bind(&user.external_customer_id)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_user_by_customer(
        &self,
        external_customer_id: &str,
    ) -> BillingResult<Option<UserRecord>> {
        let user: Option<UserRecord> = sqlx::query_as(
            r#"
            SELECT id, plan_id, subscription_status, trial_ends_at,
                   external_customer_id, created_at
            FROM users
            WHERE external_customer_id = $1
            "#,
        )
        .bind(external_customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let sub: Option<SubscriptionRecord> = sqlx::query_as(
            r#"
            SELECT id, user_id, provider_subscription_id, status,
                   current_period_start, current_period_end, updated_at
            FROM subscriptions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sub)
    }

    async fn apply_subscription_change(
        &self,
        change: &SubscriptionChange,
    ) -> BillingResult<ApplyOutcome> {
        let mut tx = self.pool.begin().await?;

        // Upsert keyed on user_id with the stale guard folded into the
        // conflict condition: the write happens only when the payload
        // timestamp is strictly newer than the stored updated_at.
        let applied: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (id, user_id, provider_subscription_id, status,
                 current_period_start, current_period_end, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id) DO UPDATE SET
                provider_subscription_id = EXCLUDED.provider_subscription_id,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                updated_at = EXCLUDED.updated_at
            WHERE subscriptions.updated_at < EXCLUDED.updated_at
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(change.user_id)
        .bind(&change.provider_subscription_id)
        .bind(change.new_status)
        .bind(change.current_period_start)
        .bind(change.current_period_end)
        .bind(change.payload_timestamp)
        .fetch_optional(&mut *tx)
        .await?;

        if applied.is_none() {
            tx.rollback().await?;
            return Ok(ApplyOutcome::Stale);
        }

        // User status (and plan, when the event carried one) move in the
        // same transaction so a reader never sees one without the other.
        if let Some(plan) = change.new_plan {
            sqlx::query(
                "UPDATE users SET subscription_status = $1, plan_id = $2 WHERE id = $3",
            )
            .bind(change.new_status)
            .bind(plan.to_string())
            .bind(change.user_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query("UPDATE users SET subscription_status = $1 WHERE id = $2")
                .bind(change.new_status)
                .bind(change.user_id)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(txn) = &change.transaction {
            // provider_event_id is unique: a crashed-then-replayed event
            // that already appended its row becomes a no-op here.
            sqlx::query(
                r#"
                INSERT INTO payment_transactions
                    (id, user_id, provider_event_id, amount_cents, status, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (provider_event_id) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(change.user_id)
            .bind(&txn.provider_event_id)
            .bind(txn.amount_cents)
            .bind(txn.status)
            .bind(change.payload_timestamp)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn try_increment_usage(
        &self,
        user_id: Uuid,
        period: &PeriodKey,
        resource: ResourceKind,
        limit: ResourceLimit,
    ) -> BillingResult<CounterUpdate> {
        let count: Option<(i64,)> = match limit {
            ResourceLimit::Unlimited => {
                sqlx::query_as(
                    r#"
                    INSERT INTO usage_counters (user_id, period_key, resource_kind, count)
                    VALUES ($1, $2, $3, 1)
                    ON CONFLICT (user_id, period_key, resource_kind)
                    DO UPDATE SET count = usage_counters.count + 1
                    RETURNING count
                    "#,
                )
                .bind(user_id)
                .bind(period.as_str())
                .bind(resource)
                .fetch_optional(&self.pool)
                .await?
            }
            ResourceLimit::Limited(0) => {
                // Zero entitlement never touches the counter.
                return Ok(CounterUpdate::Denied);
            }
            ResourceLimit::Limited(max) => {
                // The conditional update is the whole concurrency story:
                // two callers racing at count = limit - 1 serialize on the
                // row, and exactly one sees the WHERE clause hold.
                sqlx::query_as(
                    r#"
                    INSERT INTO usage_counters (user_id, period_key, resource_kind, count)
                    VALUES ($1, $2, $3, 1)
                    ON CONFLICT (user_id, period_key, resource_kind)
                    DO UPDATE SET count = usage_counters.count + 1
                    WHERE usage_counters.count < $4
                    RETURNING count
                    "#,
                )
                .bind(user_id)
                .bind(period.as_str())
                .bind(resource)
                .bind(max as i64)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        Ok(match count {
            Some((count,)) => CounterUpdate::Admitted { count },
            None => CounterUpdate::Denied,
        })
    }

    async fn usage_for_period(
        &self,
        user_id: Uuid,
        period: &PeriodKey,
    ) -> BillingResult<Vec<(ResourceKind, i64)>> {
        let rows: Vec<(ResourceKind, i64)> = sqlx::query_as(
            r#"
            SELECT resource_kind, count
            FROM usage_counters
            WHERE user_id = $1 AND period_key = $2
            "#,
        )
        .bind(user_id)
        .bind(period.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn claim_event(&self, event: &WebhookEventRecord) -> BillingResult<EventClaim> {
        // Concurrent deliveries of the same event race on this insert;
        // the unique key lets exactly one through.
        let inserted: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (event_id, event_type, payload_timestamp, payload,
                 processed, attempts, received_at)
            VALUES ($1, $2, $3, $4, FALSE, 0, NOW())
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(event.payload_timestamp)
        .bind(&event.payload)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            return Ok(EventClaim::Claimed);
        }

        let processed: Option<(bool,)> =
            sqlx::query_as("SELECT processed FROM webhook_events WHERE event_id = $1")
                .bind(&event.event_id)
                .fetch_optional(&self.pool)
                .await?;

        match processed {
            Some((true,)) => Ok(EventClaim::AlreadyProcessed),
            Some((false,)) => Ok(EventClaim::RetryUnprocessed),
            None => Err(BillingError::Database(format!(
                "webhook event {} vanished between insert and inspect",
                event.event_id
            ))),
        }
    }

    async fn mark_event_processed(&self, event_id: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE webhook_events SET processed = TRUE, error_message = NULL WHERE event_id = $1",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_event_failed(&self, event_id: &str, error: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET error_message = $2, attempts = attempts + 1, last_attempt_at = NOW()
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        let event: Option<WebhookEventRecord> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, payload_timestamp, payload,
                   processed, error_message, attempts, last_attempt_at, received_at
            FROM webhook_events
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(event)
    }

    async fn unprocessed_events(
        &self,
        cooldown: Duration,
        max_attempts: i32,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let events: Vec<WebhookEventRecord> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, payload_timestamp, payload,
                   processed, error_message, attempts, last_attempt_at, received_at
            FROM webhook_events
            WHERE processed = FALSE
              AND error_message IS NOT NULL
              AND attempts < $1
              AND (last_attempt_at IS NULL OR last_attempt_at < NOW() - ($2 || ' seconds')::INTERVAL)
            ORDER BY received_at ASC
            LIMIT $3
            "#,
        )
        .bind(max_attempts)
        .bind(cooldown.whole_seconds().to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn delete_processed_events_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> BillingResult<u64> {
        let result =
            sqlx::query("DELETE FROM webhook_events WHERE processed = TRUE AND received_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    async fn transactions_page(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<PaymentTransactionRecord>> {
        let rows: Vec<PaymentTransactionRecord> = sqlx::query_as(
            r#"
            SELECT id, user_id, provider_event_id, amount_cents, status, created_at
            FROM payment_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veridea_shared::create_pool;

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_conditional_increment_against_postgres() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = create_pool(&url, 3).await.expect("pool");
        let store = PgBillingStore::new(pool);
        let user_id = Uuid::new_v4();
        let period = PeriodKey::current();

        let first = store
            .try_increment_usage(user_id, &period, ResourceKind::Ideas, ResourceLimit::Limited(1))
            .await
            .expect("increment");
        assert_eq!(first, CounterUpdate::Admitted { count: 1 });

        let second = store
            .try_increment_usage(user_id, &period, ResourceKind::Ideas, ResourceLimit::Limited(1))
            .await
            .expect("increment");
        assert_eq!(second, CounterUpdate::Denied);
    }
}
