//! Billing History Reader
//!
//! Read-only pages over the payment transaction ledger, plus a CSV
//! export of the full history.

use serde::Serialize;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::{BillingStore, PaymentTransactionRecord, TransactionStatus};

/// Transactions per page.
pub const PAGE_SIZE: i64 = 25;

/// Export is chunked through the same pagination path.
const EXPORT_CHUNK: i64 = 500;

/// One ledger entry as rendered to clients.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub provider_event_id: String,
    pub amount_cents: i64,
    pub status: TransactionStatus,
    pub created_at: String,
}

/// One page of history, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub page: u32,
    pub page_size: i64,
    pub entries: Vec<HistoryEntry>,
    /// True when a further page exists.
    pub has_more: bool,
}

#[derive(Clone)]
pub struct BillingHistory {
    store: Arc<dyn BillingStore>,
}

impl BillingHistory {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Fetch page `page` (1-based) of a user's payment history.
    pub async fn page(&self, user_id: Uuid, page: u32) -> BillingResult<HistoryPage> {
        if page == 0 {
            return Err(BillingError::InvalidInput(
                "page numbers start at 1".into(),
            ));
        }
        self.require_user(user_id).await?;

        let offset = i64::from(page - 1) * PAGE_SIZE;
        // Over-fetch by one row to learn whether another page exists.
        let mut rows = self
            .store
            .transactions_page(user_id, PAGE_SIZE + 1, offset)
            .await?;
        let has_more = rows.len() as i64 > PAGE_SIZE;
        rows.truncate(PAGE_SIZE as usize);

        let entries = rows
            .into_iter()
            .map(render_entry)
            .collect::<BillingResult<Vec<_>>>()?;

        Ok(HistoryPage {
            page,
            page_size: PAGE_SIZE,
            entries,
            has_more,
        })
    }

    /// Render the full history as CSV, newest first.
    pub async fn export_csv(&self, user_id: Uuid) -> BillingResult<String> {
        self.require_user(user_id).await?;

        let mut csv = String::from("created_at,provider_event_id,status,amount_cents\n");
        let mut offset = 0i64;
        loop {
            let rows = self
                .store
                .transactions_page(user_id, EXPORT_CHUNK, offset)
                .await?;
            let done = (rows.len() as i64) < EXPORT_CHUNK;
            for row in rows {
                let created_at = format_timestamp(&row)?;
                csv.push_str(&format!(
                    "{},{},{},{}\n",
                    escape_csv_field(&created_at),
                    escape_csv_field(&row.provider_event_id),
                    row.status,
                    row.amount_cents
                ));
            }
            if done {
                break;
            }
            offset += EXPORT_CHUNK;
        }
        Ok(csv)
    }

    async fn require_user(&self, user_id: Uuid) -> BillingResult<()> {
        self.store
            .get_user(user_id)
            .await?
            .map(|_| ())
            .ok_or(BillingError::UserNotFound(user_id))
    }
}

fn render_entry(row: PaymentTransactionRecord) -> BillingResult<HistoryEntry> {
    let created_at = format_timestamp(&row)?;
    Ok(HistoryEntry {
        id: row.id,
        provider_event_id: row.provider_event_id,
        amount_cents: row.amount_cents,
        status: row.status,
        created_at,
    })
}

fn format_timestamp(row: &PaymentTransactionRecord) -> BillingResult<String> {
    row.created_at
        .format(&Rfc3339)
        .map_err(|e| BillingError::Database(format!("timestamp formatting: {}", e)))
}

/// Quote a CSV field when it contains a delimiter, quote, or newline.
fn escape_csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_plain_field_unchanged() {
        assert_eq!(escape_csv_field("evt_123"), "evt_123");
    }

    #[test]
    fn test_escape_field_with_comma() {
        assert_eq!(escape_csv_field("a,b"), "\"a,b\"");
    }

    #[test]
    fn test_escape_field_with_quotes() {
        assert_eq!(escape_csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
