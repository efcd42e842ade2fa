//! Billing engine: plan catalog, quota enforcement, trial tracking,
//! webhook ingestion with idempotent replay, subscription reconciliation,
//! and payment history.
//!
//! Storage sits behind [`store::BillingStore`]; the services here never
//! do read-then-write on shared counters or event rows, the store's
//! atomic primitives carry the whole concurrency contract.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod catalog;
pub mod error;
pub mod history;
pub mod ingest;
pub mod quota;
pub mod reconciler;
pub mod signature;
pub mod store;
pub mod trial;

pub use catalog::{PlanCatalog, PlanFeatures};
pub use error::{BillingError, BillingResult};
pub use history::{BillingHistory, HistoryPage, PAGE_SIZE};
pub use ingest::{IngestOutcome, WebhookDelivery, WebhookIngestor};
pub use quota::{QuotaDecision, QuotaEnforcer, Remaining, UsageSnapshot};
pub use reconciler::{ReconcileOutcome, SubscriptionReconciler};
pub use signature::SignatureVerifier;
pub use store::{BillingStore, MemoryBillingStore, PgBillingStore};
pub use trial::{trial_status, trial_status_for_user, TrialStatus};
