//! Shared application state.

use sqlx::PgPool;
use std::sync::Arc;
use veridea_billing::{
    BillingHistory, BillingStore, PgBillingStore, QuotaEnforcer, SignatureVerifier,
    WebhookIngestor,
};

use crate::config::ApiConfig;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub store: Arc<dyn BillingStore>,
    pub quota: QuotaEnforcer,
    pub ingestor: WebhookIngestor,
    pub history: BillingHistory,
    pub verifier: SignatureVerifier,
}

impl AppState {
    pub fn new(pool: PgPool, config: &ApiConfig) -> Self {
        let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool.clone()));
        Self {
            pool,
            quota: QuotaEnforcer::new(Arc::clone(&store)),
            ingestor: WebhookIngestor::new(Arc::clone(&store)),
            history: BillingHistory::new(Arc::clone(&store)),
            verifier: SignatureVerifier::new(config.webhook_secret.clone()),
            store,
        }
    }
}
