//! Billing error types
//!
//! Quota denials and stale events are NOT errors: they are normal outcomes
//! carried on `QuotaDecision` and `ReconcileOutcome`. The variants here are
//! the genuinely exceptional paths.

use thiserror::Error;
use uuid::Uuid;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    /// Malformed or unrecognized event payload. Recorded on the webhook
    /// event row; the event stays unprocessed so a later replay can retry.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("user not found: {0}")]
    UserNotFound(Uuid),

    #[error("webhook event type not supported: {0}")]
    UnknownEventType(String),

    #[error("webhook signature verification failed")]
    SignatureInvalid,

    /// Storage failure. Retryable; callers must not assume the operation
    /// took effect. Propagated unmodified from the uniqueness-insert and
    /// the quota conditional-update so the caller (or the provider, for
    /// webhook deliveries) retries.
    #[error("database error: {0}")]
    Database(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl BillingError {
    /// Whether a retry with backoff may succeed. Validation failures and
    /// unknown users are definitive until new state arrives; only storage
    /// failures are transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_storage_errors_are_retryable() {
        assert!(BillingError::Database("connection reset".into()).is_retryable());
        assert!(!BillingError::Validation("bad payload".into()).is_retryable());
        assert!(!BillingError::SignatureInvalid.is_retryable());
        assert!(!BillingError::UserNotFound(Uuid::new_v4()).is_retryable());
    }
}
