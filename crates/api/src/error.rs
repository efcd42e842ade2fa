//! HTTP error mapping
//!
//! Everything renders as `{"error": {"code", "message"}}`. Storage
//! failures are 500 in general; the webhook route upgrades them to 503
//! so the provider redelivers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use veridea_billing::BillingError;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    /// Signals the webhook provider to retry delivery later.
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "storage_unavailable",
            message,
        )
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::UserNotFound(id) => Self::new(
                StatusCode::NOT_FOUND,
                "user_not_found",
                format!("user not found: {}", id),
            ),
            BillingError::SignatureInvalid => {
                Self::bad_request("invalid_signature", err.to_string())
            }
            BillingError::Validation(_)
            | BillingError::UnknownEventType(_)
            | BillingError::InvalidInput(_) => Self::bad_request("invalid_request", err.to_string()),
            BillingError::Database(ref detail) => {
                tracing::error!(error = %detail, "Storage failure");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal error",
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        }));
        (self.status, body).into_response()
    }
}
