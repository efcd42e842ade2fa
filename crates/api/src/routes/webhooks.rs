//! Billing provider webhook endpoint.
//!
//! Signature check happens on the raw body before anything touches
//! storage. Once the event id is durably claimed the provider gets a
//! 200 whatever reconciliation decided; only a storage failure answers
//! 503, which makes the provider redeliver.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use veridea_billing::{IngestOutcome, WebhookDelivery};

use crate::error::ApiError;
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "x-webhook-signature";

pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::bad_request("missing_signature", "X-Webhook-Signature header required")
        })?;

    state.verifier.verify(&body, signature)?;

    let delivery: WebhookDelivery = serde_json::from_str(&body)
        .map_err(|e| ApiError::bad_request("invalid_payload", format!("malformed body: {}", e)))?;

    match state.ingestor.ingest(&delivery).await {
        Ok(outcome) => {
            let status = match outcome {
                IngestOutcome::Processed => "processed",
                IngestOutcome::Duplicate => "duplicate",
                IngestOutcome::Deferred { .. } => "deferred",
            };
            Ok(Json(json!({ "received": true, "status": status })))
        }
        // Nothing durable happened; ask the provider to try again.
        Err(err) if err.is_retryable() => Err(ApiError::service_unavailable(err.to_string())),
        Err(err) => Err(err.into()),
    }
}
