//! Quota enforcement endpoint.
//!
//! A denial is a successful decision, not an HTTP failure: clients read
//! `allowed` from the 200 body.

use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;
use veridea_billing::QuotaDecision;
use veridea_shared::ResourceKind;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn enforce(
    State(state): State<AppState>,
    Path((user_id, resource)): Path<(Uuid, String)>,
) -> Result<Json<QuotaDecision>, ApiError> {
    let resource: ResourceKind = resource
        .parse()
        .map_err(|e: String| ApiError::bad_request("unknown_resource", e))?;

    let decision = state.quota.enforce(user_id, resource).await?;
    Ok(Json(decision))
}
