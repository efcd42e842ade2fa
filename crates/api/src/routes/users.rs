//! Per-user read endpoints: usage snapshot and trial status.

use axum::extract::{Path, State};
use axum::Json;
use time::OffsetDateTime;
use uuid::Uuid;
use veridea_billing::{trial_status_for_user, BillingError, TrialStatus, UsageSnapshot};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn usage(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<UsageSnapshot>, ApiError> {
    let snapshot = state.quota.current_usage(user_id).await?;
    Ok(Json(snapshot))
}

pub async fn trial(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<TrialStatus>, ApiError> {
    let user = state
        .store
        .get_user(user_id)
        .await?
        .ok_or(BillingError::UserNotFound(user_id))?;

    Ok(Json(trial_status_for_user(&user, OffsetDateTime::now_utc())))
}
