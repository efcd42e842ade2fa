//! Route table.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod billing;
pub mod health;
pub mod quota;
pub mod users;
pub mod webhooks;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/webhooks/billing", post(webhooks::receive))
        .route("/users/:user_id/quota/:resource", post(quota::enforce))
        .route("/users/:user_id/usage", get(users::usage))
        .route("/users/:user_id/trial", get(users::trial))
        .route("/users/:user_id/billing/history", get(billing::history))
        .route(
            "/users/:user_id/billing/history/export",
            get(billing::export),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
