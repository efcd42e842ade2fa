//! HTTP surface over the billing engine.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
