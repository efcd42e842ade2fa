//! API configuration, loaded from the environment.

use std::env;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub database_max_connections: u32,
    /// Shared secret for webhook signature verification. Refused at
    /// startup when shorter than 32 bytes.
    pub webhook_secret: String,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_address = env::var("BIND_ADDRESS")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                name: "BIND_ADDRESS",
                reason: e.to_string(),
            })?;

        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let database_max_connections = match env::var("DATABASE_MAX_CONNECTIONS") {
            Ok(raw) => raw.parse::<u32>().map_err(|e| ConfigError::Invalid {
                name: "DATABASE_MAX_CONNECTIONS",
                reason: e.to_string(),
            })?,
            Err(_) => 10,
        };

        let webhook_secret =
            env::var("WEBHOOK_SECRET").map_err(|_| ConfigError::Missing("WEBHOOK_SECRET"))?;
        if webhook_secret.len() < 32 {
            return Err(ConfigError::Invalid {
                name: "WEBHOOK_SECRET",
                reason: "must be at least 32 bytes".to_string(),
            });
        }

        Ok(Self {
            bind_address,
            database_url,
            database_max_connections,
            webhook_secret,
        })
    }
}
