use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use veridea_api::config::ApiConfig;
use veridea_api::routes;
use veridea_api::state::AppState;
use veridea_shared::db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ApiConfig::from_env().context("loading configuration")?;

    let migration_pool = db::create_migration_pool(&config.database_url)
        .await
        .context("connecting for migrations")?;
    db::run_migrations(&migration_pool)
        .await
        .context("running migrations")?;
    migration_pool.close().await;

    let pool = db::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("connecting to database")?;

    let state = AppState::new(pool, &config);
    let app = routes::router(state);

    tracing::info!(address = %config.bind_address, "Starting billing API");
    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .context("binding listener")?;
    axum::serve(listener, app).await.context("serving")?;

    Ok(())
}
