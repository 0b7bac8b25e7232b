//! PostgreSQL pool construction shared by the graph and audit stores.

use crate::config::DatabaseConfig;
use crate::error::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

/// Connect a pool with the configured limits. The graph adapter owns its
/// pool; callers never share connections directly.
pub async fn connect_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(&config.url)
        .await?;
    info!(
        max_connections = config.max_connections,
        "database pool connected"
    );
    Ok(pool)
}
