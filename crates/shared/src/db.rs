//! Database pool construction and migrations.
//!
//! Two pool flavors: the regular pool targets the pooled (PgBouncer) URL
//! and is sized for request traffic; the migration pool targets the direct
//! URL with a single connection and generous timeouts, because migrations
//! cannot run through a transaction-mode pooler.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

/// Create the request-serving connection pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(300))
        .connect(database_url)
        .await
}

/// Create a pool suitable for running migrations.
///
/// Single connection, long timeouts. Point this at the direct database URL
/// when the main URL goes through PgBouncer.
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
}

/// Run embedded migrations against the given pool.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations complete");
    Ok(())
}
