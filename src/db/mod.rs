use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

pub mod queries;
pub mod store;

/// Initialize the PostgreSQL pool shared by the API and the worker pool.
///
/// Workers hold a connection only for the final settlement transaction, so
/// a pool sized to the worker concurrency plus headroom is enough.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(max_connections.min(2))
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Apply the embedded schema migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}
