//! Persistence for workspace, workflow and job records.

use sqlx::postgres::PgPoolOptions;

pub mod error;
pub mod memory;
pub mod models;
pub mod pg;
pub mod repositories;
pub mod store;

pub use error::DbError;
pub use memory::InMemoryStore;
pub use pg::PgStore;
pub use store::RecordStore;

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply the embedded migrations under `crates/db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
