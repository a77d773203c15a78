//! PostgreSQL persistence: pool construction, flat row mapping, the filter
//! compiler, and the storage operations.

pub mod filter;
pub mod queries;
pub mod row;

pub use queries::{AggResult, Store};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Maximum number of connections in the database pool. Sized for one
/// consumer connection plus the query concurrency limit with one spare.
const DB_POOL_MAX_CONNECTIONS: u32 = 4;
/// Minimum number of connections kept alive in the database pool.
const DB_POOL_MIN_CONNECTIONS: u32 = 1;

/// Create the shared connection pool and verify connectivity.
pub async fn new_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(DB_POOL_MAX_CONNECTIONS)
        .min_connections(DB_POOL_MIN_CONNECTIONS)
        .connect(database_url)
        .await?;
    sqlx::query("SELECT 1").execute(&pool).await?;
    Ok(pool)
}

/// Readiness probe: round-trip to the database.
pub async fn check_readiness(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
