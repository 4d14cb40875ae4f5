//! Aggregate store: users, orders, transactions, slots and settings.
//!
//! [`PgStore`] is the production backend over the `repos` functions;
//! [`MemoryStore`] backs tests and local runs.

pub mod memory;
pub mod models;
pub mod pg;
pub mod repos;
pub mod store;

pub use memory::MemoryStore;
pub use pg::PgStore;
pub use sqlx::postgres::PgPool;
pub use store::AggregateStore;

use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Connect to PostgreSQL.
///
/// Sized for one indexer with a shard worker per connection plus the
/// reconciliation loops; the API binary shares the same settings.
pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(24)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .connect(database_url)
        .await
}
