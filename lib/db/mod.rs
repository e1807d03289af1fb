pub mod models;
pub mod schema;

use diesel::pg::PgConnection;
use diesel::Connection;
use diesel_async::{
    pg::AsyncPgConnection,
    pooled_connection::{
        deadpool::{BuildError, Pool},
        AsyncDieselConnectionManager,
    },
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::error::Error;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

pub type DbPool = Pool<AsyncPgConnection>;

/// Builds the async Postgres pool shared by the store, pollers, and workers.
pub fn build_db_pool(db_url: &str, max_size: usize) -> Result<DbPool, BuildError> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(db_url);
    Pool::builder(manager).max_size(max_size.max(1)).build()
}

/// Applies pending embedded migrations over a short-lived blocking connection.
///
/// Returns the versions that were applied.
pub fn run_migrations(db_url: &str) -> Result<Vec<String>, Box<dyn Error + Send + Sync>> {
    let mut conn = PgConnection::establish(db_url)?;
    let applied = conn.run_pending_migrations(MIGRATIONS)?;
    Ok(applied.iter().map(|version| version.to_string()).collect())
}
