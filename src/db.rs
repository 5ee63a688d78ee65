use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::error::{Error, Result};

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// SQLite leaves foreign keys off unless asked, per connection.
#[derive(Debug, Clone, Copy)]
struct ConnectionOptions;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        configure(conn).map_err(diesel::r2d2::Error::QueryError)
    }
}

fn configure(conn: &mut SqliteConnection) -> QueryResult<()> {
    conn.batch_execute("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
}

/// Builds the pool and brings the schema up to date.
pub fn init_pool(database_url: &str, size: u32) -> Result<DbPool> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(size)
        .connection_customizer(Box::new(ConnectionOptions))
        .build(manager)?;

    let mut conn = pool.get()?;
    run_migrations(&mut conn)?;
    Ok(pool)
}

pub fn run_migrations(conn: &mut SqliteConnection) -> Result<()> {
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| Error::Migration(e.to_string()))?;
    for version in applied {
        tracing::info!(%version, "applied migration");
    }
    Ok(())
}

/// Runs blocking diesel work on a pooled connection off the async runtime.
pub async fn run<F, T>(pool: &DbPool, f: F) -> Result<T>
where
    F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        f(&mut conn)
    })
    .await?
}

/// Fresh in-memory database with the schema applied.
#[cfg(test)]
pub fn test_connection() -> SqliteConnection {
    let mut conn = SqliteConnection::establish(":memory:").expect("in-memory sqlite");
    configure(&mut conn).expect("pragmas");
    run_migrations(&mut conn).expect("migrations");
    conn
}

/// File-backed pool for tests that need several connections writing at once.
/// The database file lives in the temp directory; the caller removes it.
#[cfg(test)]
pub fn test_file_pool(size: u32) -> (DbPool, std::path::PathBuf) {
    let path = std::env::temp_dir().join(format!(
        "garden-{}.db",
        uuid::Uuid::new_v4().simple()
    ));
    let pool = init_pool(path.to_str().expect("utf-8 temp path"), size).expect("file pool");
    (pool, path)
}

/// Single-connection pool over a shared in-memory database.
#[cfg(test)]
pub fn test_pool() -> DbPool {
    let name = format!(
        "file:garden-{}?mode=memory&cache=shared",
        uuid::Uuid::new_v4().simple()
    );
    let manager = ConnectionManager::<SqliteConnection>::new(name);
    let pool = Pool::builder()
        .max_size(1)
        .connection_customizer(Box::new(ConnectionOptions))
        .build(manager)
        .expect("test pool");
    run_migrations(&mut pool.get().expect("connection")).expect("migrations");
    pool
}
