//! `SQLite` plumbing shared by the identity store and the session store.
//!
//! Both stores run on one pool shape: WAL journal, foreign keys enforced,
//! and a busy timeout so concurrent writers queue instead of failing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const FILE_POOL_SIZE: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Cannot open database at {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    /// `close()` already ran on the store.
    #[error("Store is closed")]
    Closed,

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("{0} not found")]
    NotFound(String),

    /// A unique constraint rejected the write.
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(db.message().to_owned())
            }
            sqlx::Error::PoolClosed => Self::Closed,
            _ => Self::Query(e.to_string()),
        }
    }
}

fn connect_options() -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT)
}

/// Open the database file at `path`, creating it and its parent directory
/// when missing.
pub async fn open_pool(path: &Path) -> Result<Pool<Sqlite>, DatabaseError> {
    let open_error = |reason: String| DatabaseError::Open {
        path: path.to_path_buf(),
        reason,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| open_error(e.to_string()))?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(FILE_POOL_SIZE)
        .connect_with(connect_options().filename(path).create_if_missing(true))
        .await
        .map_err(|e| open_error(e.to_string()))?;

    info!(path = %path.display(), "Database opened");
    Ok(pool)
}

/// Open a private in-memory database. The pool holds a single connection,
/// since each `SQLite` memory connection is its own database.
pub async fn open_pool_in_memory() -> Result<Pool<Sqlite>, DatabaseError> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect_options().in_memory(true))
        .await
        .map_err(|e| DatabaseError::Open {
            path: PathBuf::from(":memory:"),
            reason: e.to_string(),
        })
}

/// Define a database handle type around a `SQLite` pool and a [`Clock`].
///
/// ```ignore
/// idgate_core::define_database!(IdentityDatabase, "Identity database migrations complete");
/// ```
///
/// Every constructor applies the crate's `./migrations` and starts on
/// [`SystemClock`]; `with_clock` swaps in another time source, which the
/// queries read through `now()` for their `created_at`/`updated_at` stamps.
///
/// [`Clock`]: crate::clock::Clock
/// [`SystemClock`]: crate::clock::SystemClock
#[macro_export]
macro_rules! define_database {
    ($name:ident, $migration_msg:expr) => {
        #[derive(Clone)]
        pub struct $name {
            pool: ::sqlx::Pool<::sqlx::Sqlite>,
            clock: ::std::sync::Arc<dyn $crate::clock::Clock>,
        }

        impl $name {
            /// Open the database file at `path`, creating it when missing.
            pub async fn open(
                path: &::std::path::Path,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                let pool = $crate::db::open_pool(path).await?;
                Self::from_pool(pool).await
            }

            /// A throwaway in-memory database.
            pub async fn open_in_memory() -> ::std::result::Result<Self, $crate::db::DatabaseError>
            {
                let pool = $crate::db::open_pool_in_memory().await?;
                Self::from_pool(pool).await
            }

            /// Wrap an existing pool, applying migrations first.
            pub async fn from_pool(
                pool: ::sqlx::Pool<::sqlx::Sqlite>,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                let db = Self {
                    pool,
                    clock: ::std::sync::Arc::new($crate::clock::SystemClock),
                };
                db.run_migrations().await?;
                Ok(db)
            }

            /// Read the time from `clock` instead of the wall clock.
            #[must_use]
            pub fn with_clock(mut self, clock: ::std::sync::Arc<dyn $crate::clock::Clock>) -> Self {
                self.clock = clock;
                self
            }

            /// Current time as seen by this handle.
            pub fn now(&self) -> i64 {
                self.clock.now()
            }

            async fn run_migrations(&self) -> ::std::result::Result<(), $crate::db::DatabaseError> {
                ::sqlx::migrate!("./migrations")
                    .run(&self.pool)
                    .await
                    .map_err(|e| $crate::db::DatabaseError::Migration(e.to_string()))?;

                ::tracing::info!($migration_msg);
                Ok(())
            }

            /// Close every pooled connection.
            pub async fn close(&self) {
                self.pool.close().await;
            }

            /// The underlying pool, shared with the `SQLite` session store.
            pub const fn pool(&self) -> &::sqlx::Pool<::sqlx::Sqlite> {
                &self.pool
            }
        }
    };
}
