use diesel::{
    r2d2::{ConnectionManager, Pool, PooledConnection},
    Connection, PgConnection, SqliteConnection,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use once_cell::sync::Lazy;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

use crate::config::CONFIG;

pub mod ability;
pub mod batch;
pub mod channel;
pub mod consume_log;
pub mod option;
pub mod token;
pub mod user;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Query(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("{0}")]
    Logic(String),
}

pub type DbResult<T> = Result<T, DbError>;

pub enum DbPool {
    Postgres(Pool<ConnectionManager<PgConnection>>),
    Sqlite(Pool<ConnectionManager<SqliteConnection>>),
}

pub enum DbConnection {
    Postgres(PooledConnection<ConnectionManager<PgConnection>>),
    Sqlite(PooledConnection<ConnectionManager<SqliteConnection>>),
}

pub fn get_connection() -> DbResult<DbConnection> {
    match &*DB_POOL {
        DbPool::Postgres(pool) => Ok(DbConnection::Postgres(pool.get()?)),
        DbPool::Sqlite(pool) => Ok(DbConnection::Sqlite(pool.get()?)),
    }
}

/// Runs the same diesel query block against whichever backend the pool wraps.
/// The schema is backend-agnostic, so one block serves both arms.
#[macro_export]
macro_rules! db_execute {
    ($conn:ident, $block:block) => {
        match $conn {
            $crate::database::DbConnection::Postgres($conn) => {
                #[allow(unused_imports)]
                use diesel::prelude::*;
                $block
            }
            $crate::database::DbConnection::Sqlite($conn) => {
                #[allow(unused_imports)]
                use diesel::prelude::*;
                $block
            }
        }
    };
}

fn parse_is_postgres(db_url: &str) -> bool {
    db_url.starts_with("postgres")
}

impl DbPool {
    pub fn establish() -> Self {
        let db_url = &CONFIG.db_url;
        if parse_is_postgres(db_url) {
            DbPool::Postgres(init_pg_pool(db_url))
        } else {
            DbPool::Sqlite(init_sqlite_pool(db_url))
        }
    }
}

static DB_POOL: Lazy<DbPool> = Lazy::new(DbPool::establish);

const SQLITE_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/sqlite");
const POSTGRES_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/postgres");

fn init_sqlite_pool(db_url: &str) -> Pool<ConnectionManager<SqliteConnection>> {
    let db_path = Path::new(db_url);
    if !db_path.exists() {
        if let Some(parent_dir) = db_path.parent() {
            if !parent_dir.exists() {
                std::fs::create_dir_all(parent_dir).expect("failed to create database directory");
            }
        }
        File::create(db_path).expect("failed to create database file");
    }

    let mut connection =
        SqliteConnection::establish(db_url).expect("failed to establish migration connection");
    connection
        .run_pending_migrations(SQLITE_MIGRATIONS)
        .expect("failed to run migrations");

    let manager = ConnectionManager::<SqliteConnection>::new(db_url);
    Pool::builder()
        .test_on_check_out(true)
        .max_size(5)
        .build(manager)
        .expect("failed to create sqlite pool")
}

fn init_pg_pool(db_url: &str) -> Pool<ConnectionManager<PgConnection>> {
    let mut connection =
        PgConnection::establish(db_url).expect("failed to establish migration connection");
    connection
        .run_pending_migrations(POSTGRES_MIGRATIONS)
        .expect("failed to run migrations");

    let manager = ConnectionManager::<PgConnection>::new(db_url);
    Pool::builder()
        .max_size(5)
        .build(manager)
        .expect("failed to create postgres pool")
}
