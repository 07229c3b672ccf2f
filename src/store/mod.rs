//! SQLite persistence layer.
//!
//! One pool per process; every scrape run, mutation call, and analysis
//! event owns its own transaction end-to-end. Store operations take an
//! explicit connection so the caller controls the transaction boundary.

pub mod fingerprint;
pub mod job;
pub mod listing;

pub use fingerprint::{FingerprintStore, ImageFingerprint};
pub use job::{JobBookkeeping, JobParams, JobRegistry, ScheduledJob};
pub use listing::{Listing, ListingFilter, ListingStore, UpsertOutcome};

use anyhow::{Context, Result};
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{ConnectOptions, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;

/// SQL schema, idempotent.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS listings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT NOT NULL UNIQUE,
    query_name TEXT,
    title TEXT,
    description TEXT,
    price_amount TEXT,
    price_currency TEXT,
    price_negotiable INTEGER,
    price_text TEXT,
    url TEXT,
    status TEXT,
    delivery TEXT,
    thumbnail_url TEXT,
    categories TEXT,
    location TEXT,
    seller TEXT,
    details TEXT,
    features TEXT,
    extra_info TEXT,
    image_urls TEXT,
    search_params TEXT,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    posted_at TEXT,
    posted_at_text TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    is_suspicious INTEGER NOT NULL DEFAULT 0,
    suspicion_reason TEXT,
    suspicion_confidence REAL,
    suspicion_meta TEXT,
    last_analyzed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_listings_status ON listings(status);
CREATE INDEX IF NOT EXISTS idx_listings_is_suspicious ON listings(is_suspicious);

CREATE TABLE IF NOT EXISTS image_fingerprints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    listing_id INTEGER NOT NULL REFERENCES listings(id) ON DELETE CASCADE,
    image_url TEXT NOT NULL,
    hash_method TEXT NOT NULL DEFAULT 'phash',
    hash_hex TEXT NOT NULL,
    hash_bits INTEGER NOT NULL,
    width INTEGER,
    height INTEGER,
    file_size INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_image_fingerprints_listing_id ON image_fingerprints(listing_id);
CREATE INDEX IF NOT EXISTS idx_image_fingerprints_hash_hex ON image_fingerprints(hash_hex);

CREATE TABLE IF NOT EXISTS scheduled_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    query TEXT,
    location TEXT,
    radius INTEGER,
    min_price INTEGER,
    max_price INTEGER,
    page_count INTEGER NOT NULL DEFAULT 1,
    interval_seconds INTEGER NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_run_at TEXT,
    next_run_at TEXT,
    last_run_status TEXT,
    last_run_message TEXT,
    last_run_duration_seconds REAL,
    last_result_count INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Shared handle to the SQLite pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (and create if missing) the database and run the schema.
    ///
    /// WAL mode for concurrent reads during writes, 30 s busy timeout, and
    /// enforced foreign keys so fingerprint rows cascade with their listing.
    pub async fn connect(database_url: &str, echo_statements: bool) -> Result<Self> {
        let mut options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid DATABASE_URL: {database_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        if echo_statements {
            options = options.log_statements(log::LevelFilter::Debug);
        } else {
            options = options.disable_statement_logging();
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("Failed to open SQLite database")?;

        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&pool)
            .await
            .context("Failed to initialize database schema")?;

        Ok(Self { pool })
    }

    /// In-memory database for tests.
    ///
    /// Restricted to one connection: each SQLite `:memory:` connection is
    /// its own database, so a larger pool would see different schemas.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Invalid in-memory connection string")?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&pool)
            .await
            .context("Failed to initialize database schema")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin()
            .await
            .context("Failed to begin transaction")
    }
}
