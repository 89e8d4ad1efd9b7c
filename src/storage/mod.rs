//! SQLite pool bootstrap and schema creation.
//!
//! One pool backs the topology registry, saga state, and the incident
//! journal. Tables are created idempotently at startup.

use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors raised while opening or initializing the durable store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Open a SQLite pool for the given connection URL.
///
/// File databases are created on demand and run in WAL mode. A pooled
/// `:memory:` database is per-connection; a single connection is used there
/// so every caller sees the same schema.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options: SqliteConnectOptions = database_url.parse()?;
    let (options, max_connections) = if database_url.contains(":memory:") {
        (options, 1)
    } else {
        (
            options
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(30))
                .create_if_missing(true),
            5,
        )
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    info!(url = %database_url, "Connected to durable store");
    Ok(pool)
}

/// Create all tables used by the registry, saga manager, and journal.
pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS registry_sidecars (
            name TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            host_url TEXT,
            tools_count INTEGER NOT NULL DEFAULT 0,
            category TEXT,
            registered_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS sagas (
            saga_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            initiator TEXT NOT NULL,
            status TEXT NOT NULL,
            steps TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT,
            error TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sagas_status ON sagas(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sagas_created ON sagas(created_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS pulse_journal (
            entry_id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            entry TEXT NOT NULL,
            severity TEXT NOT NULL,
            category TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pulse_journal_agent ON pulse_journal(agent_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pulse_journal_created ON pulse_journal(created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
