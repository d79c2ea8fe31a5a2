//! Database migrations
//!
//! This module manages SQLite schema migrations for logsearch.
//! Migrations are versioned and applied automatically on database connection.

use sqlx::SqlitePool;

/// Current schema version
pub const CURRENT_VERSION: i32 = 4;

/// SQL for creating the migrations tracking table
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: Log table with full-text and secondary indexes
///
/// The log table is populated by the ingestion pipeline. It is created here
/// only if missing so the engine can run against a fresh database.
const MIGRATION_V1: &str = r#"
    CREATE TABLE IF NOT EXISTS log_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TIMESTAMP NOT NULL,
        level TEXT NOT NULL COLLATE NOCASE,
        service TEXT NOT NULL COLLATE NOCASE,
        message TEXT NOT NULL,
        correlation_id TEXT,
        metadata TEXT  -- JSON object
    );

    CREATE INDEX IF NOT EXISTS idx_log_entries_timestamp ON log_entries(timestamp);
    CREATE INDEX IF NOT EXISTS idx_log_entries_level ON log_entries(level);
    CREATE INDEX IF NOT EXISTS idx_log_entries_service ON log_entries(service);
    CREATE INDEX IF NOT EXISTS idx_log_entries_correlation_id ON log_entries(correlation_id);

    -- Inverted index over the message column
    CREATE VIRTUAL TABLE IF NOT EXISTS log_entries_fts USING fts5(
        message,
        content='log_entries',
        content_rowid='id'
    );

    -- Triggers to keep the FTS index in sync
    CREATE TRIGGER IF NOT EXISTS log_entries_ai AFTER INSERT ON log_entries BEGIN
        INSERT INTO log_entries_fts(rowid, message)
        VALUES (NEW.id, NEW.message);
    END;

    CREATE TRIGGER IF NOT EXISTS log_entries_ad AFTER DELETE ON log_entries BEGIN
        INSERT INTO log_entries_fts(log_entries_fts, rowid, message)
        VALUES ('delete', OLD.id, OLD.message);
    END;

    CREATE TRIGGER IF NOT EXISTS log_entries_au AFTER UPDATE ON log_entries BEGIN
        INSERT INTO log_entries_fts(log_entries_fts, rowid, message)
        VALUES ('delete', OLD.id, OLD.message);
        INSERT INTO log_entries_fts(rowid, message)
        VALUES (NEW.id, NEW.message);
    END;
"#;

/// Migration 2: Saved searches and sharing grants
const MIGRATION_V2: &str = r#"
    CREATE TABLE IF NOT EXISTS saved_searches (
        id TEXT PRIMARY KEY NOT NULL,
        owner_user_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        query_string TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (owner_user_id, name)
    );

    CREATE INDEX IF NOT EXISTS idx_saved_searches_owner_updated
        ON saved_searches(owner_user_id, updated_at DESC);

    CREATE TABLE IF NOT EXISTS shared_searches (
        saved_search_id TEXT NOT NULL REFERENCES saved_searches(id) ON DELETE CASCADE,
        owner_user_id INTEGER NOT NULL,
        grantee_user_id INTEGER NOT NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (saved_search_id, grantee_user_id)
    );

    CREATE INDEX IF NOT EXISTS idx_shared_searches_grantee
        ON shared_searches(grantee_user_id);
"#;

/// Migration 3: Append-only search history
const MIGRATION_V3: &str = r#"
    CREATE TABLE IF NOT EXISTS search_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        query_string TEXT NOT NULL,
        searched_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_search_history_user_searched_at
        ON search_history(user_id, searched_at DESC);
"#;

/// Migration 4: Result counts on history and public saved searches
const MIGRATION_V4: &str = r#"
    ALTER TABLE search_history ADD COLUMN results_count INTEGER NOT NULL DEFAULT 0;
    ALTER TABLE saved_searches ADD COLUMN is_public INTEGER NOT NULL DEFAULT 0;

    CREATE INDEX IF NOT EXISTS idx_saved_searches_public
        ON saved_searches(updated_at DESC) WHERE is_public = 1;
"#;

/// Get the current schema version from the database
async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    // Ensure migrations table exists
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

/// Record that a migration has been applied
async fn record_migration(pool: &SqlitePool, version: i32) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Log entries and full-text index");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    if current_version < 2 {
        tracing::info!("Applying migration v2: Saved searches and sharing");
        sqlx::raw_sql(MIGRATION_V2).execute(pool).await?;
        record_migration(pool, 2).await?;
    }

    if current_version < 3 {
        tracing::info!("Applying migration v3: Search history");
        sqlx::raw_sql(MIGRATION_V3).execute(pool).await?;
        record_migration(pool, 3).await?;
    }

    if current_version < 4 {
        tracing::info!("Applying migration v4: History result counts and public searches");
        sqlx::raw_sql(MIGRATION_V4).execute(pool).await?;
        record_migration(pool, 4).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Check if the database needs migrations
pub async fn needs_migration(pool: &SqlitePool) -> anyhow::Result<bool> {
    let current_version = get_current_version(pool).await?;
    Ok(current_version < CURRENT_VERSION)
}

/// Get migration status information
pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Current schema version in the database
    pub current_version: i32,
    /// Target schema version (latest)
    pub target_version: i32,
    /// Whether migrations need to be run
    pub needs_migration: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool")
    }

    #[tokio::test]
    async fn test_run_migrations() {
        let pool = create_test_pool().await;

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, 0);
        assert!(status.needs_migration);

        run_migrations(&pool).await.unwrap();

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, CURRENT_VERSION);
        assert!(!status.needs_migration);
        assert!(!needs_migration(&pool).await.unwrap());
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let pool = create_test_pool().await;

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, CURRENT_VERSION);
    }

    #[tokio::test]
    async fn test_tables_created() {
        let pool = create_test_pool().await;
        run_migrations(&pool).await.unwrap();

        let tables = vec![
            "log_entries",
            "log_entries_fts",
            "saved_searches",
            "shared_searches",
            "search_history",
        ];

        for table in tables {
            let result: (i32,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&pool)
                .await
                .unwrap_or_else(|_| panic!("Table {} should exist", table));
            assert_eq!(result.0, 0, "Table {} should be empty", table);
        }
    }

    #[tokio::test]
    async fn test_fts_index_follows_inserts() {
        let pool = create_test_pool().await;
        run_migrations(&pool).await.unwrap();

        sqlx::query(
            "INSERT INTO log_entries (timestamp, level, service, message) VALUES (?, 'error', 'api', 'upstream timeout')",
        )
        .bind(chrono::Utc::now())
        .execute(&pool)
        .await
        .unwrap();

        let (hits,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM log_entries_fts WHERE log_entries_fts MATCH ?",
        )
        .bind("\"timeout\"")
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(hits, 1);
    }

    #[tokio::test]
    async fn test_upgrade_from_v3_keeps_history() {
        let pool = create_test_pool().await;
        sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(&pool).await.unwrap();
        for (version, sql) in [(1, MIGRATION_V1), (2, MIGRATION_V2), (3, MIGRATION_V3)] {
            sqlx::raw_sql(sql).execute(&pool).await.unwrap();
            record_migration(&pool, version).await.unwrap();
        }
        sqlx::query("INSERT INTO search_history (user_id, query_string) VALUES (1, 'timeout')")
            .execute(&pool)
            .await
            .unwrap();

        assert!(needs_migration(&pool).await.unwrap());
        run_migrations(&pool).await.unwrap();

        let (query, results): (String, i64) =
            sqlx::query_as("SELECT query_string, results_count FROM search_history")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(query, "timeout");
        assert_eq!(results, 0);
        assert!(!needs_migration(&pool).await.unwrap());
    }
}
