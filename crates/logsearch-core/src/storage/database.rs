//! SQLite connection pool for the log store
//!
//! Every connection gets foreign keys and the `REGEXP` function. File
//! databases run in WAL mode so searches read alongside the ingestion writer.
//! An in-memory database lives exactly as long as its single connection, so
//! that connection is never recycled by the pool.

use crate::config::DatabaseSettings;
use crate::storage::migrations;
use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// How long a statement waits on a locked database before failing
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the log store lives and how to connect to it
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database file, or `None` for a private in-memory store
    pub path: Option<PathBuf>,
    pub max_connections: u32,
    /// Apply pending migrations on open
    pub auto_migrate: bool,
    pub busy_timeout: Duration,
}

impl DatabaseConfig {
    /// A file database at `path`, created on first open
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            auto_migrate: true,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// A throwaway store for tests and embedding
    pub fn in_memory() -> Self {
        Self {
            path: None,
            max_connections: 1,
            auto_migrate: true,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// From the `[database]` section; a missing path means the platform data dir
    pub fn from_settings(settings: &DatabaseSettings) -> Self {
        let path = settings.path.clone().unwrap_or_else(default_database_path);
        Self::with_path(path).max_connections(settings.max_connections)
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn no_migrate(mut self) -> Self {
        self.auto_migrate = false;
        self
    }

    fn connect_options(&self) -> Result<SqliteConnectOptions> {
        let options = match &self.path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create database directory: {}", parent.display())
                    })?;
                }
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
            }
            None => SqliteConnectOptions::from_str("sqlite::memory:")?
                .journal_mode(SqliteJournalMode::Memory),
        };

        Ok(options
            .foreign_keys(true)
            .with_regexp()
            .busy_timeout(self.busy_timeout))
    }

    fn pool_options(&self) -> SqlitePoolOptions {
        let options = SqlitePoolOptions::new().max_connections(self.max_connections);
        match self.path {
            Some(_) => options,
            None => options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None),
        }
    }
}

/// `logsearch/logsearch.db` under the platform data directory
pub fn default_database_path() -> PathBuf {
    match dirs::data_dir() {
        Some(data_dir) => data_dir.join("logsearch").join("logsearch.db"),
        None => PathBuf::from("logsearch.db"),
    }
}

/// Connection pool over the log store
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        let location = match &config.path {
            Some(path) => path.display().to_string(),
            None => ":memory:".to_string(),
        };

        let pool = config
            .pool_options()
            .connect_with(config.connect_options()?)
            .await
            .with_context(|| format!("Failed to open log store at {}", location))?;
        tracing::debug!(location = %location, max_connections = config.max_connections, "Opened log store");

        let db = Self { pool };
        if config.auto_migrate {
            db.migrate().await?;
        }
        Ok(db)
    }

    /// Open the store named by the `[database]` config section
    pub async fn open(settings: &DatabaseSettings) -> Result<Self> {
        Self::new(DatabaseConfig::from_settings(settings)).await
    }

    pub async fn in_memory() -> Result<Self> {
        Self::new(DatabaseConfig::in_memory()).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        migrations::run_migrations(&self.pool)
            .await
            .context("Failed to run database migrations")
    }

    pub async fn migration_status(&self) -> Result<migrations::MigrationStatus> {
        migrations::migration_status(&self.pool)
            .await
            .context("Failed to check migration status")
    }

    /// Round trip a trivial statement through the pool
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Log store health check failed")?;
        Ok(())
    }

    /// Close every connection; an in-memory store is gone afterwards
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
