//! SQLite connection setup

use docket_queue::BackendError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

/// SQLite configuration options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:docket.db?mode=rwc" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode for better concurrency
    pub wal_mode: bool,
    /// Busy timeout in seconds
    pub busy_timeout_secs: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:docket.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout_secs: 30,
        }
    }
}

impl SqliteConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Create config for in-memory database (testing).
    ///
    /// A single connection: every connection to `:memory:` is its own database.
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
        }
    }
}

/// Open a pool and bring the schema up to date.
pub async fn connect(config: &SqliteConfig) -> Result<SqlitePool, BackendError> {
    let mut options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| BackendError::backend(format!("invalid SQLite URL: {e}")))?;

    options = options.pragma("busy_timeout", (config.busy_timeout_secs * 1000).to_string());
    if config.wal_mode {
        options = options.pragma("journal_mode", "WAL");
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
        .map_err(|e| BackendError::backend(format!("SQLite connection failed: {e}")))?;

    info!(url = %config.url, wal = config.wal_mode, "Connected to SQLite");

    migrate(&pool).await?;
    Ok(pool)
}

/// Run the embedded migrations.
pub async fn migrate(pool: &SqlitePool) -> Result<(), BackendError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| BackendError::backend(format!("Migration failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_config_uses_single_connection() {
        let config = SqliteConfig::memory();
        assert_eq!(config.max_connections, 1);
        assert!(!config.wal_mode);
    }

    #[tokio::test]
    async fn test_connect_runs_migrations() {
        let pool = connect(&SqliteConfig::memory()).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);

        // Idempotent
        migrate(&pool).await.unwrap();
    }
}
