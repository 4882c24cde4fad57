use anyhow::{Context, Result};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Singleton database wrapper
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://")
            && path_part != ":memory:"
        {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// Pool-backed in-memory database for tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;
        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create bot_state table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_intents (
                client_order_id TEXT PRIMARY KEY,
                broker_order_id TEXT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                limit_price TEXT,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_order_intents_symbol
            ON order_intents (symbol, state);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create order_intents table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fills (
                broker_order_id TEXT NOT NULL,
                client_order_id TEXT NOT NULL,
                filled_qty TEXT NOT NULL,
                filled_price TEXT NOT NULL,
                dedupe_key TEXT NOT NULL,
                filled_at TEXT NOT NULL,
                PRIMARY KEY (broker_order_id, dedupe_key)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create fills table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS position_tracking (
                symbol TEXT PRIMARY KEY,
                quantity TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                atr_value REAL NOT NULL,
                trailing_stop_price TEXT NOT NULL,
                last_update_at TEXT NOT NULL,
                pending_exit INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create position_tracking table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signal_gates (
                gate_name TEXT PRIMARY KEY,
                last_accepted_bar_ts TEXT,
                last_accepted_ts TEXT,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create signal_gates table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS circuit_breaker (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                count INTEGER NOT NULL,
                last_reset_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create circuit_breaker table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS drawdown_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                level TEXT NOT NULL,
                peak_equity TEXT NOT NULL,
                current_drawdown_pct REAL NOT NULL,
                last_updated TEXT NOT NULL,
                last_peak_reset_time TEXT NOT NULL,
                manual_recovery_requested INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create drawdown_state table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS equity_curve (
                timestamp TEXT PRIMARY KEY,
                equity TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create equity_curve table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bars (
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                PRIMARY KEY (symbol, timeframe, timestamp)
            );
            CREATE INDEX IF NOT EXISTS idx_bars_symbol_time
            ON bars (symbol, timeframe, timestamp);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create bars table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS exit_attempts (
                symbol TEXT PRIMARY KEY,
                attempt_count INTEGER NOT NULL,
                last_attempt_at TEXT NOT NULL,
                next_retry_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create exit_attempts table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reconciliation_reports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                report_json TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create reconciliation_reports table")?;

        info!("Database schema initialized.");
        Ok(())
    }
}
