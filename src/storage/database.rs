use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqlitePool, SqlitePoolOptions},
};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::platform::AppPaths;

/// Versioned schema steps, applied in order and recorded in `app_settings`.
const MIGRATIONS: &[(i32, &str, &[&str])] = &[
    (
        1,
        "usage_tracking",
        &[
            r#"
            CREATE TABLE IF NOT EXISTS app_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT (unixepoch())
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS usage_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL UNIQUE,
                timestamp INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                conversation_id TEXT,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                cost TEXT NOT NULL,
                memories_used INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER,
                billing_period TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_usage_records_user ON usage_records(user_id, timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_usage_records_conversation ON usage_records(conversation_id)",
            r#"
            CREATE TABLE IF NOT EXISTS conversation_totals (
                conversation_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                total_cost_nanos INTEGER NOT NULL DEFAULT 0,
                request_count INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT (unixepoch())
            )
            "#,
        ],
    ),
    (
        2,
        "memories",
        &[
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                content_type TEXT NOT NULL DEFAULT 'text',
                embedding_vector_id TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_memories_user ON memories(user_id)",
        ],
    ),
];

/// Database connection manager with migration support
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the database file under the data directory
    /// and brings its schema up to date.
    pub async fn open(paths: &AppPaths, file_name: &str) -> Result<Self> {
        let db_path = paths.database_file(file_name);
        info!("Initializing database at: {:?}", db_path);

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}", db_path.display());
        if !sqlx::Sqlite::database_exists(&url).await? {
            info!("Database doesn't exist, creating new database");
            sqlx::Sqlite::create_database(&url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("{}?mode=rwc", url))
            .await?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database; a single connection keeps every query on
    /// the same schema.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let db = Self { pool };
        db.run_migrations().await?;
        info!("Database initialized successfully");
        Ok(db)
    }

    pub fn get_pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connection closed");
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_database_version().await?;
        debug!("Current database version: {}", current_version);

        for (version, name, statements) in MIGRATIONS {
            if *version <= current_version {
                debug!("Skipping migration {} (already applied)", name);
                continue;
            }

            info!("Applying migration {:03}_{}", version, name);
            let mut tx = self.pool.begin().await?;
            for statement in statements.iter() {
                sqlx::query(statement).execute(&mut *tx).await.map_err(|e| {
                    error!("Failed to apply migration {}: {}", name, e);
                    Error::Database(e)
                })?;
            }
            sqlx::query(
                "INSERT OR REPLACE INTO app_settings (key, value, updated_at) VALUES ('database_version', ?, unixepoch())",
            )
            .bind(version.to_string())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
        }

        Ok(())
    }

    pub async fn get_database_version(&self) -> Result<i32> {
        let table_exists = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type='table' AND name='app_settings'",
        )
        .fetch_optional(&self.pool)
        .await?
        .is_some();

        if !table_exists {
            return Ok(0);
        }

        let version: Option<String> =
            sqlx::query_scalar("SELECT value FROM app_settings WHERE key = 'database_version'")
                .fetch_optional(&self.pool)
                .await?;

        match version {
            Some(version) => version
                .parse()
                .map_err(|e| Error::persistence(format!("Invalid database version '{}': {}", version, e))),
            None => Ok(0),
        }
    }
}

/// Conversions between `Decimal` and the column types used to store money.
pub mod decimal_helpers {
    use rust_decimal::prelude::ToPrimitive;
    use rust_decimal::Decimal;

    use crate::error::{Error, Result};

    const NANOS_SCALE: u32 = 9;

    pub fn decimal_to_string(decimal: Decimal) -> String {
        decimal.normalize().to_string()
    }

    pub fn string_to_decimal(s: &str) -> Result<Decimal> {
        s.parse()
            .map_err(|e| Error::persistence(format!("Failed to parse decimal from '{}': {}", s, e)))
    }

    /// Whole nano-units, rounded half away from zero.
    pub fn decimal_to_nanos(decimal: Decimal) -> Result<i64> {
        (decimal * Decimal::from(1_000_000_000i64))
            .round()
            .to_i64()
            .ok_or_else(|| Error::persistence(format!("Amount {} out of range", decimal)))
    }

    pub fn nanos_to_decimal(nanos: i64) -> Decimal {
        Decimal::new(nanos, NANOS_SCALE).normalize()
    }
}
