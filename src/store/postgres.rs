//! PostgreSQL atom store.
//!
//! ## Configuration
//!
//! The store reads two tables and never writes, so the pool stays small.
//! Environment variables:
//! - `ATOM_STORE_URL`: connection string, falling back to `DATABASE_URL`
//! - `ATOM_STORE_POOL_SIZE`: maximum pool size (default: 4)
//! - `ATOM_STORE_ACQUIRE_TIMEOUT_MS`: pool acquire timeout (default: 2000)
//! - `ATOM_STORE_IDLE_TIMEOUT_SECS`: idle connection timeout, 0 disables (default: 300)
//!
//! Tables are described in [`crate::store::schema`].

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;

use super::{AtomRecord, AtomStore, StoreError, TagRow};

const DEFAULT_URL: &str = "postgresql://localhost/prompt_atoms";

/// Connection settings for a [`PostgresAtomStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct PostgresConfig {
    /// Database connection URL.
    pub database_url: String,
    /// Maximum pooled connections.
    pub pool_size: u32,
    /// How long a read waits for a pooled connection.
    pub acquire_timeout: Duration,
    /// Idle connections are closed after this long. `None` keeps them.
    pub idle_timeout: Option<Duration>,
}

impl PostgresConfig {
    /// Settings for one database URL with default pool sizing.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            pool_size: 4,
            acquire_timeout: Duration::from_millis(2_000),
            idle_timeout: Some(Duration::from_secs(300)),
        }
    }

    /// Load settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings from any key lookup. Unparseable values keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let url = lookup("ATOM_STORE_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .unwrap_or_else(|| DEFAULT_URL.to_string());
        let mut config = Self::new(url);
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(size) = number("ATOM_STORE_POOL_SIZE").filter(|n| *n > 0) {
            config.pool_size = u32::try_from(size).unwrap_or(u32::MAX);
        }
        if let Some(ms) = number("ATOM_STORE_ACQUIRE_TIMEOUT_MS") {
            config.acquire_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = number("ATOM_STORE_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        config
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self::new(DEFAULT_URL)
    }
}

/// PostgreSQL atom store.
pub struct PostgresAtomStore {
    pool: PgPool,
}

impl PostgresAtomStore {
    /// Connect a pool with the given settings.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        tracing::info!(
            pool_size = config.pool_size,
            acquire_timeout_ms = config.acquire_timeout.as_millis() as u64,
            "Connecting atom store"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Connect using [`PostgresConfig::from_env`].
    pub async fn from_env() -> Result<Self, StoreError> {
        Self::connect(&PostgresConfig::from_env()).await
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Check if the database is reachable.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    fn parse_atom_row(row: &PgRow) -> Result<AtomRecord, sqlx::Error> {
        let count = |column: &str| -> Result<Option<usize>, sqlx::Error> {
            let value: Option<i32> = row.try_get(column)?;
            Ok(value.filter(|v| *v >= 0).map(|v| v as usize))
        };
        let version: i32 = row.try_get("version")?;

        Ok(AtomRecord {
            id: row.try_get("id")?,
            version: version.max(1) as u32,
            content_hash: row.try_get("content_hash")?,
            content: row.try_get("content")?,
            content_concise: row.try_get("content_concise")?,
            content_min: row.try_get("content_min")?,
            token_count: count("token_count")?,
            concise_token_count: count("concise_token_count")?,
            min_token_count: count("min_token_count")?,
            category: row.try_get("category")?,
            subcategory: row.try_get("subcategory")?,
            priority: row.try_get("priority")?,
            is_mandatory: row.try_get("is_mandatory")?,
            exclusion_group: row.try_get("exclusion_group")?,
            depends_on: row.try_get("depends_on")?,
            conflicts_with: row.try_get("conflicts_with")?,
            embedding: row.try_get("embedding")?,
        })
    }
}

#[async_trait]
impl AtomStore for PostgresAtomStore {
    async fn load_atoms(&self) -> Result<Vec<AtomRecord>, StoreError> {
        if self.pool.is_closed() {
            return Err(StoreError::Closed);
        }
        let rows = sqlx::query(
            r#"
            SELECT id, version, content_hash, content, content_concise, content_min,
                   token_count, concise_token_count, min_token_count,
                   category, subcategory, priority, is_mandatory, exclusion_group,
                   depends_on, conflicts_with, embedding
            FROM prompt_atoms
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::parse_atom_row(row) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(error = %e, "Skipping malformed atom row"),
            }
        }
        Ok(records)
    }

    async fn load_tags(&self) -> Result<Vec<TagRow>, StoreError> {
        if self.pool.is_closed() {
            return Err(StoreError::Closed);
        }
        let rows = sqlx::query(
            r#"
            SELECT atom_id, dimension, tag
            FROM atom_context_tags
            ORDER BY atom_id, dimension, tag
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TagRow {
                    atom_id: row.try_get("atom_id")?,
                    dimension: row.try_get("dimension")?,
                    tag: row.try_get("tag")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn close(&self) -> Result<(), StoreError> {
        tracing::info!("Closing PostgreSQL connection pool");
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: BTreeMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        assert_eq!(PostgresConfig::from_lookup(lookup(&[])), PostgresConfig::default());
    }

    #[test]
    fn test_store_url_wins_over_database_url() {
        let config = PostgresConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgresql://db/app"),
            ("ATOM_STORE_URL", "postgresql://db/atoms"),
        ]));
        assert_eq!(config.database_url, "postgresql://db/atoms");
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let config = PostgresConfig::from_lookup(lookup(&[
            ("ATOM_STORE_POOL_SIZE", "0"),
            ("ATOM_STORE_ACQUIRE_TIMEOUT_MS", "750"),
            ("ATOM_STORE_IDLE_TIMEOUT_SECS", "0"),
        ]));
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.acquire_timeout, Duration::from_millis(750));
        assert_eq!(config.idle_timeout, None);

        let config = PostgresConfig::from_lookup(lookup(&[("ATOM_STORE_POOL_SIZE", "many")]));
        assert_eq!(config.pool_size, 4);
    }
}
