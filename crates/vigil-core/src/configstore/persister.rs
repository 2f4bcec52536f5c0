//! Durable storage of the configuration

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

use super::model::PostableUserConfig;

/// A committed configuration version
#[derive(Debug, Clone, PartialEq)]
pub struct StoredConfig {
    /// Monotonic version assigned by the persister
    pub version: i64,
    /// Configuration, secrets included
    pub config: PostableUserConfig,
    /// Commit time
    pub created_at: DateTime<Utc>,
}

/// Storage backend for the configuration store
#[async_trait]
pub trait ConfigPersister: Send + Sync {
    /// Latest committed configuration, if any
    async fn load(&self) -> Result<Option<StoredConfig>>;

    /// Commit a configuration and return its version
    async fn save(&self, config: &PostableUserConfig) -> Result<i64>;
}

/// Keeps every committed version in memory
#[derive(Default)]
pub struct InMemoryPersister {
    versions: Mutex<Vec<StoredConfig>>,
    fail_saves: AtomicBool,
}

impl InMemoryPersister {
    /// Make subsequent saves fail, to exercise commit failures
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of committed versions
    pub fn version_count(&self) -> usize {
        self.versions.lock().len()
    }
}

#[async_trait]
impl ConfigPersister for InMemoryPersister {
    async fn load(&self) -> Result<Option<StoredConfig>> {
        Ok(self.versions.lock().last().cloned())
    }

    async fn save(&self, config: &PostableUserConfig) -> Result<i64> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Error::internal("configuration storage unavailable"));
        }

        let mut versions = self.versions.lock();
        let version = versions.last().map_or(1, |v| v.version + 1);
        versions.push(StoredConfig {
            version,
            config: config.clone(),
            created_at: Utc::now(),
        });
        Ok(version)
    }
}

/// Postgres-backed configuration history
#[derive(Clone)]
pub struct PostgresPersister {
    pool: PgPool,
}

impl PostgresPersister {
    /// Connect and run migrations
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        let persister = Self { pool };
        persister.migrate().await?;
        Ok(persister)
    }

    /// Wrap an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(e.into()))?;
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigPersister for PostgresPersister {
    async fn load(&self) -> Result<Option<StoredConfig>> {
        let row = sqlx::query_as::<_, ConfigRow>(
            r#"
            SELECT version, configuration, created_at
            FROM alert_configuration
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredConfig::try_from).transpose()
    }

    async fn save(&self, config: &PostableUserConfig) -> Result<i64> {
        let json = serde_json::to_value(config)?;

        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO alert_configuration (configuration, created_at)
            VALUES ($1, $2)
            RETURNING version
            "#,
        )
        .bind(&json)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(version)
    }
}

// Database row types for mapping

#[derive(sqlx::FromRow)]
struct ConfigRow {
    version: i64,
    configuration: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<ConfigRow> for StoredConfig {
    type Error = Error;

    fn try_from(row: ConfigRow) -> Result<Self> {
        Ok(Self {
            version: row.version,
            config: serde_json::from_value(row.configuration)?,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_versions_increase() {
        let persister = InMemoryPersister::default();
        assert!(persister.load().await.unwrap().is_none());

        let config = PostableUserConfig::default_config();
        assert_eq!(persister.save(&config).await.unwrap(), 1);
        assert_eq!(persister.save(&config).await.unwrap(), 2);

        let latest = persister.load().await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.config, config);
    }

    #[tokio::test]
    async fn test_in_memory_failure_keeps_history() {
        let persister = InMemoryPersister::default();
        persister.save(&PostableUserConfig::default_config()).await.unwrap();

        persister.set_fail_saves(true);
        assert!(persister.save(&PostableUserConfig::default_config()).await.is_err());
        assert_eq!(persister.version_count(), 1);
    }
}
