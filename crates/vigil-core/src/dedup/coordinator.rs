//! Shared store that replicas use to agree on who dispatches

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::RedisConfig;
use crate::error::{Error, Result};

/// How long a delivered watermark outlives its last update
const WATERMARK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Lease and watermark store shared by all replicas
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Take the dispatch lease for `key` at `token`.
    ///
    /// Succeeds when the lease is free, expired or already held by `replica`;
    /// otherwise fails with [`Error::LeaseConflict`].
    async fn try_acquire(&self, key: &str, replica: &str, token: i64, ttl: Duration) -> Result<()>;

    /// Highest token delivered for `key`
    async fn delivered_watermark(&self, key: &str) -> Result<Option<i64>>;

    /// Record that `token` was delivered for `key`; never moves the watermark back
    async fn mark_delivered(&self, key: &str, token: i64) -> Result<()>;
}

struct Lease {
    holder: String,
    expires_at: Instant,
}

/// Coordinator for replicas living in one process
#[derive(Default)]
pub struct InMemoryCoordinator {
    leases: Mutex<HashMap<String, Lease>>,
    watermarks: Mutex<HashMap<String, i64>>,
}

impl InMemoryCoordinator {
    /// Create an empty coordinator
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn try_acquire(&self, key: &str, replica: &str, token: i64, ttl: Duration) -> Result<()> {
        let lease_key = format!("{key}@{token}");
        let now = Instant::now();
        let mut leases = self.leases.lock();
        leases.retain(|_, l| l.expires_at > now);

        match leases.get(&lease_key) {
            Some(lease) if lease.holder != replica => Err(Error::LeaseConflict {
                key: lease_key,
                holder: lease.holder.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                leases.insert(
                    lease_key,
                    Lease {
                        holder: replica.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(())
            }
        }
    }

    async fn delivered_watermark(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.watermarks.lock().get(key).copied())
    }

    async fn mark_delivered(&self, key: &str, token: i64) -> Result<()> {
        let mut watermarks = self.watermarks.lock();
        let current = watermarks.entry(key.to_string()).or_insert(token);
        *current = (*current).max(token);
        Ok(())
    }
}

/// Coordinator backed by Redis.
///
/// Leases are `SET NX PX` keys holding the replica id; watermarks are plain
/// integer keys advanced by a script so concurrent writers never lower them.
#[derive(Clone)]
pub struct RedisCoordinator {
    pool: Pool,
    prefix: String,
}

impl RedisCoordinator {
    /// Create a new Redis coordinator
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let pool = PoolConfig::from_url(&config.url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Redis(e.to_string()))?;

        Ok(Self {
            pool,
            prefix: config.key_prefix.clone(),
        })
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| Error::Redis(e.to_string()))
    }

    fn namespace(&self) -> &str {
        self.prefix.trim_end_matches(':')
    }

    fn lease_key(&self, key: &str, token: i64) -> String {
        format!("{}:lease:{key}@{token}", self.namespace())
    }

    fn watermark_key(&self, key: &str) -> String {
        format!("{}:delivered:{key}", self.namespace())
    }
}

#[async_trait]
impl Coordinator for RedisCoordinator {
    async fn try_acquire(&self, key: &str, replica: &str, token: i64, ttl: Duration) -> Result<()> {
        let lease_key = self.lease_key(key, token);
        let mut conn = self.conn().await?;

        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let acquired: Option<String> = redis::cmd("SET")
            .arg(&lease_key)
            .arg(replica)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        if acquired.is_some() {
            return Ok(());
        }

        let holder: Option<String> = redis::cmd("GET")
            .arg(&lease_key)
            .query_async(&mut conn)
            .await?;
        match holder {
            Some(holder) if holder != replica => Err(Error::LeaseConflict { key: lease_key, holder }),
            // Held by us, or expired between the two commands
            _ => Ok(()),
        }
    }

    async fn delivered_watermark(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.conn().await?;
        let value: Option<i64> = redis::cmd("GET")
            .arg(self.watermark_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn mark_delivered(&self, key: &str, token: i64) -> Result<()> {
        let script = redis::Script::new(
            r"
            local current = redis.call('GET', KEYS[1])
            if not current or tonumber(current) < tonumber(ARGV[1]) then
                redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
            end
            return 1
            ",
        );

        let mut conn = self.conn().await?;
        let _: i64 = script
            .key(self.watermark_key(key))
            .arg(token)
            .arg(WATERMARK_TTL.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
