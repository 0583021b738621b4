use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::{AsyncCommands, Script};
use tokio::sync::RwLock;

use palisade_sync::{SyncBackend, SyncError, register_lock_backend};

use crate::scripts;
use crate::settings::RedisSettings;

/// Redis [`SyncBackend`].
///
/// One key per lock name (optionally prefixed); the value is the holder
/// token and the key TTL is the lease in milliseconds. Acquire, release and
/// ownership checks run as server-side scripts so every mutation is a
/// single atomic evaluation.
///
/// Mutual exclusion holds against a single Redis instance. Asynchronous
/// replication means a failover can lose a freshly acquired lock; use the
/// Postgres backend where that is not acceptable.
pub struct RedisSyncBackend {
    url: String,
    key_prefix: String,
    pool: RwLock<Option<Pool>>,
}

impl RedisSyncBackend {
    /// Create a backend from validated settings.
    ///
    /// With `auto_register` the backend publishes itself as the
    /// process-wide default lock backend.
    pub fn new(settings: RedisSettings, auto_register: bool) -> Arc<Self> {
        let backend = Arc::new(Self {
            url: settings.url,
            key_prefix: settings.key_prefix,
            pool: RwLock::new(None),
        });
        if auto_register {
            register_lock_backend(backend.clone());
        }
        backend
    }

    /// Create a backend from the `REDIS_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SettingsValidation`] listing every offending
    /// variable.
    pub fn from_env(auto_register: bool) -> Result<Arc<Self>, SyncError> {
        Ok(Self::new(RedisSettings::from_env()?, auto_register))
    }

    fn key(&self, name: &str) -> String {
        if self.key_prefix.is_empty() {
            name.to_owned()
        } else {
            format!("{}:{name}", self.key_prefix)
        }
    }

    async fn conn(
        &self,
        operation: &'static str,
    ) -> Result<deadpool_redis::Connection, SyncError> {
        let pool = self.pool.read().await.clone();
        let Some(pool) = pool else {
            return Err(SyncError::OutOfContext { operation });
        };
        pool.get()
            .await
            .map_err(|e| SyncError::Connection(e.to_string()))
    }
}

#[async_trait]
impl SyncBackend for RedisSyncBackend {
    async fn open(&self) -> Result<(), SyncError> {
        let pool = Config::from_url(&self.url)
            .builder()
            .map_err(|e| SyncError::Connection(e.to_string()))?
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| SyncError::Connection(e.to_string()))?;
        *self.pool.write().await = Some(pool);
        Ok(())
    }

    async fn close(&self) -> Result<(), SyncError> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close();
        }
        Ok(())
    }

    async fn acquire(
        &self,
        name: &str,
        token: &str,
        duration: Duration,
    ) -> Result<bool, SyncError> {
        let mut conn = self.conn("acquire").await?;
        let ttl_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);

        let granted: i64 = Script::new(scripts::ACQUIRE)
            .key(self.key(name))
            .arg(token)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| SyncError::Backend(e.to_string()))?;
        Ok(granted == 1)
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool, SyncError> {
        let mut conn = self.conn("release").await?;

        let deleted: i64 = Script::new(scripts::RELEASE)
            .key(self.key(name))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| SyncError::Backend(e.to_string()))?;
        Ok(deleted == 1)
    }

    async fn locked(&self, name: &str) -> Result<bool, SyncError> {
        let mut conn = self.conn("locked").await?;
        conn.exists(self.key(name))
            .await
            .map_err(|e| SyncError::Backend(e.to_string()))
    }

    async fn owned(&self, name: &str, token: &str) -> Result<bool, SyncError> {
        let mut conn = self.conn("owned").await?;

        let held: i64 = Script::new(scripts::OWNED)
            .key(self.key(name))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| SyncError::Backend(e.to_string()))?;
        Ok(held == 1)
    }
}

impl std::fmt::Debug for RedisSyncBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSyncBackend")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn out_of_context_before_open() {
        let settings = RedisSettings::new("redis://127.0.0.1:6379").unwrap();
        let backend = RedisSyncBackend::new(settings, false);

        let err = backend
            .acquire("x", "a", Duration::from_secs(1))
            .await
            .expect_err("unopened backend should refuse");
        assert!(matches!(err, SyncError::OutOfContext { operation: "acquire" }));
    }

    #[test]
    fn key_prefix_applied() {
        let settings = RedisSettings::new("redis://127.0.0.1:6379")
            .unwrap()
            .with_key_prefix("palisade");
        let backend = RedisSyncBackend::new(settings, false);
        assert_eq!(backend.key("orders"), "palisade:orders");

        let bare = RedisSyncBackend::new(
            RedisSettings::new("redis://127.0.0.1:6379").unwrap(),
            false,
        );
        assert_eq!(bare.key("orders"), "orders");
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;
    use palisade_sync::testing::run_lock_backend_conformance;

    fn test_settings() -> RedisSettings {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisSettings::new(url)
            .expect("test URL should be valid")
            .with_key_prefix(format!("palisade-test-{}", uuid::Uuid::new_v4().simple()))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conformance() {
        let backend = RedisSyncBackend::new(test_settings(), false);
        backend.open().await.expect("open should succeed");
        run_lock_backend_conformance(backend.as_ref())
            .await
            .expect("conformance suite should pass");
        backend.close().await.expect("close should succeed");
    }
}
