use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::cache::{CacheError, CacheStore};

/// Cache store shared with other processes through a Redis server.
///
/// `ConnectionManager` reconnects on its own; every call works on a cheap
/// clone of it.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    url: String,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let connection = client.get_connection_manager().await.map_err(unavailable)?;

        info!("🔗 Connected to Redis at {}", url);
        Ok(Self {
            connection,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn unavailable(e: redis::RedisError) -> CacheError {
    CacheError::Unavailable(e.to_string())
}

/// `SET ... EX` takes whole seconds and rejects zero
fn expiry_secs(ttl: Duration) -> u64 {
    let rounded_up = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    rounded_up.max(1)
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut connection = self.connection.clone();
        connection.get(key).await.map_err(unavailable)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        match ttl {
            Some(ttl) => connection.set_ex::<_, _, ()>(key, value, expiry_secs(ttl)).await,
            None => connection.set::<_, _, ()>(key, value).await,
        }
        .map_err(unavailable)
    }

    async fn incr(&self, key: &str) -> Result<u64, CacheError> {
        let mut connection = self.connection.clone();
        connection.incr(key, 1u64).await.map_err(unavailable)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        let reply: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;
        debug!("🏓 Redis answered {}", reply);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::{CommandFingerprint, ResultCache};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_expiry_rounds_up_to_whole_seconds() {
        assert_eq!(expiry_secs(Duration::from_secs(30)), 30);
        assert_eq!(expiry_secs(Duration::from_millis(1500)), 2);
        assert_eq!(expiry_secs(Duration::from_millis(10)), 1);
        assert_eq!(expiry_secs(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let temp_dir = tempfile::tempdir().unwrap();
        let url = format!("unix://{}", temp_dir.path().join("redis.sock").display());

        let result = tokio::time::timeout(Duration::from_secs(30), RedisStore::connect(&url))
            .await
            .expect("connect must give up");
        assert!(matches!(result, Err(CacheError::Unavailable(_))));
        assert!(matches!(
            RedisStore::connect("not a url").await,
            Err(CacheError::Unavailable(_))
        ));
    }

    /// Runs only when AUTOMATION_HELPER_TEST_REDIS points at a server
    #[tokio::test]
    async fn test_result_cache_over_redis() {
        let Ok(url) = std::env::var("AUTOMATION_HELPER_TEST_REDIS") else {
            return;
        };
        let store = Arc::new(RedisStore::connect(&url).await.unwrap());
        store.ping().await.unwrap();

        let namespace = format!("automation-helper-test-{}", uuid::Uuid::new_v4());
        let first = ResultCache::new(Arc::clone(&store) as Arc<dyn CacheStore>, namespace.clone(), Duration::from_secs(30));
        let second = ResultCache::new(store as Arc<dyn CacheStore>, namespace, Duration::from_secs(30));
        let fingerprint = CommandFingerprint::compute("check_discovery", &json!({"host": "srv1"})).unwrap();

        first.set(&fingerprint, "R", Duration::from_secs(30)).await.unwrap();
        let shared = second.get(&fingerprint).await.unwrap().unwrap();
        assert_eq!(shared.payload, "R");

        assert_eq!(second.invalidate_all().await.unwrap(), 1);
        assert!(first.get(&fingerprint).await.unwrap().is_none());
    }
}
