use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

const GENERATION_KEY: &str = "generation";
const LAST_CHANGE_KEY: &str = "last_change_detected";
const LAST_RELOAD_KEY: &str = "last_reload";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt cache entry for {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize arguments: {0}")]
    Arguments(#[from] serde_json::Error),
}

/// Deterministic cache key for one automation command and its arguments
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandFingerprint(String);

impl CommandFingerprint {
    pub fn compute(command: &str, args: &serde_json::Value) -> Result<Self, CacheError> {
        // serde_json::Map is ordered by key, so the serialization is canonical
        let serialized = serde_json::to_vec(args)?;

        let mut hasher = Sha256::new();
        hasher.update(command.as_bytes());
        hasher.update([0u8]);
        hasher.update(&serialized);

        Ok(Self(hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResult {
    pub fingerprint: CommandFingerprint,
    pub payload: String,
    /// Unix seconds
    pub created_at: u64,
    pub ttl: Duration,
}

/// Key-value backend the result cache is layered on.
///
/// Implementations handle their own concurrency control and TTL expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value`; `None` keeps it until overwritten
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Atomically increment a counter and return the new value
    async fn incr(&self, key: &str) -> Result<u64, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

#[derive(Debug)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| now < deadline)
    }
}

/// In-process store with lazy TTL expiry
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, stored| stored.is_live(now));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        match entries.get(key) {
            Some(stored) if stored.is_live(now) => Ok(Some(stored.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .await
            .insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<u64, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let current = match entries.get(key) {
            Some(stored) if stored.is_live(now) => stored.value.parse::<u64>().unwrap_or(0),
            _ => 0,
        };
        let next = current + 1;
        entries.insert(
            key.to_string(),
            StoredValue {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Memoizes automation results by fingerprint.
///
/// Entries live under `{namespace}:{generation}:{fingerprint}`. Invalidation
/// bumps the generation held in the store, so older entries become
/// unreachable the moment `invalidate_all` returns and expire on their own.
pub struct ResultCache {
    store: Arc<dyn CacheStore>,
    namespace: String,
    default_ttl: Duration,
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>, namespace: impl Into<String>, default_ttl: Duration) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Fail fast when the backend is unreachable
    pub async fn ping(&self) -> Result<(), CacheError> {
        self.store.ping().await
    }

    fn meta_key(&self, name: &str) -> String {
        format!("{}:meta:{}", self.namespace, name)
    }

    pub async fn generation(&self) -> Result<u64, CacheError> {
        let raw = self.store.get(&self.meta_key(GENERATION_KEY)).await?;
        Ok(raw.and_then(|value| value.parse().ok()).unwrap_or(0))
    }

    fn entry_key(&self, generation: u64, fingerprint: &CommandFingerprint) -> String {
        format!("{}:{}:{}", self.namespace, generation, fingerprint)
    }

    pub async fn get(&self, fingerprint: &CommandFingerprint) -> Result<Option<CachedResult>, CacheError> {
        let generation = self.generation().await?;
        self.get_at(generation, fingerprint).await
    }

    /// Look up `fingerprint` as stored under `generation`
    pub async fn get_at(
        &self,
        generation: u64,
        fingerprint: &CommandFingerprint,
    ) -> Result<Option<CachedResult>, CacheError> {
        let key = self.entry_key(generation, fingerprint);
        match self.store.get(&key).await? {
            Some(raw) => {
                let result = serde_json::from_str(&raw)
                    .map_err(|source| CacheError::Corrupt { key, source })?;
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }

    pub async fn set(
        &self,
        fingerprint: &CommandFingerprint,
        payload: impl Into<String>,
        ttl: Duration,
    ) -> Result<CachedResult, CacheError> {
        let generation = self.generation().await?;
        self.set_at(generation, fingerprint, payload, ttl).await
    }

    /// Store a result computed while `generation` was current.
    ///
    /// If the cache was invalidated in the meantime the entry lands under
    /// the old generation and is never read back.
    pub async fn set_at(
        &self,
        generation: u64,
        fingerprint: &CommandFingerprint,
        payload: impl Into<String>,
        ttl: Duration,
    ) -> Result<CachedResult, CacheError> {
        let result = CachedResult {
            fingerprint: fingerprint.clone(),
            payload: payload.into(),
            created_at: unix_now(),
            ttl,
        };
        let key = self.entry_key(generation, fingerprint);
        let raw = serde_json::to_string(&result)
            .map_err(|source| CacheError::Corrupt { key: key.clone(), source })?;
        self.store.set(&key, raw, Some(ttl)).await?;

        debug!("💾 Cached result for {} at generation {} (ttl {:?})", fingerprint, generation, ttl);
        Ok(result)
    }

    /// Make every previously stored result unreachable, returning the new generation
    pub async fn invalidate_all(&self) -> Result<u64, CacheError> {
        let generation = self.store.incr(&self.meta_key(GENERATION_KEY)).await?;
        info!("🧹 Result cache invalidated, now at generation {}", generation);
        Ok(generation)
    }

    pub async fn record_change_detected(&self, at: u64) -> Result<(), CacheError> {
        self.store
            .set(&self.meta_key(LAST_CHANGE_KEY), at.to_string(), None)
            .await
    }

    pub async fn record_reload(&self, at: u64) -> Result<(), CacheError> {
        self.store
            .set(&self.meta_key(LAST_RELOAD_KEY), at.to_string(), None)
            .await
    }

    pub async fn last_change_detected(&self) -> Result<Option<u64>, CacheError> {
        self.read_timestamp(LAST_CHANGE_KEY).await
    }

    pub async fn last_reload(&self) -> Result<Option<u64>, CacheError> {
        self.read_timestamp(LAST_RELOAD_KEY).await
    }

    /// A change was seen that no reload has picked up yet
    pub async fn reload_required(&self) -> Result<bool, CacheError> {
        let changed = self.last_change_detected().await?;
        let reloaded = self.last_reload().await?;
        Ok(match (changed, reloaded) {
            (Some(changed), Some(reloaded)) => changed > reloaded,
            (Some(_), None) => true,
            (None, _) => false,
        })
    }

    async fn read_timestamp(&self, name: &str) -> Result<Option<u64>, CacheError> {
        let raw = self.store.get(&self.meta_key(name)).await?;
        Ok(raw.and_then(|value| value.parse().ok()))
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
