use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::cache::{CommandFingerprint, ResultCache};
use crate::core::engine::{AutomationEngine, AutomationError};

/// Result of serving one automation request
#[derive(Debug)]
pub enum AutomationOutcome {
    Fresh(String),
    Cached(String),
    Failed(AutomationError),
}

impl AutomationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            AutomationOutcome::Fresh(_) => "fresh",
            AutomationOutcome::Cached(_) => "cached",
            AutomationOutcome::Failed(_) => "failed",
        }
    }
}

/// Engine and cache bound together. Never mutated after construction;
/// reloads build a new one.
pub struct Application {
    engine: AutomationEngine,
    cache: Arc<ResultCache>,
    generation: u64,
    loaded_at: SystemTime,
}

impl Application {
    pub fn new(engine: AutomationEngine, cache: Arc<ResultCache>, generation: u64) -> Self {
        Self {
            engine,
            cache,
            generation,
            loaded_at: SystemTime::now(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn loaded_at(&self) -> SystemTime {
        self.loaded_at
    }

    pub fn automation_names(&self) -> Vec<String> {
        self.engine.names()
    }

    pub async fn handle(&self, name: &str, args: &serde_json::Value) -> AutomationOutcome {
        let cacheable = match self.engine.get(name) {
            Some(automation) => automation.cacheable(),
            None => return AutomationOutcome::Failed(AutomationError::UnknownCommand(name.to_string())),
        };

        if !cacheable {
            return match self.engine.execute(name, args).await {
                Ok(payload) => AutomationOutcome::Fresh(payload),
                Err(e) => AutomationOutcome::Failed(e),
            };
        }

        let fingerprint = match CommandFingerprint::compute(name, args) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                return AutomationOutcome::Failed(AutomationError::InvalidArguments {
                    command: name.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        // Pin the generation so a result computed across an invalidation
        // is stored where nobody looks it up again
        let generation = match self.cache.generation().await {
            Ok(generation) => Some(generation),
            Err(e) => {
                warn!("⚠️  Cache unavailable, executing '{}' uncached: {}", name, e);
                None
            }
        };

        if let Some(generation) = generation {
            match self.cache.get_at(generation, &fingerprint).await {
                Ok(Some(hit)) => {
                    debug!("🎯 Cache hit for '{}' ({})", name, fingerprint);
                    return AutomationOutcome::Cached(hit.payload);
                }
                Ok(None) => {}
                Err(e) => warn!("⚠️  Cache lookup failed, executing '{}': {}", name, e),
            }
        }

        match self.engine.execute(name, args).await {
            Ok(payload) => {
                if let Some(generation) = generation {
                    if let Err(e) = self
                        .cache
                        .set_at(generation, &fingerprint, payload.clone(), self.cache.default_ttl())
                        .await
                    {
                        warn!("⚠️  Failed to cache result of '{}': {}", name, e);
                    }
                }
                AutomationOutcome::Fresh(payload)
            }
            Err(e) => AutomationOutcome::Failed(e),
        }
    }
}

/// Swappable reference to the current application.
///
/// Readers clone the `Arc`, so requests keep the application they started
/// with while a reload installs a new one.
pub struct ApplicationHandle {
    current: RwLock<Arc<Application>>,
}

impl ApplicationHandle {
    pub fn new(application: Application) -> Self {
        Self {
            current: RwLock::new(Arc::new(application)),
        }
    }

    pub fn current(&self) -> Arc<Application> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Install `application`, returning the one it replaced
    pub fn swap(&self, application: Application) -> Arc<Application> {
        let next = Arc::new(application);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, next)
    }
}

/// Builds fresh applications on startup and on every reload
#[async_trait]
pub trait ApplicationFactory: Send + Sync {
    async fn build(&self) -> Result<Application>;
}

/// Re-reads the configuration file and registers its automations
pub struct ConfigFileFactory {
    config_path: Option<PathBuf>,
    fallback: Config,
    cache: Arc<ResultCache>,
    generation: AtomicU64,
}

impl ConfigFileFactory {
    pub fn new(config_path: Option<PathBuf>, fallback: Config, cache: Arc<ResultCache>) -> Self {
        Self {
            config_path,
            fallback,
            cache,
            generation: AtomicU64::new(0),
        }
    }

    async fn current_config(&self) -> Result<Config> {
        match &self.config_path {
            Some(path) => Config::load(&path.to_string_lossy()).await,
            None => Ok(self.fallback.clone()),
        }
    }
}

#[async_trait]
impl ApplicationFactory for ConfigFileFactory {
    async fn build(&self) -> Result<Application> {
        let config = self.current_config().await.map_err(|e| {
            error!("❌ Failed to load configuration for application: {}", e);
            e
        })?;

        let engine = AutomationEngine::from_config(&config);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "📦 Built application generation {} with {} automations",
            generation,
            engine.len()
        );

        Ok(Application::new(engine, Arc::clone(&self.cache), generation))
    }
}
