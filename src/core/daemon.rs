use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tracing::{debug, info, warn};

use crate::config::{CacheBackend, Config};
use crate::core::application::{ApplicationFactory, ApplicationHandle, ConfigFileFactory};
use crate::core::cache::{CacheStore, MemoryStore, ResultCache};
use crate::core::redis_store::RedisStore;
use crate::core::reloader::{reload_channel, ConfigReloader, ReloadRequester};
use crate::core::watcher::{ConfigWatcher, SignalOrigin};
use crate::ipc::server::{IpcServer, ServerContext};

pub struct Daemon {
    config: Config,
    config_path: Option<PathBuf>,
    store: Option<Arc<dyn CacheStore>>,
}

impl Daemon {
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Self {
        Self {
            config,
            config_path,
            store: None,
        }
    }

    /// Use this cache backend instead of the configured one
    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Run until SIGTERM or SIGINT
    pub async fn run(self) -> Result<()> {
        let mut terminate = unix_signal(SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        let shutdown = async move {
            tokio::select! {
                _ = signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        };
        self.run_until(shutdown).await
    }

    /// Run until `shutdown` resolves
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        info!("🚀 Starting automation helper");

        let store = match &self.store {
            Some(store) => Arc::clone(store),
            None => open_store(&self.config).await?,
        };
        let cache = Arc::new(ResultCache::new(
            store,
            self.config.cache.namespace.clone(),
            self.config.cache_ttl(),
        ));
        cache.ping().await.context("Result cache is unreachable")?;

        let factory: Arc<dyn ApplicationFactory> = Arc::new(ConfigFileFactory::new(
            self.config_path.clone(),
            self.config.clone(),
            Arc::clone(&cache),
        ));
        let app = factory
            .build()
            .await
            .context("Failed to build initial application")?;
        let app = Arc::new(ApplicationHandle::new(app));

        let (trigger, instructions) = reload_channel();
        let reloader = ConfigReloader::new(Arc::clone(&cache), trigger, self.config.debounce());
        let requester = reloader.requester();
        let context = Arc::new(ServerContext::new(
            Arc::clone(&app),
            Arc::clone(&cache),
            requester.clone(),
            reloader.stats(),
        ));

        let server = IpcServer::new(self.config.server_config(), context, factory);
        let bound = server.bind()?;

        let watcher = ConfigWatcher::new(self.config.watch_schedule());
        let watcher_signals = watcher.subscribe();
        let watcher_task = watcher.spawn()?;
        let reloader_task = reloader.spawn(watcher_signals);
        let hangup_task = spawn_hangup_listener(requester)?;

        info!("✅ Automation helper running (pid {})", std::process::id());
        let served = server.run(bound, instructions, shutdown).await;

        hangup_task.abort();
        reloader_task.stop().await;
        watcher_task.stop().await;

        info!("👋 Automation helper stopped");
        served
    }
}

async fn open_store(config: &Config) -> Result<Arc<dyn CacheStore>> {
    match config.cache.backend {
        CacheBackend::Memory => {
            debug!("💾 Using in-process result cache");
            Ok(Arc::new(MemoryStore::new()))
        }
        CacheBackend::Redis => {
            let url = config.redis_url();
            let store = RedisStore::connect(&url)
                .await
                .with_context(|| format!("Result cache at {url} is unreachable"))?;
            Ok(Arc::new(store))
        }
    }
}

/// SIGHUP forces a reload, same as a detected change
fn spawn_hangup_listener(requester: ReloadRequester) -> Result<tokio::task::JoinHandle<()>> {
    let mut hangups = unix_signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    Ok(tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            info!("📨 Received SIGHUP, requesting reload");
            if let Err(e) = requester.request(SignalOrigin::Hangup) {
                warn!("⚠️  Could not request reload: {}", e);
                break;
            }
        }
        debug!("SIGHUP listener exiting");
    }))
}
