pub mod application;
pub mod cache;
pub mod daemon;
pub mod engine;
pub mod pidfile;
pub mod redis_store;
pub mod reloader;
pub mod task;
pub mod watcher;

pub use application::{Application, ApplicationFactory, ApplicationHandle, AutomationOutcome};
pub use cache::{CacheStore, CachedResult, CommandFingerprint, MemoryStore, ResultCache};
pub use daemon::Daemon;
pub use engine::{Automation, AutomationEngine, AutomationError};
pub use redis_store::RedisStore;
pub use reloader::{ConfigReloader, ReloadRequester};
pub use watcher::{ChangeSignal, ConfigWatcher, SignalOrigin};
