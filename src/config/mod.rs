use anyhow::{Context, Result};
use globset::Glob;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

pub const DEFAULT_CONFIG_PATH: &str = "~/.config/automation-helper/config.toml";

const SOCKET_FILE: &str = "automation-helper.sock";
const PID_FILE: &str = "automation-helper.pid";
const LOG_DIRECTORY: &str = "automation-helper";
const ACCESS_LOG: &str = "access.log";
const ERROR_LOG: &str = "error.log";
const REDIS_SOCKET: &str = "redis";

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Site root all relative paths are resolved against
    pub site_root: PathBuf,

    pub server: ServerSettings,

    pub cache: CacheSettings,

    pub reloader: ReloaderSettings,

    pub watcher: WatcherSettings,

    /// Automation commands by name
    pub automations: HashMap<String, AutomationSpec>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerSettings {
    pub socket_path: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub workers: usize,
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            socket_path: None,
            pid_file: None,
            log_dir: None,
            workers: 4,
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub namespace: String,
    pub backend: CacheBackend,
    /// Defaults to the site's Redis socket
    pub redis_url: Option<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            namespace: "automation-helper".to_string(),
            backend: CacheBackend::Memory,
            redis_url: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ReloaderSettings {
    /// Debounce window to coalesce bursts of change signals
    pub debounce_ms: u64,
}

impl Default for ReloaderSettings {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct WatcherSettings {
    /// Empty means the default targets below the site root
    pub targets: Vec<WatchTargetSettings>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatchTargetSettings {
    pub path: PathBuf,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub ignore_directories: bool,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

/// An external program run for one automation command
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AutomationSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub cacheable: bool,
}

/// Paths and limits the application server owns for its whole lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub pid_file: PathBuf,
    pub access_log: PathBuf,
    pub error_log: PathBuf,
    pub workers: usize,
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn log_dir(&self) -> &Path {
        self.access_log.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// A single location to poll and how often
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub path: PathBuf,
    pub interval: Duration,
    pub recursive: bool,
    pub patterns: Vec<String>,
    pub ignore_directories: bool,
}

pub type WatchSchedule = Vec<WatchTarget>;

impl Config {
    /// Load from an explicit path. A missing file is an error.
    pub async fn load(path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(path);
        info!("📄 Reading config from: {}", expanded_path);

        let content = fs::read_to_string(expanded_path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file '{expanded_path}'"))?;

        let config = Self::from_toml_str(&content)?;
        debug!(
            "📋 Config loaded: {} automations, {} watch targets",
            config.automations.len(),
            config.watch_schedule().len()
        );
        Ok(config)
    }

    /// Load from `path` if given, otherwise from the default location when it exists
    pub async fn load_or_default(path: Option<&str>) -> Result<Self> {
        match Self::locate(path) {
            Some(path) => Self::load(&path.to_string_lossy()).await,
            None => {
                info!("📋 No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// The file `load_or_default` reads, with `~` expanded
    pub fn locate(path: Option<&str>) -> Option<PathBuf> {
        if let Some(path) = path {
            return Some(PathBuf::from(shellexpand::tilde(path).as_ref()));
        }

        let default_path = PathBuf::from(shellexpand::tilde(DEFAULT_CONFIG_PATH).as_ref());
        default_path.exists().then_some(default_path)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.workers == 0 {
            anyhow::bail!("server.workers must be at least 1");
        }

        for target in &self.watcher.targets {
            if target.interval_ms == 0 {
                anyhow::bail!("watch target {:?} has a zero interval", target.path);
            }
            for pattern in &target.patterns {
                Glob::new(pattern)
                    .with_context(|| format!("Invalid glob pattern '{pattern}'"))?;
            }
        }

        for (name, spec) in &self.automations {
            if name.trim().is_empty() {
                anyhow::bail!("automation names must not be empty");
            }
            if spec.command.trim().is_empty() {
                anyhow::bail!("automation '{name}' has an empty command");
            }
        }

        Ok(())
    }

    /// Resolve a possibly relative path against the site root
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.site_root.join(path)
        }
    }

    pub fn run_dir(&self) -> PathBuf {
        self.site_root.join("tmp").join("run")
    }

    pub fn log_dir(&self) -> PathBuf {
        match &self.server.log_dir {
            Some(dir) => self.resolve(dir),
            None => self.site_root.join("var").join("log").join(LOG_DIRECTORY),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        let socket_path = match &self.server.socket_path {
            Some(path) => self.resolve(path),
            None => self.run_dir().join(SOCKET_FILE),
        };
        let pid_file = match &self.server.pid_file {
            Some(path) => self.resolve(path),
            None => self.run_dir().join(PID_FILE),
        };
        let log_dir = self.log_dir();

        ServerConfig {
            socket_path,
            pid_file,
            access_log: log_dir.join(ACCESS_LOG),
            error_log: log_dir.join(ERROR_LOG),
            workers: self.server.workers,
            shutdown_grace: Duration::from_secs(self.server.shutdown_grace_secs),
        }
    }

    pub fn redis_url(&self) -> String {
        match &self.cache.redis_url {
            Some(url) => url.clone(),
            None => format!("unix://{}", self.run_dir().join(REDIS_SOCKET).display()),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.reloader.debounce_ms)
    }

    pub fn watch_schedule(&self) -> WatchSchedule {
        if self.watcher.targets.is_empty() {
            return default_schedule(&self.site_root);
        }

        self.watcher
            .targets
            .iter()
            .map(|target| WatchTarget {
                path: self.resolve(&target.path),
                interval: Duration::from_millis(target.interval_ms),
                recursive: target.recursive,
                patterns: target.patterns.clone(),
                ignore_directories: target.ignore_directories,
            })
            .collect()
    }
}

/// Locations whose changes affect automation results
pub fn default_schedule(site_root: &Path) -> WatchSchedule {
    let target = |relative: &str, patterns: &[&str]| WatchTarget {
        path: site_root.join(relative),
        interval: Duration::from_millis(default_interval_ms()),
        recursive: true,
        patterns: patterns.iter().map(|p| p.to_string()).collect(),
        ignore_directories: true,
    };

    vec![
        target("etc/check_mk", &["*.mk"]),
        target("local/share/check_mk/checks", &[]),
        target("local/lib/python3/cmk", &["*.py"]),
    ]
}

fn default_site_root() -> PathBuf {
    std::env::var_os("OMD_ROOT")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_root: default_site_root(),
            server: ServerSettings::default(),
            cache: CacheSettings::default(),
            reloader: ReloaderSettings::default(),
            watcher: WatcherSettings::default(),
            automations: HashMap::new(),
        }
    }
}
