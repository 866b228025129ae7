use anyhow::{Context, Result};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::core::application::{Application, ApplicationFactory, ApplicationHandle, AutomationOutcome};
use crate::core::cache::ResultCache;
use crate::core::pidfile::PidFile;
use crate::core::reloader::{ReloadInstructions, ReloadRequester, ReloaderStats};
use crate::core::watcher::SignalOrigin;
use crate::ipc::protocol::{read_frame, write_frame, ClientMessage, DaemonResponse, HealthReport, ProtocolError};
use crate::logging::ACCESS_LOG_TARGET;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Running,
    Reloading,
    Stopping,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Reloading => "reloading",
            ServerState::Stopping => "stopping",
            ServerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Socket file removed when the listener goes away
#[derive(Debug)]
struct SocketFile {
    path: PathBuf,
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("🧹 Removed socket {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("⚠️  Failed to remove socket {:?}: {}", self.path, e),
        }
    }
}

/// Listening socket plus the files it owns
pub struct BoundServer {
    listener: UnixListener,
    socket: SocketFile,
    pid_file: PidFile,
}

impl BoundServer {
    pub fn socket_path(&self) -> &Path {
        &self.socket.path
    }

    pub fn pid_file(&self) -> &Path {
        self.pid_file.path()
    }
}

/// Everything request handlers share
pub struct ServerContext {
    pub app: Arc<ApplicationHandle>,
    pub cache: Arc<ResultCache>,
    pub reloads: ReloadRequester,
    pub reloader_stats: Arc<ReloaderStats>,
    start_time: Instant,
}

impl ServerContext {
    pub fn new(
        app: Arc<ApplicationHandle>,
        cache: Arc<ResultCache>,
        reloads: ReloadRequester,
        reloader_stats: Arc<ReloaderStats>,
    ) -> Self {
        Self {
            app,
            cache,
            reloads,
            reloader_stats,
            start_time: Instant::now(),
        }
    }

    async fn health(&self, state: ServerState) -> HealthReport {
        let app = self.app.current();
        let cache_generation = self.cache.generation().await.unwrap_or_else(|e| {
            warn!("⚠️  Failed to read cache generation: {}", e);
            0
        });

        HealthReport {
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            state: state.to_string(),
            app_generation: app.generation(),
            cache_generation,
            automations: app.automation_names(),
            reloader: self.reloader_stats.snapshot(),
            last_change_detected: self.cache.last_change_detected().await.ok().flatten(),
            last_reload: self.cache.last_reload().await.ok().flatten(),
            reload_required: self.cache.reload_required().await.unwrap_or(false),
        }
    }
}

pub struct IpcServer {
    config: ServerConfig,
    context: Arc<ServerContext>,
    factory: Arc<dyn ApplicationFactory>,
    state: watch::Sender<ServerState>,
}

impl IpcServer {
    pub fn new(config: ServerConfig, context: Arc<ServerContext>, factory: Arc<dyn ApplicationFactory>) -> Self {
        let (state, _) = watch::channel(ServerState::Starting);
        Self {
            config,
            context,
            factory,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Write the PID file, then bind the socket.
    ///
    /// The PID file is claimed first so a refused second instance never
    /// touches the socket of the one already running.
    pub fn bind(&self) -> Result<BoundServer> {
        let pid_file = PidFile::create(&self.config.pid_file)?;

        let socket_path = &self.config.socket_path;
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create run directory {parent:?}"))?;
        }

        // Remove existing socket file if it exists
        if socket_path.exists() {
            debug!("🧹 Removing stale socket {:?}", socket_path);
            std::fs::remove_file(socket_path)
                .with_context(|| format!("Failed to remove stale socket {socket_path:?}"))?;
        }

        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("Failed to bind {socket_path:?}"))?;
        let socket = SocketFile {
            path: socket_path.clone(),
        };

        info!("🔌 Automation server listening on: {:?}", socket_path);
        Ok(BoundServer {
            listener,
            socket,
            pid_file,
        })
    }

    /// Serve until `shutdown` resolves, then drain and clean up
    pub async fn run<F>(self, bound: BoundServer, mut instructions: ReloadInstructions, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let BoundServer {
            listener,
            socket,
            pid_file,
        } = bound;
        let workers = Arc::new(Semaphore::new(self.config.workers));
        let mut inflight = JoinSet::new();
        let mut rebuilds: JoinSet<Result<Application>> = JoinSet::new();
        let mut reload_pending = false;
        let mut instructions_open = true;

        self.state.send_replace(ServerState::Running);
        info!("🚀 Serving with {} workers", self.config.workers);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("🛑 Received shutdown signal");
                    break;
                }

                instruction = instructions.recv(), if instructions_open => match instruction {
                    Some(()) if rebuilds.is_empty() => self.start_reload(&mut rebuilds),
                    Some(()) => {
                        debug!("Reload already running, queueing another");
                        reload_pending = true;
                    }
                    None => {
                        debug!("Reload instruction channel closed");
                        instructions_open = false;
                    }
                },

                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let context = Arc::clone(&self.context);
                        let workers = Arc::clone(&workers);
                        let state = self.state.subscribe();
                        inflight.spawn(async move {
                            if let Err(e) = handle_connection(stream, context, workers, state).await {
                                warn!("⚠️  Error handling client: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("❌ Failed to accept connection: {}", e);
                    }
                },

                Some(built) = rebuilds.join_next(), if !rebuilds.is_empty() => {
                    self.finish_reload(built);
                    if std::mem::take(&mut reload_pending) {
                        self.start_reload(&mut rebuilds);
                    }
                }

                Some(finished) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("💥 Request handler panicked: {}", e);
                        }
                    }
                }
            }
        }

        self.state.send_replace(ServerState::Stopping);
        if !rebuilds.is_empty() {
            info!("🛑 Abandoning application rebuild in progress");
            rebuilds.abort_all();
        }
        drop(listener);
        drop(socket);

        let grace = self.config.shutdown_grace;
        let pending = inflight.len();
        if pending > 0 {
            info!("⏳ Waiting up to {:?} for {} in-flight requests", grace, pending);
        }
        let drained = tokio::time::timeout(grace, async {
            while inflight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("⚠️  Grace period expired, aborting {} requests", inflight.len());
            inflight.abort_all();
        }

        drop(pid_file);
        self.state.send_replace(ServerState::Stopped);
        info!("👋 Automation server stopped");
        Ok(())
    }

    /// Build the next application off the accept loop
    fn start_reload(&self, rebuilds: &mut JoinSet<Result<Application>>) {
        self.state.send_replace(ServerState::Reloading);
        info!("⚡ Reloading application");

        let factory = Arc::clone(&self.factory);
        rebuilds.spawn(async move { factory.build().await });
    }

    fn finish_reload(&self, built: Result<Result<Application>, JoinError>) {
        match built {
            Ok(Ok(app)) => {
                let generation = app.generation();
                let previous = self.context.app.swap(app);
                info!(
                    "✅ Application generation {} replaced generation {}",
                    generation,
                    previous.generation()
                );
            }
            Ok(Err(e)) => {
                error!("❌ Reload failed, keeping generation {}: {:#}", self.context.app.current().generation(), e);
            }
            Err(e) => {
                error!("💥 Application rebuild aborted: {}", e);
            }
        }

        self.state.send_replace(ServerState::Running);
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    context: Arc<ServerContext>,
    workers: Arc<Semaphore>,
    state: watch::Receiver<ServerState>,
) -> Result<(), ProtocolError> {
    let request_id = Uuid::new_v4();
    debug!("📞 New client connection {}", request_id);

    let message: ClientMessage = read_frame(&mut stream).await?;
    debug!("📨 Received message: {:?}", message);

    let response = match message {
        ClientMessage::Automation { name, args } => {
            let started = Instant::now();
            let outcome = match workers.acquire().await {
                Ok(_permit) => {
                    let app = context.app.current();
                    app.handle(&name, &args).await
                }
                Err(_) => {
                    return write_frame(
                        &mut stream,
                        &DaemonResponse::Error {
                            message: "server is shutting down".to_string(),
                        },
                    )
                    .await;
                }
            };

            info!(
                target: ACCESS_LOG_TARGET,
                request_id = %request_id,
                command = %name,
                outcome = outcome.label(),
                duration_ms = started.elapsed().as_millis() as u64,
                "automation"
            );

            match outcome {
                AutomationOutcome::Fresh(payload) => DaemonResponse::Success { payload, cached: false },
                AutomationOutcome::Cached(payload) => DaemonResponse::Success { payload, cached: true },
                AutomationOutcome::Failed(e) => {
                    error!("❌ Automation '{}' failed ({}): {}", name, request_id, e);
                    DaemonResponse::Error { message: e.to_string() }
                }
            }
        }

        ClientMessage::Reload => {
            info!(target: ACCESS_LOG_TARGET, request_id = %request_id, command = "reload", "control");
            match context.reloads.request(SignalOrigin::Client) {
                Ok(()) => DaemonResponse::Accepted {
                    message: "reload scheduled".to_string(),
                },
                Err(e) => DaemonResponse::Error { message: e.to_string() },
            }
        }

        ClientMessage::Health => {
            info!(target: ACCESS_LOG_TARGET, request_id = %request_id, command = "health", "control");
            let current = *state.borrow();
            DaemonResponse::Health(context.health(current).await)
        }
    };

    write_frame(&mut stream, &response).await?;
    debug!("📤 Sent response for {}", request_id);
    Ok(())
}
