use anyhow::Result;
use async_trait::async_trait;
use automation_helper::config::ServerConfig;
use automation_helper::core::reloader::{reload_channel, ConfigReloader};
use automation_helper::core::{
    Application, ApplicationFactory, ApplicationHandle, Automation, AutomationEngine, AutomationError,
    MemoryStore, ResultCache,
};
use automation_helper::ipc::{
    ClientMessage, DaemonResponse, HealthReport, IpcClient, IpcServer, ServerContext, ServerState,
};
use automation_helper::{Config, Daemon};
use serde_json::json;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, NamedTempFile, TempDir};
use tokio::sync::{oneshot, Notify};

/// Echoes its arguments and counts executions
struct EchoAutomation {
    name: &'static str,
    calls: Arc<AtomicUsize>,
    delay: Duration,
    fail: bool,
}

#[async_trait]
impl Automation for EchoAutomation {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, args: &serde_json::Value) -> Result<String, AutomationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(AutomationError::Failed {
                command: self.name.to_string(),
                code: Some(2),
                stderr: "host unreachable".to_string(),
            });
        }
        Ok(format!("{}({})", self.name, args))
    }
}

struct TestFactory {
    cache: Arc<ResultCache>,
    calls: Arc<AtomicUsize>,
    delay: Duration,
    builds: AtomicUsize,
    /// Holds every rebuild after the first until notified
    gate: Option<Arc<Notify>>,
}

impl TestFactory {
    fn new(cache: Arc<ResultCache>, calls: Arc<AtomicUsize>, delay: Duration, gate: Option<Arc<Notify>>) -> Self {
        Self {
            cache,
            calls,
            delay,
            builds: AtomicUsize::new(0),
            gate,
        }
    }
}

#[async_trait]
impl ApplicationFactory for TestFactory {
    async fn build(&self) -> Result<Application> {
        let generation = self.builds.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        if generation > 1 {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
        }
        let mut engine = AutomationEngine::new();
        for (name, fail) in [("check_discovery", false), ("broken", true)] {
            engine.register(Arc::new(EchoAutomation {
                name,
                calls: Arc::clone(&self.calls),
                delay: self.delay,
                fail,
            }));
        }
        Ok(Application::new(engine, Arc::clone(&self.cache), generation))
    }
}

struct TestServer {
    _dir: TempDir,
    client: IpcClient,
    config: ServerConfig,
    calls: Arc<AtomicUsize>,
    shutdown: Option<oneshot::Sender<()>>,
    state: tokio::sync::watch::Receiver<ServerState>,
    handle: tokio::task::JoinHandle<Result<()>>,
}

impl TestServer {
    async fn start(delay: Duration) -> Self {
        Self::start_with(delay, None).await
    }

    async fn start_with(delay: Duration, gate: Option<Arc<Notify>>) -> Self {
        let dir = tempdir().unwrap();
        let config = ServerConfig {
            socket_path: dir.path().join("run").join("helper.sock"),
            pid_file: dir.path().join("run").join("helper.pid"),
            access_log: dir.path().join("log").join("access.log"),
            error_log: dir.path().join("log").join("error.log"),
            workers: 2,
            shutdown_grace: Duration::from_secs(5),
        };

        let cache = Arc::new(ResultCache::new(
            Arc::new(MemoryStore::new()),
            "it",
            Duration::from_secs(30),
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(TestFactory::new(Arc::clone(&cache), Arc::clone(&calls), delay, gate));
        let app = Arc::new(ApplicationHandle::new(factory.build().await.unwrap()));

        let (trigger, instructions) = reload_channel();
        let reloader = ConfigReloader::new(Arc::clone(&cache), trigger, Duration::from_millis(50));
        let context = Arc::new(ServerContext::new(app, cache, reloader.requester(), reloader.stats()));
        let (_watcher_tx, watcher_rx) = tokio::sync::broadcast::channel(4);
        let reloader_task = reloader.spawn(watcher_rx);

        let server = IpcServer::new(config.clone(), context, factory);
        let state = server.state();
        let bound = server.bind().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let result = server
                .run(bound, instructions, async {
                    let _ = shutdown_rx.await;
                })
                .await;
            reloader_task.stop().await;
            result
        });

        Self {
            client: IpcClient::new(&config.socket_path).with_timeout(Duration::from_secs(10)),
            _dir: dir,
            config,
            calls,
            shutdown: Some(shutdown_tx),
            state,
            handle,
        }
    }

    async fn stop(mut self) -> ServerConfig {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.handle.await.unwrap().unwrap();
        assert_eq!(*self.state.borrow(), ServerState::Stopped);
        self.config.clone()
    }
}

fn discovery(host: &str) -> ClientMessage {
    ClientMessage::Automation {
        name: "check_discovery".to_string(),
        args: json!({ "host": host }),
    }
}

#[tokio::test]
async fn test_config_from_file() {
    let config_content = r#"
site_root = "/omd/sites/test"

[cache]
ttl_secs = 30

[automations.check_discovery]
command = "/usr/bin/cmk"
args = ["--automation", "inventory"]
"#;

    let mut temp_file = NamedTempFile::new().expect("Failed to create temp file");
    temp_file
        .write_all(config_content.as_bytes())
        .expect("Failed to write to temp file");
    let temp_path = temp_file.path().to_str().unwrap();

    let config = Config::load(temp_path).await.expect("Failed to load config");

    assert_eq!(config.cache.ttl_secs, 30);
    assert!(config.automations.contains_key("check_discovery"));
    assert_eq!(config.watch_schedule().len(), 3);
}

#[tokio::test]
async fn test_identical_requests_hit_cache() {
    let server = TestServer::start(Duration::ZERO).await;

    let first = server.client.send(&discovery("srv1")).await.unwrap();
    let second = server.client.send(&discovery("srv1")).await.unwrap();

    match (first, second) {
        (
            DaemonResponse::Success { payload: fresh, cached: false },
            DaemonResponse::Success { payload: cached, cached: true },
        ) => assert_eq!(fresh, cached),
        other => panic!("unexpected responses: {other:?}"),
    }
    assert_eq!(server.calls.load(Ordering::SeqCst), 1);

    server.client.send(&discovery("srv2")).await.unwrap();
    assert_eq!(server.calls.load(Ordering::SeqCst), 2);

    server.stop().await;
}

#[tokio::test]
async fn test_failures_are_reported_and_not_cached() {
    let server = TestServer::start(Duration::ZERO).await;
    let broken = ClientMessage::Automation {
        name: "broken".to_string(),
        args: json!({}),
    };

    for _ in 0..2 {
        match server.client.send(&broken).await.unwrap() {
            DaemonResponse::Error { message } => assert!(message.contains("host unreachable")),
            other => panic!("expected error, got {other:?}"),
        }
    }
    assert_eq!(server.calls.load(Ordering::SeqCst), 2);

    let unknown = ClientMessage::Automation {
        name: "nope".to_string(),
        args: json!({}),
    };
    assert!(matches!(
        server.client.send(&unknown).await.unwrap(),
        DaemonResponse::Error { .. }
    ));

    server.stop().await;
}

#[tokio::test]
async fn test_reload_invalidates_and_swaps_application() {
    let server = TestServer::start(Duration::ZERO).await;

    server.client.send(&discovery("srv1")).await.unwrap();
    let accepted = server.client.send(&ClientMessage::Reload).await.unwrap();
    assert!(matches!(accepted, DaemonResponse::Accepted { .. }));

    let report = wait_for_reload(&server.client, 2).await;
    assert_eq!(report.reloader.reloads, 1);
    assert_eq!(report.cache_generation, 1);
    assert_eq!(report.state, "running");

    match server.client.send(&discovery("srv1")).await.unwrap() {
        DaemonResponse::Success { cached, .. } => assert!(!cached),
        other => panic!("unexpected response: {other:?}"),
    }
    assert_eq!(server.calls.load(Ordering::SeqCst), 2);

    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_requests_are_served() {
    let server = TestServer::start(Duration::from_millis(50)).await;

    let requests = (0..8).map(|i| {
        let client = server.client.clone();
        async move { client.send(&discovery(&format!("srv{i}"))).await }
    });
    let responses = futures::future::join_all(requests).await;

    assert!(responses
        .into_iter()
        .all(|response| matches!(response, Ok(DaemonResponse::Success { cached: false, .. }))));
    assert_eq!(server.calls.load(Ordering::SeqCst), 8);

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_and_cleans_up() {
    let server = TestServer::start(Duration::from_millis(300)).await;
    assert!(server.config.pid_file.exists());
    assert!(server.config.socket_path.exists());

    let client = server.client.clone();
    let in_flight = tokio::spawn(async move { client.send(&discovery("srv1")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let config = server.stop().await;

    let response = in_flight.await.unwrap().unwrap();
    assert!(matches!(response, DaemonResponse::Success { .. }));
    assert!(!config.pid_file.exists());
    assert!(!config.socket_path.exists());
}

fn run_dir_config(dir: &Path) -> ServerConfig {
    ServerConfig {
        socket_path: dir.join("helper.sock"),
        pid_file: dir.join("helper.pid"),
        access_log: dir.join("access.log"),
        error_log: dir.join("error.log"),
        workers: 1,
        shutdown_grace: Duration::from_secs(1),
    }
}

/// A server that is constructed but never run
async fn idle_server(config: ServerConfig) -> IpcServer {
    let cache = Arc::new(ResultCache::new(Arc::new(MemoryStore::new()), "it", Duration::from_secs(30)));
    let factory = Arc::new(TestFactory::new(
        Arc::clone(&cache),
        Arc::new(AtomicUsize::new(0)),
        Duration::ZERO,
        None,
    ));
    let app = Arc::new(ApplicationHandle::new(factory.build().await.unwrap()));
    let (trigger, _instructions) = reload_channel();
    let reloader = ConfigReloader::new(Arc::clone(&cache), trigger, Duration::from_millis(50));
    let context = Arc::new(ServerContext::new(app, cache, reloader.requester(), reloader.stats()));

    IpcServer::new(config, context, factory)
}

#[tokio::test]
async fn test_stale_socket_is_replaced() {
    let dir = tempdir().unwrap();
    let config = run_dir_config(dir.path());
    std::fs::write(&config.socket_path, "left over").unwrap();

    let server = idle_server(config.clone()).await;
    let bound = server.bind().expect("stale socket file must not block binding");
    assert_eq!(bound.socket_path(), config.socket_path.as_path());

    drop(bound);
    assert!(!config.socket_path.exists());
}

#[tokio::test]
async fn test_second_instance_leaves_running_socket_alone() {
    let dir = tempdir().unwrap();
    let config = run_dir_config(dir.path());

    // Another live process owns the PID file and is listening
    let running = tokio::net::UnixListener::bind(&config.socket_path).unwrap();
    std::fs::write(&config.pid_file, "1\n").unwrap();

    let server = idle_server(config.clone()).await;
    let refused = server.bind();
    assert!(refused.is_err());
    assert!(format!("{:#}", refused.err().unwrap()).contains("another instance is running"));

    assert!(config.socket_path.exists());
    assert_eq!(std::fs::read_to_string(&config.pid_file).unwrap(), "1\n");
    let connected = tokio::net::UnixStream::connect(&config.socket_path).await;
    assert!(connected.is_ok(), "running instance must stay reachable");
    drop(running);
}

#[tokio::test]
async fn test_requests_served_while_application_rebuilds() {
    let gate = Arc::new(Notify::new());
    let server = TestServer::start_with(Duration::ZERO, Some(Arc::clone(&gate))).await;

    server.client.send(&ClientMessage::Reload).await.unwrap();
    wait_for_state(&server.client, "reloading").await;

    match server.client.send(&discovery("srv1")).await.unwrap() {
        DaemonResponse::Success { cached: false, .. } => {}
        other => panic!("unexpected response during rebuild: {other:?}"),
    }

    gate.notify_one();
    let report = wait_for_reload(&server.client, 2).await;
    assert_eq!(report.state, "running");

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_not_blocked_by_rebuild() {
    let gate = Arc::new(Notify::new());
    let server = TestServer::start_with(Duration::ZERO, Some(gate)).await;

    server.client.send(&ClientMessage::Reload).await.unwrap();
    wait_for_state(&server.client, "reloading").await;

    let config = tokio::time::timeout(Duration::from_secs(5), server.stop())
        .await
        .expect("shutdown must not wait for a stuck rebuild");
    assert!(!config.socket_path.exists());
    assert!(!config.pid_file.exists());
}

async fn wait_for_state(client: &IpcClient, state: &str) {
    for _ in 0..100 {
        if let Ok(DaemonResponse::Health(report)) = client.send(&ClientMessage::Health).await {
            if report.state == state {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("server never reached state {state}");
}

/// Poll health until a reload has fully completed
async fn wait_for_reload(client: &IpcClient, generation: u64) -> HealthReport {
    for _ in 0..100 {
        if let Ok(DaemonResponse::Health(report)) = client.send(&ClientMessage::Health).await {
            if report.app_generation >= generation && report.reloader.reloads >= 1 && report.last_reload.is_some() {
                return report;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("application generation {generation} never appeared");
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..100 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("socket {path:?} never appeared");
}

fn count_lines(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|content| content.lines().count())
        .unwrap_or(0)
}

/// Full daemon: watched file change -> reload -> cache miss
#[tokio::test]
async fn test_watched_change_reexecutes_automation() {
    let dir = tempdir().unwrap();
    let site = dir.path();
    let etc = site.join("etc");
    std::fs::create_dir_all(&etc).unwrap();
    std::fs::write(etc.join("main.mk"), "all_hosts = []").unwrap();
    let calls_file = site.join("calls");

    let config_path = site.join("config.toml");
    let config_content = format!(
        r#"
site_root = '{site}'

[server]
workers = 2
shutdown_grace_secs = 2

[cache]
ttl_secs = 30

[reloader]
debounce_ms = 100

[[watcher.targets]]
path = "etc"
interval_ms = 50
patterns = ["*.mk"]

[automations.check_discovery]
command = "sh"
args = ["-c", "echo x >> '{calls}'; cat"]
"#,
        site = site.display(),
        calls = calls_file.display(),
    );
    std::fs::write(&config_path, config_content).unwrap();

    let config = Config::load(config_path.to_str().unwrap()).await.unwrap();
    let server_config = config.server_config();
    let daemon = Daemon::new(config, Some(config_path.clone()));

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(daemon.run_until(async {
        let _ = shutdown_rx.await;
    }));

    wait_for_socket(&server_config.socket_path).await;
    let client = IpcClient::new(&server_config.socket_path).with_timeout(Duration::from_secs(10));

    let first = client.send(&discovery("srv1")).await.unwrap();
    let second = client.send(&discovery("srv1")).await.unwrap();
    assert_eq!(
        first,
        DaemonResponse::Success {
            payload: r#"{"host":"srv1"}"#.to_string(),
            cached: false
        }
    );
    assert_eq!(
        second,
        DaemonResponse::Success {
            payload: r#"{"host":"srv1"}"#.to_string(),
            cached: true
        }
    );
    assert_eq!(count_lines(&calls_file), 1);

    // Give the watcher time to record its baseline
    tokio::time::sleep(Duration::from_millis(200)).await;
    std::fs::write(etc.join("main.mk"), "all_hosts = ['srv1', 'srv2']").unwrap();

    let report = wait_for_reload(&client, 2).await;
    assert_eq!(report.reloader.reloads, 1);
    assert!(report.last_reload.is_some());

    let third = client.send(&discovery("srv1")).await.unwrap();
    assert!(matches!(third, DaemonResponse::Success { cached: false, .. }));
    assert_eq!(count_lines(&calls_file), 2);

    shutdown_tx.send(()).unwrap();
    running.await.unwrap().unwrap();

    assert!(!server_config.pid_file.exists());
    assert!(!server_config.socket_path.exists());
}

#[tokio::test]
async fn test_unreachable_redis_is_fatal_and_leaves_nothing_behind() {
    let dir = tempdir().unwrap();
    let config = Config::from_toml_str(&format!(
        r#"
site_root = '{site}'

[cache]
backend = "redis"
redis_url = 'unix://{site}/no-redis.sock'
"#,
        site = dir.path().display(),
    ))
    .unwrap();
    let server_config = config.server_config();

    let result = tokio::time::timeout(
        Duration::from_secs(30),
        Daemon::new(config, None).run_until(std::future::pending()),
    )
    .await
    .expect("startup must fail instead of hanging");

    let error = format!("{:#}", result.unwrap_err());
    assert!(error.contains("unreachable"), "{error}");
    assert!(!server_config.socket_path.exists());
    assert!(!server_config.pid_file.exists());
}
