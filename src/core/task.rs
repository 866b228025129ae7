use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Receiving side of a shutdown request
#[derive(Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// Resolves once shutdown was requested or the owner is gone
    pub async fn requested(&mut self) {
        while !*self.0.borrow() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_requested(&self) -> bool {
        *self.0.borrow()
    }
}

/// A group of long-running tasks with a scoped lifetime.
///
/// `stop` asks them to finish and waits; dropping the handle aborts whatever
/// is still running.
pub struct BackgroundTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl BackgroundTask {
    pub fn new(name: &'static str) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name,
            shutdown,
            tasks: JoinSet::new(),
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal(self.shutdown.subscribe())
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub async fn stop(mut self) {
        debug!("🛑 Stopping {}", self.name);
        self.shutdown.send_replace(true);

        let drained = tokio::time::timeout(STOP_TIMEOUT, async {
            while let Some(result) = self.tasks.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        warn!("⚠️  {} task panicked: {}", self.name, e);
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!("⚠️  {} did not stop within {:?}, aborting", self.name, STOP_TIMEOUT);
            self.tasks.abort_all();
        }
        debug!("✅ {} stopped", self.name);
    }
}
