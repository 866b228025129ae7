use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::core::cache::{unix_now, ResultCache};
use crate::core::task::{BackgroundTask, ShutdownSignal};
use crate::core::watcher::{ChangeSignal, SignalOrigin};

const REQUEST_QUEUE: usize = 32;

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("reloader is not running")]
    ReloaderGone,

    #[error("server is not accepting reload instructions")]
    ServerGone,
}

/// Asks the reloader for a reload without waiting for the watcher
#[derive(Clone)]
pub struct ReloadRequester(mpsc::Sender<ChangeSignal>);

impl ReloadRequester {
    pub fn request(&self, origin: SignalOrigin) -> Result<(), ReloadError> {
        match self.0.try_send(ChangeSignal::new(origin)) {
            // A full queue already guarantees an upcoming reload
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ReloadError::ReloaderGone),
        }
    }
}

/// Reloader side of the reload instruction channel
#[derive(Clone)]
pub struct ReloadTrigger(mpsc::Sender<()>);

/// Server side of the reload instruction channel
pub type ReloadInstructions = mpsc::Receiver<()>;

impl ReloadTrigger {
    /// Fire-and-forget; at most one instruction is ever pending
    pub fn trigger(&self) -> Result<(), ReloadError> {
        match self.0.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => Err(ReloadError::ServerGone),
        }
    }
}

pub fn reload_channel() -> (ReloadTrigger, ReloadInstructions) {
    let (tx, rx) = mpsc::channel(1);
    (ReloadTrigger(tx), rx)
}

#[derive(Debug, Default)]
pub struct ReloaderStats {
    reloads: AtomicU64,
    coalesced: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloaderSnapshot {
    pub reloads: u64,
    pub coalesced: u64,
    pub failures: u64,
}

impl ReloaderStats {
    pub fn snapshot(&self) -> ReloaderSnapshot {
        ReloaderSnapshot {
            reloads: self.reloads.load(Ordering::SeqCst),
            coalesced: self.coalesced.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
        }
    }
}

/// Turns change signals into cache invalidation plus a server reload.
///
/// The first signal opens a debounce window; every signal inside the window
/// is folded into the same reload. Reloads run one at a time, and signals
/// arriving during a reload open the next window.
pub struct ConfigReloader {
    cache: Arc<ResultCache>,
    trigger: ReloadTrigger,
    debounce: Duration,
    stats: Arc<ReloaderStats>,
    requests_tx: mpsc::Sender<ChangeSignal>,
    requests_rx: mpsc::Receiver<ChangeSignal>,
}

impl ConfigReloader {
    pub fn new(cache: Arc<ResultCache>, trigger: ReloadTrigger, debounce: Duration) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE);
        Self {
            cache,
            trigger,
            debounce,
            stats: Arc::new(ReloaderStats::default()),
            requests_tx,
            requests_rx,
        }
    }

    pub fn requester(&self) -> ReloadRequester {
        ReloadRequester(self.requests_tx.clone())
    }

    pub fn stats(&self) -> Arc<ReloaderStats> {
        Arc::clone(&self.stats)
    }

    /// Run until stopped, consuming the watcher's signals and direct requests
    pub fn spawn(self, watcher: broadcast::Receiver<ChangeSignal>) -> BackgroundTask {
        let mut task = BackgroundTask::new("config reloader");
        let shutdown = task.shutdown_signal();

        let watcher_signals = BroadcastStream::new(watcher).map(|item| match item {
            Ok(signal) => signal,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                ChangeSignal::new(SignalOrigin::Missed(skipped))
            }
        });
        let signals = watcher_signals.merge(ReceiverStream::new(self.requests_rx));

        let worker = ReloadWorker {
            cache: self.cache,
            trigger: self.trigger,
            debounce: self.debounce,
            stats: self.stats,
        };
        // Keeps the request channel open for requesters created later
        let requests_tx = self.requests_tx;
        task.spawn(async move {
            let _requests_tx = requests_tx;
            worker.run(signals, shutdown).await;
        });

        info!("🔄 Config reloader started (debounce {:?})", self.debounce);
        task
    }
}

struct ReloadWorker {
    cache: Arc<ResultCache>,
    trigger: ReloadTrigger,
    debounce: Duration,
    stats: Arc<ReloaderStats>,
}

impl ReloadWorker {
    async fn run<S>(self, signals: S, mut shutdown: ShutdownSignal)
    where
        S: Stream<Item = ChangeSignal> + Send,
    {
        tokio::pin!(signals);
        let mut exhausted = false;

        loop {
            let first = tokio::select! {
                _ = shutdown.requested() => break,
                next = signals.next(), if !exhausted => match next {
                    Some(signal) => signal,
                    None => {
                        exhausted = true;
                        continue;
                    }
                },
            };

            let detected_at = unix_now();
            debug!("📨 Change signal received: {:?}", first.origin);

            let deadline = Instant::now() + self.debounce;
            loop {
                tokio::select! {
                    _ = shutdown.requested() => {
                        debug!("🛑 Shutdown during debounce window, skipping reload");
                        return;
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                    next = signals.next(), if !exhausted => match next {
                        Some(signal) => {
                            debug!("🔍 Coalescing change signal: {:?}", signal.origin);
                            self.stats.coalesced.fetch_add(1, Ordering::SeqCst);
                        }
                        None => exhausted = true,
                    },
                }
            }

            match self.reload(detected_at).await {
                Ok(()) => {
                    self.stats.reloads.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    self.stats.failures.fetch_add(1, Ordering::SeqCst);
                    error!("❌ Reload failed, server keeps its current application: {:#}", e);
                }
            }
        }

        debug!("👋 Config reloader exiting");
    }

    async fn reload(&self, detected_at: u64) -> Result<()> {
        if let Err(e) = self.cache.record_change_detected(detected_at).await {
            warn!("⚠️  Failed to record change timestamp: {}", e);
        }

        self.cache
            .invalidate_all()
            .await
            .context("Failed to invalidate result cache")?;
        self.trigger
            .trigger()
            .context("Failed to deliver reload instruction")?;

        if let Err(e) = self.cache.record_reload(unix_now()).await {
            warn!("⚠️  Failed to record reload timestamp: {}", e);
        }
        info!("⚡ Reload triggered");
        Ok(())
    }
}
