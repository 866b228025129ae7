use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{WatchSchedule, WatchTarget};
use crate::core::task::{BackgroundTask, ShutdownSignal};

/// Why a reload was requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOrigin {
    ConfigChanged(PathBuf),
    Hangup,
    Client,
    /// A lagging subscriber skipped this many signals
    Missed(u64),
}

/// "Something changed"; the origin is only used for logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSignal {
    pub origin: SignalOrigin,
}

impl ChangeSignal {
    pub fn new(origin: SignalOrigin) -> Self {
        Self { origin }
    }
}

/// Summary of the files below a watched path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signature {
    pub files: usize,
    pub total_len: u64,
    pub newest: Option<SystemTime>,
}

/// Polling state for one watch target
pub struct TargetState {
    target: WatchTarget,
    patterns: Option<GlobSet>,
    recorded: Option<Signature>,
}

impl TargetState {
    pub fn new(target: WatchTarget) -> Result<Self> {
        let patterns = if target.patterns.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in &target.patterns {
                builder.add(
                    Glob::new(pattern).with_context(|| format!("Invalid glob pattern '{pattern}'"))?,
                );
            }
            Some(builder.build().context("Failed to build globset")?)
        };

        Ok(Self {
            target,
            patterns,
            recorded: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.target.path
    }

    /// Compare the current signature with the recorded one.
    ///
    /// The first successful check only records a baseline. Read failures
    /// count as "no change" and keep the recorded signature.
    pub fn check(&mut self) -> Option<ChangeSignal> {
        let reading = compute_signature(&self.target, self.patterns.as_ref());
        self.observe(reading)
    }

    fn observe(&mut self, reading: std::io::Result<Signature>) -> Option<ChangeSignal> {
        let current = match reading {
            Ok(signature) => signature,
            Err(e) => {
                warn!("⚠️  Failed to read {:?}, retrying next tick: {}", self.target.path, e);
                return None;
            }
        };

        match self.recorded.replace(current) {
            None => {
                debug!("📸 Baseline for {:?}: {:?}", self.target.path, current);
                None
            }
            Some(previous) if previous == current => None,
            Some(previous) => {
                debug!("🔍 {:?} changed: {:?} -> {:?}", self.target.path, previous, current);
                Some(ChangeSignal::new(SignalOrigin::ConfigChanged(self.target.path.clone())))
            }
        }
    }
}

fn compute_signature(target: &WatchTarget, patterns: Option<&GlobSet>) -> std::io::Result<Signature> {
    let mut signature = Signature::default();

    if !target.path.exists() {
        return Ok(signature);
    }

    let max_depth = if target.recursive { usize::MAX } else { 1 };
    for entry in WalkDir::new(&target.path).max_depth(max_depth) {
        let entry = entry.map_err(std::io::Error::from)?;
        let is_dir = entry.file_type().is_dir();
        if is_dir && (target.ignore_directories || entry.depth() == 0) {
            continue;
        }

        if let Some(patterns) = patterns {
            if !patterns.is_match(entry.file_name()) {
                continue;
            }
        }

        let metadata = entry.metadata().map_err(std::io::Error::from)?;
        signature.files += 1;
        signature.total_len += metadata.len();
        if let Ok(modified) = metadata.modified() {
            signature.newest = Some(signature.newest.map_or(modified, |newest| newest.max(modified)));
        }
    }

    Ok(signature)
}

/// Polls a watch schedule and broadcasts change signals
pub struct ConfigWatcher {
    schedule: WatchSchedule,
    sender: broadcast::Sender<ChangeSignal>,
}

impl ConfigWatcher {
    pub fn new(schedule: WatchSchedule) -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { schedule, sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeSignal> {
        self.sender.subscribe()
    }

    /// Start one polling loop per target
    pub fn spawn(self) -> Result<BackgroundTask> {
        let mut task = BackgroundTask::new("config watcher");

        for target in self.schedule {
            let state = TargetState::new(target)?;
            info!(
                "👀 Watching {:?} every {:?}",
                state.target.path, state.target.interval
            );
            let sender = self.sender.clone();
            let shutdown = task.shutdown_signal();
            task.spawn(poll_target(state, sender, shutdown));
        }

        Ok(task)
    }
}

async fn poll_target(
    mut state: TargetState,
    sender: broadcast::Sender<ChangeSignal>,
    mut shutdown: ShutdownSignal,
) {
    let mut interval = tokio::time::interval(state.target.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.requested() => break,
            _ = interval.tick() => {
                let (returned, signal) = match tokio::task::spawn_blocking(move || {
                    let signal = state.check();
                    (state, signal)
                })
                .await
                {
                    Ok(checked) => checked,
                    Err(e) => {
                        warn!("⚠️  Watcher check panicked, stopping this target: {}", e);
                        return;
                    }
                };
                state = returned;

                if let Some(signal) = signal {
                    info!("📁 Config changed: {:?}", state.path());
                    // No receivers just means nobody is listening yet
                    let _ = sender.send(signal);
                }
            }
        }
    }

    debug!("👋 Stopped watching {:?}", state.path());
}
