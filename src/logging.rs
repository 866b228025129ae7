use anyhow::{Context, Result};
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{filter_fn, LevelFilter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;

/// Target of the one-line-per-request access log events
pub const ACCESS_LOG_TARGET: &str = "automation_helper::access";

/// Keeps the file writers flushing; hold until exit
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

/// Install stderr, access log and error log outputs
pub fn init(server: &ServerConfig, log_level: &str) -> Result<LogGuards> {
    let log_dir = server.log_dir();
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {log_dir:?}"))?;

    let (access_writer, access_guard) = file_writer(&server.access_log)?;
    let (error_writer, error_guard) = file_writer(&server.error_log)?;

    let stderr_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("automation_helper={log_level}")));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(stderr_filter);

    let access_layer = tracing_subscriber::fmt::layer()
        .with_writer(access_writer)
        .with_ansi(false)
        .with_target(false)
        .with_filter(filter_fn(|metadata| metadata.target() == ACCESS_LOG_TARGET));

    let error_layer = tracing_subscriber::fmt::layer()
        .with_writer(error_writer)
        .with_ansi(false)
        .with_filter(LevelFilter::from_level(Level::WARN))
        .with_filter(filter_fn(|metadata| metadata.target() != ACCESS_LOG_TARGET));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(access_layer)
        .with(error_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogGuards {
        _guards: vec![access_guard, error_guard],
    })
}

fn file_writer(path: &Path) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("Log path {path:?} has no file name"))?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    Ok(tracing_appender::non_blocking(appender))
}
