//! Automation helper - a local daemon that serves automation commands
//!
//! Requests arrive over a Unix socket, results are memoized in a result
//! cache, and the application is rebuilt whenever watched configuration
//! changes.

pub mod config;
pub mod core;
pub mod ipc;
pub mod logging;

// Re-export commonly used types
pub use config::Config;
pub use core::daemon::Daemon;
