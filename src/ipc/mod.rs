pub mod client;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use protocol::{ClientMessage, DaemonResponse, HealthReport};
pub use server::{IpcServer, ServerContext, ServerState};
