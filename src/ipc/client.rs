use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

use crate::ipc::protocol::{read_frame, write_frame, ClientMessage, DaemonResponse};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// One-request-per-connection client for the daemon socket
#[derive(Debug, Clone)]
pub struct IpcClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl IpcClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn send(&self, message: &ClientMessage) -> Result<DaemonResponse> {
        timeout(self.timeout, self.exchange(message))
            .await
            .map_err(|_| anyhow::anyhow!("Daemon did not answer within {:?}", self.timeout))?
    }

    async fn exchange(&self, message: &ClientMessage) -> Result<DaemonResponse> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("Failed to connect to {:?}", self.socket_path))?;

        debug!("📤 Sending {:?}", message);
        write_frame(&mut stream, message).await?;
        let response = read_frame(&mut stream).await?;
        debug!("📨 Received {:?}", response);
        Ok(response)
    }
}
