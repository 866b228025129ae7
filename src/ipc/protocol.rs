use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::reloader::ReloaderSnapshot;

/// Upper bound on a single request or response frame
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the {max} byte limit", max = MAX_FRAME_LEN)]
    FrameTooLarge(usize),

    #[error("connection I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Messages sent from client to daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Run an automation command
    Automation {
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    /// Invalidate the cache and reload the application
    Reload,
    /// Get daemon health
    Health,
}

/// Responses sent from daemon to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DaemonResponse {
    /// Automation result, fresh or from the cache
    Success { payload: String, cached: bool },
    /// Command failed with error
    Error { message: String },
    /// Request queued for asynchronous processing
    Accepted { message: String },
    /// Health information
    Health(HealthReport),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub version: String,
    pub pid: u32,
    pub uptime_seconds: u64,
    pub state: String,
    pub app_generation: u64,
    pub cache_generation: u64,
    pub automations: Vec<String>,
    pub reloader: ReloaderSnapshot,
    pub last_change_detected: Option<u64>,
    pub last_reload: Option<u64>,
    pub reload_required: bool,
}

impl ClientMessage {
    /// Parse command line arguments into a ClientMessage
    pub fn from_args(command: &str, args: &[String]) -> anyhow::Result<Self> {
        match command {
            "run" => {
                let name = args
                    .first()
                    .ok_or_else(|| anyhow::anyhow!("Run command requires an automation name"))?;
                let args = match args.get(1) {
                    Some(raw) => serde_json::from_str(raw)
                        .map_err(|e| anyhow::anyhow!("Arguments must be JSON: {}", e))?,
                    None => serde_json::Value::Object(Default::default()),
                };
                Ok(ClientMessage::Automation {
                    name: name.clone(),
                    args,
                })
            }
            "reload" => Ok(ClientMessage::Reload),
            "health" | "status" => Ok(ClientMessage::Health),
            _ => Err(anyhow::anyhow!("Unknown command: {}", command)),
        }
    }
}

/// Read one length-prefixed JSON frame
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    // Message length first (4 bytes, little endian)
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let msg_len = u32::from_le_bytes(len_buf) as usize;
    if msg_len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(msg_len));
    }

    let mut msg_buf = vec![0u8; msg_len];
    reader.read_exact(&mut msg_buf).await?;
    Ok(serde_json::from_slice(&msg_buf)?)
}

/// Write one length-prefixed JSON frame
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = serde_json::to_vec(message)?;
    if data.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    writer.write_all(&(data.len() as u32).to_le_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}
