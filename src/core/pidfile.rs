use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("another instance is running with PID {pid} ({path:?})")]
    AlreadyRunning { pid: u32, path: PathBuf },

    #[error("failed to write PID file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// PID file that exists exactly as long as this guard.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write our PID to `path`, replacing a stale file from a dead process
    pub fn create(path: &Path) -> Result<Self, PidFileError> {
        let own_pid = std::process::id();
        if let Some(pid) = read_pid(path) {
            if pid != own_pid && is_process_alive(pid) {
                return Err(PidFileError::AlreadyRunning {
                    pid,
                    path: path.to_path_buf(),
                });
            }
            debug!("🧹 Replacing stale PID file {:?} (pid {})", path, pid);
        }

        write_atomic(path, format!("{own_pid}\n").as_bytes()).map_err(|source| PidFileError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        info!("📝 PID file written to {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("⚠️  Failed to remove PID file {:?}: {}", self.path, e);
            }
        } else {
            debug!("🧹 Removed PID file {:?}", self.path);
        }
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("pid.tmp");
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)
}

/// PID recorded in `path`, if the file exists and parses
pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks existence and permissions
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
