use foreman_core::{ForemanError, ForemanResult};
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Exclusive ownership of a queue directory, held through a pid file that is
/// removed on drop. A second opener fails instead of replaying a snapshot that
/// would silently diverge.
#[derive(Debug)]
pub(crate) struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    pub(crate) fn acquire(path: &Path) -> ForemanResult<Self> {
        // One retry after clearing a stale file left by a dead process.
        for _ in 0..2 {
            match try_acquire(path) {
                Ok(lock) => return Ok(lock),
                Err(LockState::HeldBy(pid)) => {
                    return Err(ForemanError::Store(format!(
                        "queue at {} is in use by pid {pid}",
                        path.parent().unwrap_or(path).display()
                    )))
                }
                Err(LockState::Stale(pid)) => {
                    warn!(path = %path.display(), pid, "Removing stale queue lock");
                    let _ = std::fs::remove_file(path);
                }
                Err(LockState::Unknown(reason)) => {
                    return Err(ForemanError::Store(format!(
                        "could not lock queue at {} ({reason}); remove the lock file if no foreman process is running",
                        path.display()
                    )))
                }
            }
        }
        Err(ForemanError::Store(format!(
            "could not lock queue at {}",
            path.display()
        )))
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[derive(Debug)]
enum LockState {
    HeldBy(u32),
    Stale(u32),
    Unknown(String),
}

fn try_acquire(path: &Path) -> Result<StoreLock, LockState> {
    match OpenOptions::new().create_new(true).write(true).open(path) {
        Ok(mut file) => {
            let pid = std::process::id();
            writeln!(file, "{pid}").map_err(|e| LockState::Unknown(e.to_string()))?;
            Ok(StoreLock {
                path: path.to_path_buf(),
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let mut contents = String::new();
            OpenOptions::new()
                .read(true)
                .open(path)
                .and_then(|mut file| file.read_to_string(&mut contents))
                .map_err(|e| LockState::Unknown(e.to_string()))?;
            match contents.trim().parse::<u32>() {
                Ok(pid) if is_process_running(pid) => Err(LockState::HeldBy(pid)),
                Ok(pid) => Err(LockState::Stale(pid)),
                Err(_) => Err(LockState::Unknown(format!(
                    "unreadable lock file contents {:?}",
                    contents.trim()
                ))),
            }
        }
        Err(e) => Err(LockState::Unknown(e.to_string())),
    }
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    true
}
