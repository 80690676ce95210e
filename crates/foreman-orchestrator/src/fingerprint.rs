use async_trait::async_trait;
use foreman_core::{ForemanError, ForemanResult};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Change-detection digest of a watched resource set. Compared by equality only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the current fingerprint of whatever an observer watches.
#[async_trait]
pub trait Fingerprinter: Send + Sync {
    /// `Ok(None)` means there is nothing to review yet.
    async fn fingerprint(&self) -> ForemanResult<Option<Fingerprint>>;
}

/// Fingerprints files and directory trees by path, mtime, and size.
pub struct FileFingerprinter {
    root: PathBuf,
    paths: Vec<PathBuf>,
}

impl FileFingerprinter {
    /// Relative `paths` are resolved against `root`.
    pub fn new(root: impl Into<PathBuf>, paths: Vec<PathBuf>) -> Self {
        Self {
            root: root.into(),
            paths,
        }
    }

    async fn collect(&self) -> ForemanResult<Vec<String>> {
        let mut entries = Vec::new();
        let mut pending: Vec<PathBuf> = self.paths.iter().map(|p| self.root.join(p)).collect();

        while let Some(path) = pending.pop() {
            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&path, e)),
            };

            if meta.is_dir() {
                let mut dir = match tokio::fs::read_dir(&path).await {
                    Ok(dir) => dir,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(io_error(&path, e)),
                };
                while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(&path, e))? {
                    pending.push(entry.path());
                }
            } else if meta.is_file() {
                let mtime = meta
                    .modified()
                    .map_err(|e| io_error(&path, e))?
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos())
                    .unwrap_or(0);
                let display = path.strip_prefix(&self.root).unwrap_or(path.as_path()).display();
                entries.push(format!("{display}:{mtime}:{}", meta.len()));
            }
        }

        entries.sort();
        entries.dedup();
        Ok(entries)
    }
}

fn io_error(path: &Path, e: std::io::Error) -> ForemanError {
    ForemanError::Io(std::io::Error::new(
        e.kind(),
        format!("{}: {e}", path.display()),
    ))
}

#[async_trait]
impl Fingerprinter for FileFingerprinter {
    async fn fingerprint(&self) -> ForemanResult<Option<Fingerprint>> {
        let entries = self.collect().await?;
        if entries.is_empty() {
            return Ok(None);
        }
        let mut hasher = Sha256::new();
        for entry in &entries {
            hasher.update(entry.as_bytes());
            hasher.update(b"\n");
        }
        Ok(Some(Fingerprint(hex::encode(hasher.finalize()))))
    }
}
