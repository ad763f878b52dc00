use chrono::{Datelike, Utc};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;

use crate::error::{MediaError, MediaResult};

/// Filesystem handoff area for async local uploads. Files land under
/// `{root}/YYYY/MM/DD/{unix}_{8hex}_{name}` and live until the worker that
/// processed them deletes them (or `cleanup` sweeps them by age).
#[derive(Debug, Clone)]
pub struct TempSpool {
    root: PathBuf,
}

impl TempSpool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        TempSpool { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Park an uploaded payload, deriving the suffix from the client-supplied
    /// file name.
    pub async fn save_upload(&self, bytes: &[u8], name: &str) -> MediaResult<PathBuf> {
        self.save(bytes, &sanitize_file_name(name)).await
    }

    /// Park a payload under a bare extension, for callers without a name.
    pub async fn save_bytes(&self, bytes: &[u8], ext: &str) -> MediaResult<PathBuf> {
        self.save(bytes, &sanitize_file_name(ext)).await
    }

    async fn save(&self, bytes: &[u8], suffix: &str) -> MediaResult<PathBuf> {
        let now = Utc::now();
        let dir = self
            .root
            .join(format!("{:04}", now.year()))
            .join(format!("{:02}", now.month()))
            .join(format!("{:02}", now.day()));
        fs::create_dir_all(&dir).await?;

        let file_name = format!(
            "{}_{:08x}_{}",
            now.timestamp(),
            rand::random::<u32>(),
            suffix
        );
        let path = dir.join(file_name);
        fs::write(&path, bytes).await?;
        debug!("spooled {} bytes to {}", bytes.len(), path.display());
        Ok(path)
    }

    pub async fn read(&self, path: &Path) -> MediaResult<Vec<u8>> {
        Ok(fs::read(path).await?)
    }

    /// Best-effort removal; failures are logged and swallowed.
    pub async fn delete(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to delete spool file {}: {e}", path.display());
            }
        }
    }

    /// Remove files older than the cutoff and prune directories emptied by
    /// the sweep. Returns the number of files deleted.
    pub async fn cleanup(&self, older_than_hours: u64) -> MediaResult<usize> {
        let root = self.root.clone();
        let cutoff = SystemTime::now() - Duration::from_secs(older_than_hours * 3600);
        tokio::task::spawn_blocking(move || sweep(&root, cutoff)).await.map_err(|e| {
            MediaError::SpoolFailed {
                reason: format!("cleanup task failed: {e}"),
            }
        })
    }
}

fn sweep(root: &Path, cutoff: SystemTime) -> usize {
    let mut deleted = 0;
    let mut dirs = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cleanup: cannot read {}: {e}", dir.display());
                continue;
            }
        };
        if dir != root {
            dirs.push(dir.clone());
        }
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|mtime| mtime < cutoff)
                .unwrap_or(false);
            if expired {
                match std::fs::remove_file(&path) {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!("cleanup: cannot delete {}: {e}", path.display()),
                }
            }
        }
    }

    // Deepest directories first; rmdir only succeeds on empty ones.
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        let _ = std::fs::remove_dir(&dir);
    }

    deleted
}

fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches(['.', '_']).is_empty() {
        "bin".to_string()
    } else {
        cleaned
    }
}
