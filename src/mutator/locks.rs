//! Path-keyed mutual exclusion for pipeline runs sharing a process.
//!
//! Two runs targeting the same file are serialized from `Modifying` through
//! `Committing` / `RollingBack`: the guard lives inside the `Modification` and
//! is released when it is dropped, on every exit path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use crate::error::{PipelineError, PipelineResult};

#[derive(Clone, Default)]
pub struct FileLocks {
    inner: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

/// Held lock on one path.
#[derive(Debug)]
pub struct FileLockGuard {
    path: PathBuf,
    _guard: OwnedMutexGuard<()>,
}

impl FileLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for, then take, the lock on `path` (expected to be canonical).
    pub async fn acquire(&self, path: &Path) -> PipelineResult<FileLockGuard> {
        let slot = {
            let mut map = self
                .inner
                .lock()
                .map_err(|_| PipelineError::modification("file lock registry poisoned"))?;
            // drop slots nobody holds or waits on
            map.retain(|_, m| Arc::strong_count(m) > 1);
            Arc::clone(map.entry(path.to_path_buf()).or_default())
        };
        let guard = slot.lock_owned().await;
        tracing::debug!(target: "autopatch::mutator", path = %path.display(), "file lock acquired");
        Ok(FileLockGuard { path: path.to_path_buf(), _guard: guard })
    }

    /// Number of paths currently tracked.
    pub fn tracked(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }
}
