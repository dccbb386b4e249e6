//! Backups of target files taken before they are overwritten.
//!
//! A [`Backup`] keeps the original bytes in memory and mirrors them to
//! `{backup_dir}/{original_name}_{timestamp_ms}_{hash12}.bak`. Restoring writes
//! only when the file differs from the snapshot, so a failed mutation that never
//! reached the disk causes zero writes to the target.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::{PipelineError, PipelineResult};
use crate::spec::content_hash;

#[derive(Debug, Clone, Serialize)]
pub struct Backup {
    source_path: PathBuf,
    created_at_ms: u128,
    content_hash: String,
    #[serde(skip)]
    bytes: Vec<u8>,
    backup_file: PathBuf,
}

impl Backup {
    /// Snapshot `bytes` (the current content of `source_path`) into `backup_dir`.
    pub fn create(source_path: &Path, bytes: Vec<u8>, backup_dir: &Path) -> PipelineResult<Self> {
        let created_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let hash = content_hash(&bytes);
        let name = source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let backup_file = backup_dir.join(format!("{name}_{created_at_ms}_{}.bak", &hash[..12]));

        fs::create_dir_all(backup_dir).map_err(|e| PipelineError::io(backup_dir, e))?;
        write_atomic(&backup_file, &bytes)?;

        tracing::debug!(
            target: "autopatch::mutator",
            path = %source_path.display(),
            backup = %backup_file.display(),
            hash = %hash,
            "backup created"
        );
        Ok(Self {
            source_path: source_path.to_path_buf(),
            created_at_ms,
            content_hash: hash,
            bytes,
            backup_file,
        })
    }

    /// Read `source_path` and snapshot it.
    pub fn of_file(source_path: &Path, backup_dir: &Path) -> PipelineResult<Self> {
        let bytes = fs::read(source_path).map_err(|e| PipelineError::io(source_path, e))?;
        Self::create(source_path, bytes, backup_dir)
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn created_at_ms(&self) -> u128 {
        self.created_at_ms
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn backup_file(&self) -> &Path {
        &self.backup_file
    }

    /// Put the original bytes back. Returns `true` if the target had to be
    /// rewritten, `false` if it already matched.
    pub fn restore(&self) -> PipelineResult<bool> {
        match fs::read(&self.source_path) {
            Ok(current) if current == self.bytes => return Ok(false),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PipelineError::io(&self.source_path, e)),
        }
        write_atomic(&self.source_path, &self.bytes)?;
        tracing::info!(
            target: "autopatch::mutator",
            path = %self.source_path.display(),
            hash = %self.content_hash,
            "file restored from backup"
        );
        Ok(true)
    }

    /// Delete the on-disk copy once the backup has been consumed.
    pub fn discard(&self) -> PipelineResult<()> {
        match fs::remove_file(&self.backup_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::io(&self.backup_file, e)),
        }
    }
}

/// Write through a sibling temp file and rename, keeping the original file's
/// permissions when it exists.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> PipelineResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    let result = (|| -> std::io::Result<()> {
        fs::write(&tmp, bytes)?;
        if let Ok(meta) = fs::metadata(path) {
            fs::set_permissions(&tmp, meta.permissions())?;
        }
        fs::rename(&tmp, path)
    })();

    result.map_err(|e| {
        let _ = fs::remove_file(&tmp);
        PipelineError::io(path, e)
    })
}
