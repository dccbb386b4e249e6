//! # Stage: Syntax Mutator
//!
//! ## Responsibility
//! Apply one [`Specification`] to its target file:
//!
//! 1. Confine the target under the working directory (before any I/O that
//!    could write)
//! 2. Take the path lock, then snapshot the file into a [`Backup`]
//! 3. Plan a span edit through the language adapter; structural where the
//!    value is a literal, scoped-textual inside the declaration otherwise
//! 4. Re-parse the candidate and score it with the [`SafetyValidator`]
//! 5. Write the candidate atomically
//!
//! ## Guarantees
//! - Exactly one write to the target on success, zero net writes on failure
//! - A syntax failure is fatal even with the high-risk override
//! - The returned [`Modification`] holds the path lock until it is released
//!   or rolled back
//!
//! ## NOT Responsible For
//! - Deciding to roll back after validation (see the orchestrator)

pub mod backup;
pub mod locks;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::config::MutatorConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::lang::{AdapterRegistry, EditStrategy};
use crate::safety::{RiskAssessment, SafetyValidator};
use crate::spec::{confine_relative, ChangeKind, Specification};

pub use backup::{write_atomic, Backup};
pub use locks::{FileLockGuard, FileLocks};

// ---------------------------------------------------------------------------
// Modification
// ---------------------------------------------------------------------------

/// A change that has been written to disk and not yet committed or undone.
#[derive(Debug)]
pub struct Modification {
    pub backup: Backup,
    /// Absolute, canonical path of the modified file.
    pub modified_path: PathBuf,
    /// The same path relative to the working directory.
    pub relative_path: PathBuf,
    pub risk: RiskAssessment,
    pub strategy: EditStrategy,
    lock: FileLockGuard,
}

/// Serializable summary of a modification, for reports.
#[derive(Debug, Clone, Serialize)]
pub struct ModificationSummary {
    pub modified_path: PathBuf,
    pub backup_file: PathBuf,
    pub original_hash: String,
    pub strategy: String,
}

impl Modification {
    pub fn summary(&self) -> ModificationSummary {
        ModificationSummary {
            modified_path: self.relative_path.clone(),
            backup_file: self.backup.backup_file().to_path_buf(),
            original_hash: self.backup.content_hash().to_string(),
            strategy: self.strategy.to_string(),
        }
    }

    pub fn locked_path(&self) -> &Path {
        self.lock.path()
    }

    /// Restore the original bytes and delete the consumed backup. Returns
    /// whether the target had to be rewritten. The lock is released on return.
    pub fn roll_back(self) -> PipelineResult<bool> {
        let rewritten = self.backup.restore()?;
        if let Err(e) = self.backup.discard() {
            tracing::warn!(target: "autopatch::mutator", error = %e, "could not delete consumed backup");
        }
        Ok(rewritten)
    }

    /// Keep the change; the backup stays on disk for audit. Releases the lock.
    pub fn release(self) -> Backup {
        self.backup
    }
}

// ---------------------------------------------------------------------------
// SyntaxMutator
// ---------------------------------------------------------------------------

pub struct SyntaxMutator {
    config: MutatorConfig,
    safety: Arc<SafetyValidator>,
    adapters: AdapterRegistry,
    locks: FileLocks,
}

impl SyntaxMutator {
    pub fn new(
        config: MutatorConfig,
        safety: Arc<SafetyValidator>,
        adapters: AdapterRegistry,
        locks: FileLocks,
    ) -> Self {
        Self { config, safety, adapters, locks }
    }

    /// Canonical absolute path of `spec.target_file()` under `working_dir`.
    /// Lexical escapes and symlinks leading outside the root are security
    /// violations; nothing is written.
    pub fn confine(&self, spec: &Specification, working_dir: &Path) -> PipelineResult<PathBuf> {
        let relative = confine_relative(spec.target_file()).map_err(PipelineError::SecurityViolation)?;
        let root = working_dir
            .canonicalize()
            .map_err(|e| PipelineError::io(working_dir, e))?;
        let joined = root.join(&relative);
        let canonical = joined.canonicalize().map_err(|e| {
            PipelineError::modification(format!("target {} is not readable: {e}", joined.display()))
        })?;
        if !canonical.starts_with(&root) {
            return Err(PipelineError::SecurityViolation(format!(
                "target {} resolves outside {}",
                spec.target_file().display(),
                root.display()
            )));
        }
        if !canonical.is_file() {
            return Err(PipelineError::modification(format!(
                "target {} is not a regular file",
                canonical.display()
            )));
        }
        Ok(canonical)
    }

    pub async fn modify(
        &self,
        spec: &Specification,
        working_dir: &Path,
        allow_high_risk: bool,
    ) -> PipelineResult<Modification> {
        let path = self.confine(spec, working_dir)?;
        let adapter = self.adapters.for_path(&path).ok_or_else(|| {
            PipelineError::modification(format!("no language adapter for {}", path.display()))
        })?;

        let lock = self.locks.acquire(&path).await?;
        let backup_dir = working_dir.join(&self.config.backup_dir);
        let backup = Backup::of_file(&path, &backup_dir)?;

        let Ok(original) = std::str::from_utf8(backup.bytes()) else {
            return Err(abandon(&backup, "target is not valid UTF-8".into()));
        };

        let edit = match adapter.plan_edit(original, spec.target_symbol(), spec.change()) {
            Ok(edit) => edit,
            Err(e) => return Err(abandon(&backup, e.to_string())),
        };
        let candidate = match edit.apply(original) {
            Ok(c) => c,
            Err(e) => return Err(abandon(&backup, e.to_string())),
        };
        if candidate == original {
            return Err(abandon(&backup, "edit leaves the file unchanged".into()));
        }

        let risk = self.safety.assess(spec, original, &candidate);
        if !risk.syntax_valid {
            return Err(abandon(
                &backup,
                format!("candidate rejected (risk {:.2}): {}", risk.risk_score, risk.warnings.join("; ")),
            ));
        }
        if risk.is_high_risk(self.safety.high_risk_threshold()) {
            if !allow_high_risk {
                return Err(abandon(
                    &backup,
                    format!(
                        "high risk change (risk {:.2} >= {:.2}) without override: {}",
                        risk.risk_score,
                        self.safety.high_risk_threshold(),
                        risk.warnings.join("; ")
                    ),
                ));
            }
            tracing::warn!(
                target: "autopatch::mutator",
                proposal_id = %spec.proposal_id(),
                risk_score = risk.risk_score,
                "applying high risk change under explicit override"
            );
        }
        if let Some(message) = out_of_bounds(spec, adapter.as_ref(), &candidate) {
            return Err(abandon(&backup, message));
        }

        if let Err(e) = write_atomic(&path, candidate.as_bytes()) {
            return Err(abandon(&backup, format!("write failed: {e}")));
        }

        let relative_path = path
            .strip_prefix(working_dir.canonicalize().unwrap_or_else(|_| working_dir.to_path_buf()))
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| spec.target_file().to_path_buf());
        tracing::info!(
            target: "autopatch::mutator",
            proposal_id = %spec.proposal_id(),
            path = %relative_path.display(),
            strategy = %edit.strategy,
            risk_score = risk.risk_score,
            "modification written"
        );
        Ok(Modification {
            backup,
            modified_path: path,
            relative_path,
            risk,
            strategy: edit.strategy,
            lock,
        })
    }
}

/// Restore the target, drop the backup copy, and build the error.
fn abandon(backup: &Backup, message: String) -> PipelineError {
    let restored = match backup.restore() {
        Ok(_) => {
            if let Err(e) = backup.discard() {
                tracing::warn!(target: "autopatch::mutator", error = %e, "could not delete consumed backup");
            }
            true
        }
        Err(e) => {
            tracing::error!(
                target: "autopatch::mutator",
                path = %backup.source_path().display(),
                backup = %backup.backup_file().display(),
                error = %e,
                "restore failed; backup left in place"
            );
            false
        }
    };
    tracing::warn!(target: "autopatch::mutator", restored, "modification abandoned: {message}");
    PipelineError::Modification { message, restored }
}

/// Post-mutation check of the literal now on disk against the spec's bounds.
fn out_of_bounds(
    spec: &Specification,
    adapter: &dyn crate::lang::LanguageAdapter,
    candidate: &str,
) -> Option<String> {
    let rules = spec.validation_rules()?;
    let key = match spec.change() {
        ChangeKind::ConfigUpdate { key, .. } => Some(key.as_str()),
        ChangeKind::ParameterChange { .. } => None,
        _ => return None,
    };
    let value = adapter
        .read_value(candidate, spec.target_symbol(), key)?
        .literal?
        .as_f64()?;
    let below = rules.min.is_some_and(|min| value < min);
    let above = rules.max.is_some_and(|max| value > max);
    (below || above).then(|| format!("value on disk {value} is outside the declared bounds"))
}
