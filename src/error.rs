//! Crate-wide error taxonomy.
//!
//! Every pipeline phase returns `Result<T, PipelineError>` carrying exactly one
//! error kind. The orchestrator inspects [`PipelineError::kind`] to decide
//! whether a failure triggers rollback and which exit code the CLI reports.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// All errors that can arise while turning a proposal into a committed change.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Neither the completion provider nor the heuristic extractor produced a
    /// usable specification.
    #[error("parse error: {0}")]
    Parse(String),

    /// The target escapes the repository root, or a disallowed symbol, kind or
    /// code fragment was requested. Raised before any file I/O.
    #[error("security violation: {0}")]
    SecurityViolation(String),

    /// The structural/textual edit failed, the candidate does not parse, or the
    /// change was judged high risk without an explicit override.
    #[error("modification error: {message}")]
    Modification {
        message: String,
        /// `true` when a backup existed and the target was restored from it.
        restored: bool,
    },

    /// Generated test, regression suite or specification bounds check failed.
    #[error("validation failure: {0}")]
    Validation(String),

    /// Branch or commit failed after validation succeeded.
    #[error("git error: {0}")]
    Git(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cache store error: {0}")]
    Store(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn modification(message: impl Into<String>) -> Self {
        PipelineError::Modification { message: message.into(), restored: false }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io { path: path.into(), source }
    }

    /// Stable classification used for rollback policy and exit codes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Parse(_) => ErrorKind::Parse,
            PipelineError::SecurityViolation(_) => ErrorKind::SecurityViolation,
            PipelineError::Modification { .. } => ErrorKind::Modification,
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::Git(_) => ErrorKind::Git,
            PipelineError::Config(_) | PipelineError::Store(_) | PipelineError::Io { .. } => {
                ErrorKind::General
            }
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Store(err.to_string())
    }
}

/// Coarse error classification carried into the execution report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Parse,
    SecurityViolation,
    Modification,
    Validation,
    Git,
    General,
}

impl ErrorKind {
    /// Process exit code surfaced by the CLI.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Parse | ErrorKind::SecurityViolation => 2,
            ErrorKind::Modification => 3,
            ErrorKind::Validation => 4,
            ErrorKind::Git => 5,
            ErrorKind::General => 1,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Parse => write!(f, "parse_error"),
            ErrorKind::SecurityViolation => write!(f, "security_violation"),
            ErrorKind::Modification => write!(f, "modification_error"),
            ErrorKind::Validation => write!(f, "validation_failure"),
            ErrorKind::Git => write!(f, "git_error"),
            ErrorKind::General => write!(f, "error"),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_match_cli_contract() {
        assert_eq!(ErrorKind::General.exit_code(), 1);
        assert_eq!(ErrorKind::Parse.exit_code(), 2);
        assert_eq!(ErrorKind::SecurityViolation.exit_code(), 2);
        assert_eq!(ErrorKind::Modification.exit_code(), 3);
        assert_eq!(ErrorKind::Validation.exit_code(), 4);
        assert_eq!(ErrorKind::Git.exit_code(), 5);
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(PipelineError::Parse("x".into()).kind(), ErrorKind::Parse);
        assert_eq!(PipelineError::modification("x").kind(), ErrorKind::Modification);
        assert_eq!(PipelineError::Store("x".into()).kind(), ErrorKind::General);
        let io = PipelineError::io("a.py", std::io::Error::other("boom"));
        assert_eq!(io.kind(), ErrorKind::General);
    }

    #[test]
    fn test_display_carries_message() {
        let e = PipelineError::SecurityViolation("target escapes root".into());
        assert!(e.to_string().contains("target escapes root"));
        let e = PipelineError::Modification { message: "bad syntax".into(), restored: true };
        assert_eq!(e.to_string(), "modification error: bad syntax");
    }
}
