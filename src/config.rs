//! Pipeline configuration.
//!
//! Loaded from TOML (`autopatch.toml` in the working directory, or an explicit
//! `--config` path). Every field has a default so an empty file, or no file at
//! all, yields a usable configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::providers::Provider;

/// File name looked up in the working directory when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "autopatch.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub parser: ParserConfig,
    pub safety: SafetyConfig,
    pub mutator: MutatorConfig,
    pub testing: TestingConfig,
    pub git: GitConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(raw: &str) -> PipelineResult<Self> {
        toml::from_str(raw).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Load `path`, failing if it does not exist or does not parse.
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        Self::from_toml_str(&raw)
    }

    /// Load `explicit` if given, else `<working_dir>/autopatch.toml` if present,
    /// else defaults.
    pub fn discover(explicit: Option<&Path>, working_dir: &Path) -> PipelineResult<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let candidate = working_dir.join(DEFAULT_CONFIG_FILE);
        if candidate.is_file() {
            Self::load(&candidate)
        } else {
            Ok(Self::default())
        }
    }
}

// ---------------------------------------------------------------------------
// ParserConfig
// ---------------------------------------------------------------------------

/// Completion provider and spec-cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    pub provider: Provider,
    pub model: String,
    /// Sampling temperature; kept low so completions are near-deterministic.
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub cache_ttl_hours: u64,
    /// SQLite file for the spec cache. `None` keeps the cache in memory.
    pub cache_path: Option<PathBuf>,
}

impl ParserConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_hours * 3600)
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Openai,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            max_tokens: 800,
            timeout_secs: 30,
            cache_ttl_hours: 24,
            cache_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// SafetyConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Scores at or above this value are high risk.
    pub high_risk_threshold: f64,
    /// Relative numeric change above which the magnitude penalty applies.
    pub magnitude_threshold: f64,
    /// Path fragments marking execution / risk-critical modules.
    pub sensitive_paths: Vec<String>,
    /// Code fragments that may never appear in added or replaced code.
    pub forbidden_fragments: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            high_risk_threshold: 0.5,
            magnitude_threshold: 0.5,
            sensitive_paths: vec!["execution".to_string(), "risk".to_string()],
            forbidden_fragments: vec![
                "eval(".to_string(),
                "exec(".to_string(),
                "__import__".to_string(),
                "os.system".to_string(),
                "subprocess".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MutatorConfig {
    /// Backup directory, relative to the working directory.
    pub backup_dir: PathBuf,
}

impl Default for MutatorConfig {
    fn default() -> Self {
        Self { backup_dir: PathBuf::from(".autopatch/backups") }
    }
}

// ---------------------------------------------------------------------------
// TestingConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestingConfig {
    /// Interpreter used to run pytest and coverage.
    pub python: String,
    /// Extra arguments appended to `python -m pytest`.
    pub test_args: Vec<String>,
    /// Where generated tests are written, relative to the working directory.
    pub generated_dir: PathBuf,
    /// Coverage percentage below which a warning is recorded.
    pub coverage_floor: f64,
    pub measure_coverage: bool,
    /// Finding no related regression tests fails validation. Clearing it
    /// accepts an empty regression set with a warning.
    pub require_regression_tests: bool,
    pub timeout_secs: u64,
}

impl TestingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for TestingConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            test_args: vec!["-q".to_string(), "-p".to_string(), "no:cacheprovider".to_string()],
            generated_dir: PathBuf::from("tests/generated"),
            coverage_floor: 80.0,
            measure_coverage: true,
            require_regression_tests: true,
            timeout_secs: 300,
        }
    }
}

// ---------------------------------------------------------------------------
// GitConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub branch_prefix: String,
    /// Branches the pipeline must never commit to.
    pub protected_branches: Vec<String>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub timeout_secs: u64,
}

impl GitConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            branch_prefix: "autopatch".to_string(),
            protected_branches: vec!["main".to_string(), "master".to_string()],
            author_name: None,
            author_email: None,
            timeout_secs: 60,
        }
    }
}
