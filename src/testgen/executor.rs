//! Test execution behind an injectable trait.
//!
//! [`CommandTestExecutor`] shells out to pytest and coverage.py;
//! [`ScriptedExecutor`] returns canned outcomes so the gate can be tested
//! without a Python toolchain.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::TestingConfig;
use crate::process::{run_command, CommandFailure};

/// Outcome of one pytest invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TestRun {
    pub passed: bool,
    /// Combined stdout/stderr.
    pub output: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutorFailure {
    #[error("test runner unavailable: {0}")]
    Unavailable(String),
    #[error("test run timed out after {0:?}")]
    Timeout(Duration),
    #[error("coverage report unreadable: {0}")]
    Report(String),
}

impl From<CommandFailure> for ExecutorFailure {
    fn from(f: CommandFailure) -> Self {
        match f {
            CommandFailure::Spawn { .. } => ExecutorFailure::Unavailable(f.to_string()),
            CommandFailure::Timeout { timeout, .. } => ExecutorFailure::Timeout(timeout),
        }
    }
}

#[async_trait]
pub trait TestExecutor: Send + Sync {
    /// Run the given test files (relative to `working_dir`).
    async fn run(&self, working_dir: &Path, targets: &[PathBuf]) -> Result<TestRun, ExecutorFailure>;

    /// Line coverage percentage of `sources` while running `targets`.
    async fn coverage(
        &self,
        working_dir: &Path,
        targets: &[PathBuf],
        sources: &[PathBuf],
    ) -> Result<f64, ExecutorFailure>;
}

// ---------------------------------------------------------------------------
// CommandTestExecutor
// ---------------------------------------------------------------------------

pub struct CommandTestExecutor {
    python: String,
    test_args: Vec<String>,
    timeout: Duration,
}

impl CommandTestExecutor {
    pub fn new(config: &TestingConfig) -> Self {
        Self {
            python: config.python.clone(),
            test_args: config.test_args.clone(),
            timeout: config.timeout(),
        }
    }

    fn pytest_args(&self, targets: &[PathBuf]) -> Vec<String> {
        let mut args = vec!["-m".to_string(), "pytest".to_string()];
        args.extend(self.test_args.iter().cloned());
        args.extend(targets.iter().map(|t| t.to_string_lossy().into_owned()));
        args
    }
}

#[async_trait]
impl TestExecutor for CommandTestExecutor {
    async fn run(&self, working_dir: &Path, targets: &[PathBuf]) -> Result<TestRun, ExecutorFailure> {
        let out = run_command(&self.python, &self.pytest_args(targets), working_dir, &[], self.timeout).await?;
        Ok(TestRun { passed: out.success, output: out.combined(), duration: out.duration })
    }

    async fn coverage(
        &self,
        working_dir: &Path,
        targets: &[PathBuf],
        sources: &[PathBuf],
    ) -> Result<f64, ExecutorFailure> {
        let scratch = std::env::temp_dir().join(format!("autopatch-cov-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&scratch).map_err(|e| ExecutorFailure::Report(e.to_string()))?;
        let data_file = scratch.join(".coverage");
        let report = scratch.join("coverage.json");
        let env = vec![("COVERAGE_FILE".to_string(), data_file.to_string_lossy().into_owned())];
        let include = sources
            .iter()
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(",");

        let result = async {
            let mut run_args = vec![
                "-m".to_string(),
                "coverage".to_string(),
                "run".to_string(),
                format!("--include={include}"),
            ];
            run_args.extend(self.pytest_args(targets));
            // test failures are reported by `run`; the data file is still written
            run_command(&self.python, &run_args, working_dir, &env, self.timeout).await?;

            let json_args = vec![
                "-m".to_string(),
                "coverage".to_string(),
                "json".to_string(),
                "-q".to_string(),
                "-o".to_string(),
                report.to_string_lossy().into_owned(),
            ];
            let out = run_command(&self.python, &json_args, working_dir, &env, self.timeout).await?;
            if !out.success {
                return Err(ExecutorFailure::Unavailable(out.combined()));
            }
            let raw = std::fs::read_to_string(&report).map_err(|e| ExecutorFailure::Report(e.to_string()))?;
            percent_covered(&raw)
        }
        .await;

        let _ = std::fs::remove_dir_all(&scratch);
        result
    }
}

/// Extract `totals.percent_covered` from a coverage.py JSON report.
pub fn percent_covered(raw: &str) -> Result<f64, ExecutorFailure> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ExecutorFailure::Report(e.to_string()))?;
    value
        .get("totals")
        .and_then(|t| t.get("percent_covered"))
        .and_then(|p| p.as_f64())
        .ok_or_else(|| ExecutorFailure::Report("totals.percent_covered missing".to_string()))
}

// ---------------------------------------------------------------------------
// ScriptedExecutor
// ---------------------------------------------------------------------------

/// Executor with configurable outcomes. Runs fail when any target path
/// contains one of the configured fragments.
pub struct ScriptedExecutor {
    failing_fragments: Vec<String>,
    coverage: Result<f64, ExecutorFailure>,
    run_failure: Option<ExecutorFailure>,
    calls: Mutex<Vec<Vec<PathBuf>>>,
}

impl ScriptedExecutor {
    pub fn passing() -> Self {
        Self {
            failing_fragments: vec![],
            coverage: Ok(100.0),
            run_failure: None,
            calls: Mutex::new(vec![]),
        }
    }

    pub fn failing_when(mut self, fragment: impl Into<String>) -> Self {
        self.failing_fragments.push(fragment.into());
        self
    }

    pub fn with_coverage(mut self, percent: f64) -> Self {
        self.coverage = Ok(percent);
        self
    }

    pub fn without_coverage(mut self) -> Self {
        self.coverage = Err(ExecutorFailure::Unavailable("coverage not installed".to_string()));
        self
    }

    pub fn with_run_failure(mut self, failure: ExecutorFailure) -> Self {
        self.run_failure = Some(failure);
        self
    }

    /// Target lists passed to `run`, in call order.
    pub fn calls(&self) -> Vec<Vec<PathBuf>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TestExecutor for ScriptedExecutor {
    async fn run(&self, _working_dir: &Path, targets: &[PathBuf]) -> Result<TestRun, ExecutorFailure> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(targets.to_vec());
        }
        if let Some(failure) = &self.run_failure {
            return Err(failure.clone());
        }
        let failing = targets.iter().find(|t| {
            let t = t.to_string_lossy();
            self.failing_fragments.iter().any(|f| t.contains(f.as_str()))
        });
        Ok(match failing {
            Some(t) => TestRun {
                passed: false,
                output: format!("FAILED {} - AssertionError", t.display()),
                duration: Duration::from_millis(40),
            },
            None => TestRun {
                passed: true,
                output: format!("{} passed", targets.len()),
                duration: Duration::from_millis(40),
            },
        })
    }

    async fn coverage(
        &self,
        _working_dir: &Path,
        _targets: &[PathBuf],
        _sources: &[PathBuf],
    ) -> Result<f64, ExecutorFailure> {
        self.coverage.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_covered_reads_totals() {
        let raw = r#"{"meta": {}, "files": {}, "totals": {"covered_lines": 40, "percent_covered": 87.5}}"#;
        assert_eq!(percent_covered(raw).unwrap(), 87.5);
        assert!(matches!(percent_covered("{}"), Err(ExecutorFailure::Report(_))));
        assert!(matches!(percent_covered("not json"), Err(ExecutorFailure::Report(_))));
    }

    #[test]
    fn test_pytest_args_include_configured_flags() {
        let exec = CommandTestExecutor::new(&TestingConfig::default());
        let args = exec.pytest_args(&[PathBuf::from("tests/test_a.py")]);
        assert_eq!(&args[..2], &["-m".to_string(), "pytest".to_string()]);
        assert_eq!(args.last().map(String::as_str), Some("tests/test_a.py"));
    }

    #[tokio::test]
    async fn test_scripted_executor_fails_matching_targets() {
        let exec = ScriptedExecutor::passing().failing_when("test_detectors");
        let dir = Path::new(".");
        let ok = exec.run(dir, &[PathBuf::from("tests/test_other.py")]).await.unwrap();
        assert!(ok.passed);
        let bad = exec.run(dir, &[PathBuf::from("tests/test_detectors.py")]).await.unwrap();
        assert!(!bad.passed);
        assert_eq!(exec.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_unavailable() {
        let config = TestingConfig { python: "autopatch-no-such-python".into(), ..TestingConfig::default() };
        let exec = CommandTestExecutor::new(&config);
        let dir = tempfile::tempdir().unwrap();
        let err = exec.run(dir.path(), &[PathBuf::from("test_x.py")]).await.unwrap_err();
        assert!(matches!(err, ExecutorFailure::Unavailable(_)));
    }
}
