//! # Stage: Test Generation and Regression Gate
//!
//! ## Responsibility
//! Write a pytest module asserting the post-condition of one specification,
//! run it, then run the pre-existing tests related to the modified file and
//! optionally measure coverage of that file.
//!
//! Gate order:
//! 1. Generated test: must pass
//! 2. Regression tests: tests following the naming convention for the module
//!    or importing it; must pass when any exist
//! 3. Coverage: informational, a value under the floor only adds a warning
//!
//! ## Guarantees
//! - Non-panicking: runner failures become `Failed` statuses, never errors
//! - Reversible: [`GeneratedTest::remove`] deletes the file and any directory
//!   created for it
//! - Generated tests never count as regression tests
//!
//! ## NOT Responsible For
//! - Restoring the modified file (see `mutator`)
//! - Deciding whether to commit (see `orchestrator`)

pub mod executor;
pub mod templates;

pub use executor::{CommandTestExecutor, ExecutorFailure, ScriptedExecutor, TestExecutor, TestRun};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::TestingConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::lang::AdapterRegistry;
use crate::mutator::backup::write_atomic;
use crate::parser::resolve::{is_test_file, skipped};
use crate::process::tail;
use crate::spec::Specification;

/// Lines of runner output kept in a failure reason.
const OUTPUT_TAIL_LINES: usize = 20;

static FROM_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^from\s+(\.*[\w.]*)\s+import\s+(.+)$").expect("from-import regex is valid")
});

// ---------------------------------------------------------------------------
// Status types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed { reason: String },
    Skipped { reason: String },
}

impl TestStatus {
    pub fn is_passed(&self) -> bool {
        matches!(self, TestStatus::Passed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TestStatus::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, TestStatus::Skipped { .. })
    }

    fn from_run(run: Result<TestRun, ExecutorFailure>, what: &str) -> Self {
        match run {
            Ok(run) if run.passed => TestStatus::Passed,
            Ok(run) => TestStatus::Failed {
                reason: format!("{what} failed:\n{}", tail(&run.output, OUTPUT_TAIL_LINES)),
            },
            Err(e) => TestStatus::Failed { reason: format!("{what}: {e}") },
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestStatus::Passed => write!(f, "PASS"),
            TestStatus::Failed { reason } => write!(f, "FAIL: {}", reason),
            TestStatus::Skipped { reason } => write!(f, "SKIP: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Ready,
    Failed,
}

/// Verdict of the validation phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub new_test_status: TestStatus,
    pub regression_status: TestStatus,
    pub coverage_percentage: Option<f64>,
    pub overall_status: OverallStatus,
    pub warnings: Vec<String>,
    pub test_path: PathBuf,
    pub regression_tests: Vec<PathBuf>,
}

impl ValidationResult {
    pub fn is_ready(&self) -> bool {
        self.overall_status == OverallStatus::Ready
    }

    /// One-line description of why the result is not ready.
    pub fn failure_summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.new_test_status.is_passed() {
            parts.push(format!("generated test: {}", self.new_test_status));
        }
        if self.regression_status.is_failed() {
            parts.push(format!("regression tests: {}", self.regression_status));
        }
        if parts.is_empty() {
            "validation passed".to_string()
        } else {
            parts.join("; ")
        }
    }
}

// ---------------------------------------------------------------------------
// GeneratedTest
// ---------------------------------------------------------------------------

/// A test file written for one specification.
#[derive(Debug, Clone)]
pub struct GeneratedTest {
    /// Absolute path.
    pub path: PathBuf,
    /// Path relative to the working directory.
    pub relative_path: PathBuf,
    /// Directories that did not exist before, outermost first.
    created_dirs: Vec<PathBuf>,
    /// Content of a file this one replaced.
    previous: Option<Vec<u8>>,
}

impl GeneratedTest {
    /// Undo [`TestGenerator::generate`]: delete (or restore) the file and
    /// remove directories created for it if they are empty.
    pub fn remove(&self) -> PipelineResult<()> {
        match &self.previous {
            Some(bytes) => write_atomic(&self.path, bytes)?,
            None => match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(PipelineError::io(&self.path, e)),
            },
        }
        for dir in self.created_dirs.iter().rev() {
            // only succeeds when empty
            let _ = std::fs::remove_dir(dir);
        }
        tracing::debug!(target: "autopatch::testgen", path = %self.path.display(), "generated test removed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TestGenerator
// ---------------------------------------------------------------------------

pub struct TestGenerator {
    config: TestingConfig,
    executor: Arc<dyn TestExecutor>,
    adapters: AdapterRegistry,
}

impl TestGenerator {
    pub fn new(config: TestingConfig, executor: Arc<dyn TestExecutor>, adapters: AdapterRegistry) -> Self {
        Self { config, executor, adapters }
    }

    pub fn config(&self) -> &TestingConfig {
        &self.config
    }

    /// Write the pytest module for `spec` under the generated-tests directory.
    pub fn generate(&self, spec: &Specification, working_dir: &Path) -> PipelineResult<GeneratedTest> {
        let dir = working_dir.join(&self.config.generated_dir);
        let mut created_dirs = Vec::new();
        let mut probe = Some(dir.as_path());
        while let Some(p) = probe {
            if p.exists() {
                break;
            }
            created_dirs.push(p.to_path_buf());
            probe = p.parent();
        }
        created_dirs.reverse();
        std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;

        let name = templates::test_file_name(spec);
        let path = dir.join(&name);
        let relative_path = self.config.generated_dir.join(&name);
        let previous = std::fs::read(&path).ok();
        let source = templates::render_test(spec, templates::depth_of(&self.config.generated_dir));
        write_atomic(&path, source.as_bytes())?;

        tracing::info!(
            target: "autopatch::testgen",
            proposal_id = %spec.proposal_id(),
            test = %relative_path.display(),
            kind = spec.change().name(),
            "test generated"
        );
        Ok(GeneratedTest { path, relative_path, created_dirs, previous })
    }

    /// Existing tests related to `modified` (relative to `working_dir`):
    /// files named by the language's test convention for the module, and test
    /// files importing it. Generated tests are excluded.
    pub fn discover_regression_tests(&self, working_dir: &Path, modified: &Path) -> Vec<PathBuf> {
        let conventional = match (self.adapters.for_path(modified), modified.file_stem()) {
            (Some(adapter), Some(stem)) => adapter.test_file_patterns(&stem.to_string_lossy()),
            _ => Vec::new(),
        };
        let candidates = module_candidates(modified);
        let generated = working_dir.join(&self.config.generated_dir);

        let mut found = BTreeSet::new();
        let walker = WalkDir::new(working_dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !skipped(e) && !e.path().starts_with(&generated));
        for entry in walker.filter_map(Result::ok) {
            if !entry.file_type().is_file() || !is_test_file(&entry) {
                continue;
            }
            if !self.adapters.supports(entry.path()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let related = conventional.iter().any(|p| *p == name)
                || std::fs::read_to_string(entry.path())
                    .map(|src| imports_any(&src, &candidates))
                    .unwrap_or(false);
            if related {
                let rel = entry.path().strip_prefix(working_dir).unwrap_or(entry.path());
                found.insert(rel.to_path_buf());
            }
        }
        found.into_iter().collect()
    }

    /// Run the generated test, then the regression tests, then coverage.
    pub async fn validate(
        &self,
        spec: &Specification,
        working_dir: &Path,
        modified: &Path,
        test: &GeneratedTest,
    ) -> ValidationResult {
        let mut warnings = Vec::new();

        let new_run = self.executor.run(working_dir, std::slice::from_ref(&test.relative_path)).await;
        let new_test_status = TestStatus::from_run(new_run, "generated test");
        tracing::info!(
            target: "autopatch::testgen",
            proposal_id = %spec.proposal_id(),
            status = %new_test_status,
            "generated test finished"
        );

        let regression_tests = self.discover_regression_tests(working_dir, modified);
        let regression_status = if !new_test_status.is_passed() {
            TestStatus::Skipped { reason: "generated test did not pass".to_string() }
        } else if regression_tests.is_empty() {
            let reason = format!("no existing tests related to {}", modified.display());
            if self.config.require_regression_tests {
                TestStatus::Failed { reason }
            } else {
                warnings.push(reason.clone());
                TestStatus::Skipped { reason }
            }
        } else {
            let run = self.executor.run(working_dir, &regression_tests).await;
            TestStatus::from_run(run, "regression tests")
        };
        tracing::info!(
            target: "autopatch::testgen",
            proposal_id = %spec.proposal_id(),
            tests = regression_tests.len(),
            status = %regression_status,
            "regression gate finished"
        );

        // an empty regression set only counts when the lenient policy allowed it
        let regressions_ok = regression_status.is_passed()
            || (regression_status.is_skipped()
                && regression_tests.is_empty()
                && !self.config.require_regression_tests);
        let overall_status = if new_test_status.is_passed() && regressions_ok {
            OverallStatus::Ready
        } else {
            OverallStatus::Failed
        };

        let mut coverage_percentage = None;
        if overall_status == OverallStatus::Ready && self.config.measure_coverage {
            let mut targets = vec![test.relative_path.clone()];
            targets.extend(regression_tests.iter().cloned());
            match self.executor.coverage(working_dir, &targets, &[modified.to_path_buf()]).await {
                Ok(pct) => {
                    if pct < self.config.coverage_floor {
                        warnings.push(format!(
                            "coverage of {} is {pct:.1}%, below the {:.1}% floor",
                            modified.display(),
                            self.config.coverage_floor
                        ));
                    }
                    coverage_percentage = Some(pct);
                }
                Err(e) => warnings.push(format!("coverage not measured: {e}")),
            }
        }

        for w in &warnings {
            tracing::warn!(target: "autopatch::testgen", proposal_id = %spec.proposal_id(), "{w}");
        }

        ValidationResult {
            new_test_status,
            regression_status,
            coverage_percentage,
            overall_status,
            warnings,
            test_path: test.relative_path.clone(),
            regression_tests,
        }
    }

    /// [`generate`](Self::generate) followed by [`validate`](Self::validate).
    pub async fn generate_and_validate(
        &self,
        spec: &Specification,
        working_dir: &Path,
        modified: &Path,
    ) -> PipelineResult<(GeneratedTest, ValidationResult)> {
        let test = self.generate(spec, working_dir)?;
        let result = self.validate(spec, working_dir, modified, &test).await;
        Ok((test, result))
    }
}

// ---------------------------------------------------------------------------
// Import matching
// ---------------------------------------------------------------------------

/// Dotted module names that may refer to `relative` (every suffix of its
/// package path).
fn module_candidates(relative: &Path) -> Vec<String> {
    let mut parts: Vec<String> = relative
        .with_extension("")
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.last().map(String::as_str) == Some("__init__") {
        parts.pop();
    }
    (0..parts.len()).map(|i| parts[i..].join(".")).collect()
}

/// Modules imported at any indentation in `source`.
fn imported_modules(source: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in source.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("import ") {
            for item in rest.split(',') {
                if let Some(name) = item.split_whitespace().next() {
                    out.push(name.to_string());
                }
            }
        } else if let Some(caps) = FROM_IMPORT.captures(line) {
            let base = caps[1].trim_start_matches('.').to_string();
            if !base.is_empty() {
                out.push(base.clone());
            }
            let names = caps[2].replace(['(', ')'], "");
            for item in names.split(',') {
                let Some(name) = item.split_whitespace().next() else {
                    continue;
                };
                if name == "*" {
                    continue;
                }
                out.push(if base.is_empty() { name.to_string() } else { format!("{base}.{name}") });
            }
        }
    }
    out
}

fn imports_any(source: &str, candidates: &[String]) -> bool {
    imported_modules(source).iter().any(|m| {
        candidates
            .iter()
            .any(|c| m == c || m.ends_with(&format!(".{c}")))
    })
}
