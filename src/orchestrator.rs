//! # Stage: Pipeline Orchestrator
//!
//! ## Responsibility
//! Drive one proposal through the state machine and produce a
//! [`PipelineExecutionReport`]:
//!
//! ```text
//! Parsing     ──► Modifying | Done(Failed)
//! Modifying   ──► Validating | RollingBack | Done(Failed)   (no backup yet)
//! Validating  ──► Committing | RollingBack
//! Committing  ──► Done(Success) | Done(Failed)              (git error, no rollback)
//! RollingBack ──► Done(Failed)
//! ```
//!
//! ## Guarantees
//! - The only component that decides on rollback: every failure after a
//!   backup exists goes through `RollingBack`, except a `Git` error
//! - `RollingBack` restores the backup and deletes the generated test
//! - Every phase's wall-clock duration and every error (with its phase) is
//!   recorded in the report
//! - Per-run state only; nothing is shared between runs except the file locks
//!
//! ## NOT Responsible For
//! - How each phase does its work (see `parser`, `mutator`, `testgen`, `vcs`)
//! - Rendering the report (see `cli`)

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::config::PipelineConfig;
use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::lang::AdapterRegistry;
use crate::mutator::{FileLocks, Modification, ModificationSummary, SyntaxMutator};
use crate::parser::{new_proposal_id, ParseMetrics, ProposalParser};
use crate::providers::{CompletionProvider, HttpCompletionProvider, OfflineProvider, Provider};
use crate::safety::{RiskAssessment, SafetyValidator};
use crate::spec::Specification;
use crate::store::{MemorySpecStore, SpecStore, SqliteSpecStore};
use crate::testgen::{CommandTestExecutor, GeneratedTest, TestExecutor, TestGenerator, ValidationResult};
use crate::vcs::{GitCli, VersionControl, VersionControlAutomator};

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Parsing,
    Modifying,
    Validating,
    Committing,
    RollingBack,
    Done(RunStatus),
}

impl PipelineState {
    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Parsing, Modifying)
                | (Parsing, Done(RunStatus::Failed))
                // failures before any backup exists
                | (Modifying, Done(RunStatus::Failed))
                | (Modifying, Validating)
                | (Modifying, RollingBack)
                | (Validating, Committing)
                | (Validating, RollingBack)
                | (Committing, Done(_))
                | (RollingBack, Done(RunStatus::Failed))
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done(_))
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Parsing => write!(f, "parsing"),
            PipelineState::Modifying => write!(f, "modifying"),
            PipelineState::Validating => write!(f, "validating"),
            PipelineState::Committing => write!(f, "committing"),
            PipelineState::RollingBack => write!(f, "rolling_back"),
            PipelineState::Done(status) => write!(f, "done({status})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseTiming {
    pub phase: PipelineState,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseError {
    pub phase: PipelineState,
    pub kind: ErrorKind,
    pub message: String,
}

/// Everything a caller needs to know about one run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineExecutionReport {
    pub status: RunStatus,
    pub proposal_id: String,
    pub branch_name: Option<String>,
    pub commit_hash: Option<String>,
    pub phase_timings: Vec<PhaseTiming>,
    /// In the order they happened; the first one decides the exit code.
    pub errors: Vec<PhaseError>,
    pub rollback_performed: bool,
    pub warnings: Vec<String>,
    /// States visited, starting with `Parsing`.
    pub states: Vec<PipelineState>,
    pub parse: Option<ParseMetrics>,
    pub specification: Option<Specification>,
    pub risk: Option<RiskAssessment>,
    pub modification: Option<ModificationSummary>,
    pub validation: Option<ValidationResult>,
    /// Files left modified but uncommitted after a git failure.
    pub left_on_disk: Vec<PathBuf>,
}

impl PipelineExecutionReport {
    fn new(proposal_id: &str) -> Self {
        Self {
            status: RunStatus::Failed,
            proposal_id: proposal_id.to_string(),
            branch_name: None,
            commit_hash: None,
            phase_timings: Vec::new(),
            errors: Vec::new(),
            rollback_performed: false,
            warnings: Vec::new(),
            states: vec![PipelineState::Parsing],
            parse: None,
            specification: None,
            risk: None,
            modification: None,
            validation: None,
            left_on_disk: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Error kind that ended the run, if it failed.
    pub fn failure_kind(&self) -> Option<ErrorKind> {
        match self.status {
            RunStatus::Success => None,
            RunStatus::Failed => Some(self.errors.first().map(|e| e.kind).unwrap_or(ErrorKind::General)),
        }
    }

    /// CLI exit code: 0 on success, otherwise the code of the first error.
    pub fn exit_code(&self) -> i32 {
        self.failure_kind().map(ErrorKind::exit_code).unwrap_or(0)
    }

    pub fn final_state(&self) -> PipelineState {
        self.states.last().copied().unwrap_or(PipelineState::Parsing)
    }

    pub fn duration_of(&self, phase: PipelineState) -> Option<u128> {
        self.phase_timings.iter().find(|t| t.phase == phase).map(|t| t.duration_ms)
    }
}

/// Mutable run state: current position in the machine plus the report.
struct RunTrace {
    state: PipelineState,
    report: PipelineExecutionReport,
}

impl RunTrace {
    fn new(proposal_id: &str) -> Self {
        Self { state: PipelineState::Parsing, report: PipelineExecutionReport::new(proposal_id) }
    }

    fn enter(&mut self, next: PipelineState) {
        debug_assert!(self.state.can_transition(next), "{} -> {}", self.state, next);
        tracing::debug!(
            target: "autopatch::orchestrator",
            proposal_id = %self.report.proposal_id,
            from = %self.state,
            to = %next,
            "state transition"
        );
        self.state = next;
        self.report.states.push(next);
    }

    fn time(&mut self, phase: PipelineState, started: Instant) {
        self.report.phase_timings.push(PhaseTiming { phase, duration_ms: started.elapsed().as_millis() });
    }

    fn record_error(&mut self, phase: PipelineState, err: &PipelineError) {
        tracing::warn!(
            target: "autopatch::orchestrator",
            proposal_id = %self.report.proposal_id,
            phase = %phase,
            kind = %err.kind(),
            error = %err,
            "phase failed"
        );
        self.report.errors.push(PhaseError { phase, kind: err.kind(), message: err.to_string() });
    }

    /// Record `err` against the current phase and end the run without rollback.
    fn fail(mut self, err: &PipelineError) -> PipelineExecutionReport {
        let phase = self.state;
        self.record_error(phase, err);
        self.finish(RunStatus::Failed)
    }

    fn finish(mut self, status: RunStatus) -> PipelineExecutionReport {
        self.enter(PipelineState::Done(status));
        self.report.status = status;
        tracing::info!(
            target: "autopatch::orchestrator",
            proposal_id = %self.report.proposal_id,
            status = %status,
            rollback = self.report.rollback_performed,
            "pipeline finished"
        );
        self.report
    }
}

// ---------------------------------------------------------------------------
// PipelineOrchestrator
// ---------------------------------------------------------------------------

/// Input for one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub proposal_text: String,
    /// Generated when absent.
    pub proposal_id: Option<String>,
    pub working_dir: PathBuf,
    /// Let a high (but syntactically valid) risk score through.
    pub allow_high_risk: bool,
}

impl RunRequest {
    pub fn new(proposal_text: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            proposal_text: proposal_text.into(),
            proposal_id: None,
            working_dir: working_dir.into(),
            allow_high_risk: false,
        }
    }

    pub fn with_proposal_id(mut self, id: impl Into<String>) -> Self {
        self.proposal_id = Some(id.into());
        self
    }

    pub fn allowing_high_risk(mut self) -> Self {
        self.allow_high_risk = true;
        self
    }
}

pub struct PipelineOrchestrator {
    parser: ProposalParser,
    mutator: SyntaxMutator,
    testgen: TestGenerator,
    vcs: VersionControlAutomator,
}

/// Collaborators injected by [`PipelineOrchestrator::with_collaborators`].
pub struct Collaborators {
    pub provider: Arc<dyn CompletionProvider>,
    pub store: Arc<dyn SpecStore>,
    pub executor: Arc<dyn TestExecutor>,
    pub vcs: Arc<dyn VersionControl>,
    pub locks: FileLocks,
}

impl PipelineOrchestrator {
    pub fn new(
        parser: ProposalParser,
        mutator: SyntaxMutator,
        testgen: TestGenerator,
        vcs: VersionControlAutomator,
    ) -> Self {
        Self { parser, mutator, testgen, vcs }
    }

    /// Wire every stage from `config` around the given external collaborators.
    pub fn with_collaborators(config: &PipelineConfig, collaborators: Collaborators) -> Self {
        let adapters = AdapterRegistry::with_defaults();
        let safety = Arc::new(SafetyValidator::new(config.safety.clone(), adapters.clone()));
        let parser = ProposalParser::new(
            config.parser.clone(),
            &config.safety,
            collaborators.provider,
            collaborators.store,
            adapters.clone(),
        );
        let mutator = SyntaxMutator::new(config.mutator.clone(), safety, adapters.clone(), collaborators.locks);
        let testgen = TestGenerator::new(config.testing.clone(), collaborators.executor, adapters);
        let vcs = VersionControlAutomator::new(config.git.clone(), collaborators.vcs);
        Self::new(parser, mutator, testgen, vcs)
    }

    /// Production wiring: HTTP provider (or offline), SQLite or in-memory
    /// cache, pytest executor, git CLI.
    pub fn from_config(config: &PipelineConfig, working_dir: &Path, offline: bool) -> PipelineResult<Self> {
        let provider: Arc<dyn CompletionProvider> = if offline || config.parser.provider == Provider::Offline {
            Arc::new(OfflineProvider)
        } else {
            match HttpCompletionProvider::from_env(config.parser.provider, config.parser.model.clone()) {
                Ok(p) => Arc::new(p),
                Err(e) => {
                    tracing::warn!(
                        target: "autopatch::orchestrator",
                        provider = %config.parser.provider,
                        error = %e,
                        "completion provider unavailable, using heuristic parsing only"
                    );
                    Arc::new(OfflineProvider)
                }
            }
        };

        let store: Arc<dyn SpecStore> = match &config.parser.cache_path {
            Some(path) => {
                let path = if path.is_absolute() { path.clone() } else { working_dir.join(path) };
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
                }
                Arc::new(SqliteSpecStore::open(&path)?)
            }
            None => Arc::new(MemorySpecStore::new()),
        };

        Ok(Self::with_collaborators(
            config,
            Collaborators {
                provider,
                store,
                executor: Arc::new(CommandTestExecutor::new(&config.testing)),
                vcs: Arc::new(GitCli::new(&config.git)),
                locks: FileLocks::new(),
            },
        ))
    }

    /// Run one proposal to a terminal state. Never panics and never returns
    /// an error: failures are in the report.
    pub async fn run(&self, request: RunRequest) -> PipelineExecutionReport {
        let proposal_id = request.proposal_id.clone().unwrap_or_else(new_proposal_id);
        let working_dir = request.working_dir.as_path();
        let mut trace = RunTrace::new(&proposal_id);
        tracing::info!(
            target: "autopatch::orchestrator",
            proposal_id = %proposal_id,
            working_dir = %working_dir.display(),
            "pipeline started"
        );

        // -- Parsing ---------------------------------------------------------
        let started = Instant::now();
        let parsed = self.parser.parse_with_id(&request.proposal_text, &proposal_id, working_dir).await;
        trace.time(PipelineState::Parsing, started);
        let outcome = match parsed {
            Ok(outcome) => outcome,
            Err(e) => return trace.fail(&e),
        };
        let spec = outcome.spec;
        trace.report.parse = Some(outcome.metrics);
        trace.report.specification = Some(spec.clone());

        // -- Modifying -------------------------------------------------------
        trace.enter(PipelineState::Modifying);
        let started = Instant::now();
        let modified = self.mutator.modify(&spec, working_dir, request.allow_high_risk).await;
        trace.time(PipelineState::Modifying, started);
        let modification = match modified {
            Ok(m) => m,
            Err(e @ PipelineError::Modification { .. }) => {
                // the mutator already restored its backup
                trace.record_error(PipelineState::Modifying, &e);
                trace.enter(PipelineState::RollingBack);
                trace.report.rollback_performed = true;
                return trace.finish(RunStatus::Failed);
            }
            Err(e) => return trace.fail(&e),
        };
        trace.report.warnings.extend(modification.risk.warnings.iter().cloned());
        trace.report.risk = Some(modification.risk.clone());
        trace.report.modification = Some(modification.summary());

        // -- Validating ------------------------------------------------------
        trace.enter(PipelineState::Validating);
        let started = Instant::now();
        let validated = self
            .testgen
            .generate_and_validate(&spec, working_dir, &modification.relative_path)
            .await;
        trace.time(PipelineState::Validating, started);
        let (test, validation) = match validated {
            Ok(v) => v,
            Err(e) => {
                trace.record_error(PipelineState::Validating, &e);
                return self.roll_back(trace, modification, None);
            }
        };
        trace.report.warnings.extend(validation.warnings.iter().cloned());
        let ready = validation.is_ready();
        let summary = validation.failure_summary();
        trace.report.validation = Some(validation);
        if !ready {
            trace.record_error(PipelineState::Validating, &PipelineError::Validation(summary));
            return self.roll_back(trace, modification, Some(&test));
        }

        // -- Committing ------------------------------------------------------
        trace.enter(PipelineState::Committing);
        let started = Instant::now();
        let committed = self
            .vcs
            .commit_change(&spec, working_dir, &modification.relative_path, &test.relative_path)
            .await;
        trace.time(PipelineState::Committing, started);
        match committed {
            Ok(outcome) => {
                trace.report.branch_name = Some(outcome.branch_name);
                trace.report.commit_hash = Some(outcome.commit_hash);
                let backup = modification.release();
                tracing::debug!(
                    target: "autopatch::orchestrator",
                    backup = %backup.backup_file().display(),
                    "backup retained"
                );
                trace.finish(RunStatus::Success)
            }
            Err(e) => {
                tracing::error!(
                    target: "autopatch::orchestrator",
                    proposal_id = %proposal_id,
                    modified = %modification.relative_path.display(),
                    test = %test.relative_path.display(),
                    backup = %modification.backup.backup_file().display(),
                    error = %e,
                    "commit failed; the validated change and its test are left on disk uncommitted"
                );
                trace.report.left_on_disk = vec![modification.relative_path.clone(), test.relative_path.clone()];
                // releases the lock; the backup file stays for manual recovery
                drop(modification);
                trace.fail(&e)
            }
        }
    }

    /// Restore the backup, delete the generated test, end in `Done(Failed)`.
    fn roll_back(
        &self,
        mut trace: RunTrace,
        modification: Modification,
        test: Option<&GeneratedTest>,
    ) -> PipelineExecutionReport {
        trace.enter(PipelineState::RollingBack);
        let started = Instant::now();
        let path = modification.relative_path.clone();

        if let Some(test) = test {
            if let Err(e) = test.remove() {
                trace.record_error(PipelineState::RollingBack, &e);
            }
        }
        match modification.roll_back() {
            Ok(rewritten) => tracing::info!(
                target: "autopatch::orchestrator",
                proposal_id = %trace.report.proposal_id,
                path = %path.display(),
                rewritten,
                "rolled back"
            ),
            Err(e) => trace.record_error(PipelineState::RollingBack, &e),
        }

        trace.report.rollback_performed = true;
        trace.time(PipelineState::RollingBack, started);
        trace.finish(RunStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySpecStore;
    use crate::testgen::ScriptedExecutor;
    use crate::vcs::RecordingVcs;
    use crate::providers::ScriptedProvider;
    use std::fs;

    const DETECTOR: &str = "class SignalDetector:\n    confidence_threshold = 0.70\n";

    fn orchestrator(executor: ScriptedExecutor, vcs: Arc<RecordingVcs>) -> PipelineOrchestrator {
        PipelineOrchestrator::with_collaborators(
            &PipelineConfig::default(),
            Collaborators {
                provider: Arc::new(OfflineProvider),
                store: Arc::new(MemorySpecStore::new()),
                executor: Arc::new(executor),
                vcs,
                locks: FileLocks::new(),
            },
        )
    }

    fn repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/detectors.py"), DETECTOR).unwrap();
        fs::create_dir_all(dir.path().join("tests")).unwrap();
        fs::write(dir.path().join("tests/test_detectors.py"), "def test_loads():\n    pass\n").unwrap();
        dir
    }

    const PROPOSAL: &str = "change SignalDetector.confidence_threshold from 0.70 to 0.65 in file src/detectors.py";

    #[test]
    fn test_transition_table() {
        use PipelineState::*;
        assert!(Parsing.can_transition(Modifying));
        assert!(Parsing.can_transition(Done(RunStatus::Failed)));
        assert!(!Parsing.can_transition(Done(RunStatus::Success)));
        assert!(!Parsing.can_transition(RollingBack));
        assert!(Validating.can_transition(RollingBack));
        assert!(!Committing.can_transition(RollingBack));
        assert!(RollingBack.can_transition(Done(RunStatus::Failed)));
        assert!(!RollingBack.can_transition(Done(RunStatus::Success)));
        assert!(!Done(RunStatus::Success).can_transition(Parsing));
        assert!(Done(RunStatus::Failed).is_terminal());
    }

    #[tokio::test]
    async fn test_success_path_visits_every_phase() {
        let dir = repo();
        let vcs = Arc::new(RecordingVcs::on_branch("main"));
        let orc = orchestrator(ScriptedExecutor::passing(), vcs.clone());
        let report = orc.run(RunRequest::new(PROPOSAL, dir.path()).with_proposal_id("p-1")).await;

        assert!(report.is_success(), "{:?}", report.errors);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.branch_name.as_deref(), Some("autopatch/p-1"));
        assert_eq!(
            report.states,
            vec![
                PipelineState::Parsing,
                PipelineState::Modifying,
                PipelineState::Validating,
                PipelineState::Committing,
                PipelineState::Done(RunStatus::Success),
            ]
        );
        assert_eq!(report.phase_timings.len(), 4);
        assert!(!report.rollback_performed);
        assert_eq!(vcs.commits(), 1);
    }

    #[tokio::test]
    async fn test_parse_failure_ends_without_rollback() {
        let dir = repo();
        let vcs = Arc::new(RecordingVcs::on_branch("main"));
        let orc = orchestrator(ScriptedExecutor::passing(), vcs.clone());
        let report = orc.run(RunRequest::new("make it better somehow", dir.path())).await;

        assert_eq!(report.exit_code(), 2);
        assert_eq!(report.states, vec![PipelineState::Parsing, PipelineState::Done(RunStatus::Failed)]);
        assert_eq!(report.errors[0].phase, PipelineState::Parsing);
        assert!(!report.rollback_performed);
    }

    #[tokio::test]
    async fn test_validation_failure_rolls_back_and_removes_test() {
        let dir = repo();
        let vcs = Arc::new(RecordingVcs::on_branch("main"));
        let orc = orchestrator(ScriptedExecutor::passing().failing_when("test_autogen"), vcs.clone());
        let report = orc.run(RunRequest::new(PROPOSAL, dir.path())).await;

        assert_eq!(report.exit_code(), 4);
        assert!(report.rollback_performed);
        assert!(report.states.contains(&PipelineState::RollingBack));
        assert_eq!(fs::read_to_string(dir.path().join("src/detectors.py")).unwrap(), DETECTOR);
        assert!(!dir.path().join("tests/generated").exists());
        assert_eq!(vcs.commits(), 0);
    }

    #[tokio::test]
    async fn test_git_failure_keeps_change_on_disk() {
        let dir = repo();
        let vcs = Arc::new(RecordingVcs::on_branch("main").failing_on("commit"));
        let orc = orchestrator(ScriptedExecutor::passing(), vcs);
        let report = orc.run(RunRequest::new(PROPOSAL, dir.path())).await;

        assert_eq!(report.exit_code(), 5);
        assert!(!report.rollback_performed);
        assert!(!report.states.contains(&PipelineState::RollingBack));
        assert_eq!(report.left_on_disk.len(), 2);
        let on_disk = fs::read_to_string(dir.path().join("src/detectors.py")).unwrap();
        assert!(on_disk.contains("0.65"));
        assert!(dir.path().join(&report.left_on_disk[1]).exists());
    }

    #[tokio::test]
    async fn test_provider_answer_is_used_when_available() {
        let dir = repo();
        let completion = r#"{"target_file": "src/detectors.py", "target_symbol": "SignalDetector.confidence_threshold",
            "change": {"kind": "parameter_change", "value_type": "float", "old_value": 0.7, "new_value": 0.6}}"#;
        let orc = PipelineOrchestrator::with_collaborators(
            &PipelineConfig::default(),
            Collaborators {
                provider: Arc::new(ScriptedProvider::responding(completion)),
                store: Arc::new(MemorySpecStore::new()),
                executor: Arc::new(ScriptedExecutor::passing()),
                vcs: Arc::new(RecordingVcs::on_branch("main")),
                locks: FileLocks::new(),
            },
        );
        let report = orc.run(RunRequest::new("lower the detector threshold a bit", dir.path())).await;
        assert!(report.is_success(), "{:?}", report.errors);
        assert_eq!(report.parse.as_ref().map(|m| m.source), Some(crate::parser::SpecSource::Provider));
    }
}
