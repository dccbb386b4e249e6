//! End-to-end runs of the orchestrator against scratch repositories, with the
//! completion provider, test runner and git replaced by in-process doubles.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use autopatch::mutator::FileLocks;
use autopatch::orchestrator::{Collaborators, PipelineState, RunStatus};
use autopatch::parser::SpecSource;
use autopatch::providers::{CompletionProvider, OfflineProvider, ScriptedProvider};
use autopatch::store::MemorySpecStore;
use autopatch::testgen::ScriptedExecutor;
use autopatch::vcs::{RecordingVcs, VcsCall};
use autopatch::{PipelineConfig, PipelineOrchestrator, RunRequest};

const DETECTORS: &str = r#""""Signal detectors."""
import math


class SignalDetector:
    """Flags candidate signals."""

    confidence_threshold = 0.70
    window = 20

    def detect(self, score):
        return score >= self.confidence_threshold
"#;

const REGRESSION_TEST: &str = r#"from src.detectors import SignalDetector


def test_detects_high_scores():
    assert SignalDetector().detect(0.99)
"#;

fn repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("src")).unwrap();
    fs::create_dir_all(dir.path().join("tests")).unwrap();
    fs::write(dir.path().join("src/__init__.py"), "").unwrap();
    fs::write(dir.path().join("src/detectors.py"), DETECTORS).unwrap();
    fs::write(dir.path().join("tests/test_detectors.py"), REGRESSION_TEST).unwrap();
    dir
}

fn orchestrator(
    config: &PipelineConfig,
    provider: Arc<dyn CompletionProvider>,
    executor: ScriptedExecutor,
    vcs: Arc<RecordingVcs>,
) -> PipelineOrchestrator {
    PipelineOrchestrator::with_collaborators(
        config,
        Collaborators {
            provider,
            store: Arc::new(MemorySpecStore::new()),
            executor: Arc::new(executor),
            vcs,
            locks: FileLocks::new(),
        },
    )
}

fn snapshot(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<(String, Vec<u8>)> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().into_owned();
            (rel, fs::read(e.path()).unwrap())
        })
        .collect();
    files.sort();
    files
}

// ---------------------------------------------------------------------------
// Scenario A: bounded float parameter change succeeds
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_parameter_change_is_committed_on_feature_branch() {
    let dir = repo();
    let vcs = Arc::new(RecordingVcs::on_branch("main"));
    let orc = orchestrator(
        &PipelineConfig::default(),
        Arc::new(OfflineProvider),
        ScriptedExecutor::passing().with_coverage(88.0),
        vcs.clone(),
    );
    let proposal = "change `confidence_threshold` from 0.70 to 0.65 in class SignalDetector \
                    in file src/detectors.py with bounds [0.5, 0.9]";
    let report = orc.run(RunRequest::new(proposal, dir.path()).with_proposal_id("scenario-a")).await;

    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.branch_name.as_deref(), Some("autopatch/scenario-a"));
    assert!(report.commit_hash.is_some());

    let validation = report.validation.as_ref().unwrap();
    assert!(validation.is_ready());
    assert_eq!(validation.regression_tests, vec![Path::new("tests/test_detectors.py").to_path_buf()]);
    assert_eq!(validation.coverage_percentage, Some(88.0));

    let source = fs::read_to_string(dir.path().join("src/detectors.py")).unwrap();
    assert!(source.contains("confidence_threshold = 0.65"));
    assert!(source.contains("window = 20"));

    let calls = vcs.calls();
    assert_eq!(calls.iter().filter(|c| matches!(c, VcsCall::CreateBranch(_))).count(), 1);
    assert_eq!(vcs.commits(), 1);
    match &calls[1] {
        VcsCall::Stage(paths) => {
            assert_eq!(paths[0], Path::new("src/detectors.py"));
            assert!(paths[1].starts_with("tests/generated"));
        }
        other => panic!("expected stage, got {other:?}"),
    }
    assert!(dir.path().join(&validation.test_path).exists());
}

// ---------------------------------------------------------------------------
// Scenario B: path escaping the repository
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_absolute_target_is_security_violation_without_writes() {
    let dir = repo();
    let before = snapshot(dir.path());
    let vcs = Arc::new(RecordingVcs::on_branch("main"));
    let orc = orchestrator(&PipelineConfig::default(), Arc::new(OfflineProvider), ScriptedExecutor::passing(), vcs.clone());

    let report = orc
        .run(RunRequest::new("change root_shell from 0 to 1 in file /etc/passwd", dir.path()))
        .await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.errors[0].phase, PipelineState::Parsing);
    assert!(!report.rollback_performed);
    assert!(report.modification.is_none());
    assert_eq!(snapshot(dir.path()), before);
    assert!(vcs.calls().is_empty());
}

#[tokio::test]
async fn test_parent_traversal_is_security_violation() {
    let dir = repo();
    let before = snapshot(dir.path());
    let orc = orchestrator(
        &PipelineConfig::default(),
        Arc::new(OfflineProvider),
        ScriptedExecutor::passing(),
        Arc::new(RecordingVcs::on_branch("main")),
    );
    let report = orc
        .run(RunRequest::new("set window to 30 in file ../outside/detectors.py", dir.path()))
        .await;
    assert_eq!(report.exit_code(), 2);
    assert_eq!(snapshot(dir.path()), before);
}

// ---------------------------------------------------------------------------
// Scenario C: unrelated regression test fails
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_regression_failure_restores_file_and_skips_commit() {
    let dir = repo();
    let vcs = Arc::new(RecordingVcs::on_branch("main"));
    let orc = orchestrator(
        &PipelineConfig::default(),
        Arc::new(OfflineProvider),
        ScriptedExecutor::passing().failing_when("tests/test_detectors.py"),
        vcs.clone(),
    );
    let report = orc
        .run(RunRequest::new(
            "change SignalDetector.confidence_threshold from 0.70 to 0.65 in file src/detectors.py",
            dir.path(),
        ))
        .await;

    assert_eq!(report.exit_code(), 4);
    assert!(report.rollback_performed);
    assert_eq!(
        report.states,
        vec![
            PipelineState::Parsing,
            PipelineState::Modifying,
            PipelineState::Validating,
            PipelineState::RollingBack,
            PipelineState::Done(RunStatus::Failed),
        ]
    );
    let validation = report.validation.as_ref().unwrap();
    assert!(validation.new_test_status.is_passed());
    assert!(validation.regression_status.is_failed());

    assert_eq!(fs::read_to_string(dir.path().join("src/detectors.py")).unwrap(), DETECTORS);
    assert!(!dir.path().join(&validation.test_path).exists());
    assert!(vcs.calls().is_empty());
    assert!(report.branch_name.is_none());
}

// ---------------------------------------------------------------------------
// Scenario D: provider timeout falls back to the heuristic
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_provider_timeout_falls_back_and_proceeds() {
    let dir = repo();
    let mut config = PipelineConfig::default();
    config.parser.timeout_secs = 1;
    let provider = Arc::new(ScriptedProvider::responding("{}").with_delay(Duration::from_secs(5)));
    let vcs = Arc::new(RecordingVcs::on_branch("main"));
    let orc = orchestrator(&config, provider.clone(), ScriptedExecutor::passing(), vcs.clone());

    let report = orc
        .run(RunRequest::new(
            "change confidence_threshold from 0.70 to 0.65 in class SignalDetector in file src/detectors.py",
            dir.path(),
        ))
        .await;

    assert!(report.is_success(), "{:?}", report.errors);
    let parse = report.parse.as_ref().unwrap();
    assert_eq!(parse.source, SpecSource::Heuristic);
    assert!(parse.provider_failure.as_deref().unwrap_or_default().contains("timed out"));
    assert_eq!(provider.calls(), 1);
    assert_eq!(vcs.commits(), 1);
}

// ---------------------------------------------------------------------------
// Scenario E: candidate that does not parse is never kept
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unparsable_candidate_is_restored_even_with_override() {
    let dir = repo();
    let vcs = Arc::new(RecordingVcs::on_branch("main"));
    let orc = orchestrator(&PipelineConfig::default(), Arc::new(OfflineProvider), ScriptedExecutor::passing(), vcs.clone());
    let structured = r#"{
        "target_file": "src/detectors.py",
        "target_symbol": "SignalDetector",
        "change": {"kind": "method_addition", "method_name": "broken", "code": "def broken(self:\n    return 1\n"},
        "rationale": "exercise the syntax barrier"
    }"#;

    let report = orc.run(RunRequest::new(structured, dir.path()).allowing_high_risk()).await;

    assert_eq!(report.exit_code(), 3);
    assert!(report.rollback_performed);
    assert!(report.states.contains(&PipelineState::RollingBack));
    assert_eq!(fs::read_to_string(dir.path().join("src/detectors.py")).unwrap(), DETECTORS);
    assert!(report.validation.is_none());
    assert!(vcs.calls().is_empty());
}

// ---------------------------------------------------------------------------
// Other paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stale_old_value_is_modification_error() {
    let dir = repo();
    let orc = orchestrator(
        &PipelineConfig::default(),
        Arc::new(OfflineProvider),
        ScriptedExecutor::passing(),
        Arc::new(RecordingVcs::on_branch("main")),
    );
    let report = orc
        .run(RunRequest::new(
            "change SignalDetector.confidence_threshold from 0.80 to 0.65 in file src/detectors.py",
            dir.path(),
        ))
        .await;
    assert_eq!(report.exit_code(), 3);
    assert_eq!(fs::read_to_string(dir.path().join("src/detectors.py")).unwrap(), DETECTORS);
}

#[tokio::test]
async fn test_git_failure_is_reported_without_rollback() {
    let dir = repo();
    let vcs = Arc::new(RecordingVcs::on_branch("main").failing_on("create_branch"));
    let orc = orchestrator(&PipelineConfig::default(), Arc::new(OfflineProvider), ScriptedExecutor::passing(), vcs);
    let report = orc
        .run(RunRequest::new("set SignalDetector.window to 30 in file src/detectors.py", dir.path()))
        .await;

    assert_eq!(report.exit_code(), 5);
    assert_eq!(report.errors[0].phase, PipelineState::Committing);
    assert!(!report.rollback_performed);
    assert!(fs::read_to_string(dir.path().join("src/detectors.py")).unwrap().contains("window = 30"));
    assert_eq!(report.left_on_disk.len(), 2);
}

#[tokio::test]
async fn test_missing_regression_tests_block_the_commit() {
    let dir = repo();
    fs::remove_file(dir.path().join("tests/test_detectors.py")).unwrap();
    let before = snapshot(dir.path());
    let vcs = Arc::new(RecordingVcs::on_branch("main"));
    let orc = orchestrator(&PipelineConfig::default(), Arc::new(OfflineProvider), ScriptedExecutor::passing(), vcs.clone());

    let report = orc
        .run(RunRequest::new(
            "change SignalDetector.confidence_threshold from 0.70 to 0.65 in file src/detectors.py",
            dir.path(),
        ))
        .await;

    assert_eq!(report.exit_code(), 4);
    assert!(report.rollback_performed);
    assert!(report.validation.as_ref().unwrap().regression_status.is_failed());
    assert_eq!(vcs.commits(), 0);
    let after: Vec<_> = snapshot(dir.path()).into_iter().filter(|(p, _)| !p.starts_with(".autopatch")).collect();
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_import_addition_from_plain_language() {
    let dir = repo();
    let orc = orchestrator(
        &PipelineConfig::default(),
        Arc::new(OfflineProvider),
        ScriptedExecutor::passing(),
        Arc::new(RecordingVcs::on_branch("main")),
    );
    let report = orc
        .run(RunRequest::new("add import statistics to src/detectors.py", dir.path()))
        .await;
    assert!(report.is_success(), "{:?}", report.errors);
    let source = fs::read_to_string(dir.path().join("src/detectors.py")).unwrap();
    assert!(source.contains("import math\nimport statistics\n"));
}

#[tokio::test]
async fn test_concurrent_runs_on_same_file_are_serialized() {
    let dir = repo();
    let config = PipelineConfig::default();
    let orc = Arc::new(orchestrator(
        &config,
        Arc::new(OfflineProvider),
        ScriptedExecutor::passing(),
        Arc::new(RecordingVcs::on_branch("main")),
    ));

    let a = {
        let orc = orc.clone();
        let req = RunRequest::new("set SignalDetector.window to 30 in file src/detectors.py", dir.path())
            .with_proposal_id("run-a");
        tokio::spawn(async move { orc.run(req).await })
    };
    let b = {
        let orc = orc.clone();
        let req = RunRequest::new("add import statistics to src/detectors.py", dir.path())
            .with_proposal_id("run-b");
        tokio::spawn(async move { orc.run(req).await })
    };
    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    assert!(a.is_success(), "{:?}", a.errors);
    assert!(b.is_success(), "{:?}", b.errors);

    let source = fs::read_to_string(dir.path().join("src/detectors.py")).unwrap();
    assert!(source.contains("window = 30"));
    assert!(source.contains("import statistics"));
}
