//! # Stage: Version Control Automation
//!
//! ## Responsibility
//! Put a validated change on its own feature branch: create
//! `{branch_prefix}/{proposal_id}`, stage the modified file and the generated
//! test, commit with a structured message.
//!
//! ## Guarantees
//! - Never commits on a protected branch: the current branch is checked
//!   after branch creation and before staging
//! - Every git invocation is bounded by the configured timeout
//!
//! ## NOT Responsible For
//! - Switching back to the original branch, merging or pushing
//! - Rolling anything back on failure (a `Git` error leaves the verified
//!   change on disk)

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::GitConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::process::{run_command, CommandOutput};
use crate::spec::Specification;

/// Branch and commit produced for one proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitOutcome {
    pub branch_name: String,
    pub commit_hash: String,
}

#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn current_branch(&self, repo: &Path) -> PipelineResult<String>;
    /// Create `name` from HEAD and switch to it, carrying the working tree.
    async fn create_branch(&self, repo: &Path, name: &str) -> PipelineResult<()>;
    async fn stage(&self, repo: &Path, paths: &[PathBuf]) -> PipelineResult<()>;
    /// Commit the index; returns the new commit hash.
    async fn commit(&self, repo: &Path, message: &str) -> PipelineResult<String>;
}

// ---------------------------------------------------------------------------
// GitCli
// ---------------------------------------------------------------------------

/// [`VersionControl`] over the `git` executable.
pub struct GitCli {
    timeout: Duration,
    author_name: Option<String>,
    author_email: Option<String>,
}

impl GitCli {
    pub fn new(config: &GitConfig) -> Self {
        Self {
            timeout: config.timeout(),
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
        }
    }

    async fn git(&self, repo: &Path, args: &[&str]) -> PipelineResult<CommandOutput> {
        let mut full = vec!["-C".to_string(), repo.to_string_lossy().into_owned()];
        if let Some(name) = &self.author_name {
            full.push("-c".to_string());
            full.push(format!("user.name={name}"));
        }
        if let Some(email) = &self.author_email {
            full.push("-c".to_string());
            full.push(format!("user.email={email}"));
        }
        full.extend(args.iter().map(|a| a.to_string()));

        let out = run_command("git", &full, repo, &[], self.timeout)
            .await
            .map_err(|e| PipelineError::Git(e.to_string()))?;
        if !out.success {
            return Err(PipelineError::Git(format!(
                "git {} failed ({}): {}",
                args.iter().find(|a| !a.starts_with('-') && !a.contains('=')).copied().unwrap_or("command"),
                out.code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
                out.stderr.trim()
            )));
        }
        Ok(out)
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn current_branch(&self, repo: &Path) -> PipelineResult<String> {
        let out = self
            .git(repo, &["symbolic-ref", "--short", "HEAD"])
            .await
            .map_err(|e| PipelineError::Git(format!("cannot determine current branch: {e}")))?;
        Ok(out.stdout.trim().to_string())
    }

    async fn create_branch(&self, repo: &Path, name: &str) -> PipelineResult<()> {
        self.git(repo, &["checkout", "-b", name]).await.map(|_| ())
    }

    async fn stage(&self, repo: &Path, paths: &[PathBuf]) -> PipelineResult<()> {
        let paths: Vec<String> = paths.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        let mut args = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.git(repo, &args).await.map(|_| ())
    }

    async fn commit(&self, repo: &Path, message: &str) -> PipelineResult<String> {
        self.git(repo, &["-c", "commit.gpgsign=false", "commit", "-q", "-m", message]).await?;
        let out = self.git(repo, &["rev-parse", "HEAD"]).await?;
        Ok(out.stdout.trim().to_string())
    }
}

// ---------------------------------------------------------------------------
// RecordingVcs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcsCall {
    CreateBranch(String),
    Stage(Vec<PathBuf>),
    Commit(String),
}

/// In-memory [`VersionControl`] that records calls and can fail on demand.
pub struct RecordingVcs {
    branch: Mutex<String>,
    fail_on: Option<&'static str>,
    calls: Mutex<Vec<VcsCall>>,
}

impl RecordingVcs {
    pub fn on_branch(branch: impl Into<String>) -> Self {
        Self { branch: Mutex::new(branch.into()), fail_on: None, calls: Mutex::new(vec![]) }
    }

    /// Fail the named operation: `"create_branch"`, `"stage"` or `"commit"`.
    pub fn failing_on(mut self, op: &'static str) -> Self {
        self.fail_on = Some(op);
        self
    }

    pub fn calls(&self) -> Vec<VcsCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn commits(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, VcsCall::Commit(_))).count()
    }

    fn check(&self, op: &'static str) -> PipelineResult<()> {
        if self.fail_on == Some(op) {
            return Err(PipelineError::Git(format!("{op} rejected")));
        }
        Ok(())
    }

    fn record(&self, call: VcsCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl VersionControl for RecordingVcs {
    async fn current_branch(&self, _repo: &Path) -> PipelineResult<String> {
        self.branch
            .lock()
            .map(|b| b.clone())
            .map_err(|_| PipelineError::Git("branch state poisoned".into()))
    }

    async fn create_branch(&self, _repo: &Path, name: &str) -> PipelineResult<()> {
        self.check("create_branch")?;
        self.record(VcsCall::CreateBranch(name.to_string()));
        if let Ok(mut b) = self.branch.lock() {
            *b = name.to_string();
        }
        Ok(())
    }

    async fn stage(&self, _repo: &Path, paths: &[PathBuf]) -> PipelineResult<()> {
        self.check("stage")?;
        self.record(VcsCall::Stage(paths.to_vec()));
        Ok(())
    }

    async fn commit(&self, _repo: &Path, message: &str) -> PipelineResult<String> {
        self.check("commit")?;
        self.record(VcsCall::Commit(message.to_string()));
        Ok(crate::spec::content_hash(message.as_bytes()))
    }
}

// ---------------------------------------------------------------------------
// VersionControlAutomator
// ---------------------------------------------------------------------------

pub struct VersionControlAutomator {
    config: GitConfig,
    vcs: Arc<dyn VersionControl>,
}

impl VersionControlAutomator {
    pub fn new(config: GitConfig, vcs: Arc<dyn VersionControl>) -> Self {
        Self { config, vcs }
    }

    /// `{branch_prefix}/{proposal_id}`, with characters git rejects replaced.
    pub fn branch_name(&self, spec: &Specification) -> String {
        let mut id: String = spec
            .proposal_id()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '-' })
            .collect();
        while id.contains("..") {
            id = id.replace("..", ".");
        }
        let id = id.trim_matches(|c| c == '-' || c == '.');
        let id = id.strip_suffix(".lock").unwrap_or(id);
        let id = if id.is_empty() { "proposal" } else { id };

        let prefix = self.config.branch_prefix.trim_matches('/');
        if prefix.is_empty() {
            id.to_string()
        } else {
            format!("{prefix}/{id}")
        }
    }

    pub fn commit_message(&self, spec: &Specification, test_path: &Path) -> String {
        let rationale = if spec.rationale().trim().is_empty() {
            "(none given)"
        } else {
            spec.rationale().trim()
        };
        format!(
            "autopatch({}): {} in {}\n\nRationale: {}\n\nProposal-Id: {}\nGenerated-Test: {}\n",
            spec.change().name(),
            spec.target_symbol(),
            spec.target_file().display(),
            rationale,
            spec.proposal_id(),
            test_path.display(),
        )
    }

    fn is_protected(&self, branch: &str) -> bool {
        self.config.protected_branches.iter().any(|p| p == branch)
    }

    /// Create the feature branch, stage `modified` and `test_path` (both
    /// relative to `repo`), and commit.
    pub async fn commit_change(
        &self,
        spec: &Specification,
        repo: &Path,
        modified: &Path,
        test_path: &Path,
    ) -> PipelineResult<CommitOutcome> {
        let branch_name = self.branch_name(spec);
        if self.is_protected(&branch_name) {
            return Err(PipelineError::Git(format!("refusing to use protected branch '{branch_name}'")));
        }

        self.vcs.create_branch(repo, &branch_name).await?;
        let current = self.vcs.current_branch(repo).await?;
        if current != branch_name || self.is_protected(&current) {
            return Err(PipelineError::Git(format!(
                "expected to be on '{branch_name}' but HEAD is '{current}'; not committing"
            )));
        }

        self.vcs.stage(repo, &[modified.to_path_buf(), test_path.to_path_buf()]).await?;
        let commit_hash = self.vcs.commit(repo, &self.commit_message(spec, test_path)).await?;

        tracing::info!(
            target: "autopatch::vcs",
            proposal_id = %spec.proposal_id(),
            branch = %branch_name,
            commit = %commit_hash,
            "change committed"
        );
        Ok(CommitOutcome { branch_name, commit_hash })
    }
}
