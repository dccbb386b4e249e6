//! Bounded external command execution shared by the test executor and the git
//! layer. Children are killed when their deadline passes.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim_end().to_string();
        let err = self.stderr.trim_end();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandFailure {
    #[error("failed to start {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

/// Run `program args...` in `cwd` with extra `env`, waiting at most `timeout`.
pub async fn run_command(
    program: &str,
    args: &[String],
    cwd: &Path,
    env: &[(String, String)],
    timeout: Duration,
) -> Result<CommandOutput, CommandFailure> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (k, v) in env {
        cmd.env(k, v);
    }

    tracing::debug!(target: "autopatch::process", program, args = ?args, cwd = %cwd.display(), "spawning");
    let started = Instant::now();
    let child = cmd.spawn().map_err(|e| CommandFailure::Spawn {
        program: program.to_string(),
        message: e.to_string(),
    })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: started.elapsed(),
        }),
        Ok(Err(e)) => Err(CommandFailure::Spawn { program: program.to_string(), message: e.to_string() }),
        // dropping the future kills the child
        Err(_) => Err(CommandFailure::Timeout { program: program.to_string(), timeout }),
    }
}

/// Last `lines` lines of `text`.
pub fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
