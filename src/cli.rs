use std::path::PathBuf;

use clap::Parser;
use colored::*;

use crate::config::PipelineConfig;
use crate::orchestrator::{PipelineExecutionReport, RunRequest};
use crate::providers::Provider;

#[derive(Parser, Debug)]
#[command(name = "autopatch")]
#[command(version)]
#[command(about = "Turn a change proposal into a verified commit on a feature branch, or roll it back")]
pub struct Args {
    /// Change proposal in plain language or as a JSON specification ("-" reads stdin)
    pub proposal: String,

    /// Identifier for this proposal (generated when omitted)
    #[arg(long)]
    pub proposal_id: Option<String>,

    /// Repository root the proposal applies to
    #[arg(long, default_value = ".")]
    pub working_dir: PathBuf,

    /// Apply the change even when its risk score is above the threshold
    #[arg(long)]
    pub allow_high_risk: bool,

    /// Debug-level logging
    #[arg(long, short)]
    pub verbose: bool,

    /// Configuration file (defaults to <working-dir>/autopatch.toml when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Completion provider, overriding the configuration file
    #[arg(long, value_enum)]
    pub provider: Option<Provider>,

    /// Model name, overriding the configuration file
    #[arg(long)]
    pub model: Option<String>,

    /// Never call a completion provider; parse proposals heuristically
    #[arg(long)]
    pub offline: bool,

    /// Print the execution report as JSON
    #[arg(long)]
    pub json: bool,
}

impl Args {
    /// Fold command-line overrides into `config`.
    pub fn apply_overrides(&self, config: &mut PipelineConfig) {
        if let Some(provider) = self.provider {
            config.parser.provider = provider;
        }
        if let Some(model) = &self.model {
            config.parser.model = model.clone();
        }
        if self.offline {
            config.parser.provider = Provider::Offline;
        }
        config.parser.model = resolve_model(&config.parser.provider, &config.parser.model);
    }

    pub fn run_request(&self, proposal_text: String) -> RunRequest {
        RunRequest {
            proposal_text,
            proposal_id: self.proposal_id.clone(),
            working_dir: self.working_dir.clone(),
            allow_high_risk: self.allow_high_risk,
        }
    }

    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub fn log_directive(&self) -> &'static str {
        if self.verbose {
            "autopatch=debug"
        } else {
            "autopatch=info"
        }
    }
}

/// Select the appropriate default model for the given provider when the user
/// hasn't explicitly chosen one (i.e. the model is still the OpenAI default).
pub fn resolve_model(provider: &Provider, model: &str) -> String {
    if *provider == Provider::Anthropic && model == "gpt-4o-mini" {
        "claude-sonnet-4-20250514".to_string()
    } else {
        model.to_string()
    }
}

/// Human-readable report for the terminal.
pub fn render_report(report: &PipelineExecutionReport) -> String {
    let mut out = String::new();
    let headline = if report.is_success() {
        format!("[autopatch] {} {}", "SUCCESS".bright_green().bold(), report.proposal_id)
    } else {
        format!(
            "[autopatch] {} {} (exit {})",
            "FAILED".bright_red().bold(),
            report.proposal_id,
            report.exit_code()
        )
    };
    out.push_str(&headline);
    out.push('\n');

    if let Some(spec) = &report.specification {
        out.push_str(&format!(
            "  change:   {} on {} in {}\n",
            spec.change(),
            spec.target_symbol().bright_cyan(),
            spec.target_file().display()
        ));
    }
    if let Some(parse) = &report.parse {
        out.push_str(&format!("  parsed:   {} (cache hit: {})\n", parse.source, parse.cache_hit));
    }
    if let Some(risk) = &report.risk {
        out.push_str(&format!("  risk:     {:.2}\n", risk.risk_score));
    }
    if let Some(v) = &report.validation {
        out.push_str(&format!("  new test: {}\n", first_line(&v.new_test_status.to_string())));
        out.push_str(&format!("  regress:  {}\n", first_line(&v.regression_status.to_string())));
        if let Some(pct) = v.coverage_percentage {
            out.push_str(&format!("  coverage: {pct:.1}%\n"));
        }
    }
    if let (Some(branch), Some(hash)) = (&report.branch_name, &report.commit_hash) {
        out.push_str(&format!("  branch:   {}\n", branch.bright_green()));
        out.push_str(&format!("  commit:   {}\n", hash));
    }

    let states: Vec<String> = report.states.iter().map(|s| s.to_string()).collect();
    out.push_str(&format!("  states:   {}\n", states.join(" -> ").dimmed()));
    let timings: Vec<String> = report
        .phase_timings
        .iter()
        .map(|t| format!("{} {}ms", t.phase, t.duration_ms))
        .collect();
    if !timings.is_empty() {
        out.push_str(&format!("  timings:  {}\n", timings.join(", ").dimmed()));
    }

    for w in &report.warnings {
        out.push_str(&format!("  {} {}\n", "warning:".yellow(), w));
    }
    for e in &report.errors {
        out.push_str(&format!("  {} [{}] {}: {}\n", "error:".bright_red(), e.phase, e.kind, e.message));
    }
    if report.rollback_performed {
        out.push_str(&format!("  {}\n", "target restored from backup".yellow()));
    }
    if !report.left_on_disk.is_empty() {
        let files: Vec<String> = report.left_on_disk.iter().map(|p| p.display().to_string()).collect();
        out.push_str(&format!(
            "  {} left uncommitted on disk: {}\n",
            "manual follow-up:".bright_red().bold(),
            files.join(", ")
        ));
    }
    out
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::orchestrator::{PhaseError, PipelineState, RunStatus};

    #[test]
    fn test_resolve_model_anthropic_default_swap() {
        assert_eq!(resolve_model(&Provider::Anthropic, "gpt-4o-mini"), "claude-sonnet-4-20250514");
    }

    #[test]
    fn test_resolve_model_explicit_model_kept() {
        assert_eq!(
            resolve_model(&Provider::Anthropic, "claude-haiku-4-5-20251001"),
            "claude-haiku-4-5-20251001"
        );
        assert_eq!(resolve_model(&Provider::Openai, "gpt-4o-mini"), "gpt-4o-mini");
    }

    #[test]
    fn test_args_parse_minimal() {
        let args = Args::parse_from(["autopatch", "set x to 2"]);
        assert_eq!(args.proposal, "set x to 2");
        assert_eq!(args.working_dir, PathBuf::from("."));
        assert!(args.proposal_id.is_none());
        assert!(!args.allow_high_risk);
        assert!(!args.verbose);
        assert!(!args.json);
        assert_eq!(args.log_directive(), "autopatch=info");
    }

    #[test]
    fn test_args_parse_full() {
        let args = Args::parse_from([
            "autopatch",
            "change x from 1 to 2",
            "--proposal-id",
            "p-9",
            "--working-dir",
            "/repo",
            "--allow-high-risk",
            "-v",
            "--config",
            "ci.toml",
            "--provider",
            "anthropic",
            "--json",
        ]);
        assert_eq!(args.proposal_id.as_deref(), Some("p-9"));
        assert_eq!(args.working_dir, PathBuf::from("/repo"));
        assert!(args.allow_high_risk);
        assert_eq!(args.log_directive(), "autopatch=debug");
        assert_eq!(args.config, Some(PathBuf::from("ci.toml")));
        assert!(args.json);

        let request = args.run_request("change x from 1 to 2".into());
        assert_eq!(request.proposal_id.as_deref(), Some("p-9"));
        assert!(request.allow_high_risk);
    }

    #[test]
    fn test_overrides_offline_wins() {
        let args = Args::parse_from(["autopatch", "p", "--provider", "anthropic", "--offline"]);
        let mut config = PipelineConfig::default();
        args.apply_overrides(&mut config);
        assert_eq!(config.parser.provider, Provider::Offline);
    }

    #[test]
    fn test_overrides_swap_default_model_for_anthropic() {
        let args = Args::parse_from(["autopatch", "p", "--provider", "anthropic"]);
        let mut config = PipelineConfig::default();
        args.apply_overrides(&mut config);
        assert_eq!(config.parser.model, "claude-sonnet-4-20250514");
    }

    #[test]
    fn test_render_failed_report_names_phase_and_kind() {
        colored::control::set_override(false);
        let report = PipelineExecutionReport {
            status: RunStatus::Failed,
            proposal_id: "p-1".into(),
            branch_name: None,
            commit_hash: None,
            phase_timings: vec![],
            errors: vec![PhaseError {
                phase: PipelineState::Parsing,
                kind: ErrorKind::SecurityViolation,
                message: "target escapes the repository".into(),
            }],
            rollback_performed: false,
            warnings: vec![],
            states: vec![PipelineState::Parsing, PipelineState::Done(RunStatus::Failed)],
            parse: None,
            specification: None,
            risk: None,
            modification: None,
            validation: None,
            left_on_disk: vec![],
        };
        let text = render_report(&report);
        assert!(text.contains("FAILED p-1 (exit 2)"));
        assert!(text.contains("[parsing] security_violation: target escapes the repository"));
        assert!(text.contains("parsing -> done(failed)"));
    }
}
