use std::io::Read;

use autopatch::cli::{render_report, Args};
use autopatch::config::PipelineConfig;
use autopatch::error::{ErrorKind, PipelineError};
use autopatch::orchestrator::PipelineOrchestrator;
use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_directive())),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match run(&args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "[autopatch]".bright_red(), e);
            e.kind().exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(args: &Args) -> Result<i32, PipelineError> {
    let proposal = if args.proposal == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| PipelineError::io("<stdin>", e))?;
        buf
    } else {
        args.proposal.clone()
    };

    let mut config = PipelineConfig::discover(args.config.as_deref(), &args.working_dir)?;
    args.apply_overrides(&mut config);

    let orchestrator = PipelineOrchestrator::from_config(&config, &args.working_dir, args.offline)?;
    let report = orchestrator.run(args.run_request(proposal)).await;

    if args.json {
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| PipelineError::Config(format!("report serialization failed: {e}")))?;
        println!("{json}");
    } else {
        print!("{}", render_report(&report));
    }

    if report.failure_kind() == Some(ErrorKind::Git) {
        tracing::error!(
            target: "autopatch",
            proposal_id = %report.proposal_id,
            "change validated but not committed; see the files listed in the report"
        );
    }
    Ok(report.exit_code())
}
