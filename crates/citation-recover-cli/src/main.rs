use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use citation_recover_cli::{run_paths, MatcherKind, RunOptions};
use citation_recover_core::{RunSummary, TRUNCATION_THRESHOLD};
use clap::{Parser, ValueEnum};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "citation-recover.v1";

#[derive(Debug, Parser)]
#[command(name = "citation-recover", version)]
#[command(about = "Restore truncated citation page numbers from a reference family tree")]
struct Cli {
    /// Trusted tree file holding the complete citation text. Opened read-only.
    reference: PathBuf,

    /// Tree file whose truncated citations are repaired in place.
    damaged: PathBuf,

    /// Minimum page-number length, in characters, that marks a citation as possibly truncated.
    #[arg(long, default_value_t = TRUNCATION_THRESHOLD)]
    threshold: usize,

    #[arg(long, value_enum, default_value_t = MatcherArg::Indexed)]
    matcher: MatcherArg,

    /// Report the updates that would be made without writing them.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Skip reference citations linked to more than one fact instead of using the latest date.
    #[arg(long, default_value_t = false)]
    strict_links: bool,

    /// Copy the damaged tree here before the first write.
    #[arg(long)]
    backup: Option<PathBuf>,

    /// Print a JSON run summary on stdout.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MatcherArg {
    Indexed,
    Sql,
}

impl From<MatcherArg> for MatcherKind {
    fn from(value: MatcherArg) -> Self {
        match value {
            MatcherArg::Indexed => Self::Indexed,
            MatcherArg::Sql => Self::Sql,
        }
    }
}

impl Cli {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            threshold: self.threshold,
            matcher: self.matcher.into(),
            dry_run: self.dry_run,
            strict_links: self.strict_links,
            backup: self.backup.clone(),
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
            if let Err(print_err) = err.print() {
                eprintln!("Error: {print_err}");
            }
            return code;
        }
    };

    init_logging(&cli.log_level);

    match run(&cli) {
        Ok(()) => {
            tracing::debug!("program completed normally");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let options = cli.run_options();
    let started_at = now_rfc3339()?;
    let summary = run_paths(&cli.reference, &cli.damaged, &options)?;

    if cli.json {
        emit_json(summary_json(cli, &options, &summary, started_at)?)?;
    }
    Ok(())
}

fn summary_json(
    cli: &Cli,
    options: &RunOptions,
    summary: &RunSummary,
    started_at: String,
) -> Result<Value> {
    Ok(serde_json::json!({
        "started_at": started_at,
        "finished_at": now_rfc3339()?,
        "reference": cli.reference.display().to_string(),
        "damaged": cli.damaged.display().to_string(),
        "threshold": options.threshold,
        "matcher": options.matcher,
        "dry_run": options.dry_run,
        "strict_links": options.strict_links,
        "summary": serde_json::to_value(summary).context("failed to serialize run summary")?
    }))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).context("failed to format timestamp as RFC3339")
}
