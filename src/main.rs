use clap::Parser;
use claude_usage::auth::{resolve_mode, CredentialSources};
use claude_usage::config::{ensure_initialized, load_config, log_dir};
use claude_usage::error::AppError;
use claude_usage::logging::init_logger;
use claude_usage::models::Mode;
use claude_usage::ui::run::run_tui;

#[derive(Debug, Parser)]
#[command(name = "claude-usage")]
#[command(about = "Live usage dashboard for Claude Code and Anthropic Console accounts")]
struct Cli {
    /// Skip detection and monitor this account type.
    #[arg(long, value_enum)]
    mode: Option<Mode>,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();

    ensure_initialized()?;
    let _log_guard = init_logger(&log_dir()?);
    let cfg = load_config()?;

    let sources = CredentialSources::gather(&cfg.credentials_path()?);
    let mode = resolve_mode(cli.mode, &sources).inspect_err(|err| {
        tracing::error!(error = %err, "unable to determine monitoring mode");
    })?;
    tracing::info!(mode = mode.as_label(), explicit = cli.mode.is_some(), "mode selected");

    run_tui(&cfg, mode, &sources).await
}
