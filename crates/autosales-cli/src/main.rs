use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "autosales-cli")]
#[command(about = "Auto sales collector and dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect every enabled source and merge into its table.
    Sync {
        /// Only sync this source id, even if disabled in sources.yaml.
        #[arg(long)]
        source: Option<String>,
    },
    /// Serve the dashboard.
    Serve,
    /// Run the cron scheduler until interrupted.
    Schedule,
    /// Print a digest of recent sync runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("autosales=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { source: None }) {
        Commands::Sync { source } => {
            let summary = autosales_sync::run_sync_once_from_env(source.as_deref()).await?;
            for s in &summary.sources {
                info!(
                    source_id = %s.source_id,
                    status = ?s.status,
                    rows = s.merged_rows,
                    skipped = s.skipped_requests.len(),
                    "source finished"
                );
            }
            let summary = summary.into_result()?;
            println!(
                "sync complete: run_id={} sources={} report={}",
                summary.run_id,
                summary.sources.len(),
                summary.report_path
            );
        }
        Commands::Serve => autosales_web::serve_from_env().await?,
        Commands::Schedule => autosales_sync::run_scheduler_from_env().await?,
        Commands::Report { runs } => {
            let root = std::env::var("AUTOSALES_WORKSPACE").map(PathBuf::from).ok();
            println!("{}", autosales_sync::report_recent_runs(runs, root)?);
        }
    }

    Ok(())
}
