use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use speedcheck::catalog::CatalogSource;
use speedcheck::config::SpeedCheckConfig;
use speedcheck::engine::http::HttpTransferEngine;
use speedcheck::listener::{FailureKind, ResultListener};
use speedcheck::orchestrator::{RunOutcome, RunSnapshot, ServerStatus, SpeedTestManager};
use speedcheck::report::{format_rate, RateUnit, Report};
use speedcheck::Server;

#[derive(Parser)]
#[command(
    name = "speedcheck",
    about = "Failover-aware download/upload speed testing",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a speed test across the server catalog
    Run {
        /// Server list (JSON, or TOML with a .toml extension)
        #[arg(long, env = "SPEEDCHECK_CATALOG")]
        catalog: Option<PathBuf>,

        /// Print a JSON summary instead of live progress
        #[arg(long)]
        json: bool,

        /// Per-phase timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List the servers in try order
    Servers {
        /// Server list (JSON, or TOML with a .toml extension)
        #[arg(long, env = "SPEEDCHECK_CATALOG")]
        catalog: Option<PathBuf>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = SpeedCheckConfig::resolve(cli.config.as_deref())?;

    init_tracing(&config);

    match cli.command {
        Commands::Run {
            catalog,
            json,
            timeout,
        } => {
            if let Some(secs) = timeout {
                config.timing.phase_timeout_secs = secs;
                config.validate()?;
            }
            let source = catalog
                .map(CatalogSource::File)
                .unwrap_or_else(|| config.catalog_source());
            run_speed_test(&config, source, json).await?;
        }
        Commands::Servers { catalog, json } => {
            let source = catalog
                .map(CatalogSource::File)
                .unwrap_or_else(|| config.catalog_source());
            let catalog = source
                .load()
                .with_context(|| format!("failed to load server list from {}", source.describe()))?;

            if json {
                println!("{}", serde_json::to_string_pretty(catalog.servers())?);
            } else if catalog.is_empty() {
                println!("No servers configured.");
            } else {
                println!("{:<3} | {:<20} | {:<12} | Download URL", "#", "Name", "Upload size");
                println!("{:-<3}-|-{:-<20}-|-{:-<12}-|-{:-<40}", "", "", "", "");
                for (i, server) in catalog.iter().enumerate() {
                    println!(
                        "{:<3} | {:<20} | {:<12} | {}",
                        i + 1,
                        server.name,
                        format!("{} MB", server.upload_size() / 1_000_000),
                        server.download_url
                    );
                }
            }
        }
    }

    Ok(())
}

fn init_tracing(config: &SpeedCheckConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[derive(Serialize)]
struct RunSummary {
    outcome: RunOutcome,
    run: Option<RunSnapshot>,
}

async fn run_speed_test(config: &SpeedCheckConfig, source: CatalogSource, json: bool) -> Result<()> {
    let engine = HttpTransferEngine::new(&config.engine_options())
        .context("failed to build HTTP transfer engine")?;
    let manager = SpeedTestManager::spawn(Arc::new(engine), source, config.timing());
    let listener = Arc::new(ConsoleListener { quiet: json });

    tracing::info!(timeout_secs = config.timing.phase_timeout_secs, "Running speed test");
    manager.start_test(listener).await?;

    let outcome = tokio::select! {
        outcome = manager.wait_finished() => outcome?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received, stopping test");
            manager.stop_test()?;
            manager.wait_finished().await?
        }
    };

    let snapshot = manager.snapshot().await?;
    let _ = manager.shutdown();

    if json {
        let summary = RunSummary {
            outcome,
            run: snapshot,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else if let Some(snapshot) = &snapshot {
        print_results(snapshot);
    }

    match outcome {
        RunOutcome::Succeeded | RunOutcome::Cancelled => Ok(()),
        RunOutcome::Exhausted => anyhow::bail!("all speed test servers failed"),
        RunOutcome::ConfigFailed => anyhow::bail!("failed to load server list"),
    }
}

fn print_results(snapshot: &RunSnapshot) {
    if snapshot.results.is_empty() {
        return;
    }
    let rate = |report: Option<Report>| match report {
        Some(r) => format_rate(&r, RateUnit::Mbps),
        None => "-".to_string(),
    };

    println!("\n{:<20} | {:<14} | {:<14} | Status", "Server", "Download", "Upload");
    println!("{:-<20}-|-{:-<14}-|-{:-<14}-|-{:-<20}", "", "", "", "");
    for result in &snapshot.results {
        let status = match &result.status {
            ServerStatus::InProgress => "IN PROGRESS".to_string(),
            ServerStatus::Completed => "OK".to_string(),
            ServerStatus::Failed { direction, reason } => format!("FAIL ({direction}): {reason}"),
            ServerStatus::TimedOut { direction } => format!("TIMEOUT ({direction})"),
            ServerStatus::Cancelled => "CANCELLED".to_string(),
        };
        println!(
            "{:<20} | {:<14} | {:<14} | {}",
            result.name,
            rate(result.download),
            rate(result.upload),
            status
        );
    }
    println!();
}

// ---------------------------------------------------------------------------
// Console listener
// ---------------------------------------------------------------------------

struct ConsoleListener {
    quiet: bool,
}

impl ConsoleListener {
    fn progress(&self, label: &str, percent: f32, report: Report) {
        if self.quiet {
            return;
        }
        print!(
            "\r  {:<8} {:>5.1}%  {:<28}",
            label,
            percent,
            format_rate(&report, RateUnit::Both)
        );
        let _ = std::io::stdout().flush();
    }

    fn complete(&self, label: &str, report: Report) {
        if self.quiet {
            return;
        }
        println!(
            "\r  {:<8} {:<28} [{}]",
            label,
            format_rate(&report, RateUnit::Both),
            report.quality()
        );
    }
}

impl ResultListener for ConsoleListener {
    fn on_download_progress(&self, percent: f32, report: Report) {
        self.progress("download", percent, report);
    }

    fn on_download_complete(&self, report: Report) {
        self.complete("download", report);
    }

    fn on_upload_progress(&self, percent: f32, report: Report) {
        self.progress("upload", percent, report);
    }

    fn on_upload_complete(&self, report: Report) {
        self.complete("upload", report);
    }

    fn on_test_failed(&self, kind: FailureKind, message: &str) {
        eprintln!("\nSpeed test failed ({kind}): {message}");
    }

    fn on_test_cancelled(&self) {
        if !self.quiet {
            println!("\nSpeed test cancelled.");
        }
    }

    fn on_server_started(&self, server: &Server) {
        if !self.quiet {
            println!("Testing {} ...", server.name);
        }
    }
}
