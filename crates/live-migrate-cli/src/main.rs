//! live-migrate CLI - snapshot import, change event apply and reconciliation.

use clap::{Parser, Subcommand};
use live_migrate::{Config, ImporterRole, MigrateError, Orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "live-migrate")]
#[command(about = "Live database migration: snapshot import, change apply and reconciliation")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: trace, debug, info, warn, error (RUST_LOG overrides)
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import every snapshot file into a role's database
    ImportSnapshot {
        /// Importing role: target, fall-forward or fall-back
        #[arg(long, default_value = "target")]
        role: String,
    },

    /// Apply a JSON-lines file of change events to a role's database
    ApplyEvents {
        /// Importing role: target, fall-forward or fall-back
        #[arg(long, default_value = "target")]
        role: String,

        /// Event file, one JSON event per line
        #[arg(long)]
        file: PathBuf,
    },

    /// Forget a role's applied event sequences and counters so events can be re-applied from the start
    ClearEvents {
        /// Importing role: target, fall-forward or fall-back
        #[arg(long, default_value = "target")]
        role: String,
    },

    /// Print the per-table, per-role reconciliation report as JSON
    Report {
        /// Also write the report to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Connect to a role's database and print its server version
    HealthCheck {
        /// Importing role: target, fall-forward or fall-back
        #[arg(long, default_value = "target")]
        role: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let config = Config::load(&cli.config)?.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);
    let orchestrator = Orchestrator::new(config)?;

    match cli.command {
        Commands::ImportSnapshot { role } => {
            let role: ImporterRole = role.parse()?;
            let cancel = setup_signal_handler();
            let summary = orchestrator.import_snapshot(role, Some(cancel)).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("\nSnapshot import into {} finished", role);
                for file in &summary.files {
                    let note = if file.already_imported { " (already imported)" } else { "" };
                    println!("  {} {}: {} rows{}", file.table, file.file, file.rows, note);
                }
                for table in &summary.tables_without_data {
                    println!("  {}: no snapshot data", table);
                }
                println!("  Rows imported: {}", summary.rows_imported());
                println!("  Duration: {:.2}s", summary.duration_seconds);
            }
            if summary.cancelled {
                return Err(MigrateError::Cancelled);
            }
            summary.into_result()?;
        }

        Commands::ApplyEvents { role, file } => {
            let role: ImporterRole = role.parse()?;
            let cancel = setup_signal_handler();
            let summary = orchestrator.apply_events(role, &file, Some(cancel)).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("\nEvents applied to {}", role);
                println!("  Batches applied: {}", summary.batches_applied);
                println!("  Batches already applied: {}", summary.batches_skipped);
                for (table, counts) in &summary.counts {
                    println!(
                        "  {}: {} inserts, {} updates, {} deletes",
                        table, counts.inserts, counts.updates, counts.deletes
                    );
                }
            }
            if summary.cancelled {
                return Err(MigrateError::Cancelled);
            }
            summary.into_result()?;
        }

        Commands::ClearEvents { role } => {
            let role: ImporterRole = role.parse()?;
            orchestrator.clear_event_state(role).await?;
            println!("Cleared event state of {}", role);
        }

        Commands::Report { output } => {
            let report = orchestrator.report().await?;
            let json = serde_json::to_string_pretty(&report)?;
            if let Some(path) = output {
                std::fs::write(&path, &json)?;
                info!("Report written to {:?}", path);
            }
            println!("{}", json);
        }

        Commands::HealthCheck { role } => {
            let role: ImporterRole = role.parse()?;
            let check = orchestrator.health_check(role).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&check)?);
            } else {
                println!("Health Check Results:");
                println!("  Role: {}", check.role);
                println!("  Engine: {}", check.kind);
                println!(
                    "  Version: {}",
                    check.version.as_deref().unwrap_or("unknown")
                );
                println!("  Max connections: {}", check.max_connections);
            }
        }
    }

    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("unknown verbosity '{}'", other)),
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format '{}'", other)),
    }

    Ok(())
}

/// Cancellation flag set on SIGINT or SIGTERM. Passes stop between batches.
#[cfg(unix)]
fn setup_signal_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let (mut sigint, mut sigterm) =
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(int), Ok(term)) => (int, term),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Cannot install signal handlers: {}", e);
                    return;
                }
            };
        tokio::select! {
            _ = sigint.recv() => eprintln!("\nReceived SIGINT. Stopping after the current batches..."),
            _ = sigterm.recv() => eprintln!("\nReceived SIGTERM. Stopping after the current batches..."),
        }
        let _ = tx.send(true);
    });

    rx
}

#[cfg(not(unix))]
fn setup_signal_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!("\nReceived Ctrl-C. Stopping after the current batches...");
                let _ = tx.send(true);
            }
            Err(e) => warn!("Cannot install Ctrl-C handler: {}", e),
        }
    });

    rx
}
