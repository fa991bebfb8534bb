//! nibbler CLI - adaptive checksum reconciliation of two record stores.

use clap::{Parser, Subcommand};
use nibbler::{
    Config, Connector, FileSessionStore, Key, KeyType, MemoryConnector, MemorySessionStore,
    NoOpSessionStore, ReconcileError, ReconcileOptions, ReconcileReport, Reconciler, SessionStatus,
    SessionStore, SourceConfig, StateBackendKind, StateConfig,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code of a completed run that found differences with `--fail-on-diff`.
const DIFFERENCES_FOUND: u8 = 1;

#[derive(Parser)]
#[command(name = "nibbler")]
#[command(about = "Adaptive checksum reconciliation between a master and a slave store")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "nibbler.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start or resume the configured job
    Run {
        /// Discard any saved session and start from the beginning
        #[arg(long)]
        restart: bool,

        /// Stop starting new windows after this many seconds
        #[arg(long)]
        time_budget: Option<u64>,

        /// Stop after this many consecutive clean windows
        #[arg(long)]
        stop_on_streak: Option<u64>,

        /// Walk from the highest key down
        #[arg(long)]
        reverse: bool,

        /// Exit with code 1 when differences were found
        #[arg(long)]
        fail_on_diff: bool,
    },

    /// Show the saved session of the configured job
    Status,

    /// Discard the saved session of the configured job
    Reset,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, ReconcileError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| ReconcileError::Config(e.to_string()))?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    if let Commands::Run {
        time_budget,
        stop_on_streak,
        reverse,
        ..
    } = &cli.command
    {
        if time_budget.is_some() {
            config.job.time_budget_secs = *time_budget;
        }
        if stop_on_streak.is_some() {
            config.job.stop_on_streak = *stop_on_streak;
        }
        if *reverse {
            config.job.reverse = true;
        }
        config.validate()?;
    }

    match config.master.key_type {
        KeyType::Integer => execute::<i64>(&cli, config).await,
        KeyType::String => execute::<String>(&cli, config).await,
    }
}

async fn execute<K: Key>(cli: &Cli, config: Config) -> Result<ExitCode, ReconcileError> {
    let store = open_store::<K>(&config.state);

    match cli.command {
        Commands::Run {
            restart,
            fail_on_diff,
            ..
        } => {
            let master = load_source::<K>("master", &config.master)?;
            let slave = load_source::<K>("slave", &config.slave)?;

            let mut opts = ReconcileOptions::new(config.job.id.clone(), config.hash());
            opts.restart = restart;
            opts.time_budget = config.job.time_budget();
            opts.checksum = config.job.checksum_options()?;

            // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
            let cancel_token = setup_signal_handler();
            let mut reconciler =
                Reconciler::new(master, slave, store, opts).with_cancellation(cancel_token);

            let printer = if cli.progress {
                let (tx, mut rx) = mpsc::channel(64);
                reconciler = reconciler.with_progress(tx);
                Some(tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        if let Ok(line) = serde_json::to_string(&event) {
                            eprintln!("{}", line);
                        }
                    }
                }))
            } else {
                None
            };

            let result = reconciler.run().await;
            if let Some(printer) = printer {
                let _ = printer.await;
            }
            let report = result?;

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                print_report(&report);
            }

            if fail_on_diff && !report.is_consistent() {
                return Ok(ExitCode::from(DIFFERENCES_FOUND));
            }
        }

        Commands::Status => match store.load(&config.job.id).await? {
            Some(session) => {
                if cli.output_json {
                    println!("{}", serde_json::to_string_pretty(&session)?);
                } else {
                    println!("Session {}", session.id);
                    println!("  Run ID: {}", session.run_id);
                    match &session.status_reason {
                        Some(reason) => println!("  Status: {} ({})", session.status, reason),
                        None => println!("  Status: {}", session.status),
                    }
                    println!("  Progress: {:.2}%", session.percent_complete());
                    println!(
                        "  Rows: {} correct, {} incorrect, {} missing, {} extra",
                        session.totals.total_correct,
                        session.totals.total_incorrect,
                        session.totals.total_missing,
                        session.totals.total_extra
                    );
                    for line in session.log.iter().rev().take(5).rev() {
                        println!("  | {}", line);
                    }
                }
            }
            None => println!("No saved session for {}", config.job.id),
        },

        Commands::Reset => {
            if store.remove(&config.job.id).await? {
                println!("Removed session {}", config.job.id);
            } else {
                println!("No saved session for {}", config.job.id);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn load_source<K: Key>(
    name: &str,
    source: &SourceConfig,
) -> Result<Arc<dyn Connector<K>>, ReconcileError> {
    let mut connector = MemoryConnector::<K>::from_json_lines(name, &source.path, &source.key)?;
    if let Some(field) = &source.alt_id {
        connector = connector.with_alt_id_field(field.clone());
    }
    info!("{}: {} records from {:?}", name, connector.len(), source.path);
    Ok(Arc::new(connector))
}

fn open_store<K: Key>(state: &StateConfig) -> Arc<dyn SessionStore<K>> {
    match state.backend {
        StateBackendKind::File => Arc::new(FileSessionStore::<K>::new(state.dir.clone())),
        StateBackendKind::Memory => Arc::new(MemorySessionStore::<K>::new()),
        StateBackendKind::None => Arc::new(NoOpSessionStore::<K>::new()),
    }
}

fn print_report<K: Key>(report: &ReconcileReport<K>) {
    let headline = match (&report.stop_reason, report.is_consistent()) {
        (Some(reason), _) if report.status == SessionStatus::Running => {
            format!("Reconciliation paused ({})", reason)
        }
        (_, true) => "Reconciliation completed: stores are consistent".to_string(),
        (_, false) => "Reconciliation completed: differences found".to_string(),
    };
    println!("\n{}", headline);
    println!("  Run ID: {}", report.run_id);
    println!("  Status: {}", report.status);
    if report.resumed {
        println!("  Resumed: yes");
    }
    println!("  Duration: {:.2}s", report.duration_seconds);
    println!("  Progress: {:.2}%", report.percent_complete);
    println!("  Windows: {}", report.windows);
    println!(
        "  Rows: {} correct, {} incorrect, {} missing, {} extra",
        report.totals.total_correct,
        report.totals.total_incorrect,
        report.totals.total_missing,
        report.totals.total_extra
    );
    if !report.sample.incorrect.is_empty() {
        println!("  Sample incorrect: {:?}", report.sample.incorrect);
    }
    if !report.sample.missing.is_empty() {
        println!("  Sample missing: {:?}", report.sample.missing);
    }
    if !report.sample.extra.is_empty() {
        println!("  Sample extra: {:?}", report.sample.extra);
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("unknown verbosity '{}'", other)),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
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

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// The current window finishes and the session is saved before exiting.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    eprintln!("Failed to setup {} handler: {}", name, e);
                    return;
                }
            };
            stream.recv().await;
            eprintln!("\nReceived {}. Stopping after the current window...", name);
            token.cancel();
        });
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping after the current window...");
            token.cancel();
        }
    });

    cancel_token
}
