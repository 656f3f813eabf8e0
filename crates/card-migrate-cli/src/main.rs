//! card-migrate CLI - migrate and reconcile card platform data.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use card_migrate::{
    Config, DateGranularity, EntityType, MigrateError, Orchestrator, RunScope, VerifyReport,
};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "card-migrate")]
#[command(about = "Migrate card platform data from the relational store to the document store")]
#[command(version)]
struct Cli {
    /// Optional YAML tuning file (migration, verify and tables sections)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Timeout in seconds for graceful shutdown (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug)]
struct MigrateArgs {
    /// Re-run the phase even if it already completed
    #[arg(long)]
    force: bool,

    /// Look up target records and report what would change without writing
    #[arg(long)]
    dry_run: bool,

    /// Override number of concurrent write workers
    #[arg(long)]
    workers: Option<usize>,

    /// Override the bulk insert chunk size
    #[arg(long)]
    chunk_size: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate users
    MigrateUsers(MigrateArgs),

    /// Migrate cards (requires migrated users)
    MigrateCards(MigrateArgs),

    /// Migrate card analytics (requires migrated cards)
    MigrateAnalytics(MigrateArgs),

    /// Migrate users, cards and analytics in order
    MigrateFull(MigrateArgs),

    /// Compare source and target field by field
    VerifyMigration {
        /// Entity to verify: users, cards, analytics or all
        #[arg(long, default_value = "all")]
        entity: String,

        /// Timestamp comparison: day or exact (default: per-entity setting)
        #[arg(long)]
        date_granularity: Option<String>,

        /// Write every reconciliation entry to this JSON file
        #[arg(long)]
        entries_file: Option<PathBuf>,
    },

    /// Test database connections
    HealthCheck,
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

    setup_logging(&cli.verbosity, &cli.log_format).map_err(MigrateError::Config)?;

    let mut config = Config::load(cli.config.as_deref())?;
    match &cli.config {
        Some(path) => info!("Loaded configuration from environment and {:?}", path),
        None => info!("Loaded configuration from environment"),
    }

    let cancel_token = setup_signal_handler(cli.shutdown_timeout).await?;

    match cli.command {
        Commands::MigrateUsers(ref args) => {
            migrate(&cli, &mut config, RunScope::Users, args, cancel_token).await?
        }
        Commands::MigrateCards(ref args) => {
            migrate(&cli, &mut config, RunScope::Cards, args, cancel_token).await?
        }
        Commands::MigrateAnalytics(ref args) => {
            migrate(&cli, &mut config, RunScope::Analytics, args, cancel_token).await?
        }
        Commands::MigrateFull(ref args) => {
            migrate(&cli, &mut config, RunScope::Full, args, cancel_token).await?
        }

        Commands::VerifyMigration {
            ref entity,
            ref date_granularity,
            ref entries_file,
        } => {
            let entities = parse_entities(entity)?;
            if let Some(granularity) = date_granularity {
                let granularity: DateGranularity =
                    granularity.parse().map_err(MigrateError::Config)?;
                config.verify = config.verify.clone().with_granularity(granularity);
            }
            let sample_limit = config.verify.sample_limit;

            let orchestrator = Orchestrator::connect(config).await?;

            let (tx, mut rx) = mpsc::channel(64);
            let show_progress = cli.progress;
            let progress_task = tokio::spawn(async move {
                while let Some(update) = rx.recv().await {
                    if show_progress {
                        if let Ok(line) = serde_json::to_string(&update) {
                            eprintln!("{}", line);
                        }
                    }
                }
            });

            let result = orchestrator
                .verify_engine()
                .with_progress(tx)
                .verify(&entities)
                .await?;
            let _ = progress_task.await;

            let report = VerifyReport::new(&result, sample_limit);
            if let Some(path) = entries_file {
                report.write_entries(path)?;
                info!("Wrote reconciliation entries to {:?}", path);
            }

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                println!("{}", report.render_text());
            }
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::connect(config).await?;
            orchestrator.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::json!({ "healthy": true }));
            } else {
                println!("Health Check Results:");
                println!("  Source: OK");
                println!("  Target: OK");
            }
        }
    }

    Ok(())
}

async fn migrate(
    cli: &Cli,
    config: &mut Config,
    scope: RunScope,
    args: &MigrateArgs,
    cancel_token: CancellationToken,
) -> Result<(), MigrateError> {
    if let Some(w) = args.workers {
        config.migration.workers = Some(w);
    }
    if let Some(size) = args.chunk_size {
        config.migration.chunk_size = Some(size);
    }
    config.validate()?;

    let orchestrator = Orchestrator::connect(config.clone())
        .await?
        .with_dry_run(args.dry_run)
        .with_force(args.force)
        .with_progress(cli.progress);

    let report = orchestrator.run(scope, cancel_token).await?;

    if cli.output_json {
        println!("{}", report.to_json()?);
    } else {
        println!("{}", report.render_text());
    }
    Ok(())
}

fn parse_entities(value: &str) -> Result<Vec<EntityType>, MigrateError> {
    if value.trim().eq_ignore_ascii_case("all") {
        return Ok(EntityType::ALL.to_vec());
    }
    value
        .split(',')
        .map(|part| part.parse::<EntityType>())
        .collect()
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format '{}', expected text or json", other)),
    }

    Ok(())
}

/// Force the process down if a graceful shutdown takes too long.
fn spawn_shutdown_deadline(token: CancellationToken, shutdown_timeout: u64) {
    tokio::spawn(async move {
        token.cancelled().await;
        tokio::time::sleep(Duration::from_secs(shutdown_timeout)).await;
        warn!("Graceful shutdown timed out after {}s, exiting", shutdown_timeout);
        std::process::exit(i32::from(card_migrate::error::EXIT_CANCELLED));
    });
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();
    });

    spawn_shutdown_deadline(cancel_token.clone(), shutdown_timeout);
    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
            token.cancel();
        }
    });

    spawn_shutdown_deadline(cancel_token.clone(), shutdown_timeout);
    Ok(cancel_token)
}
