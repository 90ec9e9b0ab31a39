//! chat-migrate CLI - resumable chat history migration.

use chat_migrate::{
    progress, ChatClient, Config, DialogKind, MigrateError, MigrationOrchestrator,
};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "chat-migrate")]
#[command(about = "Resumable, rate-limit-aware chat history migration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to progress file for resume capability
    #[arg(long = "progress", default_value = "progress.json")]
    progress_file: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Timeout in seconds for graceful shutdown (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    /// Defaults to `migrate` when omitted
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start or resume the migration
    Migrate {
        /// Restrict the run to these conversation ids
        #[arg(long = "conversation")]
        conversations: Vec<i64>,

        /// Only migrate messages sent on or after this date (RFC 3339
        /// or YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,

        /// Only migrate messages sent on or before this date (RFC 3339
        /// or YYYY-MM-DD)
        #[arg(long)]
        to: Option<String>,

        /// Dry run: enumerate and show the plan without forwarding
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the state recorded in the progress file
    Status,

    /// Export the progress document to a portable file
    Export {
        /// Destination path for the exported document
        output: PathBuf,
    },

    /// Import a progress document, replacing the progress file
    Import {
        /// Path of the document to import
        input: PathBuf,
    },

    /// Remove the progress file so the next run starts fresh
    Clean {
        /// Delete without confirmation
        #[arg(long, short)]
        force: bool,
    },

    /// List conversations of the source account
    List {
        /// Restrict to one conversation kind: user, group, channel, bot
        #[arg(long = "type")]
        kind: Option<String>,
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

    // Setup logging
    setup_logging(cli.verbose, cli.quiet, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    // Migrate is the default command.
    let command = cli.command.unwrap_or(Commands::Migrate {
        conversations: Vec::new(),
        from: None,
        to: None,
        dry_run: false,
    });

    match command {
        Commands::Migrate {
            conversations,
            from,
            to,
            dry_run,
        } => {
            let mut config = Config::load(&cli.config)?;
            info!("Loaded configuration from {:?}", cli.config);

            // Apply overrides
            if !conversations.is_empty() {
                config.filters.dialogs = conversations;
            }
            if let Some(ref s) = from {
                config.forward.date_from = Some(parse_date(s, false)?);
            }
            if let Some(ref s) = to {
                config.forward.date_to = Some(parse_date(s, true)?);
            }
            config.validate()?;

            let client = connect_client(&config)?;
            let orchestrator = MigrationOrchestrator::new(config, client)
                .with_progress_file(cli.progress_file.clone());

            // Surface induced flood waits on the terminal.
            orchestrator
                .limiter()
                .set_countdown(Arc::new(|remaining, operation| {
                    eprint!("\rFlood wait: {}s remaining ({})   ", remaining, operation);
                }))
                .await;

            // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
            let cancel_token = setup_signal_handler(cli.shutdown_timeout).await?;

            let report = orchestrator.run(Some(cancel_token), dry_run).await?;

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                let status_msg = if dry_run {
                    "Dry run completed!"
                } else {
                    "Migration completed!"
                };
                println!("\n{}", status_msg);
                println!("  Run ID: {}", report.run_id);
                println!("  Status: {}", report.status);
                println!("  Duration: {:.2}s", report.duration_seconds);
                println!(
                    "  Conversations: {}/{}",
                    report.dialogs_completed, report.dialogs_total
                );
                println!("  Messages: {}", report.messages_migrated);
                if report.flood_waits > 0 {
                    println!(
                        "  Flood waits: {} ({}s signaled)",
                        report.flood_waits, report.total_wait_seconds
                    );
                }
                if !report.failed_dialogs.is_empty() {
                    println!("  Failed conversations: {:?}", report.failed_dialogs);
                }
            }
        }

        Commands::Status => {
            if !cli.progress_file.exists() {
                println!("No progress file found at {:?}", cli.progress_file);
                return Ok(());
            }
            let doc = progress::load(&cli.progress_file)?;

            if cli.output_json {
                println!("{}", progress::export_progress(&doc)?);
            } else {
                println!("Migration status ({:?})", cli.progress_file);
                println!("  Phase: {:?}", doc.current_phase);
                println!("  Source: {}", display_or_dash(&doc.source_account));
                println!("  Target: {}", display_or_dash(&doc.target_account));
                println!(
                    "  Conversations: {} total, {} completed, {} failed, {} skipped",
                    doc.stats.total_dialogs,
                    doc.stats.completed_dialogs,
                    doc.stats.failed_dialogs,
                    doc.stats.skipped_dialogs
                );
                println!(
                    "  Messages: {} migrated, {} failed (of {} known)",
                    doc.stats.migrated_messages,
                    doc.stats.failed_messages,
                    doc.stats.total_messages
                );
                if doc.stats.flood_wait_count > 0 {
                    println!(
                        "  Flood waits: {} ({}s signaled)",
                        doc.stats.flood_wait_count, doc.stats.total_wait_seconds
                    );
                }
                println!("  Last updated: {}", doc.updated_at);
            }
        }

        Commands::Export { output } => {
            if !cli.progress_file.exists() {
                return Err(MigrateError::Config(format!(
                    "progress file not found: {:?}",
                    cli.progress_file
                )));
            }
            let doc = progress::load(&cli.progress_file)?;
            std::fs::write(&output, progress::export_progress(&doc)?)?;
            println!("Exported progress to {:?}", output);
        }

        Commands::Import { input } => {
            let content = std::fs::read_to_string(&input)?;
            let doc = progress::import_progress(&content)?;
            progress::save(&cli.progress_file, &doc)?;
            println!(
                "Imported progress for {} conversations into {:?}",
                doc.dialogs.len(),
                cli.progress_file
            );
        }

        Commands::Clean { force } => {
            if !cli.progress_file.exists() {
                println!("Nothing to clean: no progress file at {:?}", cli.progress_file);
                return Ok(());
            }
            if !force {
                println!(
                    "Would remove {:?}; pass --force to delete",
                    cli.progress_file
                );
                return Ok(());
            }
            std::fs::remove_file(&cli.progress_file)?;
            println!("Removed {:?}", cli.progress_file);
        }

        Commands::List { kind } => {
            let kind = match kind {
                Some(ref s) => Some(DialogKind::parse(s).ok_or_else(|| {
                    MigrateError::Config(format!(
                        "unknown conversation type {:?} (expected user, group, channel or bot)",
                        s
                    ))
                })?),
                None => None,
            };
            let config = Config::load(&cli.config)?;
            let client = connect_client(&config)?;
            let dialogs = client.enumerate_dialogs().await?;
            for dialog in dialogs
                .iter()
                .filter(|d| kind.map_or(true, |k| d.kind == k))
            {
                println!(
                    "{:>12}  {:<8}  {:>8}  {}",
                    dialog.id,
                    format!("{:?}", dialog.kind).to_lowercase(),
                    dialog.total_messages,
                    dialog.title
                );
            }
        }
    }

    Ok(())
}

/// Connect to the remote chat platform.
///
/// This binary ships without a wire-protocol adapter; deployments link
/// one in by constructing the orchestrator from the library with their
/// own [`ChatClient`] implementation.
fn connect_client(_config: &Config) -> Result<Arc<dyn ChatClient>, MigrateError> {
    Err(MigrateError::Config(
        "no platform backend is linked into this binary; \
         embed the chat-migrate library with a ChatClient adapter"
            .to_string(),
    ))
}

fn display_or_dash(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}

/// Parse an RFC 3339 timestamp, or a bare date taken as the start
/// (`end_of_day` false) or end (`end_of_day` true) of that UTC day.
fn parse_date(s: &str, end_of_day: bool) -> Result<DateTime<Utc>, MigrateError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let time = if end_of_day {
            date.and_hms_opt(23, 59, 59)
        } else {
            date.and_hms_opt(0, 0, 0)
        };
        if let Some(naive) = time {
            return Ok(DateTime::from_naive_utc_and_offset(naive, Utc));
        }
    }
    Err(MigrateError::Config(format!(
        "invalid date {:?} (expected RFC 3339 or YYYY-MM-DD)",
        s
    )))
}

fn setup_logging(verbose: bool, quiet: bool, format: &str) -> Result<(), String> {
    let level = if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM. Returns a token that is
/// cancelled on the first signal; once signalled, a watchdog forces the
/// process down after the grace period.
#[cfg(unix)]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    // Clone token for each signal handler
    let token_int = cancel_token.clone();
    let token_term = cancel_token.clone();

    // SIGINT handler (Ctrl-C)
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT handler");
        sigint.recv().await;
        eprintln!(
            "\nReceived SIGINT. Shutting down gracefully (timeout: {}s)...",
            shutdown_timeout
        );
        token_int.cancel();
    });

    // SIGTERM handler
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
        sigterm.recv().await;
        eprintln!(
            "\nReceived SIGTERM. Shutting down gracefully (timeout: {}s)...",
            shutdown_timeout
        );
        token_term.cancel();
    });

    spawn_watchdog(cancel_token.clone(), shutdown_timeout);
    Ok(cancel_token)
}

/// Setup signal handler for Windows (only SIGINT/Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to setup Ctrl-C handler");
        eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
        token.cancel();
    });

    spawn_watchdog(cancel_token.clone(), shutdown_timeout);
    Ok(cancel_token)
}

/// Once shutdown is requested, give the run the grace period to reach a
/// safe point, then exit hard. Progress saved at batch boundaries keeps
/// the run resumable either way.
fn spawn_watchdog(cancel_token: CancellationToken, shutdown_timeout: u64) {
    tokio::spawn(async move {
        cancel_token.cancelled().await;
        tokio::time::sleep(std::time::Duration::from_secs(shutdown_timeout)).await;
        eprintln!("Graceful shutdown timed out after {}s, exiting", shutdown_timeout);
        std::process::exit(130);
    });
}
