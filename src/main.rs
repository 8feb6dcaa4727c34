use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use spendometer::config::{self, AppConfig};
use spendometer::error::MeterError;
use spendometer::ingest::{self, IngestOptions};
use spendometer::mailbox::imap::ImapMailbox;
use spendometer::store::{self, donations, DbPool};

#[derive(Parser)]
#[command(version, about = "Tracks donation totals from payment confirmation emails")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the mailbox and record new donations
    Run {
        /// Run a single cycle and exit instead of polling forever
        #[arg(long)]
        once: bool,

        /// Report what would be recorded without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Override the per-cycle message limit
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
    },

    /// Print the total of all recorded donations as JSON
    Total,

    /// Print the most recent donations as JSON, newest first
    Recent {
        /// How many entries to print
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();

    match run_command(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    // Can be overridden with the RUST_LOG environment variable
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("spendometer=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_command(cli: &Cli) -> Result<(), MeterError> {
    let config = config::load_config(cli.config.as_deref())?;
    let pool = store::create_pool(&config.store.resolved_db_path())?;

    match &cli.command {
        Command::Run {
            once,
            dry_run,
            limit,
        } => run_ingestion(&config, &pool, *once, *dry_run, *limit).await,

        Command::Total => {
            let total = donations::total_amount(&pool)?;
            println!("{}", serde_json::json!({ "total": total.to_string() }));
            Ok(())
        }

        Command::Recent { count } => {
            let entries: Vec<serde_json::Value> = donations::recent(&pool, *count)?
                .iter()
                .map(|record| {
                    serde_json::json!({
                        "transaction_id": record.transaction_id,
                        "amount": record.amount.to_string(),
                        "currency": record.currency,
                        "payer_name": record.payer_name,
                        "received_at": record.received_at,
                    })
                })
                .collect();
            println!("{}", serde_json::Value::Array(entries));
            Ok(())
        }
    }
}

async fn run_ingestion(
    config: &AppConfig,
    pool: &DbPool,
    once: bool,
    dry_run: bool,
    limit: Option<usize>,
) -> Result<(), MeterError> {
    let password = config.imap.password.resolve()?;
    let mut source = ImapMailbox::new(config.imap.clone(), password);

    let mut options = IngestOptions::from_config(&config.ingest);
    options.dry_run = dry_run;
    if let Some(limit) = limit {
        // --limit 0 would silently fetch nothing forever.
        options.batch_limit = limit.max(1);
    }

    if once {
        ingest::run_once(&mut source, pool, &options).await?;
        return Ok(());
    }

    let interval = Duration::from_secs(config.ingest.interval_secs);
    let mut ticker = tokio::time::interval(interval);
    info!(interval_secs = config.ingest.interval_secs, "Starting poll loop");

    loop {
        ticker.tick().await;

        // A bad cycle must not kill the loop. Auth failures are the
        // exception: retrying those every few minutes only gets the
        // account locked.
        match ingest::run_once(&mut source, pool, &options).await {
            Ok(_) => {}
            Err(e @ MeterError::Auth(_)) => return Err(e),
            Err(e) => error!("Ingestion cycle failed: {}", e),
        }
    }
}
