//! checkin: automated airline check-in
//!
//! Main binary with subcommands:
//! - `run`: Schedule reservations and check each one in when its window opens
//! - `validate`: Check a reservation file and print the computed schedule
//! - `status`: Show the reservations recorded in a state file

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use checkin_scheduler::{BackoffPolicy, JsonFileRepository, ReservationRepository};

mod config;
mod executor;
mod run;
mod webhook;

#[derive(Parser)]
#[command(name = "checkin")]
#[command(about = "Automated airline check-in", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Schedule reservations and check in as soon as each window opens
    Run {
        /// JSON file listing the reservations to check in
        #[arg(long, env = "CHECKIN_RESERVATIONS")]
        reservations: PathBuf,

        /// State file; progress survives restarts when set
        #[arg(long, env = "CHECKIN_STATE_FILE")]
        state_file: Option<PathBuf>,

        /// Hours before departure that check-in opens
        #[arg(long, env = "CHECKIN_WINDOW_HOURS", default_value = "24")]
        window_hours: u32,

        /// Maximum check-in attempts per reservation
        #[arg(long, env = "CHECKIN_MAX_ATTEMPTS", default_value = "10")]
        max_attempts: u32,

        /// Delay after the first failed attempt, in milliseconds
        #[arg(long, env = "CHECKIN_INITIAL_BACKOFF_MS", default_value = "500")]
        initial_backoff_ms: u64,

        /// Upper bound on any single retry delay, in seconds
        #[arg(long, env = "CHECKIN_MAX_BACKOFF_SECS", default_value = "30")]
        max_backoff_secs: u64,

        /// Growth factor between retry delays
        #[arg(long, env = "CHECKIN_BACKOFF_MULTIPLIER", default_value = "2.0")]
        backoff_multiplier: f64,

        /// Give up retrying a reservation after this many seconds
        #[arg(long, env = "CHECKIN_MAX_RETRY_SECS", default_value = "600")]
        max_retry_secs: u64,

        /// Abandon a single attempt after this many seconds
        #[arg(long, env = "CHECKIN_ATTEMPT_TIMEOUT_SECS", default_value = "60")]
        attempt_timeout_secs: u64,

        /// Program that performs one check-in attempt
        #[arg(long, env = "CHECKIN_EXECUTOR")]
        executor: PathBuf,

        /// Argument passed to the executor program (repeatable)
        #[arg(long = "executor-arg", allow_hyphen_values = true)]
        executor_args: Vec<String>,

        /// POST outcomes to this URL instead of only logging them
        #[arg(long, env = "CHECKIN_WEBHOOK_URL")]
        webhook_url: Option<String>,
    },

    /// Check a reservation file and print when each check-in will run
    Validate {
        /// JSON file listing the reservations to check in
        #[arg(long, env = "CHECKIN_RESERVATIONS")]
        reservations: PathBuf,

        /// Hours before departure that check-in opens
        #[arg(long, env = "CHECKIN_WINDOW_HOURS", default_value = "24")]
        window_hours: u32,
    },

    /// Show the reservations recorded in a state file
    Status {
        /// State file written by `run`
        #[arg(long, env = "CHECKIN_STATE_FILE")]
        state_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "checkin=info,checkin_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            reservations,
            state_file,
            window_hours,
            max_attempts,
            initial_backoff_ms,
            max_backoff_secs,
            backoff_multiplier,
            max_retry_secs,
            attempt_timeout_secs,
            executor,
            executor_args,
            webhook_url,
        } => {
            run::run(config::RunConfig {
                reservations,
                state_file,
                window_hours,
                policy: BackoffPolicy {
                    initial_delay: Duration::from_millis(initial_backoff_ms),
                    multiplier: backoff_multiplier,
                    max_delay: Duration::from_secs(max_backoff_secs),
                    max_attempts,
                    max_elapsed: Duration::from_secs(max_retry_secs),
                },
                attempt_timeout: Duration::from_secs(attempt_timeout_secs),
                executor,
                executor_args,
                webhook_url,
            })
            .await
        }

        Commands::Validate {
            reservations,
            window_hours,
        } => validate(&reservations, window_hours).await,

        Commands::Status { state_file } => status(&state_file).await,
    }
}

async fn validate(path: &std::path::Path, window_hours: u32) -> Result<()> {
    if window_hours == 0 {
        return Err(miette::miette!("check-in window must be at least one hour"));
    }

    let requests = config::load_requests(path)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    let schedule = config::build_schedule(
        requests,
        chrono::Duration::hours(i64::from(window_hours)),
        Utc::now(),
    )
    .map_err(|e| miette::miette!("{}", e))?;

    let mut accepted = schedule.accepted;
    accepted.sort_by_key(|r| r.check_in_opens_at);

    for reservation in &accepted {
        println!(
            "{}  {}  check-in opens {}  departs {}",
            reservation.confirmation_number,
            reservation.traveler,
            reservation.check_in_opens_at.to_rfc3339(),
            reservation.departure.to_rfc3339()
        );
    }
    for reservation in &schedule.departed {
        println!(
            "{}  {}  already departed {}, will be skipped",
            reservation.confirmation_number,
            reservation.traveler,
            reservation.departure.to_rfc3339()
        );
    }

    println!(
        "{} reservation(s) valid, {} to schedule",
        accepted.len() + schedule.departed.len(),
        accepted.len()
    );
    Ok(())
}

async fn status(path: &std::path::Path) -> Result<()> {
    let reservations = JsonFileRepository::new(path)
        .load()
        .await
        .map_err(|e| miette::miette!("failed to read state file: {}", e))?;

    if reservations.is_empty() {
        println!("no reservations recorded in {}", path.display());
        return Ok(());
    }

    for reservation in &reservations {
        let detail = match reservation.outcome() {
            Some(outcome) => outcome.to_string(),
            None => format!("opens {}", reservation.check_in_opens_at.to_rfc3339()),
        };
        println!(
            "{}  {}  {}  attempts={}  {}",
            reservation.confirmation_number,
            reservation.traveler,
            reservation.state.name(),
            reservation.attempt_count,
            detail
        );
        if let Some(error) = &reservation.last_error {
            println!("    last error: {error}");
        }
    }
    Ok(())
}
