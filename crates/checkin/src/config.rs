//! Reservation file loading and run configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use checkin_scheduler::{BackoffPolicy, Reservation, ReservationRequest, SchedulerError};

/// Errors while loading configuration; all are fatal before scheduling starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Invalid(#[from] SchedulerError),
}

/// Options for the `run` command.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub reservations: PathBuf,
    pub state_file: Option<PathBuf>,
    pub window_hours: u32,
    pub policy: BackoffPolicy,
    pub attempt_timeout: Duration,
    pub executor: PathBuf,
    pub executor_args: Vec<String>,
    pub webhook_url: Option<String>,
}

impl RunConfig {
    /// Default check-in window as a duration.
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.window_hours))
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_hours == 0 {
            return Err(SchedulerError::Configuration(
                "check-in window must be at least one hour".to_string(),
            )
            .into());
        }
        if self.attempt_timeout.is_zero() {
            return Err(SchedulerError::Configuration(
                "attempt timeout must be positive".to_string(),
            )
            .into());
        }
        self.policy.validate()?;
        Ok(())
    }
}

/// Reservations ready to schedule, split from ones whose flight already left.
#[derive(Debug, Default)]
pub struct Schedule {
    pub accepted: Vec<Reservation>,
    pub departed: Vec<Reservation>,
}

/// Read a JSON list of reservation requests.
pub async fn load_requests(path: &Path) -> Result<Vec<ReservationRequest>, ConfigError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Validate every request and build its reservation.
///
/// Any malformed request fails the whole batch. Reservations that already
/// departed at `now` are set aside rather than scheduled.
pub fn build_schedule(
    requests: Vec<ReservationRequest>,
    default_window: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<Schedule, ConfigError> {
    let mut schedule = Schedule::default();
    for request in requests {
        let reservation = request.into_reservation(default_window)?;
        if reservation.has_departed(now) {
            schedule.departed.push(reservation);
        } else {
            schedule.accepted.push(reservation);
        }
    }
    Ok(schedule)
}
