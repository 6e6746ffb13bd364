//! Error types for the scheduler.

use thiserror::Error;

use crate::ReservationId;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed reservation input or policy; rejected before scheduling.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Reservation already tracked for this confirmation number and traveler.
    #[error("reservation already exists: {0}")]
    DuplicateReservation(ReservationId),

    /// Reservation not found.
    #[error("reservation not found: {0}")]
    NotFound(ReservationId),

    /// The requested state change is not allowed from the current state.
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: ReservationId,
        from: &'static str,
        to: &'static str,
    },

    /// An attempt runner panicked before reaching a terminal outcome.
    #[error("attempt runner panicked: {0}")]
    RunnerPanicked(String),

    /// Loading or saving the reservation set failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Errors from the persistence boundary.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// State file written by an incompatible version.
    #[error("unsupported state file version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}
