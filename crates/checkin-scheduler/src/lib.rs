//! Durable check-in scheduler.
//!
//! This crate tracks airline reservations and checks each one in as soon as
//! the airline's check-in window opens:
//! - Sleeps until the earliest window opens, waking early when a sooner
//!   reservation arrives
//! - Runs every due reservation concurrently, retrying transient failures
//!   with exponential backoff
//! - Notifies the user of each terminal outcome exactly once
//! - Survives restarts by writing every state change through to a repository

mod backoff;
mod clock;
mod error;
mod executor;
mod notify;
mod persist;
mod runner;
mod scheduler;
mod store;
mod types;

pub use backoff::BackoffPolicy;
pub use clock::{ClockSource, SystemClock, VirtualClock, Wakeup};
pub use error::{PersistenceError, SchedulerError};
pub use executor::CheckInExecutor;
pub use notify::{LogSink, NotificationSink, NotifyError};
pub use persist::{JsonFileRepository, ReservationRepository};
pub use runner::AttemptRunner;
pub use scheduler::{RunMode, Scheduler};
pub use store::{Cancellation, Recovery, ReservationStore};
pub use types::{
    AttemptOutcome, BoardingInfo, BoardingPass, CheckInOutcome, FailureReason, Reservation,
    ReservationId, ReservationRequest, ReservationState, Traveler,
};
