//! Delivery of check-in outcomes to the user.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::{CheckInOutcome, Reservation};

/// Errors from a notification sink.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Transport failed after any retries the sink performs itself.
    #[error("notification delivery failed: {0}")]
    Delivery(String),

    /// The receiving side refused the message.
    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Receives terminal outcomes, exactly once per reservation.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver the terminal outcome of `reservation`.
    async fn notify(
        &self,
        reservation: &Reservation,
        outcome: &CheckInOutcome,
    ) -> Result<(), NotifyError>;

    /// Tell the user a reservation was accepted and when check-in will run.
    async fn scheduled(&self, _reservation: &Reservation) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Sink that writes outcomes to the log.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(
        &self,
        reservation: &Reservation,
        outcome: &CheckInOutcome,
    ) -> Result<(), NotifyError> {
        match outcome {
            CheckInOutcome::Succeeded(boarding) => info!(
                reservation = %reservation.id,
                traveler = %reservation.traveler,
                boarding = %boarding,
                "checked in"
            ),
            CheckInOutcome::Failed(reason) => warn!(
                reservation = %reservation.id,
                traveler = %reservation.traveler,
                attempts = reservation.attempt_count,
                last_error = ?reservation.last_error,
                reason = %reason,
                "check-in failed"
            ),
        }
        Ok(())
    }

    async fn scheduled(&self, reservation: &Reservation) -> Result<(), NotifyError> {
        info!(
            reservation = %reservation.id,
            departure = %reservation.departure,
            opens_at = %reservation.check_in_opens_at,
            "check-in scheduled"
        );
        Ok(())
    }
}
