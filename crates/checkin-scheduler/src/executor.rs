//! Boundary to whatever actually performs a check-in.

use async_trait::async_trait;

use crate::{AttemptOutcome, Reservation};

/// Performs one check-in attempt against the airline.
///
/// Implementations classify every remote error as retryable or permanent;
/// the runner never second-guesses that classification. Calling `attempt`
/// again for a reservation that already checked in must report success or a
/// permanent failure, never silently undo the earlier check-in.
#[async_trait]
pub trait CheckInExecutor: Send + Sync {
    async fn attempt(&self, reservation: &Reservation) -> AttemptOutcome;
}
