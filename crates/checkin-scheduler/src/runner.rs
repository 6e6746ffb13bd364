//! Drives one reservation's check-in attempts to a terminal outcome.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::{
    AttemptOutcome, BackoffPolicy, CheckInExecutor, CheckInOutcome, ClockSource, FailureReason,
    NotificationSink, Reservation, ReservationId, ReservationState, ReservationStore,
    SchedulerError,
};

/// Default bound on a single executor call.
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Retries a reservation's check-in until it succeeds, fails permanently, or
/// runs out of budget, then records and reports the outcome once.
pub struct AttemptRunner {
    store: ReservationStore,
    executor: Arc<dyn CheckInExecutor>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn ClockSource>,
    policy: BackoffPolicy,
    attempt_timeout: Duration,
}

impl AttemptRunner {
    pub fn new(
        store: ReservationStore,
        executor: Arc<dyn CheckInExecutor>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        Self {
            store,
            executor,
            sink,
            clock,
            policy: BackoffPolicy::default(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    /// Use a custom retry policy.
    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bound each executor call by `timeout`.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn store(&self) -> &ReservationStore {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn ClockSource> {
        &self.clock
    }

    /// Run attempts for a reservation the scheduler moved to `Attempting`.
    ///
    /// Returns only terminal outcomes; intermediate retries are internal. An
    /// error means the store could not record progress and the reservation is
    /// still `Attempting`.
    #[tracing::instrument(skip_all, fields(reservation = %reservation.id))]
    pub async fn run(&self, reservation: Reservation) -> Result<CheckInOutcome, SchedulerError> {
        let outcome = self.drive(&reservation).await?;
        self.finish(&reservation.id, &outcome).await?;
        Ok(outcome)
    }

    async fn drive(&self, reservation: &Reservation) -> Result<CheckInOutcome, SchedulerError> {
        let id = &reservation.id;
        let started = self.clock.now();

        loop {
            if self.store.is_cancel_requested(id).await {
                info!("reservation cancelled before next attempt");
                return Ok(CheckInOutcome::Failed(FailureReason::Cancelled));
            }
            if reservation.has_departed(self.clock.now()) {
                warn!(departure = %reservation.departure, "flight departed before check-in");
                return Ok(CheckInOutcome::Failed(FailureReason::Departed));
            }

            let current = self.store.begin_attempt(id).await?;
            let attempt = current.attempt_count;
            debug!(attempt, "attempting check-in");

            let result =
                match tokio::time::timeout(self.attempt_timeout, self.executor.attempt(&current))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => AttemptOutcome::RetryableFailure("timeout".to_string()),
                };

            let reason = match result {
                // A completed check-in stands even if cancellation was requested
                AttemptOutcome::Success(boarding) => {
                    info!(attempt, boarding = %boarding, "check-in succeeded");
                    return Ok(CheckInOutcome::Succeeded(boarding));
                }
                AttemptOutcome::PermanentFailure(reason) => {
                    if self.store.is_cancel_requested(id).await {
                        info!(attempt, reason = %reason, "check-in rejected after cancellation");
                        return Ok(CheckInOutcome::Failed(FailureReason::Cancelled));
                    }
                    warn!(attempt, reason = %reason, "check-in rejected");
                    return Ok(CheckInOutcome::Failed(FailureReason::Rejected { reason }));
                }
                AttemptOutcome::RetryableFailure(reason) => reason,
            };

            self.store.record_retryable(id, &reason).await?;

            if self.store.is_cancel_requested(id).await {
                info!(attempt, "reservation cancelled during attempt");
                return Ok(CheckInOutcome::Failed(FailureReason::Cancelled));
            }

            let now = self.clock.now();
            if reservation.has_departed(now) {
                warn!(attempt, reason = %reason, "flight departed, giving up");
                return Ok(CheckInOutcome::Failed(FailureReason::Departed));
            }

            let elapsed = (now - started).to_std().unwrap_or_default();
            if !self.policy.allows_retry(attempt, elapsed) {
                warn!(
                    attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    reason = %reason,
                    "retry budget exhausted"
                );
                return Ok(CheckInOutcome::Failed(FailureReason::RetryBudgetExhausted));
            }

            let delay = self.policy.delay(attempt);
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "check-in failed, retrying"
            );
            self.clock.sleep(delay).await;
        }
    }

    /// Record the terminal outcome, then notify.
    async fn finish(
        &self,
        id: &ReservationId,
        outcome: &CheckInOutcome,
    ) -> Result<(), SchedulerError> {
        let reservation = self.store.record_outcome(id, outcome).await?;
        self.notify_terminal(&reservation, outcome).await
    }

    /// Send the terminal notification unless it was already claimed.
    ///
    /// Delivery failures are logged and never affect the reservation. An
    /// error means the claim could not be saved and nothing was sent.
    pub async fn notify_terminal(
        &self,
        reservation: &Reservation,
        outcome: &CheckInOutcome,
    ) -> Result<(), SchedulerError> {
        if !self.store.claim_notification(&reservation.id).await? {
            debug!(reservation = %reservation.id, "notification already claimed");
            return Ok(());
        }

        if let Err(e) = self.sink.notify(reservation, outcome).await {
            warn!(
                reservation = %reservation.id,
                error = %e,
                "failed to deliver outcome notification"
            );
        }
        Ok(())
    }

    /// Tell the user a reservation was accepted.
    pub async fn notify_scheduled(&self, reservation: &Reservation) {
        if let Err(e) = self.sink.scheduled(reservation).await {
            warn!(
                reservation = %reservation.id,
                error = %e,
                "failed to deliver scheduled notification"
            );
        }
    }

    /// Handle a runner that died before reaching a terminal outcome.
    ///
    /// Treated like a retryable failure: the reservation goes back into the
    /// working set after a backoff delay, or fails once the budget is spent.
    pub async fn handle_dispatch_failure(
        &self,
        id: &ReservationId,
        reason: &str,
    ) -> Result<(), SchedulerError> {
        let Some(reservation) = self.store.get(id).await else {
            error!(reservation = %id, "dispatch failed for unknown reservation");
            return Ok(());
        };
        if reservation.state != ReservationState::Attempting {
            // The runner recorded an outcome before it died.
            return Ok(());
        }
        error!(reservation = %id, reason, "attempt runner died, treating as retryable");

        self.store.record_retryable(id, reason).await?;

        let now = self.clock.now();
        let attempts = reservation.attempt_count + 1;

        let terminal = if reservation.cancel_requested {
            Some(FailureReason::Cancelled)
        } else if reservation.has_departed(now) {
            Some(FailureReason::Departed)
        } else if !self.policy.allows_retry(attempts, Duration::ZERO) {
            // Elapsed retry time is tracked per runner; a new runner starts fresh.
            Some(FailureReason::RetryBudgetExhausted)
        } else {
            None
        };

        if let Some(reason) = terminal {
            return self.finish(id, &CheckInOutcome::Failed(reason)).await;
        }

        let delay = chrono::Duration::from_std(self.policy.delay(attempts))
            .unwrap_or_else(|_| chrono::Duration::zero());
        let requeued = self.store.requeue(id, now + delay).await?;
        info!(
            reservation = %id,
            attempts = requeued.attempt_count,
            retry_at = ?requeued.retry_at,
            "reservation requeued after dispatch failure"
        );
        Ok(())
    }
}
