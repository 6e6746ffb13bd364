//! Check-in scheduler implementation.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    AttemptRunner, Cancellation, CheckInOutcome, FailureReason, Recovery, Reservation,
    ReservationId, ReservationStore, SchedulerError,
};

/// Result reported by a worker task: the reservation it ran and either its
/// terminal outcome or why the runner died.
type WorkerResult = (ReservationId, Result<CheckInOutcome, SchedulerError>);

/// When the scheduling loop should stop on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Stop once every tracked reservation is terminal.
    UntilIdle,
    /// Keep running until shutdown, for embedders that submit reservations
    /// while the loop runs.
    Forever,
}

/// The check-in scheduler.
///
/// One loop sleeps until the earliest fire time, then hands every due
/// reservation to its own attempt runner task.
pub struct Scheduler {
    store: ReservationStore,
    runner: Arc<AttemptRunner>,
}

impl Scheduler {
    /// Create a scheduler over the runner's store.
    pub fn new(runner: AttemptRunner) -> Self {
        Self {
            store: runner.store().clone(),
            runner: Arc::new(runner),
        }
    }

    pub fn store(&self) -> &ReservationStore {
        &self.store
    }

    /// Start tracking a reservation and tell the user when check-in runs.
    ///
    /// The scheduled notice is sent from its own task, so a slow sink never
    /// holds up scheduling.
    pub async fn submit(&self, reservation: Reservation) -> Result<Reservation, SchedulerError> {
        let reservation = self.store.add(reservation).await?;

        let runner = Arc::clone(&self.runner);
        let notice = reservation.clone();
        tokio::spawn(async move { runner.notify_scheduled(&notice).await });

        Ok(reservation)
    }

    /// Withdraw a reservation.
    ///
    /// Before an attempt starts this is immediate and notifies the user. While
    /// an attempt is in flight it only takes effect at the next retry step.
    pub async fn cancel(&self, id: &ReservationId) -> Result<Cancellation, SchedulerError> {
        let cancellation = self.store.cancel(id).await?;
        if let Cancellation::Withdrawn(reservation) = &cancellation {
            self.runner
                .notify_terminal(
                    reservation,
                    &CheckInOutcome::Failed(FailureReason::Cancelled),
                )
                .await?;
        }
        Ok(cancellation)
    }

    /// Deliver notifications that a crash prevented from being sent.
    pub async fn recover(&self, recovery: &Recovery) -> Result<(), SchedulerError> {
        for reservation in &recovery.unnotified {
            if let Some(outcome) = reservation.outcome() {
                info!(reservation = %reservation.id, "sending notification missed before restart");
                self.runner.notify_terminal(reservation, &outcome).await?;
            }
        }
        Ok(())
    }

    /// Run the scheduler loop.
    ///
    /// Returns an error only when the store can no longer save its state; the
    /// in-flight attempts are aborted first and resume on restart.
    pub async fn run(
        &self,
        mut shutdown_rx: watch::Receiver<bool>,
        mode: RunMode,
    ) -> Result<(), SchedulerError> {
        info!(?mode, "scheduler starting");

        let mut workers: JoinSet<WorkerResult> = JoinSet::new();
        let result = self.run_loop(&mut workers, &mut shutdown_rx, mode).await;

        if !workers.is_empty() {
            warn!(
                in_flight = workers.len(),
                "aborting in-flight attempts, they resume on restart"
            );
            workers.shutdown().await;
        }

        match &result {
            Ok(()) => info!("scheduler shut down gracefully"),
            Err(e) => error!(error = %e, "scheduler stopped"),
        }
        result
    }

    async fn run_loop(
        &self,
        workers: &mut JoinSet<WorkerResult>,
        shutdown_rx: &mut watch::Receiver<bool>,
        mode: RunMode,
    ) -> Result<(), SchedulerError> {
        let wake = self.store.wake_signal();
        let clock = Arc::clone(self.runner.clock());

        loop {
            // Check for shutdown
            if *shutdown_rx.borrow() {
                info!("scheduler shutting down");
                return Ok(());
            }

            self.store.arm_timers().await?;

            for reservation in self.store.due_reservations(clock.now()).await? {
                self.dispatch(workers, reservation);
            }

            if mode == RunMode::UntilIdle && workers.is_empty() && self.store.all_terminal().await
            {
                info!("all reservations reached a terminal state");
                return Ok(());
            }

            let next = self.store.next_fire_time().await;
            debug!(next = ?next, in_flight = workers.len(), "scheduler sleeping");

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("scheduler received shutdown signal");
                        return Ok(());
                    }
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    self.reap(joined).await?;
                }
                wakeup = clock.sleep_until(next, &wake) => {
                    debug!(?wakeup, "scheduler woke");
                }
            }
        }
    }

    /// Hand a due reservation to its own runner task.
    fn dispatch(&self, workers: &mut JoinSet<WorkerResult>, reservation: Reservation) {
        info!(
            reservation = %reservation.id,
            opens_at = %reservation.check_in_opens_at,
            "dispatching check-in"
        );

        let runner = Arc::clone(&self.runner);
        workers.spawn(async move {
            let id = reservation.id.clone();
            let result = AssertUnwindSafe(runner.run(reservation))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(SchedulerError::RunnerPanicked(panic_message(panic.as_ref())))
                });
            (id, result)
        });
    }

    /// Handle a finished worker. Only a failed save is fatal; any other
    /// runner failure is retried like a transient one.
    async fn reap(&self, joined: Result<WorkerResult, JoinError>) -> Result<(), SchedulerError> {
        match joined {
            Ok((id, Ok(outcome))) => {
                debug!(reservation = %id, outcome = %outcome, "runner finished");
            }
            Ok((_, Err(e @ SchedulerError::Persistence(_)))) => return Err(e),
            Ok((id, Err(e))) => {
                self.runner
                    .handle_dispatch_failure(&id, &e.to_string())
                    .await?;
            }
            Err(e) => error!(error = %e, "worker task failed"),
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
