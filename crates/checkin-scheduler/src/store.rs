//! Reservation store: the single shared table of tracked reservations.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
    CheckInOutcome, ClockSource, FailureReason, Reservation, ReservationId,
    ReservationRepository, ReservationState, SchedulerError, SystemClock,
};

/// Working-set key: fire time, then insertion order.
type QueueKey = (DateTime<Utc>, u64, ReservationId);

/// Result of withdrawing a reservation.
#[derive(Debug, Clone, PartialEq)]
pub enum Cancellation {
    /// Withdrawn before any attempt; now terminal as cancelled.
    Withdrawn(Reservation),
    /// An attempt is in flight; it will stop at its next retry step.
    Requested,
    /// Already terminal; nothing to cancel.
    AlreadyTerminal,
}

/// What `restore` found in a persisted reservation set.
#[derive(Debug, Default)]
pub struct Recovery {
    /// Reservations put back into the working set.
    pub resumed: usize,
    /// Interrupted attempts returned to `Waiting`.
    pub interrupted: usize,
    /// Terminal reservations whose notification was never claimed.
    pub unnotified: Vec<Reservation>,
}

#[derive(Default)]
struct Table {
    reservations: HashMap<ReservationId, Reservation>,
    queue: BTreeSet<QueueKey>,
    next_sequence: u64,
}

impl Table {
    fn get_mut(&mut self, id: &ReservationId) -> Result<&mut Reservation, SchedulerError> {
        self.reservations
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))
    }

    fn enqueue(&mut self, reservation: &Reservation) {
        self.queue.insert((
            reservation.fire_at(),
            reservation.sequence,
            reservation.id.clone(),
        ));
    }

    fn dequeue(&mut self, reservation: &Reservation) {
        self.queue.remove(&(
            reservation.fire_at(),
            reservation.sequence,
            reservation.id.clone(),
        ));
    }

    fn earliest(&self) -> Option<DateTime<Utc>> {
        self.queue.first().map(|(at, _, _)| *at)
    }

    fn snapshot(&self) -> Vec<Reservation> {
        let mut all: Vec<Reservation> = self.reservations.values().cloned().collect();
        all.sort_by_key(|r| r.sequence);
        all
    }
}

/// Shared, lock-protected table of reservations.
///
/// Cloning is cheap and every clone refers to the same table. All operations
/// are atomic with respect to each other. When a repository is attached,
/// every mutation is written through before the lock is released.
///
/// A failed write surfaces as `SchedulerError::Persistence`. The in-memory
/// change is kept, so the table is ahead of the disk from then on and the
/// caller must stop.
#[derive(Clone)]
pub struct ReservationStore {
    table: Arc<RwLock<Table>>,
    wake: Arc<Notify>,
    repository: Option<Arc<dyn ReservationRepository>>,
    clock: Arc<dyn ClockSource>,
}

impl Default for ReservationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservationStore {
    /// Create an empty in-memory store on the system clock.
    pub fn new() -> Self {
        Self {
            table: Arc::new(RwLock::new(Table::default())),
            wake: Arc::new(Notify::new()),
            repository: None,
            clock: Arc::new(SystemClock::default()),
        }
    }

    /// Stamp acceptance and completion times from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Load a store from `repository`, recovering interrupted state, and keep
    /// writing through to it.
    #[tracing::instrument(skip_all)]
    pub async fn open(
        repository: Arc<dyn ReservationRepository>,
        clock: Arc<dyn ClockSource>,
    ) -> Result<(Self, Recovery), SchedulerError> {
        let reservations = repository.load().await?;
        let mut store = Self::new().with_clock(clock);
        let recovery = store.restore(reservations).await;
        store.repository = Some(repository);
        store.persist(&*store.table.read().await).await?;
        Ok((store, recovery))
    }

    /// Signal raised when the earliest fire time moves earlier.
    pub fn wake_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Replace the table with a previously saved reservation set.
    ///
    /// `Attempting` reservations were interrupted mid-attempt and go back to
    /// `Waiting`; instants already in the past become due immediately.
    pub async fn restore(&self, reservations: Vec<Reservation>) -> Recovery {
        let mut recovery = Recovery::default();
        let mut table = Table::default();
        let now = self.clock.now();

        for mut reservation in reservations {
            table.next_sequence = table.next_sequence.max(reservation.sequence + 1);

            if reservation.state == ReservationState::Attempting {
                recovery.interrupted += 1;
                if reservation.cancel_requested {
                    reservation.state = ReservationState::Failed {
                        reason: FailureReason::Cancelled,
                    };
                    reservation.completed_at = Some(now);
                } else {
                    reservation.state = ReservationState::Waiting;
                }
            }

            if reservation.state.is_terminal() {
                if !reservation.notification_claimed {
                    recovery.unnotified.push(reservation.clone());
                }
            } else {
                recovery.resumed += 1;
                table.enqueue(&reservation);
            }
            table
                .reservations
                .insert(reservation.id.clone(), reservation);
        }

        info!(
            total = table.reservations.len(),
            resumed = recovery.resumed,
            interrupted = recovery.interrupted,
            unnotified = recovery.unnotified.len(),
            "restored reservations"
        );
        if !recovery.unnotified.is_empty() {
            warn!(
                count = recovery.unnotified.len(),
                "found terminal reservations that were never notified"
            );
        }
        *self.table.write().await = table;
        self.wake.notify_one();
        recovery
    }

    /// Start tracking a reservation in `Pending`.
    #[tracing::instrument(skip(self, reservation), fields(reservation = %reservation.id))]
    pub async fn add(&self, mut reservation: Reservation) -> Result<Reservation, SchedulerError> {
        let mut table = self.table.write().await;
        if table.reservations.contains_key(&reservation.id) {
            return Err(SchedulerError::DuplicateReservation(reservation.id));
        }

        reservation.state = ReservationState::Pending;
        reservation.created_at = self.clock.now();
        reservation.sequence = table.next_sequence;
        table.next_sequence += 1;

        let previous_earliest = table.earliest();
        table.enqueue(&reservation);
        table
            .reservations
            .insert(reservation.id.clone(), reservation.clone());

        if previous_earliest.is_none_or(|earliest| reservation.fire_at() < earliest) {
            self.wake.notify_one();
        }

        info!(opens_at = %reservation.check_in_opens_at, "reservation added");
        self.persist(&table).await?;
        Ok(reservation)
    }

    /// Earliest fire time among reservations still waiting to be dispatched.
    pub async fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.table.read().await.earliest()
    }

    /// Move every `Pending` reservation in the working set to `Waiting`.
    pub async fn arm_timers(&self) -> Result<usize, SchedulerError> {
        let mut table = self.table.write().await;
        let mut armed = 0;
        for reservation in table.reservations.values_mut() {
            if reservation.state == ReservationState::Pending {
                reservation.state = ReservationState::Waiting;
                armed += 1;
            }
        }
        if armed > 0 {
            debug!(armed, "armed timers");
            self.persist(&table).await?;
        }
        Ok(armed)
    }

    /// Take every reservation due at `now`, moving each to `Attempting`.
    ///
    /// Returned in fire-time order, ties in insertion order. A reservation is
    /// returned at most once per dispatch.
    pub async fn due_reservations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, SchedulerError> {
        let mut table = self.table.write().await;
        let mut due = Vec::new();

        while let Some((at, _, _)) = table.queue.first() {
            if *at > now {
                break;
            }
            let Some((_, _, id)) = table.queue.pop_first() else {
                break;
            };
            let Some(reservation) = table.reservations.get_mut(&id) else {
                continue;
            };
            if !reservation.is_due(now) {
                continue;
            }
            reservation.state = ReservationState::Attempting;
            reservation.retry_at = None;
            due.push(reservation.clone());
        }

        if !due.is_empty() {
            debug!(count = due.len(), "dispatching due reservations");
            self.persist(&table).await?;
        }
        Ok(due)
    }

    /// Count a new attempt for a reservation owned by a runner.
    pub async fn begin_attempt(&self, id: &ReservationId) -> Result<Reservation, SchedulerError> {
        let mut table = self.table.write().await;
        let reservation = table.get_mut(id)?;
        if reservation.state != ReservationState::Attempting {
            return Err(SchedulerError::InvalidTransition {
                id: id.clone(),
                from: reservation.state.name(),
                to: "attempting",
            });
        }
        reservation.attempt_count += 1;
        let snapshot = reservation.clone();
        self.persist(&table).await?;
        Ok(snapshot)
    }

    /// Remember the reason for a retryable failure.
    pub async fn record_retryable(
        &self,
        id: &ReservationId,
        reason: &str,
    ) -> Result<(), SchedulerError> {
        let mut table = self.table.write().await;
        table.get_mut(id)?.last_error = Some(reason.to_string());
        self.persist(&table).await
    }

    /// Put an `Attempting` reservation back in the working set, due at
    /// `retry_at`, after its runner died. Consumes one attempt of budget.
    pub async fn requeue(
        &self,
        id: &ReservationId,
        retry_at: DateTime<Utc>,
    ) -> Result<Reservation, SchedulerError> {
        let mut table = self.table.write().await;
        let reservation = table.get_mut(id)?;
        if reservation.state != ReservationState::Attempting {
            return Err(SchedulerError::InvalidTransition {
                id: id.clone(),
                from: reservation.state.name(),
                to: "waiting",
            });
        }
        reservation.state = ReservationState::Waiting;
        reservation.attempt_count += 1;
        reservation.retry_at = Some(retry_at);
        let snapshot = reservation.clone();
        table.enqueue(&snapshot);
        self.wake.notify_one();
        self.persist(&table).await?;
        Ok(snapshot)
    }

    /// Move a reservation to its terminal state.
    #[tracing::instrument(skip_all, fields(reservation = %id, outcome = %outcome))]
    pub async fn record_outcome(
        &self,
        id: &ReservationId,
        outcome: &CheckInOutcome,
    ) -> Result<Reservation, SchedulerError> {
        let now = self.clock.now();
        let mut table = self.table.write().await;
        let reservation = table.get_mut(id)?;
        if reservation.state.is_terminal() {
            return Err(SchedulerError::InvalidTransition {
                id: id.clone(),
                from: reservation.state.name(),
                to: outcome.to_state().name(),
            });
        }

        let was_queued = matches!(
            reservation.state,
            ReservationState::Pending | ReservationState::Waiting
        );
        reservation.state = outcome.to_state();
        reservation.completed_at = Some(now);
        let snapshot = reservation.clone();
        if was_queued {
            table.dequeue(&snapshot);
        }

        info!("reservation reached terminal state");
        self.persist(&table).await?;
        Ok(snapshot)
    }

    /// Claim the right to send the terminal notification.
    ///
    /// Returns true exactly once per terminal reservation, and only after the
    /// claim is durable. When the write fails the claim is kept in memory but
    /// the error is returned, so nothing is sent and a restart sends it once.
    pub async fn claim_notification(&self, id: &ReservationId) -> Result<bool, SchedulerError> {
        let mut table = self.table.write().await;
        let reservation = table.get_mut(id)?;
        if !reservation.state.is_terminal() || reservation.notification_claimed {
            return Ok(false);
        }
        reservation.notification_claimed = true;
        self.persist(&table).await?;
        Ok(true)
    }

    /// Withdraw a reservation.
    #[tracing::instrument(skip_all, fields(reservation = %id))]
    pub async fn cancel(&self, id: &ReservationId) -> Result<Cancellation, SchedulerError> {
        let now = self.clock.now();
        let mut table = self.table.write().await;
        let reservation = table.get_mut(id)?;

        let cancellation = match reservation.state {
            ReservationState::Pending | ReservationState::Waiting => {
                reservation.state = ReservationState::Failed {
                    reason: FailureReason::Cancelled,
                };
                reservation.completed_at = Some(now);
                let snapshot = reservation.clone();
                table.dequeue(&snapshot);
                info!("reservation withdrawn");
                Cancellation::Withdrawn(snapshot)
            }
            ReservationState::Attempting => {
                reservation.cancel_requested = true;
                info!("cancellation requested for in-flight attempt");
                Cancellation::Requested
            }
            ReservationState::Succeeded { .. } | ReservationState::Failed { .. } => {
                return Ok(Cancellation::AlreadyTerminal);
            }
        };

        self.persist(&table).await?;
        Ok(cancellation)
    }

    /// Whether the user asked to cancel this reservation.
    pub async fn is_cancel_requested(&self, id: &ReservationId) -> bool {
        self.table
            .read()
            .await
            .reservations
            .get(id)
            .is_some_and(|r| r.cancel_requested)
    }

    /// Get a reservation by id.
    pub async fn get(&self, id: &ReservationId) -> Option<Reservation> {
        self.table.read().await.reservations.get(id).cloned()
    }

    /// All reservations in insertion order.
    pub async fn list(&self) -> Vec<Reservation> {
        self.table.read().await.snapshot()
    }

    /// Whether every tracked reservation is terminal.
    pub async fn all_terminal(&self) -> bool {
        self.table
            .read()
            .await
            .reservations
            .values()
            .all(|r| r.state.is_terminal())
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.reservations.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.reservations.is_empty()
    }

    /// Write the table through to the repository, if one is attached.
    async fn persist(&self, table: &Table) -> Result<(), SchedulerError> {
        let Some(repository) = &self.repository else {
            return Ok(());
        };
        repository.save(&table.snapshot()).await.map_err(|e| {
            error!(error = %e, "failed to save reservations");
            SchedulerError::Persistence(e)
        })
    }
}
