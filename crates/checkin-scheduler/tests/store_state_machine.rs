//! Stateful property testing for the reservation store.
//!
//! Uses proptest-state-machine to drive the store through random sequences
//! of adds, dispatches, outcomes, requeues, cancellations and restarts, and
//! checks it against a simple reference model after every step.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use tokio::runtime::Runtime;

use checkin_scheduler::{
    BoardingInfo, CheckInOutcome, FailureReason, Reservation, ReservationId, ReservationState,
    ReservationStore, Traveler,
};

/// Number of distinct reservations a test run can touch.
const SLOTS: usize = 5;

/// Operations that can be performed on the store.
#[derive(Debug, Clone)]
pub enum StoreOperation {
    /// Add a reservation whose window opens `opens_in` seconds from the start.
    Add { slot: usize, opens_in: i64 },
    /// Move pending reservations to waiting.
    ArmTimers,
    /// Move the clock forward.
    Advance { secs: i64 },
    /// Take every due reservation.
    Dispatch,
    /// Record a terminal outcome.
    Finish { slot: usize, success: bool },
    /// Put an attempting reservation back after `delay` seconds.
    Requeue { slot: usize, delay: i64 },
    /// Withdraw a reservation.
    Cancel { slot: usize },
    /// Reload the store from its own snapshot.
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Queued,
    Attempting,
    Terminal,
}

#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub opens: i64,
    pub fire: i64,
    pub state: ModelState,
    pub cancel_requested: bool,
}

/// Reference model for the store.
#[derive(Clone, Debug, Default)]
pub struct StoreModel {
    /// Seconds since the test's start instant.
    pub now: i64,
    pub entries: BTreeMap<usize, ModelEntry>,
}

impl StoreModel {
    fn next_fire(&self) -> Option<i64> {
        self.entries
            .values()
            .filter(|e| e.state == ModelState::Queued)
            .map(|e| e.fire)
            .min()
    }
}

impl ReferenceStateMachine for StoreModel {
    type State = Self;
    type Transition = StoreOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        prop_oneof![
            3 => (0..SLOTS, -60i64..600).prop_map(|(slot, opens_in)| {
                StoreOperation::Add { slot, opens_in }
            }),
            1 => Just(StoreOperation::ArmTimers),
            2 => (1i64..300).prop_map(|secs| StoreOperation::Advance { secs }),
            3 => Just(StoreOperation::Dispatch),
            2 => (0..SLOTS, any::<bool>()).prop_map(|(slot, success)| {
                StoreOperation::Finish { slot, success }
            }),
            2 => (0..SLOTS, 0i64..120).prop_map(|(slot, delay)| {
                StoreOperation::Requeue { slot, delay }
            }),
            1 => (0..SLOTS).prop_map(|slot| StoreOperation::Cancel { slot }),
            1 => Just(StoreOperation::Restart),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            StoreOperation::Add { slot, opens_in } => {
                // Duplicates are rejected and leave the model unchanged
                state.entries.entry(*slot).or_insert(ModelEntry {
                    opens: *opens_in,
                    fire: *opens_in,
                    state: ModelState::Queued,
                    cancel_requested: false,
                });
            }
            StoreOperation::ArmTimers => {}
            StoreOperation::Advance { secs } => state.now += secs,
            StoreOperation::Dispatch => {
                let now = state.now;
                for entry in state.entries.values_mut() {
                    if entry.state == ModelState::Queued && entry.fire <= now {
                        entry.state = ModelState::Attempting;
                        entry.fire = entry.opens;
                    }
                }
            }
            StoreOperation::Finish { slot, .. } => {
                if let Some(entry) = state.entries.get_mut(slot) {
                    entry.state = ModelState::Terminal;
                }
            }
            StoreOperation::Requeue { slot, delay } => {
                let now = state.now;
                if let Some(entry) = state.entries.get_mut(slot) {
                    if entry.state == ModelState::Attempting {
                        entry.state = ModelState::Queued;
                        entry.fire = entry.opens.max(now + delay);
                    }
                }
            }
            StoreOperation::Cancel { slot } => {
                if let Some(entry) = state.entries.get_mut(slot) {
                    match entry.state {
                        ModelState::Queued => entry.state = ModelState::Terminal,
                        ModelState::Attempting => entry.cancel_requested = true,
                        ModelState::Terminal => {}
                    }
                }
            }
            StoreOperation::Restart => {
                for entry in state.entries.values_mut() {
                    if entry.state == ModelState::Attempting {
                        entry.state = if entry.cancel_requested {
                            ModelState::Terminal
                        } else {
                            ModelState::Queued
                        };
                    }
                }
            }
        }
        state
    }
}

/// Test harness around a real store.
pub struct StoreTestHarness {
    runtime: Runtime,
    store: ReservationStore,
    start: DateTime<Utc>,
    now: DateTime<Utc>,
}

fn confirmation(slot: usize) -> String {
    format!("RES{slot:03}")
}

fn traveler() -> Traveler {
    Traveler {
        first_name: "Jane".to_string(),
        last_name: "Doe".to_string(),
    }
}

fn id(slot: usize) -> ReservationId {
    ReservationId::new(&confirmation(slot), &traveler())
}

impl StoreTestHarness {
    fn new() -> Self {
        let start = Utc::now();
        Self {
            runtime: Runtime::new().expect("Failed to create tokio runtime"),
            store: ReservationStore::new(),
            start,
            now: start,
        }
    }

    fn apply_operation(&mut self, op: &StoreOperation) {
        let store = self.store.clone();
        let start = self.start;
        let now = self.now;

        match op {
            StoreOperation::Add { slot, opens_in } => self.runtime.block_on(async {
                let mut reservation = Reservation::new(
                    &confirmation(*slot),
                    traveler(),
                    (start + Duration::hours(48)).fixed_offset(),
                    Duration::hours(24),
                );
                reservation.check_in_opens_at = start + Duration::seconds(*opens_in);
                let _ = store.add(reservation).await;
            }),
            StoreOperation::ArmTimers => {
                self.runtime
                    .block_on(store.arm_timers())
                    .expect("in-memory store never fails to save");
            }
            StoreOperation::Advance { secs } => self.now = now + Duration::seconds(*secs),
            StoreOperation::Dispatch => {
                let due = self
                    .runtime
                    .block_on(store.due_reservations(now))
                    .expect("in-memory store never fails to save");
                for reservation in &due {
                    assert_eq!(reservation.state, ReservationState::Attempting);
                }
            }
            StoreOperation::Finish { slot, success } => {
                let outcome = if *success {
                    CheckInOutcome::Succeeded(BoardingInfo::default())
                } else {
                    CheckInOutcome::Failed(FailureReason::RetryBudgetExhausted)
                };
                let _ = self.runtime.block_on(store.record_outcome(&id(*slot), &outcome));
            }
            StoreOperation::Requeue { slot, delay } => {
                let retry_at = now + Duration::seconds(*delay);
                let _ = self.runtime.block_on(store.requeue(&id(*slot), retry_at));
            }
            StoreOperation::Cancel { slot } => {
                let _ = self.runtime.block_on(store.cancel(&id(*slot)));
            }
            StoreOperation::Restart => {
                let restored = ReservationStore::new();
                self.runtime.block_on(async {
                    let snapshot = store.list().await;
                    restored.restore(snapshot).await;
                });
                self.store = restored;
            }
        }
    }
}

impl StateMachineTest for StoreTestHarness {
    type SystemUnderTest = Self;
    type Reference = StoreModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        state.runtime.block_on(async {
            assert_eq!(state.store.len().await, ref_state.entries.len());

            for (slot, entry) in &ref_state.entries {
                let reservation = state
                    .store
                    .get(&id(*slot))
                    .await
                    .expect("modelled reservation should be tracked");

                let actual = match reservation.state {
                    ReservationState::Pending | ReservationState::Waiting => ModelState::Queued,
                    ReservationState::Attempting => ModelState::Attempting,
                    ReservationState::Succeeded { .. } | ReservationState::Failed { .. } => {
                        ModelState::Terminal
                    }
                };
                assert_eq!(actual, entry.state, "state mismatch for slot {slot}");

                if entry.state == ModelState::Terminal {
                    assert!(reservation.completed_at.is_some());
                }
            }

            // The working set is exactly the queued reservations
            let expected = ref_state
                .next_fire()
                .map(|secs| state.start + Duration::seconds(secs));
            assert_eq!(state.store.next_fire_time().await, expected);
        });
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 5000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn store_state_machine_test(sequential 1..40 => StoreTestHarness);
}

#[test]
fn test_restart_keeps_tie_order() {
    let runtime = Runtime::new().expect("Failed to create tokio runtime");
    runtime.block_on(async {
        let store = ReservationStore::new();
        let start = Utc::now();
        for slot in [3, 1, 2] {
            let mut reservation = Reservation::new(
                &confirmation(slot),
                traveler(),
                (start + Duration::hours(48)).fixed_offset(),
                Duration::hours(24),
            );
            reservation.check_in_opens_at = start;
            store.add(reservation).await.unwrap();
        }

        let restored = ReservationStore::new();
        restored.restore(store.list().await).await;

        let order: Vec<ReservationId> = restored
            .due_reservations(start)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(order, vec![id(3), id(1), id(2)]);
    });
}
