//! Reservation types.

use std::fmt;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Length of an airline confirmation number.
const CONFIRMATION_NUMBER_LEN: usize = 6;

/// Identity of a tracked reservation: confirmation number plus traveler.
///
/// Names are compared case-insensitively, so "jane doe" and "Jane Doe" on
/// the same confirmation number are the same reservation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(String);

impl ReservationId {
    /// Build the id for a confirmation number and traveler.
    pub fn new(confirmation_number: &str, traveler: &Traveler) -> Self {
        Self(format!(
            "{}/{}/{}",
            confirmation_number.trim().to_uppercase(),
            traveler.first_name.trim().to_uppercase(),
            traveler.last_name.trim().to_uppercase()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The traveler a reservation checks in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traveler {
    pub first_name: String,
    pub last_name: String,
}

impl fmt::Display for Traveler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.first_name, self.last_name)
    }
}

/// A tracked check-in task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// Confirmation number + traveler key.
    pub id: ReservationId,
    /// Airline confirmation number (uppercased).
    pub confirmation_number: String,
    /// Who is checking in.
    pub traveler: Traveler,
    /// Scheduled departure, in the departure airport's offset.
    pub departure: DateTime<FixedOffset>,
    /// Earliest moment the airline accepts check-in.
    pub check_in_opens_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: ReservationState,
    /// Number of check-in attempts made so far.
    pub attempt_count: u32,
    /// Reason given by the most recent retryable failure.
    pub last_error: Option<String>,
    /// When a retry after a failed dispatch is due, if one is pending.
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
    /// Set when the user withdrew the reservation while an attempt was in flight.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Set once the terminal notification has been handed to the sink.
    #[serde(default)]
    pub notification_claimed: bool,
    /// Insertion order, used to break ties between identical fire times.
    pub sequence: u64,
    /// When the store accepted this reservation.
    pub created_at: DateTime<Utc>,
    /// When this reservation reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Reservation {
    /// Create a pending reservation whose check-in opens `window` before departure.
    pub fn new(
        confirmation_number: &str,
        traveler: Traveler,
        departure: DateTime<FixedOffset>,
        window: Duration,
    ) -> Self {
        let id = ReservationId::new(confirmation_number, &traveler);
        Self {
            id,
            confirmation_number: confirmation_number.trim().to_uppercase(),
            traveler,
            departure,
            // Saturates; `ReservationRequest::into_reservation` rejects windows this large
            check_in_opens_at: departure
                .with_timezone(&Utc)
                .checked_sub_signed(window)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            state: ReservationState::Pending,
            attempt_count: 0,
            last_error: None,
            retry_at: None,
            cancel_requested: false,
            notification_claimed: false,
            sequence: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Departure as a UTC instant.
    pub fn departs_at(&self) -> DateTime<Utc> {
        self.departure.with_timezone(&Utc)
    }

    /// Whether the flight has already left at `now`.
    pub fn has_departed(&self, now: DateTime<Utc>) -> bool {
        now >= self.departs_at()
    }

    /// The instant the scheduler should next fire for this reservation.
    pub fn fire_at(&self) -> DateTime<Utc> {
        match self.retry_at {
            Some(retry_at) if retry_at > self.check_in_opens_at => retry_at,
            _ => self.check_in_opens_at,
        }
    }

    /// Check if this reservation may start an attempt at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.state,
            ReservationState::Pending | ReservationState::Waiting
        ) && self.fire_at() <= now
    }

    /// The terminal outcome, if the reservation has one.
    pub fn outcome(&self) -> Option<CheckInOutcome> {
        match &self.state {
            ReservationState::Succeeded { boarding } => {
                Some(CheckInOutcome::Succeeded(boarding.clone()))
            }
            ReservationState::Failed { reason } => Some(CheckInOutcome::Failed(reason.clone())),
            _ => None,
        }
    }
}

/// Lifecycle state of a reservation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReservationState {
    /// Accepted, not yet in the scheduler's working set.
    #[default]
    Pending,
    /// Timer armed, waiting for check-in to open.
    Waiting,
    /// An attempt runner owns this reservation.
    Attempting,
    /// Checked in.
    Succeeded { boarding: BoardingInfo },
    /// Check-in could not be completed.
    Failed { reason: FailureReason },
}

impl ReservationState {
    /// Whether no further attempts will occur.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }

    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Attempting => "attempting",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Boarding details returned by a successful check-in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardingInfo {
    /// One entry per passenger and flight segment.
    #[serde(default)]
    pub passes: Vec<BoardingPass>,
}

/// A single boarding position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardingPass {
    pub passenger: String,
    #[serde(default)]
    pub flight_number: Option<String>,
    /// Boarding group letter, e.g. "A".
    pub group: String,
    pub position: u32,
}

impl fmt::Display for BoardingPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.flight_number {
            Some(flight) => write!(
                f,
                "{} ({}): {}{}",
                self.passenger, flight, self.group, self.position
            ),
            None => write!(f, "{}: {}{}", self.passenger, self.group, self.position),
        }
    }
}

impl fmt::Display for BoardingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passes.is_empty() {
            return f.write_str("checked in");
        }
        let passes: Vec<String> = self.passes.iter().map(ToString::to_string).collect();
        f.write_str(&passes.join(", "))
    }
}

/// Result of a single executor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Checked in.
    Success(BoardingInfo),
    /// Transient condition; worth trying again.
    RetryableFailure(String),
    /// The airline says this can never succeed.
    PermanentFailure(String),
}

/// Why a reservation ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Permanent failure reported by the executor.
    Rejected { reason: String },
    /// Repeated retryable failures used up the retry budget.
    RetryBudgetExhausted,
    /// The flight left before check-in could complete.
    Departed,
    /// Withdrawn by the user.
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected { reason } => f.write_str(reason),
            Self::RetryBudgetExhausted => f.write_str("retry budget exhausted"),
            Self::Departed => f.write_str("departed"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Terminal outcome of a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum CheckInOutcome {
    Succeeded(BoardingInfo),
    Failed(FailureReason),
}

impl CheckInOutcome {
    /// The terminal state this outcome moves a reservation into.
    pub fn to_state(&self) -> ReservationState {
        match self {
            Self::Succeeded(boarding) => ReservationState::Succeeded {
                boarding: boarding.clone(),
            },
            Self::Failed(reason) => ReservationState::Failed {
                reason: reason.clone(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }
}

impl fmt::Display for CheckInOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded(boarding) => write!(f, "checked in: {boarding}"),
            Self::Failed(reason) => write!(f, "check-in failed: {reason}"),
        }
    }
}

/// A reservation as supplied by the user, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub confirmation_number: String,
    pub first_name: String,
    pub last_name: String,
    /// Scheduled departure with its UTC offset (RFC 3339).
    pub departure: DateTime<FixedOffset>,
    /// Overrides the default check-in window for this reservation.
    #[serde(default)]
    pub check_in_window_hours: Option<u32>,
}

impl ReservationRequest {
    /// Validate the request and build a pending reservation.
    pub fn into_reservation(self, default_window: Duration) -> Result<Reservation, SchedulerError> {
        let confirmation = self.confirmation_number.trim();
        if confirmation.len() != CONFIRMATION_NUMBER_LEN
            || !confirmation.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(SchedulerError::Configuration(format!(
                "confirmation number '{}' must be {} letters or digits",
                self.confirmation_number, CONFIRMATION_NUMBER_LEN
            )));
        }

        let first_name = self.first_name.trim();
        let last_name = self.last_name.trim();
        if first_name.is_empty() || last_name.is_empty() {
            return Err(SchedulerError::Configuration(format!(
                "reservation {confirmation} is missing the traveler's first or last name"
            )));
        }

        let window = match self.check_in_window_hours {
            Some(0) => {
                return Err(SchedulerError::Configuration(format!(
                    "reservation {confirmation} has a zero-hour check-in window"
                )));
            }
            Some(hours) => Duration::hours(i64::from(hours)),
            None => default_window,
        };
        if window <= Duration::zero() {
            return Err(SchedulerError::Configuration(
                "check-in window must be positive".to_string(),
            ));
        }
        if self
            .departure
            .with_timezone(&Utc)
            .checked_sub_signed(window)
            .is_none()
        {
            return Err(SchedulerError::Configuration(format!(
                "reservation {confirmation} has an out-of-range {}-hour check-in window",
                window.num_hours()
            )));
        }

        let traveler = Traveler {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
        };
        Ok(Reservation::new(confirmation, traveler, self.departure, window))
    }
}
