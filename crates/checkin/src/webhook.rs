//! Notification sink that POSTs outcomes to a webhook.

use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use checkin_scheduler::{
    CheckInOutcome, NotificationSink, NotifyError, Reservation, ReservationId, Traveler,
};

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of every webhook request.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: &'static str,
    reservation: &'a ReservationId,
    confirmation_number: &'a str,
    traveler: &'a Traveler,
    departure: DateTime<FixedOffset>,
    check_in_opens_at: DateTime<Utc>,
    attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<&'a CheckInOutcome>,
}

impl<'a> WebhookPayload<'a> {
    fn new(
        event: &'static str,
        reservation: &'a Reservation,
        outcome: Option<&'a CheckInOutcome>,
    ) -> Self {
        Self {
            event,
            reservation: &reservation.id,
            confirmation_number: &reservation.confirmation_number,
            traveler: &reservation.traveler,
            departure: reservation.departure,
            check_in_opens_at: reservation.check_in_opens_at,
            attempts: reservation.attempt_count,
            outcome,
        }
    }
}

/// Why one POST failed.
enum PostError {
    /// Worth retrying: transport error, 5xx, 408 or 429.
    Transient(String),
    /// The receiver refused the request.
    Permanent(String),
}

/// Delivers notifications as JSON POST requests.
///
/// Transient failures are retried with exponential backoff until the retry
/// window closes; 4xx responses other than 408 and 429 fail immediately.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    initial_interval: Duration,
    max_interval: Duration,
    retry_window: Duration,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            url: url.into(),
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            retry_window: Duration::from_secs(300),
        }
    }

    /// Set the backoff intervals and how long to keep retrying.
    pub fn with_retry(
        mut self,
        initial_interval: Duration,
        max_interval: Duration,
        retry_window: Duration,
    ) -> Self {
        self.initial_interval = initial_interval;
        self.max_interval = max_interval;
        self.retry_window = retry_window;
        self
    }

    async fn deliver(&self, payload: &WebhookPayload<'_>) -> Result<(), NotifyError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            max_elapsed_time: Some(self.retry_window),
            ..Default::default()
        };

        loop {
            match self.post(payload).await {
                Ok(()) => {
                    debug!(event = payload.event, reservation = %payload.reservation, "webhook delivered");
                    return Ok(());
                }
                Err(PostError::Permanent(reason)) => return Err(NotifyError::Rejected(reason)),
                Err(PostError::Transient(reason)) => {
                    let Some(wait) = backoff.next_backoff() else {
                        return Err(NotifyError::Delivery(reason));
                    };
                    warn!(
                        reservation = %payload.reservation,
                        reason = %reason,
                        wait_ms = wait.as_millis() as u64,
                        "webhook delivery failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    async fn post(&self, payload: &WebhookPayload<'_>) -> Result<(), PostError> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| PostError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let reason = if body.is_empty() {
            status.to_string()
        } else {
            format!("{status}: {body}")
        };

        if status.is_client_error()
            && status != reqwest::StatusCode::REQUEST_TIMEOUT
            && status != reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            Err(PostError::Permanent(reason))
        } else {
            Err(PostError::Transient(reason))
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(
        &self,
        reservation: &Reservation,
        outcome: &CheckInOutcome,
    ) -> Result<(), NotifyError> {
        self.deliver(&WebhookPayload::new(
            "checkin.completed",
            reservation,
            Some(outcome),
        ))
        .await
    }

    async fn scheduled(&self, reservation: &Reservation) -> Result<(), NotifyError> {
        self.deliver(&WebhookPayload::new("checkin.scheduled", reservation, None))
            .await
    }
}
