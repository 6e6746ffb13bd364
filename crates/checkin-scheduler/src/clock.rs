//! Clock abstraction for testable time handling.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Longest single real sleep; the scheduler re-reads the wall clock after
/// each nap so clock jumps are picked up.
const MAX_NAP: Duration = Duration::from_secs(60);

/// Why `sleep_until` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// The deadline passed (or the nap cap was reached).
    Elapsed,
    /// The wake signal was raised.
    Signalled,
}

/// Source of wall-clock time and sleeps.
#[async_trait]
pub trait ClockSource: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleep until `deadline`, returning early if `wake` is notified.
    ///
    /// With no deadline, sleeps until woken.
    async fn sleep_until(&self, deadline: Option<DateTime<Utc>>, wake: &Notify) -> Wakeup;

    /// Sleep for a fixed duration.
    async fn sleep(&self, duration: Duration);
}

/// Real system clock backed by tokio timers.
#[derive(Debug, Clone)]
pub struct SystemClock {
    max_nap: Duration,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self { max_nap: MAX_NAP }
    }
}

impl SystemClock {
    /// Create a clock with a custom cap on single sleeps.
    pub fn with_max_nap(max_nap: Duration) -> Self {
        Self { max_nap }
    }
}

#[async_trait]
impl ClockSource for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: Option<DateTime<Utc>>, wake: &Notify) -> Wakeup {
        let Some(deadline) = deadline else {
            wake.notified().await;
            return Wakeup::Signalled;
        };

        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            return Wakeup::Elapsed;
        }

        tokio::select! {
            _ = wake.notified() => Wakeup::Signalled,
            _ = tokio::time::sleep(remaining.min(self.max_nap)) => Wakeup::Elapsed,
        }
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock for tests, driven by tokio's clock.
///
/// Wall-clock time is the start instant plus the tokio time elapsed since the
/// clock was created. Under a paused runtime (`#[tokio::test(start_paused =
/// true)]`) tokio only moves time forward once every task is idle, and then
/// only to the earliest pending timer, so no sleeper overtakes work that is
/// still due sooner.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    start: DateTime<Utc>,
    origin: Instant,
    skew: Arc<Mutex<chrono::Duration>>,
}

impl VirtualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            origin: Instant::now(),
            skew: Arc::new(Mutex::new(chrono::Duration::zero())),
        }
    }

    /// Jump wall-clock time forward without touching tokio's clock, like an
    /// NTP correction. Sleepers only notice when they next read the time.
    pub fn advance(&self, duration: Duration) {
        let step =
            chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        let mut skew = self.skew.lock().unwrap_or_else(|e| e.into_inner());
        *skew = skew.checked_add(&step).unwrap_or(*skew);
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl ClockSource for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let skew = *self.skew.lock().unwrap_or_else(|e| e.into_inner());
        self.start
            .checked_add_signed(elapsed)
            .and_then(|t| t.checked_add_signed(skew))
            .unwrap_or(self.start)
    }

    async fn sleep_until(&self, deadline: Option<DateTime<Utc>>, wake: &Notify) -> Wakeup {
        let Some(deadline) = deadline else {
            wake.notified().await;
            return Wakeup::Signalled;
        };

        let remaining = (deadline - self.now()).to_std().unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            return Wakeup::Elapsed;
        }

        tokio::select! {
            _ = wake.notified() => Wakeup::Signalled,
            _ = tokio::time::sleep(remaining) => Wakeup::Elapsed,
        }
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_virtual_sleep_until_advances() {
        let start = Utc::now();
        let clock = VirtualClock::new(start);
        let wake = Notify::new();
        let deadline = start + chrono::Duration::hours(5);

        assert_eq!(clock.sleep_until(Some(deadline), &wake).await, Wakeup::Elapsed);
        assert_eq!(clock.now(), deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_virtual_sleep_until_past_returns_immediately() {
        let start = Utc::now();
        let clock = VirtualClock::new(start);
        let wake = Notify::new();

        assert_eq!(
            clock
                .sleep_until(Some(start - chrono::Duration::hours(1)), &wake)
                .await,
            Wakeup::Elapsed
        );
        assert_eq!(clock.now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_virtual_sleep_without_deadline_waits_for_signal() {
        let clock = VirtualClock::default();
        let wake = Notify::new();
        wake.notify_one();

        assert_eq!(clock.sleep_until(None, &wake).await, Wakeup::Signalled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_virtual_long_sleep_waits_for_shorter_one() {
        let start = Utc::now();
        let clock = VirtualClock::new(start);
        let wake = Arc::new(Notify::new());

        let short = {
            let clock = clock.clone();
            tokio::spawn(async move {
                clock.sleep(Duration::from_secs(90)).await;
                clock.now()
            })
        };

        // The far deadline does not drag the other sleeper forward
        let deadline = start + chrono::Duration::hours(10);
        assert_eq!(clock.sleep_until(Some(deadline), &wake).await, Wakeup::Elapsed);
        assert_eq!(
            short.await.unwrap(),
            start + chrono::Duration::seconds(90)
        );
        assert_eq!(clock.now(), deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_virtual_sleep_until_wakes_on_signal() {
        let start = Utc::now();
        let clock = VirtualClock::new(start);
        let wake = Arc::new(Notify::new());

        let signal = Arc::clone(&wake);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            signal.notify_one();
        });

        let deadline = start + chrono::Duration::hours(1);
        assert_eq!(
            clock.sleep_until(Some(deadline), &wake).await,
            Wakeup::Signalled
        );
        assert_eq!(clock.now(), start + chrono::Duration::seconds(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_virtual_advance_jumps_wall_clock() {
        let start = Utc::now();
        let clock = VirtualClock::new(start);
        clock.advance(Duration::from_secs(3600));
        clock.sleep(Duration::from_secs(90)).await;
        assert_eq!(clock.now() - start, chrono::Duration::seconds(3690));
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_sleep_until_wakes_on_signal() {
        let clock = SystemClock::default();
        let wake = Arc::new(Notify::new());
        let deadline = Utc::now() + chrono::Duration::hours(1);

        let signal = Arc::clone(&wake);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            signal.notify_one();
        });

        assert_eq!(
            clock.sleep_until(Some(deadline), &wake).await,
            Wakeup::Signalled
        );
    }

    #[tokio::test]
    async fn test_system_sleep_until_past_deadline_returns_immediately() {
        let clock = SystemClock::default();
        let wake = Notify::new();
        let deadline = Utc::now() - chrono::Duration::seconds(1);

        assert_eq!(clock.sleep_until(Some(deadline), &wake).await, Wakeup::Elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_sleep_is_capped() {
        let clock = SystemClock::with_max_nap(Duration::from_millis(50));
        let wake = Notify::new();
        let deadline = Utc::now() + chrono::Duration::hours(1);

        // Returns after the nap cap instead of an hour
        assert_eq!(clock.sleep_until(Some(deadline), &wake).await, Wakeup::Elapsed);
    }
}
