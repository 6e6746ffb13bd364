//! The `run` command: schedule reservations and check each one in.

use std::sync::Arc;

use chrono::Utc;
use miette::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use checkin_scheduler::{
    AttemptRunner, CheckInExecutor, ClockSource, JsonFileRepository, LogSink, NotificationSink,
    Recovery, ReservationState, ReservationStore, RunMode, Scheduler, SchedulerError,
    SystemClock,
};

use crate::config::{self, RunConfig};
use crate::executor::CommandExecutor;
use crate::webhook::WebhookSink;

pub async fn run(config: RunConfig) -> Result<()> {
    config
        .validate()
        .map_err(|e| miette::miette!("{}", e))?;

    let requests = config::load_requests(&config.reservations)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    let schedule = config::build_schedule(requests, config.window(), Utc::now())
        .map_err(|e| miette::miette!("{}", e))?;

    for reservation in &schedule.departed {
        warn!(
            reservation = %reservation.id,
            departure = %reservation.departure,
            "flight already departed, skipping"
        );
    }

    let clock: Arc<dyn ClockSource> = Arc::new(SystemClock::default());
    let (store, recovery) = match &config.state_file {
        Some(path) => {
            info!(path = %path.display(), "loading state file");
            ReservationStore::open(Arc::new(JsonFileRepository::new(path)), clock.clone())
                .await
                .map_err(|e| miette::miette!("failed to load state file: {}", e))?
        }
        None => (ReservationStore::new(), Recovery::default()),
    };

    let executor: Arc<dyn CheckInExecutor> = Arc::new(CommandExecutor::new(
        &config.executor,
        config.executor_args.clone(),
    ));
    let sink: Arc<dyn NotificationSink> = match &config.webhook_url {
        Some(url) => Arc::new(WebhookSink::new(url)),
        None => Arc::new(LogSink),
    };

    let runner = AttemptRunner::new(store, executor, sink, clock)
        .with_policy(config.policy.clone())
        .with_attempt_timeout(config.attempt_timeout);
    let scheduler = Scheduler::new(runner);

    scheduler
        .recover(&recovery)
        .await
        .map_err(|e| miette::miette!("failed to record recovered notifications: {}", e))?;

    for reservation in schedule.accepted {
        match scheduler.submit(reservation).await {
            Ok(_) => {}
            Err(SchedulerError::DuplicateReservation(id)) => {
                info!(reservation = %id, "reservation already tracked, keeping its state");
            }
            Err(e) => return Err(miette::miette!("failed to schedule reservation: {}", e)),
        }
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    scheduler
        .run(shutdown_rx, RunMode::UntilIdle)
        .await
        .map_err(|e| miette::miette!("scheduler stopped: {}", e))?;

    let reservations = scheduler.store().list().await;
    let succeeded = reservations
        .iter()
        .filter(|r| matches!(r.state, ReservationState::Succeeded { .. }))
        .count();
    let failed = reservations
        .iter()
        .filter(|r| matches!(r.state, ReservationState::Failed { .. }))
        .count();
    info!(
        total = reservations.len(),
        succeeded,
        failed,
        pending = reservations.len() - succeeded - failed,
        "scheduler finished"
    );

    Ok(())
}
