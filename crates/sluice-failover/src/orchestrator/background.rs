//! Background classification task.
//!
//! Runs once shortly after startup, then wakes on a fixed tick and
//! re-classifies only when the last run is older than the refresh interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::state::Shared;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Schedule {
    pub initial_delay: Duration,
    pub check_interval: Duration,
    pub refresh_interval: Duration,
}

pub(crate) async fn run(shared: Arc<Shared>, schedule: Schedule, shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => return,
        _ = tokio::time::sleep(schedule.initial_delay) => {}
    }
    tokio::select! {
        _ = shutdown.cancelled() => return,
        _ = shared.classify_now() => {}
    }

    let mut tick = tokio::time::interval(schedule.check_interval.max(Duration::from_millis(10)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Skip the immediate first tick
    tick.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                let due = shared
                    .state
                    .read()
                    .await
                    .classification_due(Instant::now(), schedule.refresh_interval);
                if !due {
                    continue;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = shared.classify_now() => {}
                }
            }
        }
    }
    tracing::debug!("background classification stopped");
}
