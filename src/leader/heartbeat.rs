//! Heartbeat loop for the leader lock

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::{HeartbeatOutcome, LeaderLock, StepDownReason};

/// Start re-reading the lock row on the configured interval.
///
/// The task finishes with the step-down reason once this process loses
/// leadership, whether detected here or stepped down elsewhere.
pub fn spawn_heartbeat(lock: Arc<LeaderLock>) -> JoinHandle<StepDownReason> {
    let interval = lock.config().heartbeat_interval;
    info!(
        instance = %lock.instance_token(),
        interval_ms = interval.as_millis() as u64,
        max_failures = lock.config().max_consecutive_failures,
        "Starting leader heartbeat"
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; the claim itself was the first write
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match lock.check_once().await {
                HeartbeatOutcome::Held | HeartbeatOutcome::ReadFailed { .. } => {}
                HeartbeatOutcome::SteppedDown(reason) => return reason,
                HeartbeatOutcome::Inactive => {
                    debug!("Heartbeat found lock inactive, exiting");
                    return lock
                        .step_down_reason()
                        .unwrap_or(StepDownReason::Superseded { by: None });
                }
            }
        }
    })
}
