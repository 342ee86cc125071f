//! Single-active-instance leadership
//!
//! ## Overview
//!
//! Exactly one process may act for the bot at a time, including during a
//! rolling deploy where the old and new process briefly overlap.
//!
//! ## Protocol
//!
//! 1. On startup a process overwrites the singleton lock row with its own
//!    random token. The newest writer always wins; there is no negotiation.
//! 2. A heartbeat re-reads the row on a short interval. Seeing a different
//!    token means a newer process took over, so this one steps down.
//! 3. Repeated read failures are treated the same way (fail closed).
//! 4. `is_active()` is an in-memory check for the top of every handler.
//!
//! State: `Unclaimed -> Active -> SteppingDown -> Terminated`.

mod heartbeat;

pub use heartbeat::spawn_heartbeat;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::db::CoordinationStore;
use crate::types::{ConcordError, Result};

/// The singleton lock row
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LockRecord {
    pub instance_token: String,
    pub claimed_at: DateTime<Utc>,
}

impl LockRecord {
    /// Record a claim by `instance_token` at the current time
    pub fn new(instance_token: String) -> Self {
        Self {
            instance_token,
            claimed_at: Utc::now(),
        }
    }
}

/// Leadership state of this process
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LeaderState {
    Unclaimed = 0,
    Active = 1,
    SteppingDown = 2,
    Terminated = 3,
}

impl LeaderState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LeaderState::Unclaimed,
            1 => LeaderState::Active,
            2 => LeaderState::SteppingDown,
            _ => LeaderState::Terminated,
        }
    }
}

/// Why this process gave up leadership
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepDownReason {
    /// Another instance's token is stored (or the row disappeared)
    Superseded { by: Option<String> },
    /// The lock could not be read for too many consecutive heartbeats
    StorageUnavailable { failures: u32 },
}

impl std::fmt::Display for StepDownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepDownReason::Superseded { by: Some(by) } => write!(f, "superseded by instance {}", by),
            StepDownReason::Superseded { by: None } => write!(f, "lock row missing"),
            StepDownReason::StorageUnavailable { failures } => {
                write!(f, "lock unreadable after {} consecutive failures", failures)
            }
        }
    }
}

/// Result of one heartbeat probe
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Stored token is still ours
    Held,
    /// Read failed but the failure budget is not exhausted yet
    ReadFailed { consecutive: u32 },
    /// This probe caused the step-down
    SteppedDown(StepDownReason),
    /// Not active, nothing probed
    Inactive,
}

/// Leader lock configuration
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// Interval between lock reads
    pub heartbeat_interval: Duration,
    /// Consecutive read failures before stepping down
    pub max_consecutive_failures: u32,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            max_consecutive_failures: 3,
        }
    }
}

/// Durable single-row mutual exclusion for this process
pub struct LeaderLock {
    store: Arc<dyn CoordinationStore>,
    instance_token: String,
    config: LeaderConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    step_down_tx: watch::Sender<Option<StepDownReason>>,
}

impl LeaderLock {
    /// Create an unclaimed lock with a fresh random instance token
    pub fn new(store: Arc<dyn CoordinationStore>, config: LeaderConfig) -> Self {
        let (step_down_tx, _) = watch::channel(None);
        Self {
            store,
            instance_token: uuid::Uuid::new_v4().to_string(),
            config,
            state: AtomicU8::new(LeaderState::Unclaimed as u8),
            consecutive_failures: AtomicU32::new(0),
            step_down_tx,
        }
    }

    /// This process's token
    pub fn instance_token(&self) -> &str {
        &self.instance_token
    }

    pub fn config(&self) -> &LeaderConfig {
        &self.config
    }

    pub fn state(&self) -> LeaderState {
        LeaderState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Fast guard for handlers. Never performs I/O.
    pub fn is_active(&self) -> bool {
        self.state() == LeaderState::Active
    }

    /// Why leadership was given up, once it has been
    pub fn step_down_reason(&self) -> Option<StepDownReason> {
        self.step_down_tx.borrow().clone()
    }

    /// Overwrite the lock row with this process's token and become active.
    ///
    /// Not a conditional write: the newest claimant wins.
    pub async fn claim(&self) -> Result<()> {
        match self.state() {
            LeaderState::Unclaimed | LeaderState::Active => {}
            _ => return Err(ConcordError::NotLeader),
        }

        let record = LockRecord::new(self.instance_token.clone());
        self.store.write_lock(&record).await?;

        // A concurrent step-down wins over a late claim
        if self
            .state
            .compare_exchange(
                LeaderState::Unclaimed as u8,
                LeaderState::Active as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
            && !self.is_active()
        {
            return Err(ConcordError::NotLeader);
        }
        self.consecutive_failures.store(0, Ordering::SeqCst);

        info!(instance = %self.instance_token, claimed_at = %record.claimed_at, "Claimed leader lock");
        Ok(())
    }

    /// Run one heartbeat probe against the stored lock row.
    pub async fn check_once(&self) -> HeartbeatOutcome {
        if !self.is_active() {
            return HeartbeatOutcome::Inactive;
        }

        match self.store.read_lock().await {
            Ok(Some(record)) if record.instance_token == self.instance_token => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                debug!(instance = %self.instance_token, "Leader lock still held");
                HeartbeatOutcome::Held
            }
            Ok(record) => {
                let by = record.map(|r| r.instance_token);
                let reason = StepDownReason::Superseded { by };
                self.step_down(reason.clone());
                HeartbeatOutcome::SteppedDown(reason)
            }
            Err(e) => {
                let consecutive = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    instance = %self.instance_token,
                    consecutive,
                    max = self.config.max_consecutive_failures,
                    "Leader lock read failed: {}",
                    e
                );
                if consecutive >= self.config.max_consecutive_failures {
                    let reason = StepDownReason::StorageUnavailable {
                        failures: consecutive,
                    };
                    self.step_down(reason.clone());
                    HeartbeatOutcome::SteppedDown(reason)
                } else {
                    HeartbeatOutcome::ReadFailed { consecutive }
                }
            }
        }
    }

    /// Leave the active state. Returns false if already stepping down.
    pub fn step_down(&self, reason: StepDownReason) -> bool {
        let transitioned = self
            .state
            .compare_exchange(
                LeaderState::Active as u8,
                LeaderState::SteppingDown as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
            || self
                .state
                .compare_exchange(
                    LeaderState::Unclaimed as u8,
                    LeaderState::SteppingDown as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok();

        if transitioned {
            error!(instance = %self.instance_token, "Stepping down: {}", reason);
            self.step_down_tx.send_replace(Some(reason));
        }
        transitioned
    }

    /// Mark local cleanup as finished
    pub fn terminate(&self) {
        self.state
            .store(LeaderState::Terminated as u8, Ordering::SeqCst);
        info!(instance = %self.instance_token, "Leader lock terminated");
    }

    /// Watch for the step-down reason
    pub fn subscribe(&self) -> watch::Receiver<Option<StepDownReason>> {
        self.step_down_tx.subscribe()
    }

    /// Wait until this process steps down
    pub async fn stepped_down(&self) -> StepDownReason {
        let mut rx = self.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Sender lives as long as self, so this is unreachable in practice
                return StepDownReason::Superseded { by: None };
            }
        }
    }
}
