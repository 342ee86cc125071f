//! Background sweep task shared by the in-memory rate limiters
//!
//! The task holds only a `Weak` reference to its owner, so it ends on its own
//! once the owner is dropped. `SweepHandle` aborts it on `stop()` or drop.

use std::sync::{Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Something that can drop its expired entries
pub trait Sweepable: Send + Sync + 'static {
    /// Remove expired entries, returning how many were removed
    fn sweep(&self) -> usize;
}

/// Handle to a running sweep task
#[derive(Debug, Default)]
pub struct SweepHandle {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SweepHandle {
    /// Spawn a sweep loop for `target` on the current tokio runtime.
    ///
    /// Must be called from within a runtime.
    pub fn spawn<T: Sweepable>(name: &'static str, interval: Duration, target: Weak<T>) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(target) = target.upgrade() else {
                    debug!(sweeper = name, "Owner dropped, sweep task exiting");
                    break;
                };
                let removed = target.sweep();
                if removed > 0 {
                    debug!(sweeper = name, removed, "Swept expired entries");
                }
            }
        });

        Self {
            task: Mutex::new(Some(task)),
        }
    }

    /// Stop the sweep task. Safe to call more than once.
    pub fn stop(&self) {
        if let Ok(mut guard) = self.task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }

    /// Whether the sweep task is still scheduled
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|t| !t.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
