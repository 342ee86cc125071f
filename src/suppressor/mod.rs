//! Burst suppression for outbound notifications
//!
//! Keeps a sliding window of recent event times per actor and classifies each
//! new event:
//!
//! - below the threshold: `Emit` (normal single notification)
//! - exactly at the threshold: `EmitSummary` (one "rapid activity" notice)
//! - above the threshold: `Drop` until the window ages out again
//!
//! Staff learn that a burst happened without receiving every event in it.

mod sink;

pub use sink::{ChannelSink, NotificationSink, Outbound, TracingSink};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::sweep::{SweepHandle, Sweepable};

/// Outcome of classifying one event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    /// Deliver the individual notification
    Emit,
    /// Deliver a single summary in place of the individual notification
    EmitSummary,
    /// Deliver nothing
    Drop,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Emit => "emit",
            Classification::EmitSummary => "emit-summary",
            Classification::Drop => "drop",
        }
    }
}

/// Structured payload handed to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Who acted
    pub actor: String,
    /// What they did (action token)
    pub action: String,
    /// What they acted on (ticket surface, trigger name)
    pub target: String,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(actor: impl Into<String>, action: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            target: target.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Suppressor configuration
#[derive(Debug, Clone)]
pub struct SuppressorConfig {
    /// Sliding window length
    pub window: Duration,
    /// Event count that marks a burst
    pub threshold: usize,
    /// How often idle actors are swept
    pub sweep_interval: Duration,
}

impl Default for SuppressorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            threshold: 5,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Classification counters
#[derive(Debug, Default)]
struct SuppressorStats {
    emitted: AtomicU64,
    summarized: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of suppressor statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuppressorStatsSnapshot {
    pub emitted: u64,
    pub summarized: u64,
    pub dropped: u64,
}

struct BurstWindows {
    actors: DashMap<String, VecDeque<Instant>>,
    window: Duration,
}

impl Sweepable for BurstWindows {
    fn sweep(&self) -> usize {
        let before = self.actors.len();
        self.actors.retain(|_, events| {
            events
                .back()
                .is_some_and(|latest| latest.elapsed() < self.window)
        });
        before.saturating_sub(self.actors.len())
    }
}

/// Per-actor sliding-window burst detector
pub struct EventSuppressor {
    windows: Arc<BurstWindows>,
    threshold: usize,
    sink: Arc<dyn NotificationSink>,
    stats: SuppressorStats,
    sweeper: SweepHandle,
}

impl EventSuppressor {
    /// Create a suppressor delivering to `sink` and start its sweep task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: SuppressorConfig, sink: Arc<dyn NotificationSink>) -> Self {
        let windows = Arc::new(BurstWindows {
            actors: DashMap::new(),
            window: config.window,
        });
        let sweeper =
            SweepHandle::spawn("suppressor", config.sweep_interval, Arc::downgrade(&windows));

        Self {
            windows,
            threshold: config.threshold.max(1),
            sink,
            stats: SuppressorStats::default(),
            sweeper,
        }
    }

    /// Record one event for `actor` and classify it.
    pub fn classify(&self, actor: &str) -> Classification {
        let window = self.windows.window;
        let count = {
            let mut events = self.windows.actors.entry(actor.to_string()).or_default();
            while events
                .front()
                .is_some_and(|oldest| oldest.elapsed() >= window)
            {
                events.pop_front();
            }
            events.push_back(Instant::now());
            events.len()
        };

        let classification = match count.cmp(&self.threshold) {
            std::cmp::Ordering::Less => Classification::Emit,
            std::cmp::Ordering::Equal => Classification::EmitSummary,
            std::cmp::Ordering::Greater => Classification::Drop,
        };

        match classification {
            Classification::Emit => self.stats.emitted.fetch_add(1, Ordering::Relaxed),
            Classification::EmitSummary => {
                debug!(actor, count, "Burst detected, emitting summary");
                self.stats.summarized.fetch_add(1, Ordering::Relaxed)
            }
            Classification::Drop => self.stats.dropped.fetch_add(1, Ordering::Relaxed),
        };

        classification
    }

    /// Classify `notification` by its actor and deliver it unless dropped.
    pub fn submit(&self, notification: Notification) -> Classification {
        let classification = self.classify(&notification.actor);
        if classification != Classification::Drop {
            self.sink.deliver(Outbound {
                classification,
                notification,
            });
        }
        classification
    }

    /// Remove actors whose window has fully aged out.
    pub fn sweep(&self) -> usize {
        self.windows.sweep()
    }

    /// Number of tracked actors
    pub fn len(&self) -> usize {
        self.windows.actors.len()
    }

    /// Check if no actors are tracked.
    pub fn is_empty(&self) -> bool {
        self.windows.actors.is_empty()
    }

    /// Get statistics.
    pub fn stats(&self) -> SuppressorStatsSnapshot {
        SuppressorStatsSnapshot {
            emitted: self.stats.emitted.load(Ordering::Relaxed),
            summarized: self.stats.summarized.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop the sweep and clear all windows.
    pub fn destroy(&self) {
        self.sweeper.stop();
        self.windows.actors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suppressor(threshold: usize) -> (EventSuppressor, tokio::sync::mpsc::UnboundedReceiver<Outbound>) {
        let (sink, rx) = ChannelSink::new();
        let config = SuppressorConfig {
            window: Duration::from_secs(60),
            threshold,
            sweep_interval: Duration::from_secs(120),
        };
        (EventSuppressor::new(config, Arc::new(sink)), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_classification() {
        let (suppressor, _rx) = suppressor(5);

        for _ in 0..4 {
            assert_eq!(suppressor.classify("spammer"), Classification::Emit);
        }
        assert_eq!(suppressor.classify("spammer"), Classification::EmitSummary);
        assert_eq!(suppressor.classify("spammer"), Classification::Drop);
        assert_eq!(suppressor.classify("spammer"), Classification::Drop);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(suppressor.classify("spammer"), Classification::Emit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_actors_are_independent() {
        let (suppressor, _rx) = suppressor(2);

        assert_eq!(suppressor.classify("a"), Classification::Emit);
        assert_eq!(suppressor.classify("a"), Classification::EmitSummary);
        assert_eq!(suppressor.classify("b"), Classification::Emit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let (suppressor, _rx) = suppressor(3);

        suppressor.classify("a");
        tokio::time::advance(Duration::from_secs(40)).await;
        suppressor.classify("a");
        tokio::time::advance(Duration::from_secs(30)).await;

        // First event aged out, so this is the second in the window
        assert_eq!(suppressor.classify("a"), Classification::Emit);
        assert_eq!(suppressor.classify("a"), Classification::EmitSummary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_delivers_emit_and_summary_only() {
        let (suppressor, mut rx) = suppressor(2);

        for _ in 0..4 {
            suppressor.submit(Notification::new("mod-1", "claim", "support-0001"));
        }

        let first = rx.try_recv().unwrap();
        assert_eq!(first.classification, Classification::Emit);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.classification, Classification::EmitSummary);
        assert_eq!(second.notification.target, "support-0001");
        assert!(rx.try_recv().is_err());

        let stats = suppressor.stats();
        assert_eq!(stats.emitted, 1);
        assert_eq!(stats.summarized, 1);
        assert_eq!(stats.dropped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_idle_actors() {
        let (suppressor, _rx) = suppressor(5);
        suppressor.classify("idle");
        tokio::time::advance(Duration::from_secs(50)).await;
        suppressor.classify("active");
        tokio::time::advance(Duration::from_secs(15)).await;

        assert_eq!(suppressor.sweep(), 1);
        assert_eq!(suppressor.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_and_destroy() {
        let (suppressor, _rx) = suppressor(5);
        suppressor.classify("a");
        suppressor.classify("b");

        tokio::time::sleep(Duration::from_secs(121)).await;
        assert!(suppressor.is_empty());

        suppressor.classify("c");
        suppressor.destroy();
        assert!(suppressor.is_empty());
    }

    #[test]
    fn test_classification_serializes_kebab_case() {
        let json = serde_json::to_string(&Classification::EmitSummary).unwrap();
        assert_eq!(json, "\"emit-summary\"");
    }
}
