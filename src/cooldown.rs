//! Keyed cooldown map with self-cleaning expiry
//!
//! Answers "has `key` acted within the last window?" for rate-limited
//! operations such as ticket creation and cooldown-gated triggers.
//!
//! # Memory
//!
//! - Entries older than the window are removed by a background sweep
//! - The sweep interval is independent of the window length
//! - Memory is bounded by recently active keys, not all-time keys
//!
//! State is advisory: losing it on restart only resets a rate limit early.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::sweep::{SweepHandle, Sweepable};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a cooldown map.
#[derive(Debug, Clone)]
pub struct CooldownConfig {
    /// How long a key stays on cooldown after `set`
    pub window: Duration,

    /// How often expired entries are swept
    pub sweep_interval: Duration,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters for a cooldown map.
#[derive(Debug, Default)]
pub struct CooldownStats {
    /// Checks that found the key on cooldown
    pub hits: AtomicU64,

    /// Keys set (directly or through `try_acquire`)
    pub sets: AtomicU64,

    /// Entries removed by the sweep
    pub swept: AtomicU64,
}

impl CooldownStats {
    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> CooldownStatsSnapshot {
        CooldownStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of cooldown statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CooldownStatsSnapshot {
    pub hits: u64,
    pub sets: u64,
    pub swept: u64,
}

// =============================================================================
// Cooldown Map
// =============================================================================

struct Entries<K: Eq + Hash> {
    map: DashMap<K, Instant>,
    window: Duration,
    stats: CooldownStats,
}

impl<K: Eq + Hash> Entries<K> {
    fn remaining_since(&self, last_set: Instant) -> Duration {
        self.window.saturating_sub(last_set.elapsed())
    }
}

impl<K> Sweepable for Entries<K>
where
    K: Eq + Hash + Send + Sync + 'static,
{
    fn sweep(&self) -> usize {
        let mut removed = 0;
        self.map.retain(|_, last_set| {
            if last_set.elapsed() >= self.window {
                removed += 1;
                false
            } else {
                true
            }
        });
        self.stats.swept.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }
}

/// Per-key rate limiter with a mandatory background sweep.
///
/// Construct inside a tokio runtime; the sweep task is spawned on creation
/// and stopped by `destroy()` or on drop.
pub struct TtlCooldownMap<K>
where
    K: Eq + Hash + Send + Sync + 'static,
{
    entries: Arc<Entries<K>>,
    sweeper: SweepHandle,
}

impl<K> TtlCooldownMap<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create a cooldown map and start its sweep task.
    pub fn new(config: CooldownConfig) -> Self {
        let entries = Arc::new(Entries {
            map: DashMap::new(),
            window: config.window,
            stats: CooldownStats::default(),
        });
        let sweeper =
            SweepHandle::spawn("cooldown", config.sweep_interval, Arc::downgrade(&entries));

        Self { entries, sweeper }
    }

    /// Create a cooldown map with the given window and default sweep interval.
    pub fn with_window(window: Duration) -> Self {
        Self::new(CooldownConfig {
            window,
            ..Default::default()
        })
    }

    /// Cooldown window length
    pub fn window(&self) -> Duration {
        self.entries.window
    }

    /// True iff `key` was set less than one window ago.
    pub fn is_on_cooldown(&self, key: &K) -> bool {
        let on_cooldown = self
            .entries
            .map
            .get(key)
            .map(|last_set| last_set.elapsed() < self.entries.window)
            .unwrap_or(false);

        if on_cooldown {
            self.entries.stats.hits.fetch_add(1, Ordering::Relaxed);
        }
        on_cooldown
    }

    /// Record "now" as the last action time for `key`.
    pub fn set(&self, key: K) {
        self.entries.map.insert(key, Instant::now());
        self.entries.stats.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// Time left before `key` comes off cooldown (zero if it is not on one).
    pub fn remaining(&self, key: &K) -> Duration {
        self.entries
            .map
            .get(key)
            .map(|last_set| self.entries.remaining_since(*last_set))
            .unwrap_or(Duration::ZERO)
    }

    /// Check and set in one step.
    ///
    /// Holds the key's shard lock across the check, so two concurrent callers
    /// for the same key cannot both succeed. Returns the remaining time when
    /// the key is still on cooldown.
    pub fn try_acquire(&self, key: K) -> Result<(), Duration> {
        match self.entries.map.entry(key) {
            Entry::Occupied(mut entry) => {
                let remaining = self.entries.remaining_since(*entry.get());
                if !remaining.is_zero() {
                    self.entries.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Err(remaining);
                }
                entry.insert(Instant::now());
            }
            Entry::Vacant(entry) => {
                entry.insert(Instant::now());
            }
        }
        self.entries.stats.sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove `key` early (e.g. after the guarded action failed).
    pub fn clear(&self, key: &K) -> bool {
        self.entries.map.remove(key).is_some()
    }

    /// Remove all expired entries now.
    pub fn sweep(&self) -> usize {
        self.entries.sweep()
    }

    /// Number of tracked keys, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.map.len()
    }

    /// Check if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.map.is_empty()
    }

    /// Get statistics.
    pub fn stats(&self) -> CooldownStatsSnapshot {
        self.entries.stats.snapshot()
    }

    /// Whether the background sweep is still running
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.is_running()
    }

    /// Stop the sweep and clear all state.
    pub fn destroy(&self) {
        self.sweeper.stop();
        self.entries.map.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
