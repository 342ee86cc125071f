//! In-process store
//!
//! Used in dev mode and tests. One mutex serializes every operation, which
//! makes each trait method atomic.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::CoordinationStore;
use crate::leader::LockRecord;
use crate::tickets::{Ticket, TicketStatus, Transition, TransitionOutcome};
use crate::types::{ConcordError, Result};

struct QuotaSlot {
    open_count: u32,
    reserved_at: Instant,
}

#[derive(Default)]
struct MemoryState {
    lock: Option<LockRecord>,
    tickets: HashMap<String, Ticket>,
    by_surface: HashMap<String, String>,
    quota_slots: HashMap<(String, String), QuotaSlot>,
    last_number: u64,
}

/// Mutex-guarded in-memory store
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
    lock_reads: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a storage outage: every call fails while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of lock reads served (heartbeat probes)
    pub fn lock_reads(&self) -> u64 {
        self.lock_reads.load(Ordering::SeqCst)
    }

    /// Currently taken quota slots for `(subject, category)`
    pub async fn quota_in_use(&self, subject: &str, category: &str) -> u32 {
        let state = self.state.lock().await;
        state
            .quota_slots
            .get(&(subject.to_string(), category.to_string()))
            .map_or(0, |slot| slot.open_count)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ConcordError::StorageUnavailable(
                "memory store marked unavailable".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn write_lock(&self, record: &LockRecord) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let claimed_at = match &state.lock {
            Some(existing) => existing.claimed_at.max(record.claimed_at),
            None => record.claimed_at,
        };
        state.lock = Some(LockRecord {
            instance_token: record.instance_token.clone(),
            claimed_at,
        });
        Ok(())
    }

    async fn read_lock(&self) -> Result<Option<LockRecord>> {
        self.check_available()?;
        self.lock_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().await.lock.clone())
    }

    async fn next_ticket_number(&self) -> Result<u64> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.last_number += 1;
        Ok(state.last_number)
    }

    async fn reserve_quota(&self, subject: &str, category: &str, max: u32) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let slot = state
            .quota_slots
            .entry((subject.to_string(), category.to_string()))
            .or_insert_with(|| QuotaSlot {
                open_count: 0,
                reserved_at: Instant::now(),
            });
        if slot.open_count >= max {
            return Ok(false);
        }
        slot.open_count += 1;
        slot.reserved_at = Instant::now();
        Ok(true)
    }

    async fn release_quota(&self, subject: &str, category: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let key = (subject.to_string(), category.to_string());
        let remaining = match state.quota_slots.get_mut(&key) {
            Some(slot) => {
                slot.open_count = slot.open_count.saturating_sub(1);
                slot.open_count
            }
            None => return Ok(()),
        };
        if remaining == 0 {
            state.quota_slots.remove(&key);
        }
        Ok(())
    }

    async fn repair_quota(&self, subject: &str, category: &str, open: u32, idle: Duration) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let key = (subject.to_string(), category.to_string());
        let Some(slot) = state.quota_slots.get_mut(&key) else {
            return Ok(false);
        };
        if slot.open_count <= open || slot.reserved_at.elapsed() < idle {
            return Ok(false);
        }
        slot.open_count = open;
        if open == 0 {
            state.quota_slots.remove(&key);
        }
        Ok(true)
    }

    async fn insert_ticket(&self, ticket: &Ticket) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.by_surface.contains_key(&ticket.surface_ref) {
            return Err(ConcordError::Conflict(format!(
                "surface {} already has a ticket",
                ticket.surface_ref
            )));
        }
        if state.tickets.contains_key(&ticket.id) {
            return Err(ConcordError::Conflict(format!("ticket {} exists", ticket.id)));
        }
        state
            .by_surface
            .insert(ticket.surface_ref.clone(), ticket.id.clone());
        state.tickets.insert(ticket.id.clone(), ticket.clone());
        Ok(())
    }

    async fn get_ticket(&self, id: &str) -> Result<Option<Ticket>> {
        self.check_available()?;
        Ok(self.state.lock().await.tickets.get(id).cloned())
    }

    async fn find_by_surface(&self, surface_ref: &str) -> Result<Option<Ticket>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .by_surface
            .get(surface_ref)
            .and_then(|id| state.tickets.get(id))
            .cloned())
    }

    async fn find_open(&self, subject: &str, category: &str) -> Result<Vec<Ticket>> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut open: Vec<Ticket> = state
            .tickets
            .values()
            .filter(|t| t.subject_id == subject && t.category == category && !t.is_closed())
            .cloned()
            .collect();
        open.sort_by_key(|t| t.number);
        Ok(open)
    }

    async fn apply_transition(&self, id: &str, transition: &Transition) -> Result<TransitionOutcome> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let Some(ticket) = state.tickets.get_mut(id) else {
            return Ok(TransitionOutcome::Missing);
        };

        if ticket.state != transition.from {
            debug!(ticket = %id, "Transition guard did not match stored state");
            return Ok(TransitionOutcome::Conflict(ticket.clone()));
        }

        ticket.state = transition.to.clone();
        if transition.to.status == TicketStatus::Closed {
            ticket.closed_at = Some(Utc::now());
            ticket.closed_by = Some(transition.actor.clone());
        }
        Ok(TransitionOutcome::Applied(ticket.clone()))
    }
}
