//! Durable storage contract
//!
//! Every write that two processes (or two handlers) may race on is a single
//! predicate-guarded operation here. Callers never read and then write
//! unguarded.

use async_trait::async_trait;
use std::time::Duration;

use crate::leader::LockRecord;
use crate::tickets::{Ticket, Transition, TransitionOutcome};
use crate::types::Result;

/// Storage backend for the leader lock and ticket records
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Overwrite the singleton lock row, creating it on first use.
    ///
    /// `claimed_at` never moves backwards.
    async fn write_lock(&self, record: &LockRecord) -> Result<()>;

    /// Read the singleton lock row
    async fn read_lock(&self) -> Result<Option<LockRecord>>;

    /// Atomically allocate the next ticket number (starting at 1)
    async fn next_ticket_number(&self) -> Result<u64>;

    /// Take one open-ticket slot for `(subject, category)` if fewer than
    /// `max` are taken. Returns false when the quota is full.
    async fn reserve_quota(&self, subject: &str, category: &str, max: u32) -> Result<bool>;

    /// Give back a slot taken by `reserve_quota`
    async fn release_quota(&self, subject: &str, category: &str) -> Result<()>;

    /// Lower the slot count to `open` if it is above that and nothing has
    /// reserved the slot for at least `idle`. Returns true if it was rewritten.
    ///
    /// A release that fails after a close leaves the count too high; this is
    /// how the count is brought back in line with the open tickets.
    async fn repair_quota(&self, subject: &str, category: &str, open: u32, idle: Duration) -> Result<bool>;

    /// Insert a new ticket. Fails with `Conflict` on a duplicate surface.
    async fn insert_ticket(&self, ticket: &Ticket) -> Result<()>;

    async fn get_ticket(&self, id: &str) -> Result<Option<Ticket>>;

    async fn find_by_surface(&self, surface_ref: &str) -> Result<Option<Ticket>>;

    /// Open tickets (including close-requested) for a subject in a category
    async fn find_open(&self, subject: &str, category: &str) -> Result<Vec<Ticket>>;

    /// Compare-and-set the ticket's state.
    ///
    /// Writes `transition.to` only if the stored state equals
    /// `transition.from`. Sets `closed_at`/`closed_by` when moving to closed.
    async fn apply_transition(&self, id: &str, transition: &Transition) -> Result<TransitionOutcome>;
}
