//! Database schemas for Concord
//!
//! Defines MongoDB document structures for the leader lock, tickets, and the
//! counters behind quota slots and ticket numbers.

mod lock;
mod quota;
mod ticket;

pub use lock::{LockDoc, LOCK_COLLECTION, LOCK_ROW_ID};
pub use quota::{
    quota_slot_id, repair_filter, reserve_filter, CounterDoc, QuotaSlotDoc, COUNTER_COLLECTION,
    QUOTA_COLLECTION, TICKET_NUMBER_COUNTER,
};
pub use ticket::{state_filter, TicketDoc, TICKET_COLLECTION};
