//! Concord - process coordination for a community chat bot
//!
//! The layer that keeps a single bot deployment honest about shared state:
//!
//! - **Leader lock**: one durable row decides which process may act; a
//!   heartbeat steps an older process down when a newer one claims it
//! - **Tickets**: claim, close-request and close transitions as
//!   compare-and-set writes, with per-category quotas
//! - **Cooldowns**: per-actor rate limits that sweep themselves
//! - **Suppressor**: per-actor burst detection for staff notifications
//!
//! Storage is MongoDB in production and an in-memory store for dev mode and
//! tests.

pub mod config;
pub mod cooldown;
pub mod coordinator;
pub mod db;
pub mod leader;
pub mod logging;
pub mod suppressor;
pub mod sweep;
pub mod tickets;
pub mod types;

pub use config::Args;
pub use coordinator::{Action, Coordinator, CoordinatorConfig, InboundEvent, Reply};
pub use types::{ConcordError, Result};
