//! Shared error type for Concord
//!
//! Every component returns `ConcordError` so the inbound adapter can translate
//! failures into replies in one place.

use thiserror::Error;

use crate::tickets::TicketStatus;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, ConcordError>;

/// Errors surfaced by the coordination core
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConcordError {
    /// Subject already holds the maximum number of open tickets in a category
    #[error("{subject} already has {max} open ticket(s) in '{category}'")]
    QuotaExceeded {
        subject: String,
        category: String,
        max: u32,
    },

    /// Nobody currently holds the ticket
    #[error("Ticket is not claimed")]
    NotClaimed,

    /// Another actor won the claim
    #[error("Ticket already claimed by {by}")]
    AlreadyClaimed { by: String },

    /// Ticket was already closed
    #[error("Ticket is already closed")]
    AlreadyClosed,

    /// Operation is not valid from the stored state
    #[error("Cannot {action} a ticket in state {status}")]
    InvalidTransition {
        status: TicketStatus,
        action: &'static str,
    },

    /// Actor is not allowed to perform the action
    #[error("{actor} is not permitted to {action}")]
    NotPermitted { actor: String, action: &'static str },

    /// Referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Per-actor cooldown still running
    #[error("On cooldown for another {remaining_ms}ms")]
    RateLimited { remaining_ms: u64 },

    /// Durable storage could not be reached or rejected the operation
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A uniqueness constraint was violated
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// This instance is not (or no longer) the active leader
    #[error("Instance is not the active leader")]
    NotLeader,

    /// Inbound event could not be understood
    #[error("Unknown action: {0}")]
    UnknownAction(String),
}

impl ConcordError {
    /// Benign races that should be shown as information, not failure
    pub fn is_informational(&self) -> bool {
        matches!(
            self,
            ConcordError::NotClaimed
                | ConcordError::AlreadyClaimed { .. }
                | ConcordError::AlreadyClosed
        )
    }

    /// Errors the user can fix by changing what they asked for
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            ConcordError::QuotaExceeded { .. }
                | ConcordError::RateLimited { .. }
                | ConcordError::UnknownAction(_)
        )
    }

    /// Short machine-readable code for replies
    pub fn code(&self) -> &'static str {
        match self {
            ConcordError::QuotaExceeded { .. } => "quota_exceeded",
            ConcordError::NotClaimed => "not_claimed",
            ConcordError::AlreadyClaimed { .. } => "already_claimed",
            ConcordError::AlreadyClosed => "already_closed",
            ConcordError::InvalidTransition { .. } => "invalid_transition",
            ConcordError::NotPermitted { .. } => "not_permitted",
            ConcordError::NotFound(_) => "not_found",
            ConcordError::RateLimited { .. } => "rate_limited",
            ConcordError::StorageUnavailable(_) => "storage_unavailable",
            ConcordError::Conflict(_) => "conflict",
            ConcordError::Config(_) => "config",
            ConcordError::NotLeader => "not_leader",
            ConcordError::UnknownAction(_) => "unknown_action",
        }
    }
}
