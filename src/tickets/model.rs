//! Ticket record and lifecycle state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Durable ticket status
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Accepting claims and messages
    #[default]
    Open,
    /// Subject asked to close; waiting for staff approval
    CloseRequested,
    /// Closed; the record is immutable from here on
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::CloseRequested => "close_requested",
            TicketStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The mutable part of a ticket, compared and swapped as one unit
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TicketState {
    pub status: TicketStatus,
    pub claimed_by: Option<String>,
    pub close_requested_by: Option<String>,
}

impl TicketState {
    /// Fresh, unclaimed ticket
    pub fn open() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.status == TicketStatus::Closed
    }
}

/// A support ticket bound to one conversation surface
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Ticket {
    /// Stable identifier
    pub id: String,
    /// Human-facing sequential number
    pub number: u64,
    pub category: String,
    /// The user the ticket is about
    pub subject_id: String,
    /// External conversation surface, unique per ticket
    pub surface_ref: String,
    #[serde(flatten)]
    pub state: TicketState,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub closed_by: Option<String>,
    /// Whether the ticket holds a quota slot that must be released on close
    pub quota_reserved: bool,
}

impl Ticket {
    /// Create a new open ticket
    pub fn new(
        number: u64,
        category: impl Into<String>,
        subject_id: impl Into<String>,
        surface_ref: impl Into<String>,
        quota_reserved: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            number,
            category: category.into(),
            subject_id: subject_id.into(),
            surface_ref: surface_ref.into(),
            state: TicketState::open(),
            created_at: Utc::now(),
            closed_at: None,
            closed_by: None,
            quota_reserved,
        }
    }

    pub fn status(&self) -> TicketStatus {
        self.state.status
    }

    pub fn claimed_by(&self) -> Option<&str> {
        self.state.claimed_by.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Whether `actor` is the user the ticket is about
    pub fn is_subject(&self, actor: &str) -> bool {
        self.subject_id == actor
    }
}

/// Surface naming for a new ticket: `<category>-<number>`
pub fn surface_name(category: &str, number: u64) -> String {
    format!("{}-{:04}", category, number)
}

/// A compare-and-set on a ticket's state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    /// State the stored record must be in
    pub from: TicketState,
    /// State to write when it is
    pub to: TicketState,
    /// Recorded as `closed_by` when `to` is closed
    pub actor: String,
}

/// Result of applying a `Transition`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Stored state matched; this is the updated ticket
    Applied(Ticket),
    /// Stored state did not match; this is what is stored now
    Conflict(Ticket),
    /// No ticket with that id
    Missing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_matches_serde() {
        for status in [TicketStatus::Open, TicketStatus::CloseRequested, TicketStatus::Closed] {
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, serde_json::Value::from(status.as_str()));
            assert_eq!(serde_json::from_value::<TicketStatus>(json).unwrap(), status);
        }
        assert!(serde_json::from_str::<TicketStatus>("\"archived\"").is_err());
    }

    #[test]
    fn test_new_ticket_is_open_and_unclaimed() {
        let ticket = Ticket::new(7, "support", "user-1", surface_name("support", 7), true);
        assert_eq!(ticket.status(), TicketStatus::Open);
        assert_eq!(ticket.claimed_by(), None);
        assert_eq!(ticket.surface_ref, "support-0007");
        assert!(ticket.is_subject("user-1"));
        assert!(!ticket.is_subject("mod-1"));
    }

    #[test]
    fn test_ticket_json_flattens_state() {
        let ticket = Ticket::new(1, "support", "user-1", "support-0001", true);
        let json = serde_json::to_value(&ticket).unwrap();
        assert_eq!(json["status"], "open");
        assert!(json["claimed_by"].is_null());
    }
}
