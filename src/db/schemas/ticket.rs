//! Ticket document schema

use bson::{doc, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::IntoIndexes;
use crate::tickets::{Ticket, TicketState, TicketStatus};

/// Collection name for tickets
pub const TICKET_COLLECTION: &str = "tickets";

/// Ticket document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TicketDoc {
    #[serde(rename = "_id")]
    pub id: String,

    /// Human-facing sequential number
    pub number: i64,

    pub category: String,

    pub subject_id: String,

    /// Conversation surface, unique
    pub surface_ref: String,

    /// Current status
    #[serde(default)]
    pub status: TicketStatus,

    /// Stored as null when unclaimed so CAS filters can match on it
    pub claimed_by: Option<String>,

    pub close_requested_by: Option<String>,

    pub created_at: DateTime,

    pub closed_at: Option<DateTime>,

    pub closed_by: Option<String>,

    #[serde(default)]
    pub quota_reserved: bool,
}

impl From<&Ticket> for TicketDoc {
    fn from(ticket: &Ticket) -> Self {
        Self {
            id: ticket.id.clone(),
            number: ticket.number as i64,
            category: ticket.category.clone(),
            subject_id: ticket.subject_id.clone(),
            surface_ref: ticket.surface_ref.clone(),
            status: ticket.state.status,
            claimed_by: ticket.state.claimed_by.clone(),
            close_requested_by: ticket.state.close_requested_by.clone(),
            created_at: DateTime::from_chrono(ticket.created_at),
            closed_at: ticket.closed_at.map(DateTime::from_chrono),
            closed_by: ticket.closed_by.clone(),
            quota_reserved: ticket.quota_reserved,
        }
    }
}

impl From<TicketDoc> for Ticket {
    fn from(doc: TicketDoc) -> Self {
        Ticket {
            id: doc.id,
            number: doc.number.max(0) as u64,
            category: doc.category,
            subject_id: doc.subject_id,
            surface_ref: doc.surface_ref,
            state: TicketState {
                status: doc.status,
                claimed_by: doc.claimed_by,
                close_requested_by: doc.close_requested_by,
            },
            created_at: doc.created_at.to_chrono(),
            closed_at: doc.closed_at.map(|d| d.to_chrono()),
            closed_by: doc.closed_by,
            quota_reserved: doc.quota_reserved,
        }
    }
}

/// Filter matching a ticket whose stored state equals `state`
pub fn state_filter(id: &str, state: &TicketState) -> Document {
    doc! {
        "_id": id,
        "status": state.status.as_str(),
        "claimed_by": state.claimed_by.clone(),
        "close_requested_by": state.close_requested_by.clone(),
    }
}

impl IntoIndexes for TicketDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // Unique index on surface_ref for lookup from inbound events
            (
                doc! { "surface_ref": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("surface_ref_unique".to_string())
                        .build(),
                ),
            ),
            // Unique sequential number
            (
                doc! { "number": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("number_unique".to_string())
                        .build(),
                ),
            ),
            // Open tickets per subject and category
            (
                doc! { "subject_id": 1, "category": 1, "status": 1 },
                Some(
                    IndexOptions::builder()
                        .name("subject_category_status_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::Bson;

    #[test]
    fn test_doc_conversion_keeps_state() {
        let mut ticket = Ticket::new(12, "support", "user-1", "support-0012", true);
        ticket.state.claimed_by = Some("mod-1".into());

        let doc = TicketDoc::from(&ticket);
        assert_eq!(doc.number, 12);
        assert_eq!(doc.claimed_by.as_deref(), Some("mod-1"));

        let back = Ticket::from(doc);
        assert_eq!(back.state, ticket.state);
        assert_eq!(back.surface_ref, ticket.surface_ref);
    }

    #[test]
    fn test_unclaimed_serializes_as_null() {
        let ticket = Ticket::new(1, "support", "user-1", "support-0001", true);
        let doc = bson::to_document(&TicketDoc::from(&ticket)).unwrap();
        assert_eq!(doc.get("claimed_by"), Some(&Bson::Null));
        assert_eq!(doc.get_str("status").unwrap(), "open");
    }

    #[test]
    fn test_state_filter_matches_null_claim() {
        let filter = state_filter("t-1", &TicketState::open());
        assert_eq!(filter.get("claimed_by"), Some(&Bson::Null));
        assert_eq!(filter.get_str("status").unwrap(), "open");
    }
}
