//! Counter documents backing quota slots and ticket numbers

use bson::{doc, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::IntoIndexes;

/// Collection name for open-ticket quota slots
pub const QUOTA_COLLECTION: &str = "quota_slots";

/// Collection name for sequence counters
pub const COUNTER_COLLECTION: &str = "counters";

/// Counter `_id` for human-facing ticket numbers
pub const TICKET_NUMBER_COUNTER: &str = "ticket_number";

/// `_id` of the slot row for a subject in a category
pub fn quota_slot_id(subject: &str, category: &str) -> String {
    format!("{}/{}", subject, category)
}

/// Matches the slot only while it has room for another ticket
pub fn reserve_filter(subject: &str, category: &str, max: u32) -> Document {
    doc! {
        "_id": quota_slot_id(subject, category),
        "open_count": { "$lt": i64::from(max) },
    }
}

/// Matches a slot counting more than `open` that has not been reserved
/// since `settled_before`. Rows written before `reserved_at` existed match.
pub fn repair_filter(subject: &str, category: &str, open: u32, settled_before: DateTime) -> Document {
    doc! {
        "_id": quota_slot_id(subject, category),
        "open_count": { "$gt": i64::from(open) },
        "reserved_at": { "$not": { "$gte": settled_before } },
    }
}

/// Open-ticket count for one `(subject, category)` pair
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QuotaSlotDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub open_count: i64,
    /// Last successful reservation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_at: Option<DateTime>,
}

impl IntoIndexes for QuotaSlotDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![]
    }
}

/// Monotonic sequence
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CounterDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub seq: i64,
}

impl IntoIndexes for CounterDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![]
    }
}
