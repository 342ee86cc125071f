//! Singleton lock document

use bson::{DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::IntoIndexes;
use crate::leader::LockRecord;

/// Collection name for the leader lock
pub const LOCK_COLLECTION: &str = "singleton_lock";

/// The only `_id` the lock collection ever holds
pub const LOCK_ROW_ID: i32 = 1;

/// Leader lock row
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LockDoc {
    #[serde(rename = "_id")]
    pub id: i32,

    /// Token of the most recent instance to claim
    pub instance_token: String,

    /// When that claim happened
    pub claimed_at: DateTime,
}

impl From<LockDoc> for LockRecord {
    fn from(doc: LockDoc) -> Self {
        LockRecord {
            instance_token: doc.instance_token,
            claimed_at: doc.claimed_at.to_chrono(),
        }
    }
}

impl IntoIndexes for LockDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        // `_id` is the only key
        vec![]
    }
}
