//! MongoDB client, collection wrapper, and store implementation
//!
//! Every contended write is one filtered update, so MongoDB's single-document
//! atomicity is the serialization point.

use async_trait::async_trait;
use bson::{doc, DateTime, Document};
use futures::TryStreamExt;
use mongodb::{
    error::{ErrorKind, WriteFailure},
    options::{ClientOptions, IndexOptions, ReturnDocument},
    Client, Collection, IndexModel,
};
use std::time::Duration;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use super::schemas::{
    quota_slot_id, repair_filter, reserve_filter, state_filter, CounterDoc, LockDoc, QuotaSlotDoc,
    TicketDoc, COUNTER_COLLECTION, LOCK_COLLECTION, LOCK_ROW_ID, QUOTA_COLLECTION,
    TICKET_COLLECTION, TICKET_NUMBER_COUNTER,
};
use super::CoordinationStore;
use crate::leader::LockRecord;
use crate::tickets::{Ticket, TicketStatus, Transition, TransitionOutcome};
use crate::types::{ConcordError, Result};

/// MongoDB duplicate key error code
const DUPLICATE_KEY: i32 = 11000;

/// Bounds server selection and connect so an unreachable server fails fast
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Trait for schemas that provide index definitions
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
}

impl MongoClient {
    /// Create a new MongoDB client
    pub async fn new(uri: &str, db_name: &str) -> Result<Self> {
        info!("Connecting to MongoDB at {}", uri);

        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(|e| storage_error("Invalid MongoDB URI", e))?;
        options.app_name.get_or_insert_with(|| "concord".to_string());
        options.server_selection_timeout.get_or_insert(CONNECT_TIMEOUT);
        options.connect_timeout.get_or_insert(CONNECT_TIMEOUT);

        let client = Client::with_options(options)
            .map_err(|e| storage_error("Failed to connect to MongoDB", e))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| storage_error("MongoDB ping failed", e))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    /// Get a typed collection with its indexes applied
    pub async fn collection<T>(&self, name: &str) -> Result<MongoCollection<T>>
    where
        T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes,
    {
        MongoCollection::new(&self.client, &self.db_name, name).await
    }
}

/// Typed MongoDB collection with automatic indexing
#[derive(Debug, Clone)]
pub struct MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync,
{
    inner: Collection<T>,
}

impl<T> MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes,
{
    /// Create a new collection and apply indexes
    pub async fn new(client: &Client, db_name: &str, collection_name: &str) -> Result<Self> {
        let collection = client.database(db_name).collection::<T>(collection_name);
        let mongo_collection = MongoCollection { inner: collection };

        mongo_collection.apply_indexes().await?;

        Ok(mongo_collection)
    }

    /// Apply schema-defined indexes
    async fn apply_indexes(&self) -> Result<()> {
        let schema_indices = T::into_indices();

        if schema_indices.is_empty() {
            return Ok(());
        }

        let indices: Vec<IndexModel> = schema_indices
            .into_iter()
            .map(|(keys, opts)| IndexModel::builder().keys(keys).options(opts).build())
            .collect();

        self.inner
            .create_indexes(indices)
            .await
            .map_err(|e| storage_error("Failed to create indexes", e))?;

        Ok(())
    }

    /// Get the underlying collection
    pub fn inner(&self) -> &Collection<T> {
        &self.inner
    }
}

fn storage_error(context: &str, e: mongodb::error::Error) -> ConcordError {
    ConcordError::StorageUnavailable(format!("{}: {}", context, e))
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    match e.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == DUPLICATE_KEY,
        ErrorKind::Command(command_error) => command_error.code == DUPLICATE_KEY,
        _ => false,
    }
}

/// `CoordinationStore` backed by MongoDB
#[derive(Clone)]
pub struct MongoStore {
    locks: MongoCollection<LockDoc>,
    tickets: MongoCollection<TicketDoc>,
    quota_slots: MongoCollection<QuotaSlotDoc>,
    counters: MongoCollection<CounterDoc>,
}

impl MongoStore {
    /// Open all collections and apply their indexes
    pub async fn new(mongo: &MongoClient) -> Result<Self> {
        Ok(Self {
            locks: mongo.collection(LOCK_COLLECTION).await?,
            tickets: mongo.collection(TICKET_COLLECTION).await?,
            quota_slots: mongo.collection(QUOTA_COLLECTION).await?,
            counters: mongo.collection(COUNTER_COLLECTION).await?,
        })
    }
}

#[async_trait]
impl CoordinationStore for MongoStore {
    async fn write_lock(&self, record: &LockRecord) -> Result<()> {
        // Unconditional overwrite of the singleton row; $max keeps claimed_at monotonic
        self.locks
            .inner()
            .update_one(
                doc! { "_id": LOCK_ROW_ID },
                doc! {
                    "$set": { "instance_token": &record.instance_token },
                    "$max": { "claimed_at": DateTime::from_chrono(record.claimed_at) },
                },
            )
            .upsert(true)
            .await
            .map_err(|e| storage_error("Lock write failed", e))?;
        Ok(())
    }

    async fn read_lock(&self) -> Result<Option<LockRecord>> {
        let doc = self
            .locks
            .inner()
            .find_one(doc! { "_id": LOCK_ROW_ID })
            .await
            .map_err(|e| storage_error("Lock read failed", e))?;
        Ok(doc.map(LockRecord::from))
    }

    async fn next_ticket_number(&self) -> Result<u64> {
        let counter = self
            .counters
            .inner()
            .find_one_and_update(
                doc! { "_id": TICKET_NUMBER_COUNTER },
                doc! { "$inc": { "seq": 1_i64 } },
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await
            .map_err(|e| storage_error("Counter increment failed", e))?
            .ok_or_else(|| ConcordError::StorageUnavailable("Counter upsert returned nothing".into()))?;
        Ok(counter.seq.max(0) as u64)
    }

    async fn reserve_quota(&self, subject: &str, category: &str, max: u32) -> Result<bool> {
        let slots = self.quota_slots.inner();

        // Plain _id upsert: the server retries it if two first reservations race
        slots
            .update_one(
                doc! { "_id": quota_slot_id(subject, category) },
                doc! { "$setOnInsert": { "open_count": 0_i64 } },
            )
            .upsert(true)
            .await
            .map_err(|e| storage_error("Quota slot init failed", e))?;

        let result = slots
            .update_one(
                reserve_filter(subject, category, max),
                doc! {
                    "$inc": { "open_count": 1_i64 },
                    "$set": { "reserved_at": DateTime::now() },
                },
            )
            .await
            .map_err(|e| storage_error("Quota reservation failed", e))?;

        if result.matched_count == 0 {
            debug!(subject, category, max, "Quota slot full");
            return Ok(false);
        }
        Ok(true)
    }

    async fn release_quota(&self, subject: &str, category: &str) -> Result<()> {
        self.quota_slots
            .inner()
            .update_one(
                doc! {
                    "_id": quota_slot_id(subject, category),
                    "open_count": { "$gt": 0_i64 },
                },
                doc! { "$inc": { "open_count": -1_i64 } },
            )
            .await
            .map_err(|e| storage_error("Quota release failed", e))?;
        Ok(())
    }

    async fn repair_quota(&self, subject: &str, category: &str, open: u32, idle: Duration) -> Result<bool> {
        let idle_ms = i64::try_from(idle.as_millis()).unwrap_or(i64::MAX);
        let settled_before = DateTime::from_millis(DateTime::now().timestamp_millis().saturating_sub(idle_ms));

        let result = self
            .quota_slots
            .inner()
            .update_one(
                repair_filter(subject, category, open, settled_before),
                doc! { "$set": { "open_count": i64::from(open) } },
            )
            .await
            .map_err(|e| storage_error("Quota repair failed", e))?;
        Ok(result.modified_count > 0)
    }

    async fn insert_ticket(&self, ticket: &Ticket) -> Result<()> {
        match self.tickets.inner().insert_one(TicketDoc::from(ticket)).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(ConcordError::Conflict(format!(
                "surface {} already has a ticket",
                ticket.surface_ref
            ))),
            Err(e) => Err(storage_error("Ticket insert failed", e)),
        }
    }

    async fn get_ticket(&self, id: &str) -> Result<Option<Ticket>> {
        let doc = self
            .tickets
            .inner()
            .find_one(doc! { "_id": id })
            .await
            .map_err(|e| storage_error("Ticket lookup failed", e))?;
        Ok(doc.map(Ticket::from))
    }

    async fn find_by_surface(&self, surface_ref: &str) -> Result<Option<Ticket>> {
        let doc = self
            .tickets
            .inner()
            .find_one(doc! { "surface_ref": surface_ref })
            .await
            .map_err(|e| storage_error("Ticket lookup failed", e))?;
        Ok(doc.map(Ticket::from))
    }

    async fn find_open(&self, subject: &str, category: &str) -> Result<Vec<Ticket>> {
        let cursor = self
            .tickets
            .inner()
            .find(doc! {
                "subject_id": subject,
                "category": category,
                "status": { "$ne": TicketStatus::Closed.as_str() },
            })
            .sort(doc! { "number": 1 })
            .await
            .map_err(|e| storage_error("Ticket query failed", e))?;

        let docs: Vec<TicketDoc> = cursor
            .try_collect()
            .await
            .map_err(|e| storage_error("Ticket query failed", e))?;
        Ok(docs.into_iter().map(Ticket::from).collect())
    }

    async fn apply_transition(&self, id: &str, transition: &Transition) -> Result<TransitionOutcome> {
        let to = &transition.to;
        let mut set = doc! {
            "status": to.status.as_str(),
            "claimed_by": to.claimed_by.clone(),
            "close_requested_by": to.close_requested_by.clone(),
        };
        if to.status == TicketStatus::Closed {
            set.insert("closed_at", DateTime::now());
            set.insert("closed_by", transition.actor.clone());
        }

        let updated = self
            .tickets
            .inner()
            .find_one_and_update(state_filter(id, &transition.from), doc! { "$set": set })
            .return_document(ReturnDocument::After)
            .await
            .map_err(|e| storage_error("Ticket transition failed", e))?;

        if let Some(doc) = updated {
            return Ok(TransitionOutcome::Applied(Ticket::from(doc)));
        }

        // Guard missed: report what is stored now
        Ok(match self.get_ticket(id).await? {
            Some(current) => TransitionOutcome::Conflict(current),
            None => TransitionOutcome::Missing,
        })
    }
}

#[cfg(test)]
mod tests {
    // Integration tests would require a running MongoDB instance.
    // Schema and filter construction is covered in `db::schemas`.
}
