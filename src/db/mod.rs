//! Durable storage for the leader lock and tickets
//!
//! `MongoStore` is the production backend; `MemoryStore` serves dev mode and
//! tests. Both implement `CoordinationStore`.

pub mod memory;
pub mod mongo;
pub mod schemas;
mod store;

pub use memory::MemoryStore;
pub use mongo::{MongoClient, MongoCollection, MongoStore};
pub use store::CoordinationStore;
