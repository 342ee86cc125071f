//! Transcript archival on close
//!
//! Runs once per ticket, after the transition to closed succeeds.

use async_trait::async_trait;
use tracing::info;

use super::Ticket;
use crate::types::{ConcordError, Result};

/// Exports the record of a closed ticket
#[async_trait]
pub trait TranscriptArchiver: Send + Sync {
    async fn archive(&self, ticket: &Ticket) -> Result<()>;
}

/// Writes the closed ticket as one JSON line through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogArchiver;

#[async_trait]
impl TranscriptArchiver for LogArchiver {
    async fn archive(&self, ticket: &Ticket) -> Result<()> {
        let line = serde_json::to_string(ticket)
            .map_err(|e| ConcordError::StorageUnavailable(format!("Failed to encode transcript: {e}")))?;
        info!(target: "concord::archive", ticket = %ticket.id, number = ticket.number, "{}", line);
        Ok(())
    }
}
