//! Outbound notification sinks
//!
//! The core hands classified notifications to a sink; rendering is the
//! presentation layer's job.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{Classification, Notification};

/// A notification that survived suppression
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outbound {
    pub classification: Classification,
    #[serde(flatten)]
    pub notification: Notification,
}

/// Receives notifications classified as `Emit` or `EmitSummary`
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, outbound: Outbound);
}

/// Logs every delivered notification as a structured event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn deliver(&self, outbound: Outbound) {
        let n = &outbound.notification;
        info!(
            target: "concord::notify",
            classification = outbound.classification.as_str(),
            actor = %n.actor,
            action = %n.action,
            target_ref = %n.target,
            timestamp = %n.timestamp,
            "Notification"
        );
    }
}

/// Forwards notifications to an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelSink {
    /// Create a sink and the receiver that drains it
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn deliver(&self, outbound: Outbound) {
        if self.tx.send(outbound).is_err() {
            warn!("Notification receiver dropped, discarding notification");
        }
    }
}
