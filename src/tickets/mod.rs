//! Support tickets: record, access policy, archival, and the state machine

mod archive;
mod lifecycle;
mod model;
mod policy;

pub use archive::{LogArchiver, TranscriptArchiver};
pub use lifecycle::{CloseOutcome, LifecycleConfig, TicketLifecycle};
pub use model::{surface_name, Ticket, TicketState, TicketStatus, Transition, TransitionOutcome};
pub use policy::{AccessPolicy, StaticPolicy};
