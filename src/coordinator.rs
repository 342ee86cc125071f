//! Inbound event dispatch
//!
//! Every event goes through the same gate: leadership first, then the
//! per-actor cooldowns, then the ticket state machine. Whatever changed is
//! handed to the burst suppressor before it reaches staff.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cooldown::{CooldownConfig, TtlCooldownMap};
use crate::leader::LeaderLock;
use crate::suppressor::{Classification, EventSuppressor, Notification, NotificationSink, SuppressorConfig};
use crate::tickets::{CloseOutcome, Ticket, TicketLifecycle};
use crate::types::{ConcordError, Result};

/// Discrete action token carried by an inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Create { category: String },
    Claim,
    Unclaim,
    Close,
    ApproveClose,
    DenyClose,
    Trigger { name: String },
}

impl FromStr for Action {
    type Err = ConcordError;

    fn from_str(token: &str) -> Result<Self> {
        let action = match token.split_once(':') {
            Some(("create", category)) if !category.is_empty() => Action::Create {
                category: category.to_string(),
            },
            Some(("trigger", name)) if !name.is_empty() => Action::Trigger {
                name: name.to_string(),
            },
            None => match token {
                "claim" => Action::Claim,
                "unclaim" => Action::Unclaim,
                "close" => Action::Close,
                "approve-close" => Action::ApproveClose,
                "deny-close" => Action::DenyClose,
                _ => return Err(ConcordError::UnknownAction(token.to_string())),
            },
            _ => return Err(ConcordError::UnknownAction(token.to_string())),
        };
        Ok(action)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create { category } => write!(f, "create:{}", category),
            Action::Claim => f.write_str("claim"),
            Action::Unclaim => f.write_str("unclaim"),
            Action::Close => f.write_str("close"),
            Action::ApproveClose => f.write_str("approve-close"),
            Action::DenyClose => f.write_str("deny-close"),
            Action::Trigger { name } => write!(f, "trigger:{}", name),
        }
    }
}

/// One event from the chat gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub actor: String,
    pub surface: Option<String>,
    pub action: Action,
}

impl InboundEvent {
    pub fn new(actor: impl Into<String>, surface: Option<&str>, action: Action) -> Self {
        Self {
            actor: actor.into(),
            surface: surface.map(str::to_string),
            action,
        }
    }

    /// Parse `<actor> <surface|-> <action-token>`
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let (Some(actor), Some(surface), Some(token), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ConcordError::UnknownAction(line.trim().to_string()));
        };

        let surface = (surface != "-").then_some(surface);
        Ok(Self::new(actor, surface, token.parse()?))
    }
}

/// Reply for one event, serialized as a JSON line by the inbound adapter
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub ok: bool,
    pub code: &'static str,
    pub message: String,
    /// Benign race: show as information, not failure
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub informational: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket: Option<Ticket>,
    /// What the suppressor decided for the resulting notification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<Classification>,
}

impl Reply {
    pub fn from_error(err: &ConcordError) -> Self {
        Self {
            ok: false,
            code: err.code(),
            message: err.to_string(),
            informational: err.is_informational(),
            ticket: None,
            notification: None,
        }
    }
}

/// Cooldown and suppression settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Per-actor ticket creation cooldown
    pub create_cooldown: CooldownConfig,
    /// Per-actor, per-trigger cooldown
    pub trigger_cooldown: CooldownConfig,
    pub suppressor: SuppressorConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            create_cooldown: CooldownConfig::default(),
            trigger_cooldown: CooldownConfig {
                window: Duration::from_secs(10),
                ..Default::default()
            },
            suppressor: SuppressorConfig::default(),
        }
    }
}

/// Successful handling, before notification
struct Handled {
    message: String,
    ticket: Option<Ticket>,
    /// Target for the notification; `None` when nothing changed
    notify: Option<String>,
}

/// Routes inbound events through the coordination core
pub struct Coordinator {
    leader: Arc<LeaderLock>,
    tickets: TicketLifecycle,
    create_cooldowns: TtlCooldownMap<String>,
    trigger_cooldowns: TtlCooldownMap<(String, String)>,
    suppressor: EventSuppressor,
}

impl Coordinator {
    /// Build the dispatcher. Spawns sweep tasks, so call inside a runtime.
    pub fn new(
        leader: Arc<LeaderLock>,
        tickets: TicketLifecycle,
        config: CoordinatorConfig,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            leader,
            tickets,
            create_cooldowns: TtlCooldownMap::new(config.create_cooldown),
            trigger_cooldowns: TtlCooldownMap::new(config.trigger_cooldown),
            suppressor: EventSuppressor::new(config.suppressor, sink),
        }
    }

    pub fn leader(&self) -> &Arc<LeaderLock> {
        &self.leader
    }

    pub fn tickets(&self) -> &TicketLifecycle {
        &self.tickets
    }

    pub fn suppressor(&self) -> &EventSuppressor {
        &self.suppressor
    }

    /// Handle one event and build its reply
    pub async fn handle(&self, event: &InboundEvent) -> Reply {
        match self.dispatch(event).await {
            Ok(handled) => {
                let notification = handled.notify.map(|target| {
                    self.suppressor.submit(Notification::new(
                        event.actor.clone(),
                        event.action.to_string(),
                        target,
                    ))
                });
                Reply {
                    ok: true,
                    code: "ok",
                    message: handled.message,
                    informational: false,
                    ticket: handled.ticket,
                    notification,
                }
            }
            Err(e) => {
                if e.is_informational() || e.is_user_correctable() {
                    debug!(actor = %event.actor, action = %event.action, "Rejected: {}", e);
                } else {
                    warn!(actor = %event.actor, action = %event.action, "Event failed: {}", e);
                }
                Reply::from_error(&e)
            }
        }
    }

    async fn dispatch(&self, event: &InboundEvent) -> Result<Handled> {
        if !self.leader.is_active() {
            return Err(ConcordError::NotLeader);
        }

        let actor = event.actor.as_str();
        match &event.action {
            Action::Create { category } => self.create(actor, category).await,
            Action::Trigger { name } => {
                self.trigger_cooldowns
                    .try_acquire((actor.to_string(), name.clone()))
                    .map_err(rate_limited)?;
                info!(actor, trigger = %name, "Trigger fired");
                Ok(Handled {
                    message: format!("Triggered {}", name),
                    ticket: None,
                    notify: Some(name.clone()),
                })
            }
            action => {
                let surface = event.surface.as_deref().ok_or_else(|| {
                    ConcordError::NotFound(format!("{} needs a ticket surface", action))
                })?;
                let ticket = self.tickets.find_by_surface(surface).await?;
                self.on_ticket(action, &ticket, actor).await
            }
        }
    }

    async fn create(&self, actor: &str, category: &str) -> Result<Handled> {
        self.create_cooldowns
            .try_acquire(actor.to_string())
            .map_err(rate_limited)?;

        match self.tickets.create(actor, category).await {
            Ok(ticket) => Ok(Handled {
                message: format!("Opened ticket #{} in {}", ticket.number, ticket.surface_ref),
                notify: Some(ticket.surface_ref.clone()),
                ticket: Some(ticket),
            }),
            Err(e) => {
                // Only successful creations count against the cooldown
                self.create_cooldowns.clear(&actor.to_string());
                Err(e)
            }
        }
    }

    async fn on_ticket(&self, action: &Action, ticket: &Ticket, actor: &str) -> Result<Handled> {
        let id = ticket.id.as_str();
        let (message, updated, changed) = match action {
            Action::Claim => {
                let t = self.tickets.claim(id, actor).await?;
                (format!("{} claimed ticket #{}", actor, t.number), t, true)
            }
            Action::Unclaim => {
                let t = self.tickets.unclaim(id, actor).await?;
                (format!("Ticket #{} is unclaimed", t.number), t, true)
            }
            Action::Close => closed(self.tickets.request_close(id, actor).await?),
            Action::ApproveClose => closed(self.tickets.approve_close(id, actor).await?),
            Action::DenyClose => {
                let t = self.tickets.deny_close(id, actor).await?;
                (format!("Ticket #{} stays open", t.number), t, true)
            }
            Action::Create { .. } | Action::Trigger { .. } => {
                return Err(ConcordError::UnknownAction(action.to_string()))
            }
        };

        Ok(Handled {
            message,
            notify: changed.then(|| updated.surface_ref.clone()),
            ticket: Some(updated),
        })
    }

    /// Stop all sweep tasks and drop soft state
    pub fn shutdown(&self) {
        self.create_cooldowns.destroy();
        self.trigger_cooldowns.destroy();
        self.suppressor.destroy();
        info!("Coordinator shut down");
    }
}

fn closed(outcome: CloseOutcome) -> (String, Ticket, bool) {
    match outcome {
        CloseOutcome::Closed {
            ticket,
            first_close: true,
            archived,
        } => {
            let message = if archived {
                format!("Ticket #{} closed", ticket.number)
            } else {
                format!("Ticket #{} closed (transcript not archived)", ticket.number)
            };
            (message, ticket, true)
        }
        CloseOutcome::Closed { ticket, .. } => {
            (format!("Ticket #{} was already closed", ticket.number), ticket, false)
        }
        CloseOutcome::AwaitingApproval(ticket) => (
            format!("Close of ticket #{} is waiting for staff approval", ticket.number),
            ticket,
            true,
        ),
    }
}

fn rate_limited(remaining: Duration) -> ConcordError {
    ConcordError::RateLimited {
        remaining_ms: remaining.as_millis() as u64,
    }
}
