//! Ticket state machine over the durable record
//!
//! ```text
//! Open(unclaimed) <-> Open(claimed)
//!        |                 |
//!        +--> CloseRequested (subject asked; staff approves or denies)
//!        |                 |
//!        +-------> Closed <+
//! ```
//!
//! Every transition re-reads the stored state and writes through a single
//! compare-and-set, so stale callers get a clean "already ..." answer instead
//! of overwriting newer state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::archive::TranscriptArchiver;
use super::model::{surface_name, Ticket, TicketState, TicketStatus, Transition, TransitionOutcome};
use super::policy::AccessPolicy;
use crate::db::CoordinationStore;
use crate::types::{ConcordError, Result};

/// Bounded re-reads when a close races another transition
const CLOSE_ATTEMPTS: usize = 3;

/// Quota and housekeeping settings
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Open tickets allowed per subject per category unless overridden
    pub default_max_open: u32,
    /// Per-category overrides
    pub category_max_open: HashMap<String, u32>,
    /// How long a full quota slot must go without a reservation before it
    /// may be recounted from the open tickets
    pub quota_repair_after: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_max_open: 1,
            category_max_open: HashMap::new(),
            quota_repair_after: Duration::from_secs(30),
        }
    }
}

impl LifecycleConfig {
    /// Open-ticket limit for `category`
    pub fn max_open(&self, category: &str) -> u32 {
        self.category_max_open
            .get(category)
            .copied()
            .unwrap_or(self.default_max_open)
    }
}

/// What a close request did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The ticket is closed. `first_close` is true only for the call that
    /// performed the transition; `archived` reports the export result.
    Closed {
        ticket: Ticket,
        first_close: bool,
        archived: bool,
    },
    /// The subject asked to close; staff must approve
    AwaitingApproval(Ticket),
}

impl CloseOutcome {
    pub fn ticket(&self) -> &Ticket {
        match self {
            CloseOutcome::Closed { ticket, .. } => ticket,
            CloseOutcome::AwaitingApproval(ticket) => ticket,
        }
    }
}

/// Atomic ticket transitions and quotas
pub struct TicketLifecycle {
    store: Arc<dyn CoordinationStore>,
    policy: Arc<dyn AccessPolicy>,
    archiver: Arc<dyn TranscriptArchiver>,
    config: LifecycleConfig,
}

impl TicketLifecycle {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        policy: Arc<dyn AccessPolicy>,
        archiver: Arc<dyn TranscriptArchiver>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            policy,
            archiver,
            config,
        }
    }

    pub fn policy(&self) -> &dyn AccessPolicy {
        self.policy.as_ref()
    }

    /// Look up a ticket by id
    pub async fn get(&self, ticket_id: &str) -> Result<Ticket> {
        self.store
            .get_ticket(ticket_id)
            .await?
            .ok_or_else(|| ConcordError::NotFound(format!("ticket {}", ticket_id)))
    }

    /// Look up the ticket bound to a conversation surface
    pub async fn find_by_surface(&self, surface_ref: &str) -> Result<Ticket> {
        self.store
            .find_by_surface(surface_ref)
            .await?
            .ok_or_else(|| ConcordError::NotFound(format!("ticket for surface {}", surface_ref)))
    }

    /// Open tickets for a subject in a category
    pub async fn open_tickets(&self, subject: &str, category: &str) -> Result<Vec<Ticket>> {
        self.store.find_open(subject, category).await
    }

    /// Open a new ticket for `subject` in `category`.
    pub async fn create(&self, subject: &str, category: &str) -> Result<Ticket> {
        let bypass = self.policy.can_bypass_quota(subject);
        let max = self.config.max_open(category);

        if !bypass && !self.reserve_slot(subject, category, max).await? {
            info!(subject, category, max, "Ticket quota exceeded");
            return Err(ConcordError::QuotaExceeded {
                subject: subject.to_string(),
                category: category.to_string(),
                max,
            });
        }
        let quota_reserved = !bypass;

        let inserted = async {
            let number = self.store.next_ticket_number().await?;
            let ticket = Ticket::new(
                number,
                category,
                subject,
                surface_name(category, number),
                quota_reserved,
            );
            self.store.insert_ticket(&ticket).await?;
            Ok::<_, ConcordError>(ticket)
        }
        .await;

        match inserted {
            Ok(ticket) => {
                info!(
                    ticket = %ticket.id,
                    number = ticket.number,
                    subject,
                    category,
                    surface = %ticket.surface_ref,
                    bypass,
                    "Ticket created"
                );
                Ok(ticket)
            }
            Err(e) => {
                if quota_reserved {
                    if let Err(release_err) = self.store.release_quota(subject, category).await {
                        error!(subject, category, "Failed to release quota slot: {}", release_err);
                    }
                }
                Err(e)
            }
        }
    }

    /// Take a quota slot, recounting once from the open tickets when the
    /// slot reports full.
    async fn reserve_slot(&self, subject: &str, category: &str, max: u32) -> Result<bool> {
        if self.store.reserve_quota(subject, category, max).await? {
            return Ok(true);
        }

        let open = self
            .store
            .find_open(subject, category)
            .await?
            .iter()
            .filter(|t| t.quota_reserved)
            .count();
        let open = u32::try_from(open).unwrap_or(u32::MAX);
        if open >= max {
            return Ok(false);
        }

        let repair_after = self.config.quota_repair_after;
        if !self.store.repair_quota(subject, category, open, repair_after).await? {
            return Ok(false);
        }
        warn!(subject, category, open, max, "Quota slot was ahead of open tickets; recounted");
        self.store.reserve_quota(subject, category, max).await
    }

    /// Assign the ticket to `actor`.
    ///
    /// One compare-and-set from unclaimed to claimed: of any number of
    /// concurrent claimants exactly one succeeds, and the others learn who.
    pub async fn claim(&self, ticket_id: &str, actor: &str) -> Result<Ticket> {
        if !self.policy.is_staff(actor) {
            return Err(ConcordError::NotPermitted {
                actor: actor.to_string(),
                action: "claim",
            });
        }

        let transition = Transition {
            from: TicketState::open(),
            to: TicketState {
                claimed_by: Some(actor.to_string()),
                ..TicketState::open()
            },
            actor: actor.to_string(),
        };

        match self.store.apply_transition(ticket_id, &transition).await? {
            TransitionOutcome::Applied(ticket) => {
                info!(ticket = %ticket.id, actor, "Ticket claimed");
                Ok(ticket)
            }
            TransitionOutcome::Conflict(current) => {
                debug!(ticket = %current.id, actor, "Claim lost");
                Err(explain_conflict(&current, "claim"))
            }
            TransitionOutcome::Missing => Err(ConcordError::NotFound(format!("ticket {}", ticket_id))),
        }
    }

    /// Release the claim. Only the claimant or staff may do this.
    pub async fn unclaim(&self, ticket_id: &str, actor: &str) -> Result<Ticket> {
        let current = self.get(ticket_id).await?;
        let state = &current.state;

        if state.is_closed() {
            return Err(ConcordError::AlreadyClosed);
        }
        let Some(claimant) = state.claimed_by.as_deref() else {
            return Err(ConcordError::NotClaimed);
        };
        if claimant != actor && !self.policy.is_staff(actor) {
            return Err(ConcordError::NotPermitted {
                actor: actor.to_string(),
                action: "unclaim",
            });
        }

        let transition = Transition {
            from: state.clone(),
            to: TicketState {
                claimed_by: None,
                ..state.clone()
            },
            actor: actor.to_string(),
        };

        match self.store.apply_transition(ticket_id, &transition).await? {
            TransitionOutcome::Applied(ticket) => {
                info!(ticket = %ticket.id, actor, previous = claimant, "Ticket unclaimed");
                Ok(ticket)
            }
            TransitionOutcome::Conflict(now) => Err(match now.claimed_by() {
                None if !now.is_closed() => ConcordError::NotClaimed,
                _ => explain_conflict(&now, "unclaim"),
            }),
            TransitionOutcome::Missing => Err(ConcordError::NotFound(format!("ticket {}", ticket_id))),
        }
    }

    /// Ask to close the ticket.
    ///
    /// Staff close immediately. The ticket's subject only moves it to
    /// `CloseRequested`; a staff member has to approve.
    pub async fn request_close(&self, ticket_id: &str, actor: &str) -> Result<CloseOutcome> {
        if self.policy.is_staff(actor) {
            return self.close(ticket_id, actor).await;
        }

        let current = self.get(ticket_id).await?;
        if !current.is_subject(actor) {
            return Err(ConcordError::NotPermitted {
                actor: actor.to_string(),
                action: "request close of",
            });
        }

        match current.status() {
            TicketStatus::Closed => return Err(ConcordError::AlreadyClosed),
            // Repeated button press
            TicketStatus::CloseRequested => return Ok(CloseOutcome::AwaitingApproval(current)),
            TicketStatus::Open => {}
        }

        let transition = Transition {
            from: current.state.clone(),
            to: TicketState {
                status: TicketStatus::CloseRequested,
                close_requested_by: Some(actor.to_string()),
                ..current.state.clone()
            },
            actor: actor.to_string(),
        };

        match self.store.apply_transition(ticket_id, &transition).await? {
            TransitionOutcome::Applied(ticket) => {
                info!(ticket = %ticket.id, actor, "Close requested");
                Ok(CloseOutcome::AwaitingApproval(ticket))
            }
            TransitionOutcome::Conflict(now) if now.status() == TicketStatus::CloseRequested => {
                Ok(CloseOutcome::AwaitingApproval(now))
            }
            TransitionOutcome::Conflict(now) => Err(explain_conflict(&now, "request close of")),
            TransitionOutcome::Missing => Err(ConcordError::NotFound(format!("ticket {}", ticket_id))),
        }
    }

    /// Staff approval of a pending close request
    pub async fn approve_close(&self, ticket_id: &str, actor: &str) -> Result<CloseOutcome> {
        if !self.policy.is_staff(actor) {
            return Err(ConcordError::NotPermitted {
                actor: actor.to_string(),
                action: "approve close of",
            });
        }

        self.close_from(ticket_id, actor, Some(TicketStatus::CloseRequested), "approve close of")
            .await
    }

    /// Reject (staff) or withdraw (requester) a pending close request.
    ///
    /// The ticket returns to the Open state it was in, keeping its claim.
    pub async fn deny_close(&self, ticket_id: &str, actor: &str) -> Result<Ticket> {
        let current = self.get(ticket_id).await?;
        let state = &current.state;

        match state.status {
            TicketStatus::Closed => return Err(ConcordError::AlreadyClosed),
            TicketStatus::Open => {
                return Err(ConcordError::InvalidTransition {
                    status: TicketStatus::Open,
                    action: "deny close of",
                })
            }
            TicketStatus::CloseRequested => {}
        }

        let is_requester = state.close_requested_by.as_deref() == Some(actor);
        if !is_requester && !self.policy.is_staff(actor) {
            return Err(ConcordError::NotPermitted {
                actor: actor.to_string(),
                action: "deny close of",
            });
        }

        let transition = Transition {
            from: state.clone(),
            to: TicketState {
                status: TicketStatus::Open,
                close_requested_by: None,
                ..state.clone()
            },
            actor: actor.to_string(),
        };

        match self.store.apply_transition(ticket_id, &transition).await? {
            TransitionOutcome::Applied(ticket) => {
                info!(ticket = %ticket.id, actor, withdrawn = is_requester, "Close request denied");
                Ok(ticket)
            }
            TransitionOutcome::Conflict(now) => Err(explain_conflict(&now, "deny close of")),
            TransitionOutcome::Missing => Err(ConcordError::NotFound(format!("ticket {}", ticket_id))),
        }
    }

    /// Close the ticket.
    ///
    /// Idempotent: closing a closed ticket succeeds with `first_close =
    /// false`. The archival export and quota release run only for the call
    /// whose compare-and-set moved the ticket to closed. Role checks belong
    /// to the callers (`request_close`, `approve_close`).
    pub async fn close(&self, ticket_id: &str, closed_by: &str) -> Result<CloseOutcome> {
        self.close_from(ticket_id, closed_by, None, "close").await
    }

    /// Close, optionally only out of `required` status. A closed ticket
    /// always counts as success; any other status fails with
    /// `InvalidTransition` naming `action`.
    async fn close_from(
        &self,
        ticket_id: &str,
        closed_by: &str,
        required: Option<TicketStatus>,
        action: &'static str,
    ) -> Result<CloseOutcome> {
        for attempt in 1..=CLOSE_ATTEMPTS {
            let current = self.get(ticket_id).await?;
            if current.is_closed() {
                debug!(ticket = %current.id, closed_by, "Ticket already closed");
                return Ok(CloseOutcome::Closed {
                    ticket: current,
                    first_close: false,
                    archived: false,
                });
            }
            if let Some(required) = required {
                if current.status() != required {
                    return Err(ConcordError::InvalidTransition {
                        status: current.status(),
                        action,
                    });
                }
            }

            let transition = Transition {
                from: current.state.clone(),
                to: TicketState {
                    status: TicketStatus::Closed,
                    close_requested_by: None,
                    ..current.state.clone()
                },
                actor: closed_by.to_string(),
            };

            match self.store.apply_transition(ticket_id, &transition).await? {
                TransitionOutcome::Applied(ticket) => {
                    info!(ticket = %ticket.id, number = ticket.number, closed_by, "Ticket closed");
                    let archived = self.after_close(&ticket).await;
                    return Ok(CloseOutcome::Closed {
                        ticket,
                        first_close: true,
                        archived,
                    });
                }
                TransitionOutcome::Conflict(now) if now.is_closed() => {
                    return Ok(CloseOutcome::Closed {
                        ticket: now,
                        first_close: false,
                        archived: false,
                    });
                }
                TransitionOutcome::Conflict(_) => {
                    debug!(ticket = %ticket_id, attempt, "Close raced another transition, retrying");
                }
                TransitionOutcome::Missing => {
                    return Err(ConcordError::NotFound(format!("ticket {}", ticket_id)))
                }
            }
        }

        warn!(ticket = %ticket_id, "Close kept losing races");
        let current = self.get(ticket_id).await?;
        Err(ConcordError::InvalidTransition {
            status: current.status(),
            action,
        })
    }

    /// One-time side effects of the Open→Closed transition
    async fn after_close(&self, ticket: &Ticket) -> bool {
        if ticket.quota_reserved {
            if let Err(e) = self
                .store
                .release_quota(&ticket.subject_id, &ticket.category)
                .await
            {
                error!(ticket = %ticket.id, "Failed to release quota slot: {}", e);
            }
        }

        match self.archiver.archive(ticket).await {
            Ok(()) => true,
            Err(e) => {
                error!(ticket = %ticket.id, "Transcript archival failed: {}", e);
                false
            }
        }
    }
}

/// Turn the state a guarded write found into the caller-facing error
fn explain_conflict(current: &Ticket, action: &'static str) -> ConcordError {
    if current.is_closed() {
        return ConcordError::AlreadyClosed;
    }
    match current.claimed_by() {
        Some(by) if action == "claim" => ConcordError::AlreadyClaimed { by: by.to_string() },
        _ => ConcordError::InvalidTransition {
            status: current.status(),
            action,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::leader::LockRecord;
    use crate::tickets::policy::StaticPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct CountingArchiver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TranscriptArchiver for CountingArchiver {
        async fn archive(&self, _ticket: &Ticket) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingArchiver;

    #[async_trait]
    impl TranscriptArchiver for FailingArchiver {
        async fn archive(&self, _ticket: &Ticket) -> Result<()> {
            Err(ConcordError::StorageUnavailable("export bucket down".into()))
        }
    }

    /// Delegates to `MemoryStore`, failing the next `fail_releases` quota
    /// releases and applying `interleaved` just before the next close write.
    #[derive(Default)]
    struct ScriptedStore {
        inner: MemoryStore,
        fail_releases: AtomicUsize,
        interleaved: std::sync::Mutex<Option<Transition>>,
    }

    #[async_trait]
    impl CoordinationStore for ScriptedStore {
        async fn write_lock(&self, record: &LockRecord) -> Result<()> {
            self.inner.write_lock(record).await
        }

        async fn read_lock(&self) -> Result<Option<LockRecord>> {
            self.inner.read_lock().await
        }

        async fn next_ticket_number(&self) -> Result<u64> {
            self.inner.next_ticket_number().await
        }

        async fn reserve_quota(&self, subject: &str, category: &str, max: u32) -> Result<bool> {
            self.inner.reserve_quota(subject, category, max).await
        }

        async fn release_quota(&self, subject: &str, category: &str) -> Result<()> {
            let fail = self
                .fail_releases
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(ConcordError::StorageUnavailable("release dropped".into()));
            }
            self.inner.release_quota(subject, category).await
        }

        async fn repair_quota(&self, subject: &str, category: &str, open: u32, idle: Duration) -> Result<bool> {
            self.inner.repair_quota(subject, category, open, idle).await
        }

        async fn insert_ticket(&self, ticket: &Ticket) -> Result<()> {
            self.inner.insert_ticket(ticket).await
        }

        async fn get_ticket(&self, id: &str) -> Result<Option<Ticket>> {
            self.inner.get_ticket(id).await
        }

        async fn find_by_surface(&self, surface_ref: &str) -> Result<Option<Ticket>> {
            self.inner.find_by_surface(surface_ref).await
        }

        async fn find_open(&self, subject: &str, category: &str) -> Result<Vec<Ticket>> {
            self.inner.find_open(subject, category).await
        }

        async fn apply_transition(&self, id: &str, transition: &Transition) -> Result<TransitionOutcome> {
            if transition.to.status == TicketStatus::Closed {
                let interleaved = self.interleaved.lock().unwrap().take();
                if let Some(other) = interleaved {
                    self.inner.apply_transition(id, &other).await?;
                }
            }
            self.inner.apply_transition(id, transition).await
        }
    }

    fn scripted(store: Arc<ScriptedStore>) -> TicketLifecycle {
        TicketLifecycle::new(
            store,
            Arc::new(StaticPolicy::new(["mod-1", "mod-2"], ["vip"])),
            Arc::new(CountingArchiver::default()),
            LifecycleConfig::default(),
        )
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        archiver: Arc<CountingArchiver>,
        lifecycle: TicketLifecycle,
    }

    fn fixture() -> Fixture {
        fixture_with(LifecycleConfig::default())
    }

    fn fixture_with(config: LifecycleConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let archiver = Arc::new(CountingArchiver::default());
        let policy = Arc::new(StaticPolicy::new(["mod-1", "mod-2"], ["vip"]));
        let lifecycle = TicketLifecycle::new(store.clone(), policy, archiver.clone(), config);
        Fixture {
            store,
            archiver,
            lifecycle,
        }
    }

    #[tokio::test]
    async fn test_create_allocates_number_and_surface() {
        let f = fixture();
        let first = f.lifecycle.create("user-1", "support").await.unwrap();
        let second = f.lifecycle.create("user-2", "support").await.unwrap();

        assert_eq!(first.number, 1);
        assert_eq!(second.number, 2);
        assert_eq!(first.surface_ref, "support-0001");
        assert_ne!(first.surface_ref, second.surface_ref);

        let found = f.lifecycle.find_by_surface("support-0002").await.unwrap();
        assert_eq!(found.id, second.id);
    }

    #[tokio::test]
    async fn test_quota_per_category() {
        let f = fixture();
        assert_ok!(f.lifecycle.create("user-1", "support").await);

        let err = assert_err!(f.lifecycle.create("user-1", "support").await);
        assert_eq!(
            err,
            ConcordError::QuotaExceeded {
                subject: "user-1".into(),
                category: "support".into(),
                max: 1
            }
        );

        assert_ok!(f.lifecycle.create("user-1", "appeal").await);
        assert_eq!(f.lifecycle.open_tickets("user-1", "support").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_quota_override_and_bypass() {
        let mut config = LifecycleConfig::default();
        config.category_max_open.insert("report".into(), 2);
        let f = fixture_with(config);

        assert_ok!(f.lifecycle.create("user-1", "report").await);
        assert_ok!(f.lifecycle.create("user-1", "report").await);
        assert_err!(f.lifecycle.create("user-1", "report").await);

        for _ in 0..3 {
            let ticket = f.lifecycle.create("vip", "support").await.unwrap();
            assert!(!ticket.quota_reserved);
        }
        assert_eq!(f.store.quota_in_use("vip", "support").await, 0);
    }

    #[tokio::test]
    async fn test_closing_frees_quota() {
        let f = fixture();
        let ticket = f.lifecycle.create("user-1", "support").await.unwrap();
        f.lifecycle.close(&ticket.id, "mod-1").await.unwrap();

        assert_ok!(f.lifecycle.create("user-1", "support").await);
    }

    #[tokio::test]
    async fn test_failed_create_releases_slot() {
        let f = fixture();
        // Occupy surface "support-0001" so the insert collides
        let squatter = Ticket::new(99, "support", "other", "support-0001", false);
        f.store.insert_ticket(&squatter).await.unwrap();

        let err = f.lifecycle.create("user-1", "support").await.unwrap_err();
        assert!(matches!(err, ConcordError::Conflict(_)));
        assert_eq!(f.store.quota_in_use("user-1", "support").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaked_quota_slot_is_recounted() {
        let store = Arc::new(ScriptedStore::default());
        let lifecycle = scripted(store.clone());
        let ticket = lifecycle.create("user-1", "support").await.unwrap();

        store.fail_releases.store(1, Ordering::SeqCst);
        lifecycle.close(&ticket.id, "mod-1").await.unwrap();
        assert_eq!(store.inner.quota_in_use("user-1", "support").await, 1);
        assert!(lifecycle.open_tickets("user-1", "support").await.unwrap().is_empty());

        // A fresh reservation may belong to a create that has not inserted yet
        let err = assert_err!(lifecycle.create("user-1", "support").await);
        assert!(matches!(err, ConcordError::QuotaExceeded { max: 1, .. }));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_ok!(lifecycle.create("user-1", "support").await);
        assert_eq!(store.inner.quota_in_use("user-1", "support").await, 1);

        // A slot held by a real open ticket is never recounted away
        tokio::time::advance(Duration::from_secs(31)).await;
        let err = assert_err!(lifecycle.create("user-1", "support").await);
        assert!(matches!(err, ConcordError::QuotaExceeded { max: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_create_with_failed_release_recovers() {
        let store = Arc::new(ScriptedStore::default());
        let lifecycle = scripted(store.clone());
        let squatter = Ticket::new(99, "support", "other", "support-0001", false);
        store.insert_ticket(&squatter).await.unwrap();

        store.fail_releases.store(1, Ordering::SeqCst);
        assert_err!(lifecycle.create("user-1", "support").await);
        assert_eq!(store.inner.quota_in_use("user-1", "support").await, 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        let ticket = assert_ok!(lifecycle.create("user-1", "support").await);
        assert_eq!(ticket.surface_ref, "support-0002");
    }

    #[tokio::test]
    async fn test_claim_then_second_claim_names_winner() {
        let f = fixture();
        let ticket = f.lifecycle.create("user-1", "support").await.unwrap();

        let claimed = f.lifecycle.claim(&ticket.id, "mod-1").await.unwrap();
        assert_eq!(claimed.claimed_by(), Some("mod-1"));

        let err = f.lifecycle.claim(&ticket.id, "mod-2").await.unwrap_err();
        assert_eq!(err, ConcordError::AlreadyClaimed { by: "mod-1".into() });
    }

    #[tokio::test]
    async fn test_claim_during_close_request_names_claimant() {
        let f = fixture();
        let ticket = f.lifecycle.create("user-1", "support").await.unwrap();
        f.lifecycle.claim(&ticket.id, "mod-1").await.unwrap();
        f.lifecycle.request_close(&ticket.id, "user-1").await.unwrap();

        let err = f.lifecycle.claim(&ticket.id, "mod-2").await.unwrap_err();
        assert_eq!(err, ConcordError::AlreadyClaimed { by: "mod-1".into() });

        // Unclaimed and waiting on approval: nothing to claim into
        let other = f.lifecycle.create("user-2", "support").await.unwrap();
        f.lifecycle.request_close(&other.id, "user-2").await.unwrap();
        let err = f.lifecycle.claim(&other.id, "mod-2").await.unwrap_err();
        assert_eq!(
            err,
            ConcordError::InvalidTransition {
                status: TicketStatus::CloseRequested,
                action: "claim"
            }
        );
    }

    #[tokio::test]
    async fn test_claim_requires_staff_and_open_ticket() {
        let f = fixture();
        let ticket = f.lifecycle.create("user-1", "support").await.unwrap();

        let err = f.lifecycle.claim(&ticket.id, "user-1").await.unwrap_err();
        assert!(matches!(err, ConcordError::NotPermitted { .. }));

        f.lifecycle.close(&ticket.id, "mod-1").await.unwrap();
        let err = f.lifecycle.claim(&ticket.id, "mod-1").await.unwrap_err();
        assert_eq!(err, ConcordError::AlreadyClosed);

        let err = f.lifecycle.claim("missing", "mod-1").await.unwrap_err();
        assert!(matches!(err, ConcordError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unclaim_rules() {
        let f = fixture();
        let ticket = f.lifecycle.create("user-1", "support").await.unwrap();

        let err = f.lifecycle.unclaim(&ticket.id, "mod-1").await.unwrap_err();
        assert_eq!(err, ConcordError::NotClaimed);

        f.lifecycle.claim(&ticket.id, "mod-1").await.unwrap();
        let err = f.lifecycle.unclaim(&ticket.id, "user-1").await.unwrap_err();
        assert!(matches!(err, ConcordError::NotPermitted { .. }));

        // Another staff member may release it
        let released = f.lifecycle.unclaim(&ticket.id, "mod-2").await.unwrap();
        assert_eq!(released.claimed_by(), None);

        // And it can be claimed again
        assert_ok!(f.lifecycle.claim(&ticket.id, "mod-2").await);
        assert_ok!(f.lifecycle.unclaim(&ticket.id, "mod-2").await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_archives_once() {
        let f = fixture();
        let ticket = f.lifecycle.create("user-1", "support").await.unwrap();

        let first = f.lifecycle.close(&ticket.id, "mod-1").await.unwrap();
        let second = f.lifecycle.close(&ticket.id, "mod-2").await.unwrap();

        match (&first, &second) {
            (
                CloseOutcome::Closed { first_close: true, archived: true, ticket: t1 },
                CloseOutcome::Closed { first_close: false, ticket: t2, .. },
            ) => {
                assert_eq!(t1.status(), TicketStatus::Closed);
                assert_eq!(t2.status(), TicketStatus::Closed);
                assert_eq!(t2.closed_by.as_deref(), Some("mod-1"));
                assert!(t2.closed_at.is_some());
            }
            other => panic!("unexpected outcomes: {other:?}"),
        }
        assert_eq!(f.archiver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subject_close_request_needs_approval() {
        let f = fixture();
        let ticket = f.lifecycle.create("user-1", "support").await.unwrap();
        f.lifecycle.claim(&ticket.id, "mod-1").await.unwrap();

        let outcome = f.lifecycle.request_close(&ticket.id, "user-1").await.unwrap();
        let CloseOutcome::AwaitingApproval(pending) = outcome else {
            panic!("subject close must not close directly");
        };
        assert_eq!(pending.status(), TicketStatus::CloseRequested);
        assert_eq!(f.archiver.calls.load(Ordering::SeqCst), 0);

        // Pressing again changes nothing
        let again = f.lifecycle.request_close(&ticket.id, "user-1").await.unwrap();
        assert!(matches!(again, CloseOutcome::AwaitingApproval(_)));

        // Subject cannot approve their own request
        let err = f.lifecycle.approve_close(&ticket.id, "user-1").await.unwrap_err();
        assert!(matches!(err, ConcordError::NotPermitted { .. }));

        let approved = f.lifecycle.approve_close(&ticket.id, "mod-2").await.unwrap();
        assert!(matches!(approved, CloseOutcome::Closed { first_close: true, .. }));
        assert_eq!(approved.ticket().closed_by.as_deref(), Some("mod-2"));
        assert_eq!(f.archiver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deny_restores_claimed_open_state() {
        let f = fixture();
        let ticket = f.lifecycle.create("user-1", "support").await.unwrap();
        f.lifecycle.claim(&ticket.id, "mod-1").await.unwrap();
        f.lifecycle.request_close(&ticket.id, "user-1").await.unwrap();

        let restored = f.lifecycle.deny_close(&ticket.id, "mod-1").await.unwrap();
        assert_eq!(restored.status(), TicketStatus::Open);
        assert_eq!(restored.claimed_by(), Some("mod-1"));
        assert_eq!(restored.state.close_requested_by, None);

        let err = f.lifecycle.deny_close(&ticket.id, "mod-1").await.unwrap_err();
        assert!(matches!(err, ConcordError::InvalidTransition { status: TicketStatus::Open, .. }));
    }

    #[tokio::test]
    async fn test_requester_can_withdraw() {
        let f = fixture();
        let ticket = f.lifecycle.create("user-1", "support").await.unwrap();
        f.lifecycle.request_close(&ticket.id, "user-1").await.unwrap();

        let err = f.lifecycle.deny_close(&ticket.id, "user-2").await.unwrap_err();
        assert!(matches!(err, ConcordError::NotPermitted { .. }));

        let restored = f.lifecycle.deny_close(&ticket.id, "user-1").await.unwrap();
        assert_eq!(restored.state, TicketState::open());
    }

    #[tokio::test]
    async fn test_staff_close_is_direct() {
        let f = fixture();
        let ticket = f.lifecycle.create("user-1", "support").await.unwrap();

        let outcome = f.lifecycle.request_close(&ticket.id, "mod-1").await.unwrap();
        assert!(matches!(outcome, CloseOutcome::Closed { first_close: true, .. }));

        let err = f.lifecycle.request_close(&ticket.id, "user-1").await.unwrap_err();
        assert_eq!(err, ConcordError::AlreadyClosed);
    }

    #[tokio::test]
    async fn test_unrelated_user_cannot_request_close() {
        let f = fixture();
        let ticket = f.lifecycle.create("user-1", "support").await.unwrap();

        let err = f.lifecycle.request_close(&ticket.id, "user-2").await.unwrap_err();
        assert!(matches!(err, ConcordError::NotPermitted { .. }));
    }

    #[tokio::test]
    async fn test_approve_requires_pending_request() {
        let f = fixture();
        let ticket = f.lifecycle.create("user-1", "support").await.unwrap();

        let err = f.lifecycle.approve_close(&ticket.id, "mod-1").await.unwrap_err();
        assert_eq!(
            err,
            ConcordError::InvalidTransition {
                status: TicketStatus::Open,
                action: "approve close of"
            }
        );
    }

    #[tokio::test]
    async fn test_approve_fails_when_request_withdrawn_mid_close() {
        let store = Arc::new(ScriptedStore::default());
        let lifecycle = scripted(store.clone());
        let ticket = lifecycle.create("user-1", "support").await.unwrap();
        lifecycle.request_close(&ticket.id, "user-1").await.unwrap();

        // The subject withdraws between the approval's read and its write
        let pending = lifecycle.get(&ticket.id).await.unwrap();
        *store.interleaved.lock().unwrap() = Some(Transition {
            from: pending.state.clone(),
            to: TicketState::open(),
            actor: "user-1".into(),
        });

        let err = lifecycle.approve_close(&ticket.id, "mod-1").await.unwrap_err();
        assert_eq!(
            err,
            ConcordError::InvalidTransition {
                status: TicketStatus::Open,
                action: "approve close of"
            }
        );
        let stored = lifecycle.get(&ticket.id).await.unwrap();
        assert_eq!(stored.status(), TicketStatus::Open);
        assert_eq!(stored.closed_by, None);
    }

    #[tokio::test]
    async fn test_archive_failure_still_closes() {
        let store = Arc::new(MemoryStore::new());
        let policy = Arc::new(StaticPolicy::new(["mod-1"], Vec::<String>::new()));
        let lifecycle = TicketLifecycle::new(
            store.clone(),
            policy,
            Arc::new(FailingArchiver),
            LifecycleConfig::default(),
        );
        let ticket = lifecycle.create("user-1", "support").await.unwrap();

        let outcome = lifecycle.close(&ticket.id, "mod-1").await.unwrap();
        assert!(matches!(outcome, CloseOutcome::Closed { first_close: true, archived: false, .. }));
        assert!(lifecycle.get(&ticket.id).await.unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_storage_outage_surfaces_error() {
        let f = fixture();
        let ticket = f.lifecycle.create("user-1", "support").await.unwrap();
        f.store.set_unavailable(true);

        let err = f.lifecycle.claim(&ticket.id, "mod-1").await.unwrap_err();
        assert!(matches!(err, ConcordError::StorageUnavailable(_)));
    }
}
