//! Negotiation engine: the API the chat command layer calls
//!
//! Every operation takes the session mutex for its whole duration, store I/O
//! included. Notifications are published after the mutex is released.

use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, Result};
use crate::inventory::Inventory;
use crate::locks::LockRegistry;
use crate::notify::{NotificationSink, SessionEvent, TracingSink};
use crate::random::{RandomSource, ThreadRandom};
use crate::settlement::{
    OutcomeKind, SettlementEngine, SettlementInput, SettlementOutcome, SettlementReport,
    WinnerTakesAll,
};
use crate::store::{ItemStore, ParticipantStore};
use crate::throttle::CommandThrottle;
use crate::types::{Item, ItemId, ParticipantId, ScopeKey};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::MutexGuard;

use super::directory::{SessionDirectory, SessionHandle};
use super::session::{AcceptOutcome, NegotiationSession};
use super::supervisor::Supervisor;
use super::types::{
    EndReason, LockAck, NegotiationPhase, ProposalAck, ProposedItem, Role, SessionSnapshot,
};

/// Result of a confirmation
#[derive(Clone, Debug)]
pub enum ConfirmOutcome {
    /// Accepted, waiting for the other participant
    Waiting,
    /// Both accepted and ownership was transferred
    Settled(SettlementReport),
}

/// Builder for [`NegotiationEngine`]
pub struct EngineBuilder {
    items: Arc<dyn ItemStore>,
    participants: Arc<dyn ParticipantStore>,
    config: ExchangeConfig,
    outcome: Arc<dyn SettlementOutcome>,
    random: Arc<dyn RandomSource>,
    sink: Arc<dyn NotificationSink>,
}

impl EngineBuilder {
    pub fn config(mut self, config: ExchangeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn outcome(mut self, outcome: Arc<dyn SettlementOutcome>) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> Result<NegotiationEngine> {
        self.config.validate()?;

        let locks = Arc::new(LockRegistry::new(self.items.clone()));
        let settlement = SettlementEngine::new(self.items.clone(), locks.clone());
        let throttle = CommandThrottle::new(self.config.command_cooldown());

        Ok(NegotiationEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                items: self.items,
                participants: self.participants,
                locks,
                directory: SessionDirectory::new(),
                settlement,
                outcome: self.outcome,
                random: self.random,
                sink: self.sink,
                throttle,
            }),
        })
    }
}

struct EngineInner {
    config: ExchangeConfig,
    items: Arc<dyn ItemStore>,
    participants: Arc<dyn ParticipantStore>,
    locks: Arc<LockRegistry>,
    directory: SessionDirectory,
    settlement: SettlementEngine,
    outcome: Arc<dyn SettlementOutcome>,
    random: Arc<dyn RandomSource>,
    sink: Arc<dyn NotificationSink>,
    throttle: CommandThrottle,
}

/// Negotiation engine manages all active sessions
#[derive(Clone)]
pub struct NegotiationEngine {
    inner: Arc<EngineInner>,
}

impl NegotiationEngine {
    /// Start building an engine over the given stores. Defaults: winner takes
    /// all, thread RNG, tracing sink, default configuration.
    pub fn builder(
        items: Arc<dyn ItemStore>,
        participants: Arc<dyn ParticipantStore>,
    ) -> EngineBuilder {
        EngineBuilder {
            items,
            participants,
            config: ExchangeConfig::default(),
            outcome: Arc::new(WinnerTakesAll),
            random: Arc::new(ThreadRandom),
            sink: Arc::new(TracingSink),
        }
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.inner.config
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.inner.locks
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.inner.directory
    }

    pub fn outcome_kind(&self) -> OutcomeKind {
        self.inner.outcome.kind()
    }

    /// Inventory operations that respect negotiation locks
    pub fn inventory(&self) -> Inventory {
        Inventory::new(self.inner.items.clone(), self.inner.locks.clone())
    }

    /// Open a negotiation between `initiator` and `counterparty` in `scope`
    pub async fn open_negotiation(
        &self,
        scope: ScopeKey,
        initiator: ParticipantId,
        counterparty: ParticipantId,
    ) -> Result<SessionHandle> {
        if initiator == counterparty {
            return Err(ExchangeError::SelfNegotiation);
        }
        self.inner.throttle.check_and_record(initiator)?;

        match self.open_checked(scope, initiator, counterparty).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.inner.throttle.forget(initiator);
                tracing::debug!(
                    "Refused negotiation {} -> {} in {}: {}",
                    initiator,
                    counterparty,
                    scope,
                    e
                );
                Err(e)
            }
        }
    }

    async fn open_checked(
        &self,
        scope: ScopeKey,
        initiator: ParticipantId,
        counterparty: ParticipantId,
    ) -> Result<SessionHandle> {
        let participants = &self.inner.participants;
        let first = participants.get_or_create(initiator).await?;
        let second = participants.get_or_create(counterparty).await?;

        for participant in [&first, &second] {
            if participant.bot {
                return Err(ExchangeError::BotParticipant(participant.id));
            }
        }
        if second.blacklisted {
            return Err(ExchangeError::Blacklisted(second.id));
        }
        if participants.blocks(initiator, counterparty).await?
            || participants.blocks(counterparty, initiator).await?
        {
            return Err(ExchangeError::Blocked {
                initiator,
                counterparty,
            });
        }

        let handle = self.inner.directory.open(scope, first, second)?;
        let session = handle.lock().await;
        let started_at = session.started_at();
        let snapshot = self.snapshot_of(&session);
        drop(session);

        let task = Supervisor::spawn(self.clone(), handle.clone(), started_at);
        handle.set_supervisor_task(task);

        self.notify(SessionEvent::Opened(snapshot)).await;
        Ok(handle)
    }

    /// Active session of `participant` in `scope`, pruning finished ones
    pub fn find_session(&self, scope: ScopeKey, participant: ParticipantId) -> Option<SessionHandle> {
        self.inner.directory.find(scope, participant)
    }

    pub fn session_for(&self, scope: ScopeKey, participant: ParticipantId) -> Result<SessionHandle> {
        self.find_session(scope, participant)
            .ok_or(ExchangeError::NoActiveSession(participant))
    }

    /// Take the session mutex unless a cancellation is already pending
    async fn enter<'a>(
        &self,
        handle: &'a SessionHandle,
    ) -> Result<MutexGuard<'a, NegotiationSession>> {
        if handle.cancel_requested() {
            return Err(ExchangeError::SessionClosed(handle.id()));
        }
        let session = handle.lock().await;
        if handle.cancel_requested() && session.phase().is_active() {
            return Err(ExchangeError::SessionClosed(handle.id()));
        }
        Ok(session)
    }

    fn snapshot_of(&self, session: &NegotiationSession) -> SessionSnapshot {
        session.snapshot(self.inner.config.cooldown())
    }

    /// Offer one item into `participant`'s proposal
    pub async fn propose_item(
        &self,
        handle: &SessionHandle,
        participant: ParticipantId,
        item: ItemId,
    ) -> Result<ProposalAck> {
        let mut session = self.enter(handle).await?;
        let role = session.role_of(participant)?;

        let item = self.inner.items.get_item(item).await?;
        session.check_proposable(role, &item, self.inner.config.max_proposal_items)?;
        if self.inner.locks.is_locked(item.id) {
            return Err(ExchangeError::ItemLocked(item.id));
        }
        self.inner.locks.acquire(item.id, session.id()).await?;
        let item = match self.recheck_locked(item.id, participant).await {
            Ok(current) => current,
            Err(e) => {
                self.inner.locks.release_if_held_by(item.id, session.id()).await;
                return Err(e);
            }
        };
        session.push_item(role, ProposedItem::from(&item));

        let snapshot = self.snapshot_of(&session);
        drop(session);

        tracing::debug!("{} proposed {} in {}", participant, item.id, handle.id());
        self.notify(SessionEvent::Updated(snapshot)).await;
        Ok(ProposalAck {
            item: item.id,
            favorite: item.favorite,
        })
    }

    /// Offer several items at once: either all are added or none are
    pub async fn propose_items(
        &self,
        handle: &SessionHandle,
        participant: ParticipantId,
        items: &[ItemId],
    ) -> Result<Vec<ProposalAck>> {
        let mut session = self.enter(handle).await?;
        let role = session.role_of(participant)?;
        let session_id = session.id();

        let mut seen = HashSet::new();
        let mut fetched = Vec::with_capacity(items.len());
        for id in items {
            if !seen.insert(*id) {
                return Err(ExchangeError::AlreadyProposed(*id));
            }
            let item = self.inner.items.get_item(*id).await?;
            session.check_proposable(role, &item, self.inner.config.max_proposal_items)?;
            if self.inner.locks.is_locked(item.id) {
                return Err(ExchangeError::ItemLocked(item.id));
            }
            fetched.push(item);
        }

        let limit = self.inner.config.max_proposal_items;
        if session.side(role).proposal.len() + fetched.len() > limit {
            return Err(ExchangeError::ProposalFull { limit });
        }

        let mut acquired = Vec::with_capacity(fetched.len());
        for item in &fetched {
            if let Err(e) = self.inner.locks.acquire(item.id, session_id).await {
                for id in &acquired {
                    self.inner.locks.release_if_held_by(*id, session_id).await;
                }
                return Err(e.into());
            }
            acquired.push(item.id);
        }

        let mut current = Vec::with_capacity(fetched.len());
        for item in &fetched {
            match self.recheck_locked(item.id, participant).await {
                Ok(item) => current.push(item),
                Err(e) => {
                    for id in &acquired {
                        self.inner.locks.release_if_held_by(*id, session_id).await;
                    }
                    return Err(e);
                }
            }
        }
        let fetched = current;

        let acks = fetched
            .iter()
            .map(|item| {
                session.push_item(role, ProposedItem::from(item));
                ProposalAck {
                    item: item.id,
                    favorite: item.favorite,
                }
            })
            .collect();

        let snapshot = self.snapshot_of(&session);
        drop(session);

        tracing::debug!(
            "{} proposed {} items in {}",
            participant,
            fetched.len(),
            handle.id()
        );
        self.notify(SessionEvent::Updated(snapshot)).await;
        Ok(acks)
    }

    /// Re-read an item once its lock is held. The first read happened before
    /// the lock, so the item may have been settled away in between.
    async fn recheck_locked(&self, item: ItemId, owner: ParticipantId) -> Result<Item> {
        let current = self.inner.items.get_item(item).await?;
        if current.owner != owner {
            tracing::debug!(
                "{} changed hands to {} before {} could lock it",
                item,
                current.owner,
                owner
            );
            return Err(ExchangeError::NotOwner {
                item,
                participant: owner,
            });
        }
        if !current.tradeable {
            return Err(ExchangeError::NotTradeable(item));
        }
        Ok(current)
    }

    /// Take an item back out of `participant`'s proposal
    pub async fn withdraw_item(
        &self,
        handle: &SessionHandle,
        participant: ParticipantId,
        item: ItemId,
    ) -> Result<()> {
        let mut session = self.enter(handle).await?;
        let role = session.role_of(participant)?;

        session.remove_item(role, item)?;
        self.inner.locks.release_if_held_by(item, session.id()).await;

        let snapshot = self.snapshot_of(&session);
        drop(session);

        tracing::debug!("{} withdrew {} from {}", participant, item, handle.id());
        self.notify(SessionEvent::Updated(snapshot)).await;
        Ok(())
    }

    /// Empty `participant`'s proposal, returning the withdrawn items
    pub async fn clear_proposal(
        &self,
        handle: &SessionHandle,
        participant: ParticipantId,
    ) -> Result<Vec<ItemId>> {
        let mut session = self.enter(handle).await?;
        let role = session.role_of(participant)?;

        let removed = session.clear_items(role)?;
        for item in &removed {
            self.inner.locks.release_if_held_by(*item, session.id()).await;
        }

        let snapshot = self.snapshot_of(&session);
        drop(session);

        tracing::debug!(
            "{} cleared {} items from {}",
            participant,
            removed.len(),
            handle.id()
        );
        self.notify(SessionEvent::Updated(snapshot)).await;
        Ok(removed)
    }

    /// Lock `participant`'s proposal
    pub async fn lock_side(
        &self,
        handle: &SessionHandle,
        participant: ParticipantId,
    ) -> Result<LockAck> {
        let mut session = self.enter(handle).await?;
        let role = session.role_of(participant)?;

        let phase = session.lock_side(role)?;
        handle.publish_phase(phase);
        let snapshot = self.snapshot_of(&session);
        drop(session);

        tracing::info!("{} locked their side of {}", participant, handle.id());
        if phase == NegotiationPhase::BothLocked {
            let cooldown = self.inner.config.cooldown();
            self.notify(SessionEvent::BothLocked { snapshot, cooldown })
                .await;
            Ok(LockAck::BothLocked { cooldown })
        } else {
            self.notify(SessionEvent::Updated(snapshot)).await;
            Ok(LockAck::Waiting)
        }
    }

    /// Accept the locked proposals; the second acceptance runs the settlement
    pub async fn confirm(
        &self,
        handle: &SessionHandle,
        participant: ParticipantId,
    ) -> Result<ConfirmOutcome> {
        let mut session = self.enter(handle).await?;
        let role = session.role_of(participant)?;

        if session.accept(role, self.inner.config.cooldown())? == AcceptOutcome::Waiting {
            let snapshot = self.snapshot_of(&session);
            drop(session);
            tracing::info!("{} accepted {}", participant, handle.id());
            self.notify(SessionEvent::Updated(snapshot)).await;
            return Ok(ConfirmOutcome::Waiting);
        }

        let initiator_items = session.side(Role::Initiator).item_ids();
        let counterparty_items = session.side(Role::Counterparty).item_ids();
        let input = SettlementInput {
            session: session.id(),
            initiator: session.participant(Role::Initiator),
            counterparty: session.participant(Role::Counterparty),
            initiator_items: &initiator_items,
            counterparty_items: &counterparty_items,
        };
        let plan = self.inner.outcome.plan(&input, self.inner.random.as_ref());
        let held = session.held_items();

        match self.inner.settlement.execute(&plan, &held).await {
            Ok(report) => {
                session.mark_settled(report.winner);
                let snapshot = self.finish(handle, session).await;
                self.notify(SessionEvent::Settled {
                    snapshot,
                    report: report.clone(),
                })
                .await;
                Ok(ConfirmOutcome::Settled(report))
            }
            Err(failure) if failure.retryable => {
                session.reset_acceptance();
                let snapshot = self.snapshot_of(&session);
                drop(session);
                self.notify(SessionEvent::Updated(snapshot)).await;
                Err(ExchangeError::SettlementFailed {
                    session: handle.id(),
                    applied: failure.applied,
                    pending: failure.pending,
                    retryable: true,
                    reason: failure.reason,
                })
            }
            Err(failure) => {
                session.terminate(NegotiationPhase::Cancelled, EndReason::SettlementFailed);
                let snapshot = self.finish(handle, session).await;
                self.notify(SessionEvent::Ended {
                    snapshot,
                    reason: EndReason::SettlementFailed,
                })
                .await;
                Err(ExchangeError::SettlementFailed {
                    session: handle.id(),
                    applied: failure.applied,
                    pending: failure.pending,
                    retryable: false,
                    reason: failure.reason,
                })
            }
        }
    }

    /// Cancel the session. Always wins over pending operations; a no-op once
    /// the session has ended.
    pub async fn cancel(&self, handle: &SessionHandle, participant: ParticipantId) -> Result<()> {
        if !handle.involves(participant) {
            return Err(ExchangeError::NotParticipant {
                session: handle.id(),
                participant,
            });
        }
        handle.request_cancel();

        let mut session = handle.lock().await;
        let role = session.role_of(participant)?;
        if !session.cancel(role) {
            tracing::debug!("{} already ended, cancel ignored", handle.id());
            return Ok(());
        }

        let snapshot = self.finish(handle, session).await;
        tracing::info!("{} cancelled {}", participant, handle.id());
        self.notify(SessionEvent::Ended {
            snapshot,
            reason: EndReason::CancelledBy(participant),
        })
        .await;
        Ok(())
    }

    /// Read-only view of the session
    pub async fn describe(&self, handle: &SessionHandle) -> SessionSnapshot {
        let session = handle.lock().await;
        self.snapshot_of(&session)
    }

    /// Force the session into `TimedOut`; called by the supervisor
    pub(crate) async fn expire(&self, handle: &SessionHandle) {
        let mut session = handle.lock().await;
        if !session.expire() {
            return;
        }

        let snapshot = self.finish(handle, session).await;
        tracing::info!("{} timed out", handle.id());
        self.notify(SessionEvent::Ended {
            snapshot,
            reason: EndReason::TimedOut,
        })
        .await;
    }

    /// Republish the current state; called by the supervisor
    pub(crate) async fn refresh(&self, handle: &SessionHandle) {
        let session = handle.lock().await;
        if session.phase().is_terminal() {
            return;
        }
        let snapshot = self.snapshot_of(&session);
        drop(session);
        self.notify(SessionEvent::Refreshed(snapshot)).await;
    }

    /// Cancel every active session and wait for their supervisors to stop
    pub async fn shutdown(&self) {
        let handles = self.inner.directory.active();
        let mut cancelled = 0;

        for handle in &handles {
            handle.request_cancel();
            let mut session = handle.lock().await;
            if session.phase().is_terminal() {
                continue;
            }
            session.terminate(NegotiationPhase::Cancelled, EndReason::Shutdown);
            let snapshot = self.finish(handle, session).await;
            self.notify(SessionEvent::Ended {
                snapshot,
                reason: EndReason::Shutdown,
            })
            .await;
            cancelled += 1;
        }

        let tasks: Vec<_> = handles
            .iter()
            .filter_map(SessionHandle::take_supervisor_task)
            .collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::warn!("Supervisor task failed during shutdown: {}", e);
            }
        }

        tracing::info!("Negotiation engine shut down, {} sessions cancelled", cancelled);
    }

    /// Exit path shared by every terminal transition: stop the supervisor,
    /// release the session's locks, then drop it from the directory.
    async fn finish(
        &self,
        handle: &SessionHandle,
        session: MutexGuard<'_, NegotiationSession>,
    ) -> SessionSnapshot {
        handle.supervisor_token().cancel();

        let released = self.inner.locks.release_session(session.id()).await;
        if !released.is_empty() {
            tracing::debug!("{} released {} locks on exit", session.id(), released.len());
        }

        handle.publish_phase(session.phase());
        let snapshot = self.snapshot_of(&session);
        drop(session);

        self.inner.directory.close(handle.scope(), handle.id());
        snapshot
    }

    async fn notify(&self, event: SessionEvent) {
        if let Err(e) = self.inner.sink.publish(&event).await {
            tracing::warn!(
                "Failed to publish {} event for {}: {}",
                event.name(),
                event.session_id(),
                e
            );
        }
    }
}
