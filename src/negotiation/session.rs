//! Negotiation session state machine
//!
//! Pure state: no I/O happens here. The engine acquires and releases item
//! locks around these transitions while holding the session's mutex.

use crate::error::{ExchangeError, Result};
use crate::types::{Item, ItemId, Participant, ParticipantId, ScopeKey, SessionId};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

use super::types::{EndReason, NegotiationPhase, ProposedItem, Role, SessionSnapshot, Side};

/// Outcome of a successful `accept`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Waiting for the other participant
    Waiting,
    /// Both accepted, settlement must run now
    ReadyToSettle,
}

/// A negotiation session between two participants
#[derive(Clone, Debug)]
pub struct NegotiationSession {
    id: SessionId,
    scope: ScopeKey,
    sides: [Side; 2],
    phase: NegotiationPhase,
    created_at: SystemTime,
    started_at: Instant,
    cooldown_started_at: Option<Instant>,
    end_reason: Option<EndReason>,
}

impl NegotiationSession {
    pub fn new(
        id: SessionId,
        scope: ScopeKey,
        initiator: Participant,
        counterparty: Participant,
    ) -> Self {
        Self {
            id,
            scope,
            sides: [Side::new(initiator), Side::new(counterparty)],
            phase: NegotiationPhase::Open,
            created_at: SystemTime::now(),
            started_at: Instant::now(),
            cooldown_started_at: None,
            end_reason: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn scope(&self) -> ScopeKey {
        self.scope
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn end_reason(&self) -> Option<&EndReason> {
        self.end_reason.as_ref()
    }

    pub fn side(&self, role: Role) -> &Side {
        &self.sides[role.index()]
    }

    fn side_mut(&mut self, role: Role) -> &mut Side {
        &mut self.sides[role.index()]
    }

    pub fn participant(&self, role: Role) -> ParticipantId {
        self.side(role).participant.id
    }

    pub fn role_of(&self, participant: ParticipantId) -> Result<Role> {
        if self.sides[0].participant.id == participant {
            Ok(Role::Initiator)
        } else if self.sides[1].participant.id == participant {
            Ok(Role::Counterparty)
        } else {
            Err(ExchangeError::NotParticipant {
                session: self.id,
                participant,
            })
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.phase.is_terminal() {
            return Err(ExchangeError::SessionClosed(self.id));
        }
        Ok(())
    }

    fn ensure_editable(&self, role: Role) -> Result<()> {
        self.ensure_active()?;
        if self.side(role).locked {
            return Err(ExchangeError::SideLocked);
        }
        Ok(())
    }

    /// Validation for adding `item` to `role`'s proposal. Lock state is the
    /// registry's business and is checked by the caller.
    pub fn check_proposable(&self, role: Role, item: &Item, max_items: usize) -> Result<()> {
        self.ensure_editable(role)?;
        let side = self.side(role);
        if side.contains(item.id) {
            return Err(ExchangeError::AlreadyProposed(item.id));
        }
        if item.owner != side.participant.id {
            return Err(ExchangeError::NotOwner {
                item: item.id,
                participant: side.participant.id,
            });
        }
        if !item.tradeable {
            return Err(ExchangeError::NotTradeable(item.id));
        }
        if side.proposal.len() >= max_items {
            return Err(ExchangeError::ProposalFull { limit: max_items });
        }
        Ok(())
    }

    /// Append an item whose lock is already held by this session
    pub fn push_item(&mut self, role: Role, item: ProposedItem) {
        self.side_mut(role).proposal.push(item);
    }

    /// Remove an item from `role`'s proposal; the caller releases its lock
    pub fn remove_item(&mut self, role: Role, item: ItemId) -> Result<ProposedItem> {
        self.ensure_editable(role)?;
        let side = self.side_mut(role);
        let position = side
            .proposal
            .iter()
            .position(|entry| entry.id == item)
            .ok_or(ExchangeError::NotProposed(item))?;
        Ok(side.proposal.remove(position))
    }

    /// Empty `role`'s proposal and return what it held
    pub fn clear_items(&mut self, role: Role) -> Result<Vec<ItemId>> {
        self.ensure_editable(role)?;
        let side = self.side_mut(role);
        let removed = side.item_ids();
        side.proposal.clear();
        Ok(removed)
    }

    /// Lock `role`'s proposal. Irreversible.
    pub fn lock_side(&mut self, role: Role) -> Result<NegotiationPhase> {
        self.ensure_active()?;
        if self.side(role).locked {
            return Err(ExchangeError::AlreadyLocked);
        }

        self.side_mut(role).locked = true;
        if self.side(role.other()).locked {
            self.phase = NegotiationPhase::BothLocked;
            self.cooldown_started_at = Some(Instant::now());
        } else {
            self.phase = NegotiationPhase::Locking;
        }
        Ok(self.phase)
    }

    /// Cooldown still to wait before `role` may confirm
    pub fn cooldown_remaining(&self, role: Role, cooldown: Duration) -> Option<Duration> {
        if !self.side(role).participant.cooldown_policy.is_enforced() {
            return None;
        }
        let started = self.cooldown_started_at?;
        let elapsed = started.elapsed();
        (elapsed < cooldown).then(|| cooldown - elapsed)
    }

    /// Record `role`'s acceptance
    pub fn accept(&mut self, role: Role, cooldown: Duration) -> Result<AcceptOutcome> {
        match self.phase {
            NegotiationPhase::Settled => return Err(ExchangeError::AlreadyAccepted),
            NegotiationPhase::Cancelled | NegotiationPhase::TimedOut => {
                return Err(ExchangeError::SessionClosed(self.id))
            }
            NegotiationPhase::Open | NegotiationPhase::Locking => {
                return Err(ExchangeError::NotBothLocked)
            }
            NegotiationPhase::BothLocked => {}
        }
        if self.side(role).accepted {
            return Err(ExchangeError::AlreadyAccepted);
        }
        if let Some(remaining) = self.cooldown_remaining(role, cooldown) {
            return Err(ExchangeError::CooldownActive { remaining });
        }

        self.side_mut(role).accepted = true;
        if self.side(role.other()).accepted {
            Ok(AcceptOutcome::ReadyToSettle)
        } else {
            Ok(AcceptOutcome::Waiting)
        }
    }

    /// Undo both acceptances after a settlement that changed nothing
    pub fn reset_acceptance(&mut self) {
        for side in &mut self.sides {
            side.accepted = false;
        }
    }

    /// Cancellation by a participant. Returns false if the session had already ended.
    pub fn cancel(&mut self, role: Role) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        let by = self.participant(role);
        self.side_mut(role).cancelled = true;
        self.terminate(NegotiationPhase::Cancelled, EndReason::CancelledBy(by));
        true
    }

    /// Inactivity timeout. Returns false if the session had already ended.
    pub fn expire(&mut self) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        self.terminate(NegotiationPhase::TimedOut, EndReason::TimedOut);
        true
    }

    /// Force the session into a terminal phase
    pub fn terminate(&mut self, phase: NegotiationPhase, reason: EndReason) {
        self.phase = phase;
        self.end_reason = Some(reason);
    }

    /// Mark a completed settlement: proposals are emptied
    pub fn mark_settled(&mut self, winner: Option<ParticipantId>) {
        for side in &mut self.sides {
            side.won = winner == Some(side.participant.id);
            side.proposal.clear();
        }
        self.terminate(NegotiationPhase::Settled, EndReason::Settled);
    }

    /// Every item currently proposed on either side
    pub fn held_items(&self) -> Vec<ItemId> {
        self.sides.iter().flat_map(|side| side.item_ids()).collect()
    }

    pub fn snapshot(&self, cooldown: Duration) -> SessionSnapshot {
        let cooldown_remaining = match self.phase {
            NegotiationPhase::BothLocked => [Role::Initiator, Role::Counterparty]
                .into_iter()
                .filter_map(|role| self.cooldown_remaining(role, cooldown))
                .max(),
            _ => None,
        };
        SessionSnapshot::build(
            self.id,
            self.scope,
            self.phase,
            &self.sides,
            self.created_at,
            cooldown_remaining,
            self.end_reason.clone(),
        )
    }
}
