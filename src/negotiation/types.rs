//! Negotiation types and state machine phases

use crate::types::{Item, ItemId, Participant, ParticipantId, ScopeKey, SessionId};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Position of a participant in a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Counterparty,
}

impl Role {
    pub fn other(self) -> Role {
        match self {
            Role::Initiator => Role::Counterparty,
            Role::Counterparty => Role::Initiator,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Role::Initiator => 0,
            Role::Counterparty => 1,
        }
    }
}

/// Negotiation state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationPhase {
    /// Both sides editing
    Open,
    /// One side locked, the other still editing
    Locking,
    /// Both sides locked, confirmation cooldown running
    BothLocked,
    Settled,
    Cancelled,
    TimedOut,
}

impl NegotiationPhase {
    /// Check if negotiation is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NegotiationPhase::Settled | NegotiationPhase::Cancelled | NegotiationPhase::TimedOut
        )
    }

    /// Check if negotiation is active
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// Why a session reached a terminal phase
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    Settled,
    CancelledBy(ParticipantId),
    TimedOut,
    /// A transfer failed after others were already applied
    SettlementFailed,
    Shutdown,
}

/// An item offered into a session, with the attributes the UI needs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedItem {
    pub id: ItemId,
    pub name: String,
    pub favorite: bool,
}

impl From<&Item> for ProposedItem {
    fn from(item: &Item) -> Self {
        Self {
            id: item.id,
            name: item.name.clone(),
            favorite: item.favorite,
        }
    }
}

/// One participant's half of a session
#[derive(Clone, Debug)]
pub struct Side {
    pub participant: Participant,
    /// Insertion order
    pub proposal: Vec<ProposedItem>,
    pub locked: bool,
    pub accepted: bool,
    pub cancelled: bool,
    pub won: bool,
}

impl Side {
    pub fn new(participant: Participant) -> Self {
        Self {
            participant,
            proposal: Vec::new(),
            locked: false,
            accepted: false,
            cancelled: false,
            won: false,
        }
    }

    pub fn contains(&self, item: ItemId) -> bool {
        self.proposal.iter().any(|entry| entry.id == item)
    }

    pub fn item_ids(&self) -> Vec<ItemId> {
        self.proposal.iter().map(|entry| entry.id).collect()
    }

    fn snapshot(&self) -> SideSnapshot {
        SideSnapshot {
            participant: self.participant.id,
            handle: self.participant.handle.clone(),
            items: self.proposal.clone(),
            locked: self.locked,
            accepted: self.accepted,
            cancelled: self.cancelled,
            won: self.won,
        }
    }
}

/// Read-only view of a side, for rendering
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideSnapshot {
    pub participant: ParticipantId,
    pub handle: String,
    pub items: Vec<ProposedItem>,
    pub locked: bool,
    pub accepted: bool,
    pub cancelled: bool,
    pub won: bool,
}

/// Read-only view of a session, for rendering
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub scope: ScopeKey,
    pub phase: NegotiationPhase,
    pub initiator: SideSnapshot,
    pub counterparty: SideSnapshot,
    pub created_at: SystemTime,
    /// Longest cooldown still to wait by a participant subject to it
    pub cooldown_remaining: Option<Duration>,
    pub end_reason: Option<EndReason>,
}

impl SessionSnapshot {
    pub(crate) fn build(
        id: SessionId,
        scope: ScopeKey,
        phase: NegotiationPhase,
        sides: &[Side; 2],
        created_at: SystemTime,
        cooldown_remaining: Option<Duration>,
        end_reason: Option<EndReason>,
    ) -> Self {
        Self {
            id,
            scope,
            phase,
            initiator: sides[0].snapshot(),
            counterparty: sides[1].snapshot(),
            created_at,
            cooldown_remaining,
            end_reason,
        }
    }

    pub fn side(&self, participant: ParticipantId) -> Option<&SideSnapshot> {
        if self.initiator.participant == participant {
            Some(&self.initiator)
        } else if self.counterparty.participant == participant {
            Some(&self.counterparty)
        } else {
            None
        }
    }

    /// Items at stake on both sides
    pub fn total_items(&self) -> usize {
        self.initiator.items.len() + self.counterparty.items.len()
    }
}

/// Result of proposing one item
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalAck {
    pub item: ItemId,
    /// Favorites are accepted, but the UI should ask for confirmation
    pub favorite: bool,
}

/// Result of locking a side
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockAck {
    /// Waiting for the other side to lock
    Waiting,
    /// Both sides locked, confirmation opens after the cooldown
    BothLocked { cooldown: Duration },
}
