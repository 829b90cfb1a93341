//! Error types for ballbet

use crate::store::StoreError;
use crate::types::{ItemId, ParticipantId, SessionId};
use std::time::Duration;
use thiserror::Error;

/// Main error type for ballbet
#[derive(Error, Debug)]
pub enum ExchangeError {
    // Session opening errors
    #[error("Participant {0} already has an active session in this channel")]
    AlreadyInSession(ParticipantId),

    #[error("Negotiation between {initiator} and {counterparty} is blocked")]
    Blocked {
        initiator: ParticipantId,
        counterparty: ParticipantId,
    },

    #[error("A participant cannot negotiate with themselves")]
    SelfNegotiation,

    #[error("Bots cannot take part in a negotiation: {0}")]
    BotParticipant(ParticipantId),

    #[error("Participant is blacklisted: {0}")]
    Blacklisted(ParticipantId),

    #[error("Command throttled, retry in {remaining:?}")]
    Throttled { remaining: Duration },

    // Proposal errors
    #[error("Item {0} is held by another negotiation")]
    ItemLocked(ItemId),

    #[error("Item {0} is not tradeable")]
    NotTradeable(ItemId),

    #[error("Item {0} is already in the proposal")]
    AlreadyProposed(ItemId),

    #[error("Item {0} is not in the proposal")]
    NotProposed(ItemId),

    #[error("Item {item} is not owned by participant {participant}")]
    NotOwner {
        item: ItemId,
        participant: ParticipantId,
    },

    #[error("Proposal is locked and cannot be edited")]
    SideLocked,

    #[error("Proposal is full: at most {limit} items")]
    ProposalFull { limit: usize },

    // Locking and confirmation errors
    #[error("Proposal already locked")]
    AlreadyLocked,

    #[error("Confirmation cooldown active: {remaining:?} remaining")]
    CooldownActive { remaining: Duration },

    #[error("Both proposals must be locked before confirming")]
    NotBothLocked,

    #[error("Negotiation already accepted")]
    AlreadyAccepted,

    // Session lookup errors
    #[error("Participant {participant} is not part of {session}")]
    NotParticipant {
        session: SessionId,
        participant: ParticipantId,
    },

    #[error("Participant {0} has no active negotiation here")]
    NoActiveSession(ParticipantId),

    #[error("Negotiation session has ended: {0}")]
    SessionClosed(SessionId),

    // Settlement errors
    #[error("Settlement of {session} failed after {} of {} transfers: {reason}", applied.len(), applied.len() + pending.len())]
    SettlementFailed {
        session: SessionId,
        applied: Vec<ItemId>,
        pending: Vec<ItemId>,
        retryable: bool,
        reason: String,
    },

    // Storage errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration value: {0}")]
    InvalidConfig(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExchangeError {
    /// Lost races and timing rejections: nothing was mutated and the caller may try again
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::ItemLocked(_)
            | ExchangeError::AlreadyLocked
            | ExchangeError::AlreadyAccepted
            | ExchangeError::CooldownActive { .. }
            | ExchangeError::Throttled { .. } => true,
            ExchangeError::SettlementFailed { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

/// Result type alias for ballbet operations
pub type Result<T> = std::result::Result<T, ExchangeError>;
