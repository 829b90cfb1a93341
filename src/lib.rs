//! Ballbet Negotiation Library
//!
//! Two-party item negotiation for chat communities: each participant proposes
//! items, locks their side, and both confirm before ownership is reassigned
//! by a pluggable settlement outcome (symmetric swap or winner takes all).
//!
//! The library provides:
//! - Item locks that keep one item in at most one negotiation
//! - A per-session state machine with cooldown, timeout and cancellation
//! - Settlement strategies and an engine that applies them to the item store
//! - Storage, randomness and notification ports with in-memory implementations

pub mod cli;
pub mod config;
pub mod error;
pub mod inventory;
pub mod locks;
pub mod negotiation;
pub mod notify;
pub mod random;
pub mod settlement;
pub mod store;
pub mod throttle;
pub mod types;

// Re-export commonly used types
pub use config::ExchangeConfig;
pub use error::{ExchangeError, Result};
pub use inventory::Inventory;
pub use locks::LockRegistry;
pub use negotiation::{
    ConfirmOutcome, EndReason, LockAck, NegotiationEngine, NegotiationPhase, ProposalAck,
    SessionHandle, SessionSnapshot,
};
pub use notify::{ChannelSink, NotificationSink, SessionEvent, TracingSink};
pub use random::{FixedRandom, RandomSource, SeededRandom, ThreadRandom};
pub use settlement::{OutcomeKind, SettlementOutcome, SettlementReport, SymmetricSwap, WinnerTakesAll};
pub use store::{ItemStore, MemoryStore, ParticipantStore, StoreError};
pub use types::{CooldownPolicy, Item, ItemId, Participant, ParticipantId, ScopeKey, SessionId};
