//! Negotiation sessions between two participants

pub mod directory;
pub mod engine;
pub mod session;
pub mod supervisor;
pub mod types;

pub use directory::{SessionDirectory, SessionHandle};
pub use engine::{ConfirmOutcome, EngineBuilder, NegotiationEngine};
pub use session::{AcceptOutcome, NegotiationSession};
pub use types::{
    EndReason, LockAck, NegotiationPhase, ProposalAck, ProposedItem, Role, Side, SessionSnapshot,
    SideSnapshot,
};
