//! Session event notifications for the UI layer
//!
//! Publishing is fire-and-forget from the engine's point of view: a failing
//! sink is logged and the session carries on.

use crate::negotiation::{EndReason, SessionSnapshot};
use crate::settlement::SettlementReport;
use crate::types::SessionId;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Something that happened to a session, with its state afterwards
#[derive(Clone, Debug, Serialize)]
pub enum SessionEvent {
    Opened(SessionSnapshot),
    /// A proposal changed, a side locked or a participant accepted
    Updated(SessionSnapshot),
    BothLocked {
        snapshot: SessionSnapshot,
        cooldown: Duration,
    },
    /// Periodic republish by the supervisor
    Refreshed(SessionSnapshot),
    Settled {
        snapshot: SessionSnapshot,
        report: SettlementReport,
    },
    /// Cancellation, timeout, failed settlement or shutdown
    Ended {
        snapshot: SessionSnapshot,
        reason: EndReason,
    },
}

impl SessionEvent {
    pub fn snapshot(&self) -> &SessionSnapshot {
        match self {
            SessionEvent::Opened(snapshot)
            | SessionEvent::Updated(snapshot)
            | SessionEvent::Refreshed(snapshot) => snapshot,
            SessionEvent::BothLocked { snapshot, .. }
            | SessionEvent::Settled { snapshot, .. }
            | SessionEvent::Ended { snapshot, .. } => snapshot,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.snapshot().id
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Opened(_) => "opened",
            SessionEvent::Updated(_) => "updated",
            SessionEvent::BothLocked { .. } => "both_locked",
            SessionEvent::Refreshed(_) => "refreshed",
            SessionEvent::Settled { .. } => "settled",
            SessionEvent::Ended { .. } => "ended",
        }
    }
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification channel closed")]
    Closed,
}

/// Receiver of session events, typically the chat UI renderer
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: &SessionEvent) -> Result<(), NotifyError>;
}

/// Logs every event; default sink when no UI is attached
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn publish(&self, event: &SessionEvent) -> Result<(), NotifyError> {
        let snapshot = event.snapshot();
        tracing::info!(
            "{} {}: phase={:?} {}={} items, {}={} items",
            snapshot.id,
            event.name(),
            snapshot.phase,
            snapshot.initiator.handle,
            snapshot.initiator.items.len(),
            snapshot.counterparty.handle,
            snapshot.counterparty.items.len()
        );
        Ok(())
    }
}

/// Forwards events into an unbounded channel
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn publish(&self, event: &SessionEvent) -> Result<(), NotifyError> {
        self.tx.send(event.clone()).map_err(|_| NotifyError::Closed)
    }
}
