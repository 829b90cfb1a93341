//! Per-session timer task: periodic refresh and the inactivity timeout

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::directory::SessionHandle;
use super::engine::NegotiationEngine;

/// Background task bound to one session's lifetime.
///
/// Stops when the session's supervisor token is cancelled, which every exit
/// path does before releasing locks.
pub struct Supervisor;

impl Supervisor {
    pub(crate) fn spawn(
        engine: NegotiationEngine,
        handle: SessionHandle,
        started_at: Instant,
    ) -> JoinHandle<()> {
        let token = handle.supervisor_token();
        let refresh = engine.config().refresh_interval();
        let deadline = started_at + engine.config().inactivity_timeout();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(started_at + refresh, refresh);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let timeout = tokio::time::sleep_until(deadline);
            tokio::pin!(timeout);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = &mut timeout => {
                        engine.expire(&handle).await;
                        break;
                    }
                    _ = ticker.tick() => engine.refresh(&handle).await,
                }
            }

            tracing::debug!("Supervisor for {} stopped", handle.id());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExchangeConfig;
    use crate::notify::{ChannelSink, SessionEvent};
    use crate::store::MemoryStore;
    use crate::types::{Item, ItemId, ParticipantId, ScopeKey};
    use crate::negotiation::{EndReason, NegotiationPhase};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn setup() -> (
        Arc<MemoryStore>,
        NegotiationEngine,
        UnboundedReceiver<SessionEvent>,
    ) {
        let store = Arc::new(MemoryStore::new());
        store.insert_item(Item::new(ItemId(1), ParticipantId(1), "Argentina"));
        let (sink, events) = ChannelSink::new();
        let engine = NegotiationEngine::builder(store.clone(), store.clone())
            .config(ExchangeConfig {
                command_cooldown_secs: 0,
                ..Default::default()
            })
            .sink(Arc::new(sink))
            .build()
            .unwrap();
        (store, engine, events)
    }

    fn drain(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_every_interval() {
        let (_store, engine, mut events) = setup().await;
        let handle = engine
            .open_negotiation(ScopeKey::new(1, 1), ParticipantId(1), ParticipantId(2))
            .await
            .unwrap();
        drain(&mut events);

        tokio::time::sleep(Duration::from_secs(46)).await;

        let refreshed = drain(&mut events)
            .into_iter()
            .filter(|event| matches!(event, SessionEvent::Refreshed(_)))
            .count();
        assert_eq!(refreshed, 3);
        assert!(handle.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_locks() {
        let (store, engine, mut events) = setup().await;
        let handle = engine
            .open_negotiation(ScopeKey::new(1, 1), ParticipantId(1), ParticipantId(2))
            .await
            .unwrap();
        engine
            .propose_item(&handle, ParticipantId(1), ItemId(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(899)).await;
        assert!(handle.is_active());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(handle.phase(), NegotiationPhase::TimedOut);
        assert!(handle.supervisor_stopped());
        assert_eq!(engine.locks().locked_count(), 0);
        assert!(!store.item(ItemId(1)).unwrap().is_locked());

        let ended = drain(&mut events).into_iter().find_map(|event| match event {
            SessionEvent::Ended { reason, .. } => Some(reason),
            _ => None,
        });
        assert_eq!(ended, Some(EndReason::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_supervisor() {
        let (_store, engine, mut events) = setup().await;
        let handle = engine
            .open_negotiation(ScopeKey::new(1, 1), ParticipantId(1), ParticipantId(2))
            .await
            .unwrap();

        engine.cancel(&handle, ParticipantId(2)).await.unwrap();
        assert!(handle.supervisor_stopped());
        drain(&mut events);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(drain(&mut events).is_empty());
        assert_eq!(handle.phase(), NegotiationPhase::Cancelled);
    }
}
