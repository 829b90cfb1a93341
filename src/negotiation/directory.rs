//! Session directory: which participant is negotiating where

use crate::error::{ExchangeError, Result};
use crate::types::{Participant, ParticipantId, ScopeKey, SessionId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, MutexGuard as SessionGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::session::NegotiationSession;
use super::types::{NegotiationPhase, Role};

struct HandleInner {
    id: SessionId,
    scope: ScopeKey,
    participants: [ParticipantId; 2],
    session: tokio::sync::Mutex<NegotiationSession>,
    phase: watch::Sender<NegotiationPhase>,
    cancel_requested: AtomicBool,
    supervisor: CancellationToken,
    supervisor_task: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to one session.
///
/// All mutations go through the session mutex, which is held across store
/// I/O so that operations on one session never interleave.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

impl SessionHandle {
    fn new(session: NegotiationSession) -> Self {
        let participants = [
            session.side(Role::Initiator).participant.id,
            session.side(Role::Counterparty).participant.id,
        ];
        let (phase, _) = watch::channel(session.phase());
        Self {
            inner: Arc::new(HandleInner {
                id: session.id(),
                scope: session.scope(),
                participants,
                session: tokio::sync::Mutex::new(session),
                phase,
                cancel_requested: AtomicBool::new(false),
                supervisor: CancellationToken::new(),
                supervisor_task: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn scope(&self) -> ScopeKey {
        self.inner.scope
    }

    pub fn initiator(&self) -> ParticipantId {
        self.inner.participants[0]
    }

    pub fn counterparty(&self) -> ParticipantId {
        self.inner.participants[1]
    }

    pub fn involves(&self, participant: ParticipantId) -> bool {
        self.inner.participants.contains(&participant)
    }

    /// Last published phase, readable without waiting on the session
    pub fn phase(&self) -> NegotiationPhase {
        *self.inner.phase.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.phase().is_active()
    }

    /// Watch phase changes
    pub fn subscribe_phase(&self) -> watch::Receiver<NegotiationPhase> {
        self.inner.phase.subscribe()
    }

    pub(crate) fn publish_phase(&self, phase: NegotiationPhase) {
        self.inner.phase.send_replace(phase);
    }

    pub(crate) async fn lock(&self) -> SessionGuard<'_, NegotiationSession> {
        self.inner.session.lock().await
    }

    /// Flag a pending cancellation; operations queued behind it give up
    pub(crate) fn request_cancel(&self) {
        self.inner.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn supervisor_token(&self) -> CancellationToken {
        self.inner.supervisor.clone()
    }

    pub(crate) fn set_supervisor_task(&self, task: JoinHandle<()>) {
        *self
            .inner
            .supervisor_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    pub(crate) fn take_supervisor_task(&self) -> Option<JoinHandle<()>> {
        self.inner
            .supervisor_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn supervisor_stopped(&self) -> bool {
        self.inner.supervisor.is_cancelled()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("scope", &self.inner.scope)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Maps (scope, participant) to the participant's active session
pub struct SessionDirectory {
    scopes: Mutex<HashMap<ScopeKey, Vec<SessionHandle>>>,
    next_id: AtomicU64,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self {
            scopes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn scopes(&self) -> MutexGuard<'_, HashMap<ScopeKey, Vec<SessionHandle>>> {
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prune(sessions: &mut Vec<SessionHandle>) {
        sessions.retain(|handle| {
            let keep = handle.is_active();
            if !keep {
                tracing::debug!("Pruned finished {}", handle.id());
            }
            keep
        });
    }

    /// Active session of `participant` in `scope`. Finished sessions met
    /// along the way are dropped from the directory.
    pub fn find(&self, scope: ScopeKey, participant: ParticipantId) -> Option<SessionHandle> {
        let mut scopes = self.scopes();
        let sessions = scopes.get_mut(&scope)?;
        Self::prune(sessions);
        let found = sessions
            .iter()
            .find(|handle| handle.involves(participant))
            .cloned();
        if sessions.is_empty() {
            scopes.remove(&scope);
        }
        found
    }

    pub fn get(&self, scope: ScopeKey, id: SessionId) -> Option<SessionHandle> {
        self.scopes()
            .get(&scope)?
            .iter()
            .find(|handle| handle.id() == id && handle.is_active())
            .cloned()
    }

    /// Create and register a session. The "already in session" check and the
    /// insertion happen under one lock.
    pub fn open(
        &self,
        scope: ScopeKey,
        initiator: Participant,
        counterparty: Participant,
    ) -> Result<SessionHandle> {
        if initiator.id == counterparty.id {
            return Err(ExchangeError::SelfNegotiation);
        }

        let mut scopes = self.scopes();
        let sessions = scopes.entry(scope).or_default();
        Self::prune(sessions);
        for participant in [initiator.id, counterparty.id] {
            if sessions.iter().any(|handle| handle.involves(participant)) {
                return Err(ExchangeError::AlreadyInSession(participant));
            }
        }

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = SessionHandle::new(NegotiationSession::new(id, scope, initiator, counterparty));
        sessions.push(handle.clone());

        tracing::info!(
            "Opened {} in {} between {} and {}",
            id,
            scope,
            handle.initiator(),
            handle.counterparty()
        );
        Ok(handle)
    }

    /// Remove a session immediately
    pub fn close(&self, scope: ScopeKey, id: SessionId) -> bool {
        let mut scopes = self.scopes();
        let Some(sessions) = scopes.get_mut(&scope) else {
            return false;
        };
        let before = sessions.len();
        sessions.retain(|handle| handle.id() != id);
        let removed = sessions.len() != before;
        if sessions.is_empty() {
            scopes.remove(&scope);
        }
        if removed {
            tracing::debug!("Closed {} in {}", id, scope);
        }
        removed
    }

    /// Every registered session that is still active, across all scopes
    pub fn active(&self) -> Vec<SessionHandle> {
        self.scopes()
            .values()
            .flatten()
            .filter(|handle| handle.is_active())
            .cloned()
            .collect()
    }

    /// Number of registered sessions, finished-but-unpruned ones included
    pub fn len(&self) -> usize {
        self.scopes().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCOPE: ScopeKey = ScopeKey {
        guild: 1,
        channel: 10,
    };

    fn player(id: u64) -> Participant {
        Participant::new(ParticipantId(id), format!("player_{}", id))
    }

    #[tokio::test]
    async fn test_open_and_find() {
        let directory = SessionDirectory::new();
        let handle = directory.open(SCOPE, player(1), player(2)).unwrap();

        let found = directory.find(SCOPE, ParticipantId(2)).unwrap();
        assert_eq!(found.id(), handle.id());
        assert!(directory.find(SCOPE, ParticipantId(3)).is_none());
        assert!(directory.find(ScopeKey::new(1, 11), ParticipantId(1)).is_none());
    }

    #[tokio::test]
    async fn test_participant_limited_to_one_session_per_scope() {
        let directory = SessionDirectory::new();
        directory.open(SCOPE, player(1), player(2)).unwrap();

        let err = directory.open(SCOPE, player(3), player(2)).unwrap_err();
        assert!(matches!(err, ExchangeError::AlreadyInSession(ParticipantId(2))));

        let err = directory.open(SCOPE, player(1), player(4)).unwrap_err();
        assert!(matches!(err, ExchangeError::AlreadyInSession(ParticipantId(1))));

        // A different channel is a different scope
        assert!(directory.open(ScopeKey::new(1, 11), player(1), player(2)).is_ok());
    }

    #[tokio::test]
    async fn test_self_negotiation_rejected() {
        let directory = SessionDirectory::new();
        let err = directory.open(SCOPE, player(1), player(1)).unwrap_err();
        assert!(matches!(err, ExchangeError::SelfNegotiation));
    }

    #[tokio::test]
    async fn test_get_only_returns_active_sessions() {
        let directory = SessionDirectory::new();
        let handle = directory.open(SCOPE, player(1), player(2)).unwrap();

        assert_eq!(directory.get(SCOPE, handle.id()).unwrap().id(), handle.id());
        assert!(directory.get(ScopeKey::new(1, 11), handle.id()).is_none());
        assert!(directory.get(SCOPE, SessionId(handle.id().0 + 100)).is_none());

        handle.publish_phase(NegotiationPhase::Settled);
        assert!(directory.get(SCOPE, handle.id()).is_none());
    }

    #[tokio::test]
    async fn test_phase_subscribers_see_changes() {
        let directory = SessionDirectory::new();
        let handle = directory.open(SCOPE, player(1), player(2)).unwrap();
        let mut phase = handle.subscribe_phase();
        assert_eq!(*phase.borrow(), NegotiationPhase::Open);

        handle.publish_phase(NegotiationPhase::BothLocked);
        phase.changed().await.unwrap();
        assert_eq!(*phase.borrow_and_update(), NegotiationPhase::BothLocked);

        handle.publish_phase(NegotiationPhase::Cancelled);
        phase.changed().await.unwrap();
        assert!(!phase.borrow().is_active());
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn test_find_prunes_finished_sessions() {
        let directory = SessionDirectory::new();
        let handle = directory.open(SCOPE, player(1), player(2)).unwrap();
        directory.open(SCOPE, player(3), player(4)).unwrap();

        handle.publish_phase(NegotiationPhase::Cancelled);
        assert_eq!(directory.len(), 2);

        assert!(directory.find(SCOPE, ParticipantId(1)).is_none());
        assert_eq!(directory.len(), 1);

        // Participants are free again
        assert!(directory.open(SCOPE, player(1), player(2)).is_ok());
    }

    #[tokio::test]
    async fn test_close_removes_immediately() {
        let directory = SessionDirectory::new();
        let handle = directory.open(SCOPE, player(1), player(2)).unwrap();

        assert!(directory.close(SCOPE, handle.id()));
        assert!(!directory.close(SCOPE, handle.id()));
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let directory = SessionDirectory::new();
        let a = directory.open(SCOPE, player(1), player(2)).unwrap();
        let b = directory.open(SCOPE, player(3), player(4)).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(directory.active().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_open_single_winner() {
        let directory = Arc::new(SessionDirectory::new());

        let attempts = (2..=9).map(|other| {
            let directory = directory.clone();
            tokio::spawn(async move { directory.open(SCOPE, player(1), player(other)) })
        });
        let results = futures::future::join_all(attempts).await;

        let opened = results
            .into_iter()
            .filter(|result| matches!(result, Ok(Ok(_))))
            .count();
        assert_eq!(opened, 1);
    }
}
