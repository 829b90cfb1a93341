//! Item lock registry
//!
//! The registry is the only place that flips an item's lock. The in-memory
//! table is authoritative and checked-and-updated under one mutex, so two
//! sessions can never both acquire the same item; the persisted `locked_at`
//! attribute mirrors it for subsystems that only see the store.

use crate::error::ExchangeError;
use crate::store::{ItemStore, StoreError};
use crate::types::{ItemId, SessionId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use thiserror::Error;

/// Who holds a lock and since when
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockEntry {
    pub holder: SessionId,
    pub acquired_at: SystemTime,
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Item {item} is already locked by {holder}")]
    AlreadyLocked { item: ItemId, holder: SessionId },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<LockError> for ExchangeError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::AlreadyLocked { item, .. } => ExchangeError::ItemLocked(item),
            LockError::Store(e) => ExchangeError::Store(e),
        }
    }
}

/// Process-wide exclusivity tracker over item identifiers
pub struct LockRegistry {
    store: Arc<dyn ItemStore>,
    held: Mutex<HashMap<ItemId, LockEntry>>,
}

impl LockRegistry {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self {
            store,
            held: Mutex::new(HashMap::new()),
        }
    }

    fn held(&self) -> MutexGuard<'_, HashMap<ItemId, LockEntry>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_locked(&self, item: ItemId) -> bool {
        self.held().contains_key(&item)
    }

    pub fn holder(&self, item: ItemId) -> Option<SessionId> {
        self.held().get(&item).map(|entry| entry.holder)
    }

    pub fn entry(&self, item: ItemId) -> Option<LockEntry> {
        self.held().get(&item).cloned()
    }

    /// Items currently held by one session, sorted
    pub fn held_by(&self, session: SessionId) -> Vec<ItemId> {
        let mut items: Vec<ItemId> = self
            .held()
            .iter()
            .filter(|(_, entry)| entry.holder == session)
            .map(|(item, _)| *item)
            .collect();
        items.sort();
        items
    }

    pub fn locked_count(&self) -> usize {
        self.held().len()
    }

    /// Take the lock on `item` for `holder`.
    ///
    /// Not idempotent: a second acquisition by the same holder fails too.
    pub async fn acquire(&self, item: ItemId, holder: SessionId) -> Result<SystemTime, LockError> {
        let acquired_at = SystemTime::now();
        {
            let mut held = self.held();
            if let Some(entry) = held.get(&item) {
                return Err(LockError::AlreadyLocked {
                    item,
                    holder: entry.holder,
                });
            }
            held.insert(
                item,
                LockEntry {
                    holder,
                    acquired_at,
                },
            );
        }

        if let Err(e) = self.store.set_locked(item, Some(acquired_at)).await {
            self.held().remove(&item);
            tracing::warn!("Failed to persist lock on {} for {}: {}", item, holder, e);
            return Err(e.into());
        }

        tracing::debug!("{} locked {}", holder, item);
        Ok(acquired_at)
    }

    /// Clear the lock on `item`. Releasing an unlocked item is a no-op.
    ///
    /// The table entry is dropped only after the store write, so a new
    /// holder's `locked_at` can never be overwritten by this release.
    pub async fn release(&self, item: ItemId) {
        let Some(entry) = self.entry(item) else {
            return;
        };

        if let Err(e) = self.store.set_locked(item, None).await {
            tracing::warn!(
                "Failed to persist unlock of {} held by {}: {}",
                item,
                entry.holder,
                e
            );
        }

        self.held().remove(&item);
        tracing::debug!("{} released {}", entry.holder, item);
    }

    /// Drop the table entry without touching the store, for items that no
    /// longer exist there
    pub(crate) fn forget(&self, item: ItemId) {
        self.held().remove(&item);
    }

    pub async fn release_all(&self, items: &[ItemId]) {
        for item in items {
            self.release(*item).await;
        }
    }

    /// Release `item` only if `holder` still holds it.
    ///
    /// Session exit paths use this: an item released earlier may already
    /// belong to another session by the time the exit path runs.
    pub async fn release_if_held_by(&self, item: ItemId, holder: SessionId) -> bool {
        if self.holder(item) != Some(holder) {
            return false;
        }
        self.release(item).await;
        true
    }

    /// Release every lock held by `holder`, returning the released items
    pub async fn release_session(&self, holder: SessionId) -> Vec<ItemId> {
        let items = self.held_by(holder);
        for item in &items {
            self.release_if_held_by(*item, holder).await;
        }
        items
    }
}
