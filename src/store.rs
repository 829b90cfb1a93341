//! Persistence ports for items and players, plus an in-memory implementation
//!
//! The negotiation core only needs simple get/save calls from the data store.
//! Every call is a suspension point: other tasks may run between any two of them.

use crate::types::{Item, ItemId, Participant, ParticipantId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use thiserror::Error;

/// Errors reported by a store backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("Participant not found: {0}")]
    ParticipantNotFound(ParticipantId),

    #[error("Write rejected for item {0}")]
    WriteRejected(ItemId),
}

/// Item persistence used by the lock registry, the settlement engine and inventory
#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn get_item(&self, id: ItemId) -> Result<Item, StoreError>;

    async fn set_owner(&self, id: ItemId, owner: ParticipantId) -> Result<(), StoreError>;

    /// Persist the lock attribute so that other subsystems can observe it
    async fn set_locked(&self, id: ItemId, locked_at: Option<SystemTime>)
        -> Result<(), StoreError>;

    async fn items_owned_by(&self, owner: ParticipantId) -> Result<Vec<Item>, StoreError>;

    async fn delete_item(&self, id: ItemId) -> Result<(), StoreError>;

    async fn get_owner(&self, id: ItemId) -> Result<ParticipantId, StoreError> {
        Ok(self.get_item(id).await?.owner)
    }

    async fn is_tradeable(&self, id: ItemId) -> Result<bool, StoreError> {
        Ok(self.get_item(id).await?.tradeable)
    }

    async fn is_favorite(&self, id: ItemId) -> Result<bool, StoreError> {
        Ok(self.get_item(id).await?.favorite)
    }
}

/// Player persistence used when opening a negotiation
#[async_trait]
pub trait ParticipantStore: Send + Sync {
    /// Fetch a player record, creating a default one on first sight
    async fn get_or_create(&self, id: ParticipantId) -> Result<Participant, StoreError>;

    /// Whether `blocker` has blocked `blocked`
    async fn blocks(
        &self,
        blocker: ParticipantId,
        blocked: ParticipantId,
    ) -> Result<bool, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    items: HashMap<ItemId, Item>,
    participants: HashMap<ParticipantId, Participant>,
    blocks: HashSet<(ParticipantId, ParticipantId)>,
    rejected_writes: HashSet<ItemId>,
}

/// In-memory store backing the CLI and the test suite.
///
/// Writes yield to the scheduler before applying, so concurrent callers
/// interleave the way they would against a real database.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_item(&self, item: Item) {
        self.inner().items.insert(item.id, item);
    }

    pub fn insert_participant(&self, participant: Participant) {
        self.inner().participants.insert(participant.id, participant);
    }

    /// Record that `blocker` blocked `blocked`
    pub fn block(&self, blocker: ParticipantId, blocked: ParticipantId) {
        self.inner().blocks.insert((blocker, blocked));
    }

    /// Make every subsequent owner write for `id` fail
    pub fn reject_writes_for(&self, id: ItemId) {
        self.inner().rejected_writes.insert(id);
    }

    pub fn accept_writes_for(&self, id: ItemId) {
        self.inner().rejected_writes.remove(&id);
    }

    /// Synchronous read, convenient for assertions and CLI output
    pub fn item(&self, id: ItemId) -> Option<Item> {
        self.inner().items.get(&id).cloned()
    }

    pub fn owned_ids(&self, owner: ParticipantId) -> Vec<ItemId> {
        let mut ids: Vec<ItemId> = self
            .inner()
            .items
            .values()
            .filter(|item| item.owner == owner)
            .map(|item| item.id)
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn get_item(&self, id: ItemId) -> Result<Item, StoreError> {
        self.inner()
            .items
            .get(&id)
            .cloned()
            .ok_or(StoreError::ItemNotFound(id))
    }

    async fn set_owner(&self, id: ItemId, owner: ParticipantId) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        let mut inner = self.inner();
        if inner.rejected_writes.contains(&id) {
            return Err(StoreError::WriteRejected(id));
        }
        let item = inner.items.get_mut(&id).ok_or(StoreError::ItemNotFound(id))?;
        item.owner = owner;
        Ok(())
    }

    async fn set_locked(
        &self,
        id: ItemId,
        locked_at: Option<SystemTime>,
    ) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        let mut inner = self.inner();
        let item = inner.items.get_mut(&id).ok_or(StoreError::ItemNotFound(id))?;
        item.locked_at = locked_at;
        Ok(())
    }

    async fn items_owned_by(&self, owner: ParticipantId) -> Result<Vec<Item>, StoreError> {
        let mut items: Vec<Item> = self
            .inner()
            .items
            .values()
            .filter(|item| item.owner == owner)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.id);
        Ok(items)
    }

    async fn delete_item(&self, id: ItemId) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.inner()
            .items
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::ItemNotFound(id))
    }
}

#[async_trait]
impl ParticipantStore for MemoryStore {
    async fn get_or_create(&self, id: ParticipantId) -> Result<Participant, StoreError> {
        let mut inner = self.inner();
        let participant = inner
            .participants
            .entry(id)
            .or_insert_with(|| Participant::new(id, format!("player_{}", id)));
        Ok(participant.clone())
    }

    async fn blocks(
        &self,
        blocker: ParticipantId,
        blocked: ParticipantId,
    ) -> Result<bool, StoreError> {
        Ok(self.inner().blocks.contains(&(blocker, blocked)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_item() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_item(Item::new(ItemId(1), ParticipantId(10), "France"));
        store
    }

    #[tokio::test]
    async fn test_set_owner() {
        let store = store_with_item();

        store.set_owner(ItemId(1), ParticipantId(20)).await.unwrap();

        assert_eq!(store.get_owner(ItemId(1)).await.unwrap(), ParticipantId(20));
        assert_eq!(store.owned_ids(ParticipantId(20)), vec![ItemId(1)]);
    }

    #[tokio::test]
    async fn test_rejected_write() {
        let store = store_with_item();
        store.reject_writes_for(ItemId(1));

        let result = store.set_owner(ItemId(1), ParticipantId(20)).await;
        assert_eq!(result, Err(StoreError::WriteRejected(ItemId(1))));
        assert_eq!(store.get_owner(ItemId(1)).await.unwrap(), ParticipantId(10));

        store.accept_writes_for(ItemId(1));
        assert!(store.set_owner(ItemId(1), ParticipantId(20)).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_item() {
        let store = MemoryStore::new();
        let result = store.get_item(ItemId(9)).await;
        assert_eq!(result, Err(StoreError::ItemNotFound(ItemId(9))));
    }

    #[tokio::test]
    async fn test_participants_created_on_first_sight() {
        let store = MemoryStore::new();
        let player = store.get_or_create(ParticipantId(5)).await.unwrap();
        assert_eq!(player.handle, "player_5");
    }

    #[tokio::test]
    async fn test_blocks_are_directional() {
        let store = MemoryStore::new();
        store.block(ParticipantId(1), ParticipantId(2));

        assert!(store.blocks(ParticipantId(1), ParticipantId(2)).await.unwrap());
        assert!(!store.blocks(ParticipantId(2), ParticipantId(1)).await.unwrap());
    }
}
