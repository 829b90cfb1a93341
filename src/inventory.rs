//! Inventory operations that must respect negotiation locks

use crate::error::Result;
use crate::locks::LockRegistry;
use crate::store::ItemStore;
use crate::types::{Item, ItemId, ParticipantId, SessionId};
use std::sync::Arc;

/// Holder used while an item is being deleted. Session ids start at 1.
const DELETION_HOLDER: SessionId = SessionId(0);

pub struct Inventory {
    store: Arc<dyn ItemStore>,
    locks: Arc<LockRegistry>,
}

impl Inventory {
    pub fn new(store: Arc<dyn ItemStore>, locks: Arc<LockRegistry>) -> Self {
        Self { store, locks }
    }

    /// Delete an item unless a negotiation holds it.
    ///
    /// The item is reserved in the lock registry for the duration of the
    /// delete, so no session can pick it up halfway through.
    pub async fn delete_item(&self, id: ItemId) -> Result<()> {
        let item = self.store.get_item(id).await?;
        if item.is_locked() && !self.locks.is_locked(id) {
            // Lock persisted by a process that no longer tracks it
            tracing::warn!("{} carries a stale lock from {:?}", id, item.locked_at);
        }

        self.locks.acquire(id, DELETION_HOLDER).await?;
        if let Err(e) = self.store.delete_item(id).await {
            self.locks.release(id).await;
            return Err(e.into());
        }
        self.locks.forget(id);

        tracing::info!("Deleted {} ({}) owned by {}", id, item.name, item.owner);
        Ok(())
    }

    /// Items `owner` could put into a proposal right now
    pub async fn tradeable_items(&self, owner: ParticipantId) -> Result<Vec<Item>> {
        let items = self.store.items_owned_by(owner).await?;
        Ok(items
            .into_iter()
            .filter(|item| item.tradeable && !self.locks.is_locked(item.id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use crate::store::{MemoryStore, StoreError};

    fn inventory() -> (Arc<MemoryStore>, Arc<LockRegistry>, Inventory) {
        let store = Arc::new(MemoryStore::new());
        store.insert_item(Item::new(ItemId(1), ParticipantId(1), "France"));
        store.insert_item(Item::new(ItemId(2), ParticipantId(1), "Spain"));
        store.insert_item(Item::new(ItemId(3), ParticipantId(1), "Italy").untradeable());
        let locks = Arc::new(LockRegistry::new(store.clone()));
        let inventory = Inventory::new(store.clone(), locks.clone());
        (store, locks, inventory)
    }

    #[tokio::test]
    async fn test_delete_unlocked_item() {
        let (store, locks, inventory) = inventory();

        inventory.delete_item(ItemId(1)).await.unwrap();

        assert!(store.item(ItemId(1)).is_none());
        assert_eq!(locks.locked_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_locked_item_refused() {
        let (store, locks, inventory) = inventory();
        locks.acquire(ItemId(2), SessionId(4)).await.unwrap();

        let err = inventory.delete_item(ItemId(2)).await.unwrap_err();

        assert!(matches!(err, ExchangeError::ItemLocked(ItemId(2))));
        assert!(store.item(ItemId(2)).is_some());
        assert_eq!(locks.holder(ItemId(2)), Some(SessionId(4)));
    }

    #[tokio::test]
    async fn test_delete_missing_item() {
        let (_store, _locks, inventory) = inventory();
        let err = inventory.delete_item(ItemId(9)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Store(StoreError::ItemNotFound(_))));
    }

    #[tokio::test]
    async fn test_tradeable_items_skip_locked_and_untradeable() {
        let (_store, locks, inventory) = inventory();
        locks.acquire(ItemId(1), SessionId(1)).await.unwrap();

        let items = inventory.tradeable_items(ParticipantId(1)).await.unwrap();

        let ids: Vec<ItemId> = items.iter().map(|item| item.id).collect();
        assert_eq!(ids, vec![ItemId(2)]);
    }
}
