//! Settlement outcomes and the engine that applies them
//!
//! The reassignment mapping is computed in memory by a [`SettlementOutcome`]
//! and then applied one item at a time. The store offers no multi-item
//! transaction, so a failure part-way leaves earlier writes in place.

use crate::locks::LockRegistry;
use crate::random::RandomSource;
use crate::store::ItemStore;
use crate::types::{ItemId, ParticipantId, SessionId};
use blake2::{Blake2b512, Digest};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

/// How item ownership is reassigned once both participants accept
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Each participant receives the other's proposal
    Swap,
    /// One participant, chosen uniformly, receives both proposals
    WinnerTakesAll,
}

impl OutcomeKind {
    pub fn strategy(self) -> Arc<dyn SettlementOutcome> {
        match self {
            OutcomeKind::Swap => Arc::new(SymmetricSwap),
            OutcomeKind::WinnerTakesAll => Arc::new(WinnerTakesAll),
        }
    }
}

/// The two proposals being settled
#[derive(Clone, Copy, Debug)]
pub struct SettlementInput<'a> {
    pub session: SessionId,
    pub initiator: ParticipantId,
    pub counterparty: ParticipantId,
    pub initiator_items: &'a [ItemId],
    pub counterparty_items: &'a [ItemId],
}

/// A single ownership change
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub item: ItemId,
    pub from: ParticipantId,
    pub to: ParticipantId,
}

/// The full reassignment mapping, computed before anything is written
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPlan {
    pub session: SessionId,
    pub kind: OutcomeKind,
    /// Items whose owner changes; items staying with their owner are not listed
    pub transfers: Vec<Transfer>,
    pub winner: Option<ParticipantId>,
    pub loser: Option<ParticipantId>,
}

impl TransferPlan {
    /// Blake2b digest of the mapping, hex encoded, for audit records
    pub fn receipt(&self) -> String {
        let mut hasher = Blake2b512::new();
        hasher.update(self.session.0.to_be_bytes());
        for transfer in &self.transfers {
            hasher.update(transfer.item.0.to_be_bytes());
            hasher.update(transfer.from.0.to_be_bytes());
            hasher.update(transfer.to.0.to_be_bytes());
        }
        let digest = hasher.finalize();
        hex::encode(&digest[..16])
    }
}

/// Strategy computing the reassignment mapping
pub trait SettlementOutcome: Send + Sync {
    fn kind(&self) -> OutcomeKind;

    fn plan(&self, input: &SettlementInput<'_>, random: &dyn RandomSource) -> TransferPlan;
}

/// Each participant receives the other's proposal
#[derive(Clone, Copy, Debug, Default)]
pub struct SymmetricSwap;

impl SettlementOutcome for SymmetricSwap {
    fn kind(&self) -> OutcomeKind {
        OutcomeKind::Swap
    }

    fn plan(&self, input: &SettlementInput<'_>, _random: &dyn RandomSource) -> TransferPlan {
        let outgoing = input.initiator_items.iter().map(|item| Transfer {
            item: *item,
            from: input.initiator,
            to: input.counterparty,
        });
        let incoming = input.counterparty_items.iter().map(|item| Transfer {
            item: *item,
            from: input.counterparty,
            to: input.initiator,
        });

        TransferPlan {
            session: input.session,
            kind: OutcomeKind::Swap,
            transfers: outgoing.chain(incoming).collect(),
            winner: None,
            loser: None,
        }
    }
}

/// One participant, drawn 50/50, receives the union of both proposals
#[derive(Clone, Copy, Debug, Default)]
pub struct WinnerTakesAll;

impl SettlementOutcome for WinnerTakesAll {
    fn kind(&self) -> OutcomeKind {
        OutcomeKind::WinnerTakesAll
    }

    fn plan(&self, input: &SettlementInput<'_>, random: &dyn RandomSource) -> TransferPlan {
        let (winner, loser, loser_items) = if random.pick_index(2) == 0 {
            (input.initiator, input.counterparty, input.counterparty_items)
        } else {
            (input.counterparty, input.initiator, input.initiator_items)
        };

        TransferPlan {
            session: input.session,
            kind: OutcomeKind::WinnerTakesAll,
            transfers: loser_items
                .iter()
                .map(|item| Transfer {
                    item: *item,
                    from: loser,
                    to: winner,
                })
                .collect(),
            winner: Some(winner),
            loser: Some(loser),
        }
    }
}

/// Summary of a completed settlement
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementReport {
    pub session: SessionId,
    pub kind: OutcomeKind,
    pub winner: Option<ParticipantId>,
    pub loser: Option<ParticipantId>,
    pub transfers: Vec<Transfer>,
    /// Number of items that were at stake, moved or not
    pub items_at_stake: usize,
    pub receipt: String,
    pub settled_at: SystemTime,
}

/// A settlement that stopped before every transfer was applied
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettlementFailure {
    /// Items whose new owner was written
    pub applied: Vec<ItemId>,
    /// Items whose transfer was never written
    pub pending: Vec<ItemId>,
    /// True when nothing was written and all locks are still held
    pub retryable: bool,
    pub reason: String,
}

/// Applies a [`TransferPlan`] to the item store
pub struct SettlementEngine {
    store: Arc<dyn ItemStore>,
    locks: Arc<LockRegistry>,
}

impl SettlementEngine {
    pub fn new(store: Arc<dyn ItemStore>, locks: Arc<LockRegistry>) -> Self {
        Self { store, locks }
    }

    /// Apply `plan` for the items `held` by the session.
    ///
    /// On success every held lock is released. If nothing could be written the
    /// locks are kept so the caller can retry. If some writes went through, or
    /// an item already changed hands, application stops, applied writes stay,
    /// and every remaining lock held by the session is released.
    pub async fn execute(
        &self,
        plan: &TransferPlan,
        held: &[ItemId],
    ) -> std::result::Result<SettlementReport, SettlementFailure> {
        self.preflight(plan).await?;

        let mut applied = Vec::with_capacity(plan.transfers.len());
        for (index, transfer) in plan.transfers.iter().enumerate() {
            if let Err(e) = self.store.set_owner(transfer.item, transfer.to).await {
                let pending: Vec<ItemId> = plan.transfers[index..]
                    .iter()
                    .map(|t| t.item)
                    .collect();
                let retryable = applied.is_empty();

                if retryable {
                    tracing::warn!(
                        "Settlement of {} rejected before any transfer: {}",
                        plan.session,
                        e
                    );
                } else {
                    tracing::error!(
                        "Settlement of {} failed part-way, manual reconciliation may be needed: applied={:?} pending={:?} error={}",
                        plan.session,
                        applied,
                        pending,
                        e
                    );
                    self.locks.release_session(plan.session).await;
                }

                return Err(SettlementFailure {
                    applied,
                    pending,
                    retryable,
                    reason: e.to_string(),
                });
            }

            self.locks
                .release_if_held_by(transfer.item, plan.session)
                .await;
            applied.push(transfer.item);
        }

        // Items that stayed with their owner
        let moved: HashSet<ItemId> = applied.iter().copied().collect();
        for item in held.iter().filter(|item| !moved.contains(item)) {
            self.locks.release_if_held_by(*item, plan.session).await;
        }

        let report = SettlementReport {
            session: plan.session,
            kind: plan.kind,
            winner: plan.winner,
            loser: plan.loser,
            transfers: plan.transfers.clone(),
            items_at_stake: held.len(),
            receipt: plan.receipt(),
            settled_at: SystemTime::now(),
        };

        tracing::info!(
            "Settlement of {} complete ({:?}): winner={:?} loser={:?} items={} receipt={}",
            report.session,
            report.kind,
            report.winner,
            report.loser,
            report.items_at_stake,
            report.receipt
        );

        Ok(report)
    }

    /// Verify every source owner before writing anything.
    ///
    /// A failed read is retryable. An owner that differs from the plan is not:
    /// nothing inside the session can move the item back, so every lock the
    /// session holds is released.
    async fn preflight(&self, plan: &TransferPlan) -> std::result::Result<(), SettlementFailure> {
        let failure = |retryable: bool, reason: String| SettlementFailure {
            applied: Vec::new(),
            pending: plan.transfers.iter().map(|t| t.item).collect(),
            retryable,
            reason,
        };

        for transfer in &plan.transfers {
            let owner = self
                .store
                .get_owner(transfer.item)
                .await
                .map_err(|e| failure(true, e.to_string()))?;
            if owner != transfer.from {
                tracing::warn!(
                    "Settlement of {} aborted: {} is owned by {}, expected {}",
                    plan.session,
                    transfer.item,
                    owner,
                    transfer.from
                );
                self.locks.release_session(plan.session).await;
                return Err(failure(
                    false,
                    format!(
                        "item {} is owned by {}, expected {}",
                        transfer.item, owner, transfer.from
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::FixedRandom;
    use crate::store::MemoryStore;
    use crate::types::Item;

    const ALICE: ParticipantId = ParticipantId(1);
    const BOB: ParticipantId = ParticipantId(2);
    const SESSION: SessionId = SessionId(1);

    fn input<'a>(alice: &'a [ItemId], bob: &'a [ItemId]) -> SettlementInput<'a> {
        SettlementInput {
            session: SESSION,
            initiator: ALICE,
            counterparty: BOB,
            initiator_items: alice,
            counterparty_items: bob,
        }
    }

    async fn setup(alice: &[u64], bob: &[u64]) -> (Arc<MemoryStore>, Arc<LockRegistry>, SettlementEngine) {
        let store = Arc::new(MemoryStore::new());
        for id in alice {
            store.insert_item(Item::new(ItemId(*id), ALICE, "Italy"));
        }
        for id in bob {
            store.insert_item(Item::new(ItemId(*id), BOB, "Spain"));
        }
        let locks = Arc::new(LockRegistry::new(store.clone()));
        for id in alice.iter().chain(bob) {
            locks.acquire(ItemId(*id), SESSION).await.unwrap();
        }
        let engine = SettlementEngine::new(store.clone(), locks.clone());
        (store, locks, engine)
    }

    #[test]
    fn test_swap_plan() {
        let plan = SymmetricSwap.plan(&input(&[ItemId(1)], &[ItemId(2)]), &FixedRandom(0));

        assert_eq!(plan.kind, OutcomeKind::Swap);
        assert_eq!(
            plan.transfers,
            vec![
                Transfer { item: ItemId(1), from: ALICE, to: BOB },
                Transfer { item: ItemId(2), from: BOB, to: ALICE },
            ]
        );
        assert_eq!(plan.winner, None);
    }

    #[test]
    fn test_winner_takes_all_plan() {
        let alice = [ItemId(1)];
        let bob = [ItemId(2), ItemId(3)];

        let plan = WinnerTakesAll.plan(&input(&alice, &bob), &FixedRandom(0));
        assert_eq!(plan.winner, Some(ALICE));
        assert_eq!(plan.loser, Some(BOB));
        assert!(plan.transfers.iter().all(|t| t.to == ALICE && t.from == BOB));
        assert_eq!(plan.transfers.len(), 2);

        let plan = WinnerTakesAll.plan(&input(&alice, &bob), &FixedRandom(1));
        assert_eq!(plan.winner, Some(BOB));
        assert_eq!(plan.transfers, vec![Transfer { item: ItemId(1), from: ALICE, to: BOB }]);
    }

    #[test]
    fn test_receipt_depends_on_mapping() {
        let a = SymmetricSwap.plan(&input(&[ItemId(1)], &[ItemId(2)]), &FixedRandom(0));
        let b = SymmetricSwap.plan(&input(&[ItemId(1)], &[ItemId(3)]), &FixedRandom(0));

        assert_eq!(a.receipt(), a.clone().receipt());
        assert_ne!(a.receipt(), b.receipt());
        assert_eq!(a.receipt().len(), 32);
    }

    #[tokio::test]
    async fn test_execute_swap() {
        let (store, locks, engine) = setup(&[1], &[2]).await;
        let plan = SymmetricSwap.plan(&input(&[ItemId(1)], &[ItemId(2)]), &FixedRandom(0));

        let report = engine.execute(&plan, &[ItemId(1), ItemId(2)]).await.unwrap();

        assert_eq!(report.items_at_stake, 2);
        assert_eq!(store.item(ItemId(1)).unwrap().owner, BOB);
        assert_eq!(store.item(ItemId(2)).unwrap().owner, ALICE);
        assert_eq!(locks.locked_count(), 0);
    }

    #[tokio::test]
    async fn test_execute_releases_unmoved_items() {
        let (store, locks, engine) = setup(&[1], &[2, 3]).await;
        let held = [ItemId(1), ItemId(2), ItemId(3)];
        let plan = WinnerTakesAll.plan(&input(&held[..1], &held[1..]), &FixedRandom(1));

        engine.execute(&plan, &held).await.unwrap();

        assert_eq!(store.owned_ids(BOB), held.to_vec());
        assert!(store.owned_ids(ALICE).is_empty());
        assert_eq!(locks.locked_count(), 0);
    }

    #[tokio::test]
    async fn test_first_write_failure_keeps_locks() {
        let (store, locks, engine) = setup(&[1], &[2]).await;
        store.reject_writes_for(ItemId(1));
        let plan = SymmetricSwap.plan(&input(&[ItemId(1)], &[ItemId(2)]), &FixedRandom(0));

        let failure = engine.execute(&plan, &[ItemId(1), ItemId(2)]).await.unwrap_err();

        assert!(failure.retryable);
        assert!(failure.applied.is_empty());
        assert_eq!(failure.pending, vec![ItemId(1), ItemId(2)]);
        assert_eq!(locks.locked_count(), 2);
        assert_eq!(store.item(ItemId(2)).unwrap().owner, BOB);
    }

    #[tokio::test]
    async fn test_partial_failure_releases_everything() {
        let (store, locks, engine) = setup(&[1], &[2]).await;
        store.reject_writes_for(ItemId(2));
        let plan = SymmetricSwap.plan(&input(&[ItemId(1)], &[ItemId(2)]), &FixedRandom(0));

        let failure = engine.execute(&plan, &[ItemId(1), ItemId(2)]).await.unwrap_err();

        assert!(!failure.retryable);
        assert_eq!(failure.applied, vec![ItemId(1)]);
        assert_eq!(failure.pending, vec![ItemId(2)]);
        // Applied write stays, no compensation
        assert_eq!(store.item(ItemId(1)).unwrap().owner, BOB);
        assert_eq!(store.item(ItemId(2)).unwrap().owner, BOB);
        assert_eq!(locks.locked_count(), 0);
    }

    #[tokio::test]
    async fn test_preflight_detects_owner_drift() {
        let (store, locks, engine) = setup(&[1], &[2]).await;
        store.insert_item(Item::new(ItemId(1), ParticipantId(99), "Italy"));
        let plan = SymmetricSwap.plan(&input(&[ItemId(1)], &[ItemId(2)]), &FixedRandom(0));

        let failure = engine.execute(&plan, &[ItemId(1), ItemId(2)]).await.unwrap_err();

        // Nothing inside the session can undo the drift, so retrying is pointless
        assert!(!failure.retryable);
        assert!(failure.applied.is_empty());
        assert_eq!(store.item(ItemId(1)).unwrap().owner, ParticipantId(99));
        assert_eq!(store.item(ItemId(2)).unwrap().owner, BOB);
        assert_eq!(locks.locked_count(), 0);
    }

    #[tokio::test]
    async fn test_preflight_read_failure_is_retryable() {
        let (store, locks, engine) = setup(&[1], &[2]).await;
        store.delete_item(ItemId(2)).await.unwrap();
        let plan = SymmetricSwap.plan(&input(&[ItemId(1)], &[ItemId(2)]), &FixedRandom(0));

        let failure = engine.execute(&plan, &[ItemId(1), ItemId(2)]).await.unwrap_err();

        assert!(failure.retryable);
        assert_eq!(store.item(ItemId(1)).unwrap().owner, ALICE);
        assert_eq!(locks.locked_count(), 2);
    }
}
