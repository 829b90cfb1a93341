//! Ballbet application: drives the engine against an in-memory store

use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, Result};
use crate::negotiation::{
    ConfirmOutcome, LockAck, NegotiationEngine, SessionHandle, SessionSnapshot,
};
use crate::random::{RandomSource, SeededRandom, ThreadRandom};
use crate::settlement::{OutcomeKind, SettlementReport};
use crate::store::MemoryStore;
use crate::types::{CooldownPolicy, Item, ItemId, Participant, ParticipantId, ScopeKey};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const TEAMS: [&str; 12] = [
    "Brazil", "Argentina", "France", "Germany", "Spain", "Italy", "England", "Portugal",
    "Netherlands", "Uruguay", "Croatia", "Belgium",
];

const ALICE: ParticipantId = ParticipantId(1);
const BOB: ParticipantId = ParticipantId(2);

/// Current owner of one item, for reporting
#[derive(Clone, Debug, Serialize)]
pub struct ItemOwner {
    pub item: ItemId,
    pub name: String,
    pub owner: ParticipantId,
    pub locked: bool,
}

/// What a simulated negotiation ended with
#[derive(Clone, Debug, Serialize)]
pub struct SimulationSummary {
    pub settlement: Option<SettlementReport>,
    pub failure: Option<String>,
    pub snapshot: SessionSnapshot,
    pub ownership: Vec<ItemOwner>,
}

/// A scripted sequence of actions against a fresh store
#[derive(Clone, Debug, Deserialize)]
pub struct ReplayScript {
    #[serde(default)]
    pub outcome: Option<OutcomeKind>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_scope")]
    pub scope: ScopeKey,
    pub players: Vec<ScriptPlayer>,
    #[serde(default)]
    pub blocks: Vec<(ParticipantId, ParticipantId)>,
    pub actions: Vec<ScriptAction>,
}

fn default_scope() -> ScopeKey {
    ScopeKey::new(1, 1)
}

fn default_tradeable() -> bool {
    true
}

impl ReplayScript {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ScriptPlayer {
    pub id: ParticipantId,
    pub handle: String,
    #[serde(default)]
    pub cooldown_policy: CooldownPolicy,
    #[serde(default)]
    pub bot: bool,
    #[serde(default)]
    pub blacklisted: bool,
    #[serde(default)]
    pub items: Vec<ScriptItem>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ScriptItem {
    pub id: ItemId,
    pub name: String,
    #[serde(default = "default_tradeable")]
    pub tradeable: bool,
    #[serde(default)]
    pub favorite: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScriptAction {
    Open {
        initiator: ParticipantId,
        counterparty: ParticipantId,
    },
    Propose {
        participant: ParticipantId,
        items: Vec<ItemId>,
    },
    Withdraw {
        participant: ParticipantId,
        item: ItemId,
    },
    Clear {
        participant: ParticipantId,
    },
    Lock {
        participant: ParticipantId,
    },
    Confirm {
        participant: ParticipantId,
    },
    Cancel {
        participant: ParticipantId,
    },
    Describe {
        participant: ParticipantId,
    },
    Wait {
        secs: u64,
    },
}

/// Result of one replayed action
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StepResult {
    Ok { detail: String },
    Err { error: String, retryable: bool },
}

#[derive(Clone, Debug, Serialize)]
pub struct ReplayStep {
    pub index: usize,
    pub action: String,
    #[serde(flatten)]
    pub result: StepResult,
}

/// Main Ballbet application
pub struct BallbetApp {
    store: Arc<MemoryStore>,
    engine: NegotiationEngine,
}

impl BallbetApp {
    /// Create an application over an empty in-memory store
    pub fn new(config: ExchangeConfig, outcome: OutcomeKind, seed: Option<u64>) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let random: Arc<dyn RandomSource> = match seed {
            Some(seed) => Arc::new(SeededRandom::new(seed)),
            None => Arc::new(ThreadRandom),
        };
        let engine = NegotiationEngine::builder(store.clone(), store.clone())
            .config(config)
            .outcome(outcome.strategy())
            .random(random)
            .build()?;

        Ok(Self { store, engine })
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn engine(&self) -> &NegotiationEngine {
        &self.engine
    }

    /// Run open, propose, lock and confirm for two players with `items_each`
    /// items apiece. A retryable settlement failure is retried once after the
    /// injected fault is cleared.
    pub async fn simulate(
        &self,
        items_each: usize,
        fail_item: Option<ItemId>,
    ) -> Result<SimulationSummary> {
        self.store.insert_participant(Participant::new(ALICE, "alice"));
        self.store.insert_participant(Participant::new(BOB, "bob"));

        let mut alice_items = Vec::with_capacity(items_each);
        let mut bob_items = Vec::with_capacity(items_each);
        for i in 0..items_each as u64 {
            let name = TEAMS[i as usize % TEAMS.len()];
            let (a, b) = (ItemId(i + 1), ItemId(i + 101));
            self.store.insert_item(Item::new(a, ALICE, name));
            self.store.insert_item(Item::new(b, BOB, name));
            alice_items.push(a);
            bob_items.push(b);
        }
        if let Some(item) = fail_item {
            tracing::info!("Injecting write failure for {}", item);
            self.store.reject_writes_for(item);
        }

        let scope = default_scope();
        let handle = self.engine.open_negotiation(scope, ALICE, BOB).await?;
        self.engine.propose_items(&handle, ALICE, &alice_items).await?;
        self.engine.propose_items(&handle, BOB, &bob_items).await?;
        self.engine.lock_side(&handle, ALICE).await?;
        if let LockAck::BothLocked { cooldown } = self.engine.lock_side(&handle, BOB).await? {
            tracing::info!("Both sides locked, waiting {:?} before confirming", cooldown);
            tokio::time::sleep(cooldown).await;
        }

        let mut result = self.confirm_both(&handle).await;
        let retryable = matches!(&result, Err(e) if e.is_retryable());
        if let (true, Some(item)) = (retryable, fail_item) {
            tracing::warn!("Settlement rejected, clearing the fault on {} and retrying", item);
            self.store.accept_writes_for(item);
            result = self.confirm_both(&handle).await;
        }

        let (settlement, failure) = match result {
            Ok(report) => (Some(report), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let mut items = alice_items;
        items.extend(bob_items);

        Ok(SimulationSummary {
            settlement,
            failure,
            snapshot: self.engine.describe(&handle).await,
            ownership: self.ownership(&items),
        })
    }

    async fn confirm_both(&self, handle: &SessionHandle) -> Result<SettlementReport> {
        self.engine.confirm(handle, ALICE).await?;
        match self.engine.confirm(handle, BOB).await? {
            ConfirmOutcome::Settled(report) => Ok(report),
            ConfirmOutcome::Waiting => Err(ExchangeError::Internal(format!(
                "{} still waiting after both confirmations",
                handle.id()
            ))),
        }
    }

    fn ownership(&self, items: &[ItemId]) -> Vec<ItemOwner> {
        items
            .iter()
            .filter_map(|id| self.store.item(*id))
            .map(|item| ItemOwner {
                locked: item.is_locked(),
                item: item.id,
                name: item.name,
                owner: item.owner,
            })
            .collect()
    }

    /// Seed the store from `script` and run its actions in order. A failing
    /// action is recorded and the replay carries on.
    pub async fn replay(&self, script: &ReplayScript) -> Vec<ReplayStep> {
        for player in &script.players {
            let mut participant = Participant::new(player.id, player.handle.clone())
                .with_cooldown_policy(player.cooldown_policy);
            participant.bot = player.bot;
            participant.blacklisted = player.blacklisted;
            self.store.insert_participant(participant);

            for entry in &player.items {
                let mut item = Item::new(entry.id, player.id, entry.name.clone());
                item.tradeable = entry.tradeable;
                item.favorite = entry.favorite;
                self.store.insert_item(item);
            }
        }
        for (blocker, blocked) in &script.blocks {
            self.store.block(*blocker, *blocked);
        }

        let mut steps = Vec::with_capacity(script.actions.len());
        for (index, action) in script.actions.iter().enumerate() {
            let result = match self.run_action(script.scope, action).await {
                Ok(detail) => StepResult::Ok { detail },
                Err(e) => StepResult::Err {
                    retryable: e.is_retryable(),
                    error: e.to_string(),
                },
            };
            tracing::debug!("Step {} {:?}: {:?}", index, action, result);
            steps.push(ReplayStep {
                index,
                action: format!("{:?}", action),
                result,
            });
        }
        steps
    }

    async fn run_action(&self, scope: ScopeKey, action: &ScriptAction) -> Result<String> {
        let engine = &self.engine;
        match action {
            ScriptAction::Open {
                initiator,
                counterparty,
            } => {
                let handle = engine
                    .open_negotiation(scope, *initiator, *counterparty)
                    .await?;
                Ok(format!("opened {}", handle.id()))
            }
            ScriptAction::Propose { participant, items } => {
                let handle = engine.session_for(scope, *participant)?;
                let acks = engine.propose_items(&handle, *participant, items).await?;
                let favorites = acks.iter().filter(|ack| ack.favorite).count();
                Ok(format!("proposed {} items ({} favorites)", acks.len(), favorites))
            }
            ScriptAction::Withdraw { participant, item } => {
                let handle = engine.session_for(scope, *participant)?;
                engine.withdraw_item(&handle, *participant, *item).await?;
                Ok(format!("withdrew {}", item))
            }
            ScriptAction::Clear { participant } => {
                let handle = engine.session_for(scope, *participant)?;
                let removed = engine.clear_proposal(&handle, *participant).await?;
                Ok(format!("cleared {} items", removed.len()))
            }
            ScriptAction::Lock { participant } => {
                let handle = engine.session_for(scope, *participant)?;
                match engine.lock_side(&handle, *participant).await? {
                    LockAck::Waiting => Ok("locked, waiting for the other side".to_string()),
                    LockAck::BothLocked { cooldown } => {
                        Ok(format!("both locked, cooldown {:?}", cooldown))
                    }
                }
            }
            ScriptAction::Confirm { participant } => {
                let handle = engine.session_for(scope, *participant)?;
                match engine.confirm(&handle, *participant).await? {
                    ConfirmOutcome::Waiting => Ok("accepted, waiting".to_string()),
                    ConfirmOutcome::Settled(report) => Ok(format!(
                        "settled: {} transfers, winner {:?}, receipt {}",
                        report.transfers.len(),
                        report.winner,
                        report.receipt
                    )),
                }
            }
            ScriptAction::Cancel { participant } => {
                let handle = engine.session_for(scope, *participant)?;
                engine.cancel(&handle, *participant).await?;
                Ok(format!("cancelled {}", handle.id()))
            }
            ScriptAction::Describe { participant } => {
                let handle = engine.session_for(scope, *participant)?;
                let snapshot = engine.describe(&handle).await;
                Ok(serde_json::to_string(&snapshot)?)
            }
            ScriptAction::Wait { secs } => {
                tokio::time::sleep(Duration::from_secs(*secs)).await;
                Ok(format!("waited {}s", secs))
            }
        }
    }
}
