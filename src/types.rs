//! Core types used throughout ballbet

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Identifier of a collectible instance (a "countryball")
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:X}", self.0)
    }
}

/// Identifier of a player on the chat platform
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(pub u64);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a negotiation session, unique for the lifetime of the process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session_{}", self.0)
    }
}

/// Discovery scope of a session: the guild and channel it was started in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub guild: u64,
    pub channel: u64,
}

impl ScopeKey {
    pub fn new(guild: u64, channel: u64) -> Self {
        Self { guild, channel }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.guild, self.channel)
    }
}

/// Whether a participant must wait out the confirmation cooldown
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownPolicy {
    #[default]
    Cooldown,
    Bypass,
}

impl CooldownPolicy {
    pub fn is_enforced(self) -> bool {
        matches!(self, CooldownPolicy::Cooldown)
    }
}

/// A uniquely-owned, transferable collectible instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub owner: ParticipantId,
    /// Catalog name, only used for display
    pub name: String,
    pub tradeable: bool,
    pub favorite: bool,
    /// Set while the item is held by a negotiation session
    pub locked_at: Option<SystemTime>,
}

impl Item {
    pub fn new(id: ItemId, owner: ParticipantId, name: impl Into<String>) -> Self {
        Self {
            id,
            owner,
            name: name.into(),
            tradeable: true,
            favorite: false,
            locked_at: None,
        }
    }

    pub fn untradeable(mut self) -> Self {
        self.tradeable = false;
        self
    }

    pub fn favorited(mut self) -> Self {
        self.favorite = true;
        self
    }

    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }
}

/// A player record as seen by the negotiation core
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub handle: String,
    pub cooldown_policy: CooldownPolicy,
    pub bot: bool,
    pub blacklisted: bool,
}

impl Participant {
    pub fn new(id: ParticipantId, handle: impl Into<String>) -> Self {
        Self {
            id,
            handle: handle.into(),
            cooldown_policy: CooldownPolicy::default(),
            bot: false,
            blacklisted: false,
        }
    }

    pub fn with_cooldown_policy(mut self, policy: CooldownPolicy) -> Self {
        self.cooldown_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_id_display_is_hex() {
        assert_eq!(ItemId(255).to_string(), "#FF");
        assert_eq!(ItemId(4096).to_string(), "#1000");
    }

    #[test]
    fn test_session_id_display() {
        assert_eq!(SessionId(7).to_string(), "session_7");
    }

    #[test]
    fn test_item_builders() {
        let item = Item::new(ItemId(1), ParticipantId(10), "France")
            .untradeable()
            .favorited();

        assert!(!item.tradeable);
        assert!(item.favorite);
        assert!(!item.is_locked());
    }

    #[test]
    fn test_cooldown_policy_default_is_enforced() {
        let participant = Participant::new(ParticipantId(1), "alice");
        assert!(participant.cooldown_policy.is_enforced());

        let bypass = participant.with_cooldown_policy(CooldownPolicy::Bypass);
        assert!(!bypass.cooldown_policy.is_enforced());
    }

    #[test]
    fn test_cooldown_policy_serialization() {
        let serialized = serde_json::to_string(&CooldownPolicy::Bypass).unwrap();
        assert_eq!(serialized, "\"bypass\"");
    }
}
