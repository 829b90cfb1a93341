//! Runtime configuration for the negotiation engine

use crate::error::{ExchangeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Timing and sizing knobs; every field has a default so partial files load
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Delay between both sides locking and confirmation being allowed
    pub cooldown_secs: u64,
    /// How often the supervisor republishes session state
    pub refresh_interval_secs: u64,
    /// Session lifetime before it is force-cancelled
    pub inactivity_timeout_secs: u64,
    /// Minimum delay between two negotiations opened by the same participant (0 disables)
    pub command_cooldown_secs: u64,
    /// Maximum number of items on one side of a negotiation
    pub max_proposal_items: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 10,
            refresh_interval_secs: 15,
            inactivity_timeout_secs: 15 * 60,
            command_cooldown_secs: 5,
            max_proposal_items: 500,
        }
    }
}

impl ExchangeConfig {
    /// Load from a JSON file and validate
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ExchangeError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: ExchangeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval_secs == 0 {
            return Err(ExchangeError::InvalidConfig(
                "refresh_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.inactivity_timeout_secs < self.refresh_interval_secs {
            return Err(ExchangeError::InvalidConfig(format!(
                "inactivity_timeout_secs ({}) is shorter than refresh_interval_secs ({})",
                self.inactivity_timeout_secs, self.refresh_interval_secs
            )));
        }
        if self.max_proposal_items == 0 {
            return Err(ExchangeError::InvalidConfig(
                "max_proposal_items must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn command_cooldown(&self) -> Duration {
        Duration::from_secs(self.command_cooldown_secs)
    }
}
