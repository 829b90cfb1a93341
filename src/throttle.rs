//! Per-participant command throttle

use crate::error::{ExchangeError, Result};
use crate::types::ParticipantId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Enforces a minimum delay between two throttled commands of one participant.
///
/// Owned by the engine; entries older than the cooldown are pruned on use.
pub struct CommandThrottle {
    cooldown: Duration,
    last_used: Mutex<HashMap<ParticipantId, Instant>>,
}

impl CommandThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_used: Mutex::new(HashMap::new()),
        }
    }

    fn last_used(&self) -> MutexGuard<'_, HashMap<ParticipantId, Instant>> {
        self.last_used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Time left before `participant` may run a throttled command again
    pub fn remaining(&self, participant: ParticipantId) -> Option<Duration> {
        let last = *self.last_used().get(&participant)?;
        let elapsed = last.elapsed();
        (elapsed < self.cooldown).then(|| self.cooldown - elapsed)
    }

    /// Check the throttle and record a use in one step
    pub fn check_and_record(&self, participant: ParticipantId) -> Result<()> {
        if self.cooldown.is_zero() {
            return Ok(());
        }

        let now = Instant::now();
        let mut last_used = self.last_used();
        if let Some(last) = last_used.get(&participant) {
            let elapsed = now.duration_since(*last);
            if elapsed < self.cooldown {
                return Err(ExchangeError::Throttled {
                    remaining: self.cooldown - elapsed,
                });
            }
        }

        let cooldown = self.cooldown;
        last_used.retain(|_, last| now.duration_since(*last) < cooldown);
        last_used.insert(participant, now);
        Ok(())
    }

    /// Forget a participant's last use, e.g. when the throttled command failed
    pub fn forget(&self, participant: ParticipantId) {
        self.last_used().remove(&participant);
    }

    pub fn tracked(&self) -> usize {
        self.last_used().len()
    }
}
