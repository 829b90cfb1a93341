//! Randomness used by stochastic settlement outcomes

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, PoisonError};

/// Source of uniform choices, injectable so outcomes can be made deterministic
pub trait RandomSource: Send + Sync {
    /// Uniform index in `0..len`. Returns 0 when `len` is 0.
    fn pick_index(&self, len: usize) -> usize;
}

/// Thread-local RNG
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn pick_index(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..len)
    }
}

/// Reproducible RNG seeded once at construction
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn pick_index(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..len)
    }
}

/// Always picks the same index (modulo `len`)
#[derive(Clone, Copy, Debug)]
pub struct FixedRandom(pub usize);

impl RandomSource for FixedRandom {
    fn pick_index(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        self.0 % len
    }
}
