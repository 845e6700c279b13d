//! Seed selection for generation requests.
//!
//! A requested seed of [`RANDOM_SEED`] is replaced by a fresh value from a
//! [`SeedSource`]; anything non-negative passes through untouched. Swap the
//! source for [`FixedSeedSource`] or [`SequenceSeedSource`] to make seeds
//! deterministic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;

/// Sentinel asking for a random seed.
pub const RANDOM_SEED: i64 = -1;

/// Largest seed handed to the server.
pub const MAX_SEED: u64 = i64::MAX as u64;

/// Source of fresh seeds.
pub trait SeedSource: Send + Sync {
    /// Produce a seed in `0..=MAX_SEED`.
    fn next_seed(&self) -> u64;
}

/// Uniformly random seeds from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngSource;

impl SeedSource for ThreadRngSource {
    fn next_seed(&self) -> u64 {
        rand::rng().random_range(0..=MAX_SEED)
    }
}

/// Always yields the same seed.
#[derive(Debug, Clone, Copy)]
pub struct FixedSeedSource(pub u64);

impl SeedSource for FixedSeedSource {
    fn next_seed(&self) -> u64 {
        self.0.min(MAX_SEED)
    }
}

/// Yields `start`, `start + 1`, ... wrapping inside the accepted range.
#[derive(Debug)]
pub struct SequenceSeedSource {
    next: AtomicU64,
}

impl SequenceSeedSource {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start.min(MAX_SEED)),
        }
    }
}

impl SeedSource for SequenceSeedSource {
    fn next_seed(&self) -> u64 {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        n % (MAX_SEED + 1)
    }
}

/// Decides between a caller-supplied seed and a synthesized one.
#[derive(Clone)]
pub struct SeedPolicy {
    source: Arc<dyn SeedSource>,
}

impl Default for SeedPolicy {
    fn default() -> Self {
        Self::new(ThreadRngSource)
    }
}

impl std::fmt::Debug for SeedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedPolicy").finish_non_exhaustive()
    }
}

impl SeedPolicy {
    pub fn new(source: impl SeedSource + 'static) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    /// Resolve a requested seed to the concrete value sent to the server.
    ///
    /// Negative values (the [`RANDOM_SEED`] sentinel) draw from the source.
    pub fn resolve_seed(&self, requested: i64) -> u64 {
        if requested < 0 {
            self.source.next_seed()
        } else {
            requested as u64
        }
    }
}

/// Resolve a seed with the default random source.
pub fn resolve_seed(requested: i64) -> u64 {
    SeedPolicy::default().resolve_seed(requested)
}
