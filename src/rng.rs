//! Seedable randomness for all games.
//!
//! One source per process, seeded from OS entropy at boot (or from a fixed
//! seed in tests). Crash points are sampled from a dedicated per-round seed
//! so each round's `(seed, crash_point)` pair can be logged and re-derived.

use crate::money::Mult;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use std::sync::Mutex;
use tracing::info;

#[derive(Debug)]
pub struct GameRng {
    inner: Mutex<StdRng>,
}

impl GameRng {
    /// Seed from OS entropy.
    pub fn from_entropy() -> Self {
        let mut seed = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let seed = u64::from_le_bytes(seed);
        info!(seed, "game rng seeded from OS entropy");
        Self::seeded(seed)
    }

    /// Deterministic source for tests and replay.
    pub fn seeded(seed: u64) -> Self {
        Self {
            inner: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Uniform integer in `[0, n)`. `n` must be nonzero.
    pub fn uniform(&self, n: usize) -> usize {
        self.inner.lock().unwrap().gen_range(0..n)
    }

    /// Fair coin.
    pub fn flip(&self) -> bool {
        self.inner.lock().unwrap().gen_bool(0.5)
    }

    /// Fisher-Yates shuffle in place.
    pub fn shuffle<T>(&self, items: &mut [T]) {
        items.shuffle(&mut *self.inner.lock().unwrap());
    }

    /// Draw a fresh round seed from the master source.
    pub fn round_seed(&self) -> u64 {
        self.inner.lock().unwrap().next_u64()
    }

    /// Sample a crash point for a new round. Returns the round seed alongside
    /// the sealed crash point; both are logged for post-hoc verification.
    pub fn crash_point(&self, edge_bps: u32) -> (u64, Mult) {
        let seed = self.round_seed();
        let point = crash_point_from_seed(seed, edge_bps);
        info!(seed, crash_point = %point, "crash round sealed");
        (seed, point)
    }
}

/// Derive a crash point from a round seed.
///
/// With `u` uniform in (0, 1], `m = (1 - edge) / u` gives
/// `P(m >= M) = (1 - edge) / M` for `M >= 1`, the declared house-edge
/// distribution. Values below 1.00 (probability `edge`) become an instant
/// crash at 1.00; the result is truncated to two decimals.
pub fn crash_point_from_seed(seed: u64, edge_bps: u32) -> Mult {
    let mut rng = StdRng::seed_from_u64(seed);
    // gen::<f64>() is [0, 1); flip to (0, 1] so we never divide by zero.
    let u = 1.0 - rng.gen::<f64>();
    let kept = 1.0 - edge_bps as f64 / 10_000.0;
    Mult::from_f64_truncated(kept / u)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_in_range() {
        let rng = GameRng::seeded(7);
        for _ in 0..1_000 {
            assert!(rng.uniform(52) < 52);
        }
    }

    #[test]
    fn test_shuffle_preserves_elements() {
        let rng = GameRng::seeded(42);
        let mut cards: Vec<u8> = (0..108).collect();
        rng.shuffle(&mut cards);
        let mut sorted = cards.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..108).collect::<Vec<u8>>());
    }

    #[test]
    fn test_crash_point_floor() {
        for seed in 0..500 {
            let point = crash_point_from_seed(seed, 300);
            assert!(point >= Mult::ONE);
        }
    }

    #[test]
    fn test_crash_point_deterministic() {
        let a = crash_point_from_seed(12345, 300);
        let b = crash_point_from_seed(12345, 300);
        assert_eq!(a, b);
    }

    #[test]
    fn test_crash_distribution_tail() {
        // P(m >= 2.00) should be about (1 - 0.03) / 2 = 48.5%.
        let hits = (0..20_000)
            .filter(|&seed| crash_point_from_seed(seed, 300) >= Mult(200))
            .count();
        let freq = hits as f64 / 20_000.0;
        assert!((freq - 0.485).abs() < 0.02, "tail frequency {}", freq);
    }
}
