//! Deterministic shuffling.
//!
//! Seeds are arbitrary strings; the same seed always yields the same
//! permutation so replicas that agree on a seed agree on the order.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Build a ChaCha8 generator from a string seed.
pub fn seeded_rng(seed: &str) -> ChaCha8Rng {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    ChaCha8Rng::seed_from_u64(hasher.finish())
}

/// Fisher-Yates shuffle, seeded when a seed is given, thread-local otherwise.
pub fn shuffle_slice<T>(items: &mut [T], seed: Option<&str>) {
    match seed {
        Some(seed) => items.shuffle(&mut seeded_rng(seed)),
        None => items.shuffle(&mut rand::thread_rng()),
    }
}
