//! Two independent hash projections (`h1`, `h2`) shared by both table backends.
//!
//! `h1` selects the primary bucket/slot; `h2` selects the sub-group used by
//! [`crate::table::chained::ChainedTable`]. Both are deterministic within a
//! process (no cross-process stability is required or promised).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const GOLDEN: u64 = 0x9E3779B97F4A7C15;

fn mix(x: u64) -> u64 {
    x ^ (x >> 16)
}

/// Both hash projections deliberately use `DefaultHasher`'s fixed (`0, 0`)
/// keys rather than a per-instance randomized `BuildHasher`: `KeyHasher` is
/// reconstructed with `Default::default()` after every snapshot deserialize
/// (it is `#[serde(skip)]` on both table structs, since hasher state itself
/// is never part of the wire format), and the reloaded table keeps the
/// bucket/slot placement computed by the hasher that existed at save time.
/// A randomized-per-instance hasher would silently relocate every key's
/// ideal bucket on reload and break lookups; a fixed-key hasher makes `h1`/
/// `h2` reproducible across any number of reconstructions, in this process
/// or another, which is exactly what "deterministic within a process" plus
/// "keys, not hashes, are what snapshots store" requires in practice.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyHasher;

impl KeyHasher {
    pub fn new() -> Self {
        KeyHasher
    }

    /// Primary hash used to pick a bucket/slot.
    pub fn h1<K: Hash + ?Sized>(&self, key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Secondary hash used to pick a sub-group within a bucket, derived from
    /// `h1` folded with the golden-ratio constant, matching the documented
    /// `h2(key) = mix(hash((key, GOLDEN)))` derivation.
    pub fn h2<K: Hash + ?Sized>(&self, key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        GOLDEN.hash(&mut hasher);
        mix(hasher.finish())
    }
}

/// Round `value` up to the next power of two (minimum 1).
pub fn next_power_of_two(value: usize) -> usize {
    if value <= 1 {
        1
    } else {
        value.next_power_of_two()
    }
}

pub fn is_power_of_two(value: usize) -> bool {
    value != 0 && (value & (value - 1)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_power_of_two_rounds_up() {
        assert_eq!(next_power_of_two(0), 1);
        assert_eq!(next_power_of_two(1), 1);
        assert_eq!(next_power_of_two(5), 8);
        assert_eq!(next_power_of_two(64), 64);
    }

    #[test]
    fn h1_is_stable_within_process() {
        let hasher = KeyHasher::new();
        let a = hasher.h1(&"hello");
        let b = hasher.h1(&"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn h2_differs_from_h1_generally() {
        let hasher = KeyHasher::new();
        assert_ne!(hasher.h1(&"key"), hasher.h2(&"key"));
    }
}
