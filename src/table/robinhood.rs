//! Power-of-two open-addressed table with Robin Hood displacement and
//! tombstones.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::hash::{is_power_of_two, KeyHasher};
use crate::table::{HealthSignals, Key, Table, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Slot {
    Empty,
    Tombstone,
    Occupied(Key, Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobinHoodTable {
    cap: usize,
    mask: usize,
    size: usize,
    tombstones: usize,
    table: Vec<Slot>,
    #[serde(skip, default)]
    hasher: KeyHasher,
}

const MAX_LOAD_FACTOR: f64 = 0.85;
const PROBE_SAMPLE_STRIDE: usize = 8;

impl RobinHoodTable {
    pub fn new(initial_capacity: usize) -> Result<Self> {
        if !is_power_of_two(initial_capacity) {
            return Err(EngineError::BadConfig(
                "initial_capacity must be a positive power of two".into(),
            ));
        }
        Ok(RobinHoodTable {
            cap: initial_capacity,
            mask: initial_capacity - 1,
            size: 0,
            tombstones: 0,
            table: (0..initial_capacity).map(|_| Slot::Empty).collect(),
            hasher: KeyHasher::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    pub fn load_factor(&self) -> f64 {
        if self.cap == 0 {
            0.0
        } else {
            self.size as f64 / self.cap as f64
        }
    }

    pub fn tombstone_ratio(&self) -> f64 {
        if self.cap == 0 {
            0.0
        } else {
            self.tombstones as f64 / self.cap as f64
        }
    }

    fn ideal(&self, key: &[u8]) -> usize {
        (self.hasher.h1(key) as usize) & self.mask
    }

    fn probe_distance(&self, ideal_idx: usize, cur_idx: usize) -> usize {
        if cur_idx >= ideal_idx {
            cur_idx - ideal_idx
        } else {
            (cur_idx + self.cap) - ideal_idx
        }
    }

    fn resize(&mut self, new_cap: usize) {
        let old = std::mem::replace(&mut self.table, (0..new_cap).map(|_| Slot::Empty).collect());
        self.cap = new_cap;
        self.mask = new_cap - 1;
        self.size = 0;
        self.tombstones = 0;
        for slot in old {
            if let Slot::Occupied(key, value) = slot {
                self.put(key, value);
            }
        }
    }

    /// Rebuild at the current capacity, dropping tombstones. Idempotent.
    pub fn compact(&mut self) {
        self.resize(self.cap);
    }

    /// Sample every `PROBE_SAMPLE_STRIDE`-th slot and average the probe
    /// distance of occupied samples; a cheap, biased control-loop signal.
    pub fn avg_probe_estimate(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        let mut total = 0usize;
        let mut count = 0usize;
        let mut i = 0;
        while i < self.cap {
            if let Slot::Occupied(key, _) = &self.table[i] {
                let ideal = self.ideal(key);
                total += self.probe_distance(ideal, i);
                count += 1;
            }
            i += PROBE_SAMPLE_STRIDE;
        }
        total as f64 / count.max(1) as f64
    }

    /// Distance histogram over every occupied slot, as `(distance, count)` pairs sorted by distance.
    pub fn probe_histogram(&self) -> Vec<(usize, usize)> {
        let mut histogram = std::collections::BTreeMap::new();
        for (idx, slot) in self.table.iter().enumerate() {
            if let Slot::Occupied(key, _) = slot {
                let ideal = self.ideal(key);
                let dist = self.probe_distance(ideal, idx);
                *histogram.entry(dist).or_insert(0usize) += 1;
            }
        }
        histogram.into_iter().collect()
    }

    /// `1` for occupied, `0` otherwise, in slot order — the raw series the
    /// key heatmap aggregates.
    pub fn occupancy_series(&self) -> Vec<usize> {
        self.table
            .iter()
            .map(|s| if matches!(s, Slot::Occupied(..)) { 1 } else { 0 })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Key, Value)> + '_ {
        self.table.iter().filter_map(|slot| match slot {
            Slot::Occupied(k, v) => Some((k.clone(), v.clone())),
            _ => None,
        })
    }
}

impl Table for RobinHoodTable {
    fn put(&mut self, key: Key, value: Value) {
        // A tombstone-inclusive occupancy check, not just `load_factor()`
        // (which only counts live entries): a table whose slots are mostly
        // tombstones would otherwise never trip the size/cap resize trigger
        // and the probe loop below, which only terminates on a true empty
        // slot, could run out of room to place a genuinely new key.
        if self.load_factor() > MAX_LOAD_FACTOR || self.size + self.tombstones >= self.cap {
            self.resize(self.cap * 2);
        }
        let mut idx = self.ideal(&key);
        let mut candidate_key = key;
        let mut candidate_value = value;
        let mut dist = 0usize;
        loop {
            match &self.table[idx] {
                Slot::Empty => {
                    self.table[idx] = Slot::Occupied(candidate_key, candidate_value);
                    self.size += 1;
                    return;
                }
                // Transparent to insertion, exactly as it is to lookup and
                // delete: the key may already be occupying a slot further
                // along this same probe chain, so we cannot stop and reuse
                // this tombstone without first ruling that out. Reusing it
                // here (instead of continuing to scan) would both risk
                // leaving a stale duplicate entry unreachable behind a
                // later delete, and place the final candidate at a slot
                // that may sit before its own ideal index once earlier
                // displacements have changed which key is being carried.
                Slot::Tombstone => {}
                Slot::Occupied(k, _) if *k == candidate_key => {
                    self.table[idx] = Slot::Occupied(candidate_key, candidate_value);
                    return;
                }
                Slot::Occupied(k, _) => {
                    let ideal = self.ideal(k);
                    let slot_dist = self.probe_distance(ideal, idx);
                    if slot_dist < dist {
                        let evicted = std::mem::replace(
                            &mut self.table[idx],
                            Slot::Occupied(candidate_key, candidate_value),
                        );
                        if let Slot::Occupied(ek, ev) = evicted {
                            candidate_key = ek;
                            candidate_value = ev;
                        }
                        dist = slot_dist;
                    }
                }
            }
            idx = (idx + 1) & self.mask;
            dist += 1;
        }
    }

    fn get(&self, key: &[u8]) -> Option<&Value> {
        let mut idx = self.ideal(key);
        let mut scanned = 0usize;
        while scanned <= self.cap {
            match &self.table[idx] {
                Slot::Empty => return None,
                Slot::Occupied(k, v) if k.as_slice() == key => return Some(v),
                _ => {}
            }
            idx = (idx + 1) & self.mask;
            scanned += 1;
        }
        None
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        let mut idx = self.ideal(key);
        let mut scanned = 0usize;
        while scanned <= self.cap {
            match &self.table[idx] {
                Slot::Empty => return false,
                Slot::Occupied(k, _) if k.as_slice() == key => {
                    self.table[idx] = Slot::Tombstone;
                    self.size -= 1;
                    self.tombstones += 1;
                    return true;
                }
                _ => {}
            }
            idx = (idx + 1) & self.mask;
            scanned += 1;
        }
        false
    }

    fn len(&self) -> usize {
        self.size
    }

    fn health(&self) -> HealthSignals {
        HealthSignals {
            size: self.size,
            capacity: self.cap,
            load_factor: self.load_factor(),
            max_group_len: 0,
            avg_probe_estimate: self.avg_probe_estimate(),
            tombstone_ratio: self.tombstone_ratio(),
        }
    }

    fn iter_entries(&self) -> Box<dyn Iterator<Item = (Key, Value)> + '_> {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two_capacity() {
        assert!(RobinHoodTable::new(10).is_err());
    }

    #[test]
    fn put_get_delete_round_trip() {
        let mut t = RobinHoodTable::new(16).unwrap();
        t.put(b"a".to_vec(), b"1".to_vec());
        t.put(b"b".to_vec(), b"2".to_vec());
        assert_eq!(t.get(b"a"), Some(&b"1".to_vec()));
        assert!(t.delete(b"a"));
        assert_eq!(t.get(b"a"), None);
        assert_eq!(t.len(), 1);
        assert_eq!(t.tombstones(), 1);
    }

    #[test]
    fn compact_clears_tombstones_idempotently() {
        let mut t = RobinHoodTable::new(16).unwrap();
        for i in 0..10 {
            t.put(format!("k{i}").into_bytes(), b"v".to_vec());
        }
        for i in 0..6 {
            t.delete(format!("k{i}").into_bytes().as_slice());
        }
        assert!(t.tombstone_ratio() >= 0.25);
        t.compact();
        assert_eq!(t.tombstones(), 0);
        assert_eq!(t.len(), 4);
        assert_eq!(t.capacity(), 16);
        t.compact();
        assert_eq!(t.tombstones(), 0);
        assert_eq!(t.len(), 4);
    }

    #[test]
    fn put_past_a_tombstone_updates_in_place_instead_of_duplicating() {
        // Fill every slot in a small table so every key's probe chain is
        // forced through the whole table, then delete one key to leave a
        // tombstone ahead of another key in its own probe chain.
        let mut t = RobinHoodTable::new(8).unwrap();
        for i in 0..8 {
            t.put(format!("k{i}").into_bytes(), format!("v{i}").into_bytes());
        }
        for i in 0..8 {
            t.delete(format!("k{i}").into_bytes().as_slice());
            t.put(format!("k{i}").into_bytes(), format!("v{i}-tombstone").into_bytes());
        }
        // Every key must now resolve to exactly one entry holding the
        // updated value, never a stale duplicate left behind an earlier
        // tombstone.
        for i in 0..8 {
            let key = format!("k{i}").into_bytes();
            assert_eq!(t.get(&key), Some(&format!("v{i}-tombstone").into_bytes()));
        }
        assert_eq!(t.iter().count(), t.len());
        for i in 0..8 {
            let key = format!("k{i}").into_bytes();
            assert!(t.delete(&key));
            assert_eq!(t.get(&key), None, "key {i} must be gone, not resurrected from a stale duplicate");
        }
    }

    #[test]
    fn size_plus_tombstones_never_exceeds_capacity() {
        let mut t = RobinHoodTable::new(16).unwrap();
        for i in 0..40 {
            t.put(format!("k{i}").into_bytes(), b"v".to_vec());
        }
        for i in 0..20 {
            t.delete(format!("k{i}").into_bytes().as_slice());
        }
        assert!(t.size + t.tombstones <= t.cap);
        assert_eq!(t.iter().count(), t.len());
    }
}
