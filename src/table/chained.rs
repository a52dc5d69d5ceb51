//! Two-level chained hash table: `M` buckets, each with `G` groups, each
//! group a short vector of entries.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::hash::{is_power_of_two, KeyHasher};
use crate::table::{HealthSignals, Key, Table, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub key: Key,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainedTable {
    m: usize,
    g: usize,
    size: usize,
    buckets: Vec<Vec<Vec<Entry>>>,
    #[serde(skip, default)]
    hasher: KeyHasher,
}

const MAX_LOAD_FACTOR: f64 = 0.8;

impl ChainedTable {
    pub fn new(initial_buckets: usize, groups_per_bucket: usize) -> Result<Self> {
        if !is_power_of_two(initial_buckets) {
            return Err(EngineError::BadConfig(
                "initial_buckets must be a positive power of two".into(),
            ));
        }
        if !is_power_of_two(groups_per_bucket) {
            return Err(EngineError::BadConfig(
                "groups_per_bucket must be a positive power of two".into(),
            ));
        }
        Ok(ChainedTable {
            m: initial_buckets,
            g: groups_per_bucket,
            size: 0,
            buckets: vec![vec![Vec::new(); groups_per_bucket]; initial_buckets],
            hasher: KeyHasher::new(),
        })
    }

    pub fn buckets_count(&self) -> usize {
        self.m
    }

    pub fn groups_per_bucket(&self) -> usize {
        self.g
    }

    pub fn load_factor(&self) -> f64 {
        if self.m == 0 {
            0.0
        } else {
            self.size as f64 / self.m as f64
        }
    }

    pub fn max_group_len(&self) -> usize {
        self.buckets
            .iter()
            .flat_map(|groups| groups.iter())
            .map(|g| g.len())
            .max()
            .unwrap_or(0)
    }

    fn index_group(&self, key: &[u8]) -> (usize, usize) {
        let i = (self.hasher.h1(key) as usize) & (self.m - 1);
        let g = (self.hasher.h2(key) as usize) & (self.g - 1);
        (i, g)
    }

    fn rehash(&mut self, new_m: usize) {
        let old = std::mem::replace(&mut self.buckets, vec![vec![Vec::new(); self.g]; new_m]);
        self.m = new_m;
        for groups in old {
            for group in groups {
                for entry in group {
                    let (i, g) = self.index_group(&entry.key);
                    self.buckets[i][g].push(entry);
                }
            }
        }
    }

    /// All entries in bucket/group order; used directly as a migration cursor source.
    pub fn iter(&self) -> impl Iterator<Item = (Key, Value)> + '_ {
        self.buckets.iter().flat_map(|groups| groups.iter()).flat_map(|group| {
            group
                .iter()
                .map(|entry| (entry.key.clone(), entry.value.clone()))
        })
    }
}

impl Table for ChainedTable {
    fn put(&mut self, key: Key, value: Value) {
        let (i, g) = self.index_group(&key);
        let group = &mut self.buckets[i][g];
        if let Some(entry) = group.iter_mut().find(|e| e.key == key) {
            entry.value = value;
            return;
        }
        group.push(Entry { key, value });
        self.size += 1;
        if self.load_factor() > MAX_LOAD_FACTOR {
            self.rehash(self.m * 2);
        }
    }

    fn get(&self, key: &[u8]) -> Option<&Value> {
        let (i, g) = self.index_group(key);
        self.buckets[i][g]
            .iter()
            .find(|e| e.key == key)
            .map(|e| &e.value)
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        let (i, g) = self.index_group(key);
        let group = &mut self.buckets[i][g];
        if let Some(pos) = group.iter().position(|e| e.key == key) {
            group.swap_remove(pos);
            self.size -= 1;
            true
        } else {
            false
        }
    }

    fn len(&self) -> usize {
        self.size
    }

    fn health(&self) -> HealthSignals {
        HealthSignals {
            size: self.size,
            capacity: self.m,
            load_factor: self.load_factor(),
            max_group_len: self.max_group_len(),
            avg_probe_estimate: 0.0,
            tombstone_ratio: 0.0,
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
    fn rejects_non_power_of_two() {
        assert!(ChainedTable::new(3, 2).is_err());
        assert!(ChainedTable::new(4, 3).is_err());
    }

    #[test]
    fn put_get_delete_round_trip() {
        let mut t = ChainedTable::new(4, 2).unwrap();
        t.put(b"k1".to_vec(), b"v1".to_vec());
        t.put(b"k2".to_vec(), b"v2".to_vec());
        assert_eq!(t.get(b"k1"), Some(&b"v1".to_vec()));
        assert!(t.delete(b"k2"));
        assert_eq!(t.get(b"k2"), None);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn size_equals_sum_of_group_lengths() {
        let mut t = ChainedTable::new(4, 2).unwrap();
        for i in 0..200 {
            t.put(format!("key-{i}").into_bytes(), b"v".to_vec());
        }
        let summed: usize = t
            .buckets
            .iter()
            .flat_map(|groups| groups.iter())
            .map(|g| g.len())
            .sum();
        assert_eq!(summed, t.len());
        assert!(t.load_factor() <= MAX_LOAD_FACTOR);
    }

    #[test]
    fn update_in_place_does_not_grow_size() {
        let mut t = ChainedTable::new(4, 2).unwrap();
        t.put(b"k".to_vec(), b"v1".to_vec());
        t.put(b"k".to_vec(), b"v2".to_vec());
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(b"k"), Some(&b"v2".to_vec()));
    }
}
