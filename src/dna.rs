//! Single-pass workload DNA analyzer: a static report of op mix, key-space
//! shape, and bucket distribution used to recommend a starting backend.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::hash::KeyHasher;
use crate::replay::Op;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpMix {
    pub put: u64,
    pub get: u64,
    pub del: u64,
    pub mutation_fraction: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunningStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotKey {
    pub key: String,
    pub approx_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketSimulation {
    pub reference_buckets: usize,
    pub counts: Vec<u64>,
    pub p50_depth: u64,
    pub p90_depth: u64,
    pub p99_depth: u64,
    pub hotspot_buckets: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnaReport {
    pub total_ops: u64,
    pub op_mix: OpMix,
    pub estimated_unique_keys: u64,
    pub key_space_depth_entropy: f64,
    pub key_length_stats: RunningStats,
    pub value_length_stats: RunningStats,
    pub shannon_entropy_raw: f64,
    pub shannon_entropy_normalized: f64,
    pub top_hot_keys: Vec<HotKey>,
    pub numeric_key_fraction: f64,
    pub sequential_step_fraction: f64,
    pub adjacent_duplicate_fraction: f64,
    pub bucket_simulation: BucketSimulation,
}

/// Bounds the heavy-hitter sketch and the key-cardinality estimator so a
/// pathological stream can't grow the analyzer's own memory unboundedly.
pub struct DnaAnalyzerConfig {
    pub max_tracked_keys: usize,
    pub reference_buckets: usize,
}

impl Default for DnaAnalyzerConfig {
    fn default() -> Self {
        DnaAnalyzerConfig {
            max_tracked_keys: 4096,
            reference_buckets: 64,
        }
    }
}

/// Consumes a sequence of ops in one pass and produces a [`DnaReport`].
pub struct DnaAnalyzer {
    cfg: DnaAnalyzerConfig,
    hasher: KeyHasher,
    total_ops: u64,
    op_mix: OpMix,
    unique_keys: std::collections::HashSet<Vec<u8>>,
    key_len_sum: f64,
    key_len_min: f64,
    key_len_max: f64,
    value_len_sum: f64,
    value_len_min: f64,
    value_len_max: f64,
    value_count: u64,
    key_counts: HashMap<Vec<u8>, u64>,
    numeric_keys: u64,
    sequential_steps: u64,
    integer_pairs: u64,
    adjacent_duplicates: u64,
    last_key: Option<Vec<u8>>,
    last_numeric: Option<i64>,
    bucket_counts: Vec<u64>,
}

impl DnaAnalyzer {
    pub fn new(cfg: DnaAnalyzerConfig) -> Self {
        let reference_buckets = cfg.reference_buckets.max(1);
        DnaAnalyzer {
            cfg,
            hasher: KeyHasher::new(),
            total_ops: 0,
            op_mix: OpMix::default(),
            unique_keys: std::collections::HashSet::new(),
            key_len_sum: 0.0,
            key_len_min: f64::INFINITY,
            key_len_max: 0.0,
            value_len_sum: 0.0,
            value_len_min: f64::INFINITY,
            value_len_max: 0.0,
            value_count: 0,
            key_counts: HashMap::new(),
            numeric_keys: 0,
            sequential_steps: 0,
            integer_pairs: 0,
            adjacent_duplicates: 0,
            last_key: None,
            last_numeric: None,
            bucket_counts: vec![0; reference_buckets],
        }
    }

    pub fn observe(&mut self, op: &Op) {
        self.total_ops += 1;
        match op {
            Op::Put { key, value } => {
                self.op_mix.put += 1;
                self.value_len_sum += value.len() as f64;
                self.value_len_min = self.value_len_min.min(value.len() as f64);
                self.value_len_max = self.value_len_max.max(value.len() as f64);
                self.value_count += 1;
                self.observe_key(key);
            }
            Op::Get { key } => {
                self.op_mix.get += 1;
                self.observe_key(key);
            }
            Op::Del { key } => {
                self.op_mix.del += 1;
                self.observe_key(key);
            }
        }
    }

    fn observe_key(&mut self, key: &[u8]) {
        self.key_len_sum += key.len() as f64;
        self.key_len_min = self.key_len_min.min(key.len() as f64);
        self.key_len_max = self.key_len_max.max(key.len() as f64);

        if self.unique_keys.len() < self.cfg.max_tracked_keys * 8 {
            self.unique_keys.insert(key.to_vec());
        }

        if self.key_counts.len() < self.cfg.max_tracked_keys || self.key_counts.contains_key(key) {
            *self.key_counts.entry(key.to_vec()).or_insert(0) += 1;
        }

        if let Some(last) = &self.last_key {
            if last.as_slice() == key {
                self.adjacent_duplicates += 1;
            }
        }
        self.last_key = Some(key.to_vec());

        let bucket = (self.hasher.h1(key) as usize) % self.bucket_counts.len();
        self.bucket_counts[bucket] += 1;

        if let Ok(text) = std::str::from_utf8(key) {
            if let Ok(n) = text.trim().parse::<i64>() {
                self.numeric_keys += 1;
                if let Some(prev) = self.last_numeric {
                    self.integer_pairs += 1;
                    if n - prev == 1 {
                        self.sequential_steps += 1;
                    }
                }
                self.last_numeric = Some(n);
                return;
            }
        }
        self.last_numeric = None;
    }

    pub fn finish(self) -> DnaReport {
        let total = self.total_ops.max(1) as f64;
        let mutation_fraction = self.op_mix.put as f64 / total + self.op_mix.del as f64 / total;

        let distinct = self.unique_keys.len() as u64;
        let key_space_depth_entropy = if distinct > 1 {
            (distinct as f64).log2()
        } else {
            0.0
        };

        let total_counted: u64 = self.key_counts.values().sum();
        let shannon_entropy_raw = if total_counted > 0 {
            self.key_counts
                .values()
                .map(|&c| {
                    let p = c as f64 / total_counted as f64;
                    -p * p.log2()
                })
                .sum()
        } else {
            0.0
        };
        let normalizer = if self.key_counts.len() > 1 {
            (self.key_counts.len() as f64).log2()
        } else {
            1.0
        };
        let shannon_entropy_normalized = if normalizer > 0.0 {
            shannon_entropy_raw / normalizer
        } else {
            0.0
        };

        let mut top: Vec<HotKey> = self
            .key_counts
            .into_iter()
            .map(|(k, c)| HotKey {
                key: String::from_utf8_lossy(&k).into_owned(),
                approx_count: c,
            })
            .collect();
        top.sort_by(|a, b| b.approx_count.cmp(&a.approx_count));
        top.truncate(self.cfg.max_tracked_keys.min(50));

        let mut depths = self.bucket_counts.clone();
        depths.sort_unstable();
        let depth_percentile = |p: f64| -> u64 {
            if depths.is_empty() {
                0
            } else {
                let idx = ((depths.len() - 1) as f64 * p).floor() as usize;
                depths[idx.min(depths.len() - 1)]
            }
        };
        let mean_depth = if self.bucket_counts.is_empty() {
            0.0
        } else {
            self.bucket_counts.iter().sum::<u64>() as f64 / self.bucket_counts.len() as f64
        };
        let hotspot_buckets: Vec<usize> = self
            .bucket_counts
            .iter()
            .enumerate()
            .filter(|(_, c)| mean_depth > 0.0 && **c as f64 > 5.0 * mean_depth)
            .map(|(i, _)| i)
            .collect();

        DnaReport {
            total_ops: self.total_ops,
            op_mix: OpMix {
                put: self.op_mix.put,
                get: self.op_mix.get,
                del: self.op_mix.del,
                mutation_fraction,
            },
            estimated_unique_keys: distinct,
            key_space_depth_entropy,
            key_length_stats: RunningStats {
                min: if self.key_len_min.is_finite() { self.key_len_min } else { 0.0 },
                max: self.key_len_max,
                mean: self.key_len_sum / total,
            },
            value_length_stats: RunningStats {
                min: if self.value_len_min.is_finite() { self.value_len_min } else { 0.0 },
                max: self.value_len_max,
                mean: if self.value_count > 0 {
                    self.value_len_sum / self.value_count as f64
                } else {
                    0.0
                },
            },
            shannon_entropy_raw,
            shannon_entropy_normalized,
            top_hot_keys: top,
            numeric_key_fraction: self.numeric_keys as f64 / total,
            sequential_step_fraction: if self.integer_pairs > 0 {
                self.sequential_steps as f64 / self.integer_pairs as f64
            } else {
                0.0
            },
            adjacent_duplicate_fraction: self.adjacent_duplicates as f64 / total,
            bucket_simulation: BucketSimulation {
                reference_buckets: self.bucket_counts.len(),
                counts: self.bucket_counts,
                p50_depth: depth_percentile(0.5),
                p90_depth: depth_percentile(0.9),
                p99_depth: depth_percentile(0.99),
                hotspot_buckets,
            },
        }
    }
}
