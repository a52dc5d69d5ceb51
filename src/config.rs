//! Policy knobs for the adaptive map and replay engine.
//!
//! Mirrors the teacher's habit of collecting tunables into a single
//! `Default`-constructible struct rather than scattering magic numbers
//! through the implementation.

/// Thresholds that drive backend selection and migration/compaction triggers.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub max_lf_chaining: f64,
    pub max_group_len: usize,
    pub max_avg_probe_robinhood: f64,
    pub max_tombstone_ratio: f64,
    pub initial_buckets: usize,
    pub groups_per_bucket: usize,
    pub initial_capacity_rh: usize,
    pub incremental_batch: usize,
    pub large_map_warn_threshold: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            max_lf_chaining: 0.82,
            max_group_len: 8,
            max_avg_probe_robinhood: 6.0,
            max_tombstone_ratio: 0.25,
            initial_buckets: 64,
            groups_per_bucket: 8,
            initial_capacity_rh: 64,
            incremental_batch: 2048,
            large_map_warn_threshold: 1_000_000,
        }
    }
}

/// Which backend an [`crate::adaptive::AdaptiveMap`] starts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StartBackend {
    Chaining,
    RobinHood,
}

impl Default for StartBackend {
    fn default() -> Self {
        StartBackend::Chaining
    }
}

/// Guardrails applied while reading an operation stream, so a malformed or
/// hostile input file cannot exhaust memory before validation runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplayLimits {
    pub max_rows: u64,
    pub max_bytes: u64,
}

impl Default for ReplayLimits {
    fn default() -> Self {
        ReplayLimits {
            max_rows: 50_000_000,
            max_bytes: 8 * 1024 * 1024 * 1024,
        }
    }
}

/// Named latency histogram bucket-bound presets, in milliseconds.
pub const DEFAULT_LATENCY_BUCKET_BOUNDS_MS: &[f64] =
    &[0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, f64::INFINITY];

pub const MICRO_LATENCY_BUCKET_BOUNDS_MS: &[f64] = &[
    0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, f64::INFINITY,
];

/// Resolve a named latency bucket preset ("default" or "micro") to its bounds.
pub fn resolve_latency_bucket_bounds(name: &str) -> crate::error::Result<(&'static str, &'static [f64])> {
    match name.trim().to_lowercase().as_str() {
        "" | "default" => Ok(("default", DEFAULT_LATENCY_BUCKET_BOUNDS_MS)),
        "micro" => Ok(("micro", MICRO_LATENCY_BUCKET_BOUNDS_MS)),
        other => Err(crate::error::EngineError::BadConfig(format!(
            "unknown latency bucket preset: {other}"
        ))),
    }
}
