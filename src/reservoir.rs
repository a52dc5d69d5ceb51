//! Fixed-size reservoir sampling and cumulative latency histograms.

use blake2::{digest::consts::U32, Blake2b, Digest};

type Blake2b256 = Blake2b<U32>;

/// Deterministic-when-seeded RNG used by reservoirs. Mirrors the
/// counter-mode-over-a-hash construction used upstream: hashing a seed plus
/// an incrementing counter gives reproducible draws for tests without
/// depending on any particular PRNG algorithm's stability guarantees.
pub enum ReservoirRng {
    Os(rand::rngs::ThreadRng),
    Seeded { seed: [u8; 32], counter: u64 },
}

impl ReservoirRng {
    pub fn from_os() -> Self {
        ReservoirRng::Os(rand::thread_rng())
    }

    pub fn from_seed(seed: u64) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(seed.to_be_bytes());
        let digest = hasher.finalize();
        let mut seed_bytes = [0u8; 32];
        seed_bytes.copy_from_slice(&digest);
        ReservoirRng::Seeded {
            seed: seed_bytes,
            counter: 0,
        }
    }

    fn next_u64(&mut self) -> u64 {
        match self {
            ReservoirRng::Os(rng) => {
                use rand::RngCore;
                rng.next_u64()
            }
            ReservoirRng::Seeded { seed, counter } => {
                *counter += 1;
                let mut hasher = Blake2b256::new();
                hasher.update(seed);
                hasher.update(counter.to_be_bytes());
                let digest = hasher.finalize();
                u64::from_be_bytes(digest[0..8].try_into().unwrap())
            }
        }
    }

    /// A uniform integer in `[0, bound)`. `bound` must be positive.
    pub fn below(&mut self, bound: u64) -> u64 {
        debug_assert!(bound > 0);
        self.next_u64() % bound
    }
}

/// Fixed-capacity `k` sample buffer with counter `n`, maintained by uniform
/// random replacement: after `n >= k` offers, each sample has probability
/// `k/n` of being retained.
pub struct Reservoir {
    k: usize,
    buf: Vec<f64>,
    n: u64,
    rng: ReservoirRng,
}

impl Reservoir {
    pub fn new(k: usize, rng: ReservoirRng) -> Self {
        Reservoir {
            k: k.max(1),
            buf: Vec::new(),
            n: 0,
            rng,
        }
    }

    pub fn offer(&mut self, value_ms: f64) {
        self.n += 1;
        if self.buf.len() < self.k {
            self.buf.push(value_ms);
            return;
        }
        let j = self.rng.below(self.n);
        if j < self.k as u64 {
            self.buf[j as usize] = value_ms;
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn samples_seen(&self) -> u64 {
        self.n
    }

    pub fn clone_samples(&self) -> Vec<f64> {
        self.buf.clone()
    }

    /// Percentiles at the given `p` values (e.g. `0.5, 0.9, 0.99`), computed
    /// as `floor(p * (len - 1))` over a sorted copy of the buffer.
    pub fn percentiles(&self, ps: &[f64]) -> Vec<(f64, f64)> {
        if self.buf.is_empty() {
            return ps.iter().map(|p| (*p, 0.0)).collect();
        }
        let mut data = self.buf.clone();
        data.sort_by(|a, b| a.partial_cmp(b).unwrap());
        ps.iter()
            .map(|p| {
                let idx = ((data.len() - 1) as f64 * p).floor() as usize;
                let idx = idx.min(data.len() - 1);
                (*p, data[idx])
            })
            .collect()
    }
}

/// A fixed ordered set of upper bounds in milliseconds, terminating in +inf.
/// Counts reported against it are cumulative by bound.
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    bounds: Vec<f64>,
}

impl LatencyHistogram {
    pub fn new(bounds: &[f64]) -> Self {
        LatencyHistogram {
            bounds: bounds.to_vec(),
        }
    }

    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    /// Cumulative counts: `counts[i]` is the number of samples `<= bounds[i]`.
    /// The final bucket (+inf) always equals `samples.len()`.
    pub fn cumulative_counts(&self, samples: &[f64]) -> Vec<(f64, u64)> {
        self.bounds
            .iter()
            .map(|&bound| {
                let count = samples.iter().filter(|&&v| v <= bound).count() as u64;
                (bound, count)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservoir_retains_all_samples_under_capacity() {
        let mut r = Reservoir::new(10, ReservoirRng::from_seed(1));
        for i in 0..5 {
            r.offer(i as f64);
        }
        assert_eq!(r.len(), 5);
        assert_eq!(r.samples_seen(), 5);
    }

    #[test]
    fn reservoir_caps_at_k_with_deterministic_seed() {
        let mut r = Reservoir::new(10, ReservoirRng::from_seed(42));
        for i in 0..1000 {
            r.offer(i as f64);
        }
        assert_eq!(r.len(), 10);
        assert_eq!(r.samples_seen(), 1000);
    }

    #[test]
    fn percentiles_use_floor_indexing() {
        let mut r = Reservoir::new(100, ReservoirRng::from_seed(7));
        for i in 1..=10 {
            r.offer(i as f64);
        }
        let p = r.percentiles(&[0.5]);
        // floor(0.5 * 9) = 4 -> sorted[4] = 5.0
        assert_eq!(p[0].1, 5.0);
    }

    #[test]
    fn histogram_counts_are_monotonic_and_final_equals_total() {
        let hist = LatencyHistogram::new(&[1.0, 2.0, 5.0, f64::INFINITY]);
        let samples = vec![0.5, 1.5, 3.0, 100.0];
        let counts = hist.cumulative_counts(&samples);
        let mut prev = 0u64;
        for (_, c) in &counts {
            assert!(*c >= prev);
            prev = *c;
        }
        assert_eq!(counts.last().unwrap().1, samples.len() as u64);
    }
}
