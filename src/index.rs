//! Sign-bit bucketing for approximate nearest-neighbor search.
//!
//! Each embedding is projected onto a fixed set of random hyperplanes;
//! the sign of each projection contributes one bit to a bucket id. Vectors
//! close in cosine distance tend to land in the same or nearby buckets, so
//! a query only needs to scan buckets within a small Hamming radius of its
//! own bucket. Small corpora skip the index and scan exactly.
//!
//! The hyperplanes are derived deterministically from a fixed seed, so
//! bucket assignments are stable across processes and restarts. Changing
//! `planes` invalidates stored bucket ids; re-ingest after changing it.

use crate::config::IndexConfig;

const HYPERPLANE_SEED: u64 = 0x5eed_c0de_2024_0001;

/// Deterministic random-hyperplane index over embedding vectors.
pub struct SignIndex {
    planes: Vec<Vec<f32>>,
    probes: u32,
    pub exact_below: i64,
}

impl SignIndex {
    pub fn new(config: &IndexConfig, dims: usize) -> Self {
        let mut rng = Lcg::new(HYPERPLANE_SEED);
        let planes = (0..config.planes)
            .map(|_| (0..dims).map(|_| rng.next_unit()).collect())
            .collect();
        Self {
            planes,
            probes: config.probes,
            exact_below: config.exact_below,
        }
    }

    /// Bucket id for a vector: bit i is the sign of the projection onto
    /// hyperplane i.
    pub fn bucket(&self, vec: &[f32]) -> i64 {
        let mut bits: i64 = 0;
        for (i, plane) in self.planes.iter().enumerate() {
            let dot: f32 = plane.iter().zip(vec.iter()).map(|(p, v)| p * v).sum();
            if dot >= 0.0 {
                bits |= 1 << i;
            }
        }
        bits
    }

    /// All bucket ids within the configured Hamming radius of the query's
    /// bucket, the query's own bucket first. Sorted for deterministic SQL.
    pub fn probe_buckets(&self, query: &[f32]) -> Vec<i64> {
        let home = self.bucket(query);
        let n_bits = self.planes.len() as u32;
        let mut buckets = vec![home];

        // Radius 1 and beyond: flip combinations of bits
        let mut frontier = vec![home];
        for _ in 0..self.probes {
            let mut next = Vec::new();
            for &b in &frontier {
                for bit in 0..n_bits {
                    let flipped = b ^ (1 << bit);
                    if !buckets.contains(&flipped) {
                        buckets.push(flipped);
                        next.push(flipped);
                    }
                }
            }
            frontier = next;
        }

        buckets[1..].sort_unstable();
        buckets
    }
}

/// Small linear congruential generator, only used to derive hyperplanes.
struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // Constants from Knuth's MMIX
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }

    /// Uniform in [-1.0, 1.0).
    fn next_unit(&mut self) -> f32 {
        let bits = self.next_u64() >> 40;
        (bits as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;

    fn index(planes: u32, probes: u32) -> SignIndex {
        SignIndex::new(
            &IndexConfig {
                planes,
                probes,
                exact_below: 0,
            },
            8,
        )
    }

    #[test]
    fn buckets_are_deterministic() {
        let a = index(8, 1);
        let b = index(8, 1);
        let v = vec![0.3, -0.7, 0.1, 0.9, -0.2, 0.5, -0.4, 0.6];
        assert_eq!(a.bucket(&v), b.bucket(&v));
    }

    #[test]
    fn identical_vectors_share_a_bucket() {
        let idx = index(8, 1);
        let v = vec![1.0, 2.0, -1.0, 0.5, 0.0, -0.5, 1.5, -2.0];
        let w = v.iter().map(|x| x * 3.0).collect::<Vec<_>>();
        // Scaling preserves all projection signs
        assert_eq!(idx.bucket(&v), idx.bucket(&w));
    }

    #[test]
    fn probe_set_contains_home_bucket_first() {
        let idx = index(8, 1);
        let v = vec![0.1; 8];
        let buckets = idx.probe_buckets(&v);
        assert_eq!(buckets[0], idx.bucket(&v));
        // Radius 1 over 8 planes adds exactly 8 neighbors
        assert_eq!(buckets.len(), 9);
    }

    #[test]
    fn zero_probes_returns_only_home() {
        let idx = index(8, 0);
        let v = vec![0.1; 8];
        assert_eq!(idx.probe_buckets(&v).len(), 1);
    }

    #[test]
    fn probe_set_has_no_duplicates() {
        let idx = index(4, 2);
        let v = vec![0.2, -0.3, 0.4, -0.5, 0.6, -0.7, 0.8, -0.9];
        let buckets = idx.probe_buckets(&v);
        let mut sorted = buckets.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), buckets.len());
    }
}
