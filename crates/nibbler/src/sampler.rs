//! Random selection of record ids for field-level reports.
//!
//! A seed makes the choice reproducible, which keeps repeated runs over the
//! same data producing the same report.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Ids picked for field-level inspection of a window.
pub const DEFAULT_SAMPLE_SIZE: usize = 4;

#[derive(Debug, Clone)]
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    /// Reproducible sampler.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Sampler seeded from the thread RNG.
    pub fn from_entropy() -> Self {
        Self::seeded(rand::rng().random())
    }

    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::seeded(seed),
            None => Self::from_entropy(),
        }
    }

    /// Up to `n` distinct items of `items`, chosen uniformly.
    ///
    /// Partial Fisher-Yates over indices; the result keeps input order.
    pub fn pick<T: Clone>(&mut self, items: &[T], n: usize) -> Vec<T> {
        if items.len() <= n {
            return items.to_vec();
        }
        let mut indices: Vec<usize> = (0..items.len()).collect();
        for i in 0..n {
            let j = self.rng.random_range(i..indices.len());
            indices.swap(i, j);
        }
        let mut chosen = indices[..n].to_vec();
        chosen.sort_unstable();
        chosen.into_iter().map(|i| items[i].clone()).collect()
    }

    /// Fold `incoming` into a bounded rolling `pool`.
    ///
    /// Duplicates are ignored; when the union exceeds `cap` a uniform subset
    /// is kept.
    pub fn merge_bounded<T: Clone + PartialEq>(&mut self, pool: &mut Vec<T>, incoming: &[T], cap: usize) {
        let mut union = std::mem::take(pool);
        for item in incoming {
            if !union.contains(item) {
                union.push(item.clone());
            }
        }
        *pool = self.pick(&union, cap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_returns_all_when_short() {
        let mut sampler = Sampler::seeded(1);
        assert_eq!(sampler.pick(&[1, 2, 3], 4), vec![1, 2, 3]);
        assert!(sampler.pick::<i32>(&[], 4).is_empty());
    }

    #[test]
    fn test_pick_is_distinct_and_bounded() {
        let mut sampler = Sampler::seeded(7);
        let items: Vec<i32> = (0..100).collect();
        let chosen = sampler.pick(&items, 4);
        assert_eq!(chosen.len(), 4);
        let mut dedup = chosen.clone();
        dedup.dedup();
        assert_eq!(dedup.len(), 4);
        assert!(chosen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_same_seed_same_choice() {
        let items: Vec<i32> = (0..1000).collect();
        let a = Sampler::seeded(42).pick(&items, 4);
        let b = Sampler::seeded(42).pick(&items, 4);
        assert_eq!(a, b);
    }

    #[test]
    fn test_merge_bounded_caps_pool() {
        let mut sampler = Sampler::seeded(3);
        let mut pool = vec![1, 2, 3];
        sampler.merge_bounded(&mut pool, &[3, 4, 5, 6], 4);
        assert_eq!(pool.len(), 4);
        assert!(pool.iter().all(|v| (1..=6).contains(v)));

        let mut small = vec![1];
        sampler.merge_bounded(&mut small, &[1, 2], 4);
        assert_eq!(small, vec![1, 2]);
    }
}
