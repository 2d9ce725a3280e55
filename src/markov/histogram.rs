//! Frequency histogram with cumulative-weight sampling.
//!
//! While building, observations go into a frequency table. `compile`
//! converts the table into a cumulative-weight map keyed by running totals,
//! after which `next` samples in O(log n) via upper-bound search.

use std::collections::BTreeMap;
use std::ops::Bound;

use rand::Rng;

#[derive(Debug, Clone, Default)]
pub struct Histogram<T: Ord + Clone> {
    freq: BTreeMap<T, u32>,
    distribution: BTreeMap<u32, T>,
    total: u32,
}

impl<T: Ord + Clone> Histogram<T> {
    pub fn new() -> Self {
        Self {
            freq: BTreeMap::new(),
            distribution: BTreeMap::new(),
            total: 0,
        }
    }

    pub fn add(&mut self, value: T) {
        *self.freq.entry(value).or_insert(0) += 1;
    }

    /// Convert the frequency table into the cumulative distribution.
    pub fn compile(&mut self) {
        self.distribution.clear();
        let mut max = 0;
        for (value, count) in std::mem::take(&mut self.freq) {
            max += count;
            self.distribution.insert(max, value);
        }
        self.total = max;
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0 && self.freq.is_empty()
    }

    /// Sample a value proportionally to its observed frequency.
    ///
    /// Must be compiled first; returns `None` for an empty histogram.
    pub fn next(&self, rng: &mut impl Rng) -> Option<&T> {
        if self.total == 0 {
            return None;
        }
        let r = rng.random_range(0..self.total);
        self.distribution
            .range((Bound::Excluded(r), Bound::Unbounded))
            .next()
            .map(|(_, value)| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_single_value_always_sampled() {
        let mut h = Histogram::new();
        h.add("only");
        h.compile();

        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..10 {
            assert_eq!(h.next(&mut rng), Some(&"only"));
        }
    }

    #[test]
    fn test_samples_follow_weights() {
        let mut h = Histogram::new();
        for _ in 0..99 {
            h.add("common");
        }
        h.add("rare");
        h.compile();

        let mut rng = StdRng::seed_from_u64(7);
        let common = (0..1000)
            .filter(|_| h.next(&mut rng) == Some(&"common"))
            .count();
        assert!(common > 900);
    }

    #[test]
    fn test_empty_histogram_yields_none() {
        let mut h: Histogram<String> = Histogram::new();
        h.compile();
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(h.next(&mut rng), None);
    }

    #[test]
    fn test_recompile_after_more_observations() {
        let mut h = Histogram::new();
        h.add(1u32);
        h.compile();
        h.add(2u32);
        h.compile();

        let mut rng = StdRng::seed_from_u64(3);
        // After recompiling, only the new observation remains (the original
        // table is consumed by compilation).
        assert_eq!(h.next(&mut rng), Some(&2));
    }
}
