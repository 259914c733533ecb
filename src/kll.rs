//! # KLL streaming quantile sketch
//!
//! A Karnin–Lang–Liberty sketch: a small set of per-level compactors
//! that absorb values in batches and halve themselves under a fair
//! coin flip once full, trading exactness for bounded memory.
//!
//! This is a deliberate re-derivation of the `original_source/kll.hpp`
//! template, not a transliteration — with its coin flip fixed from a
//! constant (`rand() % 1` always takes the same branch) to a fair
//! `rand() % 2`, and its total-size bookkeeping fixed from an
//! assignment inside the per-level loop (which overwrites the count
//! instead of accumulating it) to a sum across every compactor.

use rand::Rng;

/// A single compaction level: an unsorted buffer of items plus the
/// capacity it may hold before it must compact.
#[derive(Debug, Clone)]
struct Compactor {
    items: Vec<f64>,
    capacity: usize,
}

impl Compactor {
    fn new(capacity: usize) -> Self {
        Self { items: Vec::new(), capacity }
    }

    fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }
}

/// Streaming approximate-quantile sketch over `f64` values.
///
/// `k` controls the accuracy/size trade-off (larger `k` means a
/// tighter approximation at the cost of more memory); `c` is the
/// per-level capacity decay applied going up the level stack.
#[derive(Debug, Clone)]
pub struct KllSketch {
    k: usize,
    c: f64,
    compactors: Vec<Compactor>,
    /// Count of exact-zero values, tracked outside the compactors so a
    /// zero-heavy stream (common for sparse tile cells) doesn't spend
    /// compactor capacity on a single repeated value.
    zeroes: u64,
    size: u64,
}

impl KllSketch {
    /// Typical sketch size used throughout the tiling pipeline.
    pub const DEFAULT_K: usize = 512;
    const DEFAULT_C: f64 = 2.0 / 3.0;

    pub fn new(k: usize) -> Self {
        Self::with_growth(k, Self::DEFAULT_C)
    }

    pub fn with_growth(k: usize, c: f64) -> Self {
        let mut s = Self { k, c, compactors: Vec::new(), zeroes: 0, size: 0 };
        s.ensure_level(0);
        s
    }

    /// Capacity of level `h` given the current height `height`:
    /// `ceil(k * c^(height - h - 1)) + 1`, floored at `k`'s own base
    /// level so the sketch never shrinks below one usable buffer.
    fn capacity_for(&self, h: usize, height: usize) -> usize {
        if h + 1 >= height {
            return self.k + 1;
        }
        let exp = (height - h - 1) as i32;
        (self.k as f64 * self.c.powi(exp)).ceil() as usize + 1
    }

    fn ensure_level(&mut self, level: usize) {
        while self.compactors.len() <= level {
            self.compactors.push(Compactor::new(self.k + 1));
        }
        self.recompute_capacities();
    }

    fn recompute_capacities(&mut self) {
        let height = self.compactors.len();
        for h in 0..height {
            self.compactors[h].capacity = self.capacity_for(h, height);
        }
    }

    /// Absorb one observed value.
    pub fn update(&mut self, value: f64) {
        if value == 0.0 {
            self.zeroes += 1;
            self.size += 1;
            return;
        }
        self.compactors[0].items.push(value);
        self.size += 1;
        self.compact_if_needed(0);
        self.resize_total();
    }

    fn compact_if_needed(&mut self, level: usize) {
        if !self.compactors[level].is_full() {
            return;
        }
        self.ensure_level(level + 1);

        let items = &mut self.compactors[level].items;
        items.sort_by(|a, b| a.partial_cmp(b).unwrap());

        // Fair coin: keep the even-indexed half or the odd-indexed half.
        let keep_odd = rand::thread_rng().gen_bool(0.5);
        let promoted: Vec<f64> = items
            .iter()
            .enumerate()
            .filter(|(i, _)| (i % 2 == 1) == keep_odd)
            .map(|(_, v)| *v)
            .collect();
        items.clear();

        self.compactors[level + 1].items.extend(promoted);
        self.compact_if_needed(level + 1);
    }

    /// Recompute `size` as the sum of all compactor occupancies plus
    /// `zeroes`, never an assignment from a single level.
    fn resize_total(&mut self) {
        let counted: usize = self.compactors.iter().map(|c| c.items.len()).sum();
        self.size = counted as u64 + self.zeroes;
    }

    /// Total number of values ever absorbed (approximately — compaction
    /// halves items but `size` tracks retained weight, not raw count;
    /// see `update`/`merge` callers for the exact semantics they need).
    pub fn len(&self) -> u64 {
        self.size
    }

    /// Fold `other`'s items into `self` at matching levels, then
    /// recompact from the bottom up. Capacities are recomputed for the
    /// resulting (possibly taller) stack before any compaction runs.
    pub fn merge(&mut self, other: &KllSketch) {
        self.zeroes += other.zeroes;
        self.ensure_level(other.compactors.len().saturating_sub(1));
        for (level, compactor) in other.compactors.iter().enumerate() {
            self.compactors[level].items.extend(compactor.items.iter().copied());
        }
        for level in 0..self.compactors.len() {
            self.compact_if_needed(level);
        }
        self.resize_total();
    }

    /// Weight each retained item by `2^level` (since a level-`h` item
    /// represents `2^h` original observations) and sort into a single
    /// approximate empirical distribution.
    fn weighted_items(&self) -> Vec<(f64, u64)> {
        let mut out = Vec::new();
        if self.zeroes > 0 {
            out.push((0.0, self.zeroes));
        }
        for (level, compactor) in self.compactors.iter().enumerate() {
            let weight = 1u64 << level;
            out.extend(compactor.items.iter().map(|&v| (v, weight)));
        }
        out.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        out
    }

    /// Approximate CDF at `value`: fraction of total weight at or
    /// below `value`.
    pub fn cdf(&self, value: f64) -> f64 {
        let items = self.weighted_items();
        let total: u64 = items.iter().map(|(_, w)| w).sum();
        if total == 0 {
            return 0.0;
        }
        let at_or_below: u64 = items.iter().filter(|(v, _)| *v <= value).map(|(_, w)| w).sum();
        at_or_below as f64 / total as f64
    }

    /// Largest retained item value (the top of the sorted CDF), used
    /// to derive a per-zoom normalization ceiling. Zero if the sketch
    /// has absorbed nothing but zeroes, or nothing at all.
    pub fn max_value(&self) -> f64 {
        self.compactors.iter().flat_map(|c| c.items.iter().copied()).fold(0.0_f64, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sketch_has_zero_cdf() {
        let s = KllSketch::new(32);
        assert_eq!(s.cdf(0.0), 0.0);
        assert_eq!(s.cdf(100.0), 0.0);
        assert_eq!(s.max_value(), 0.0);
    }

    #[test]
    fn cdf_at_max_is_one() {
        let mut s = KllSketch::new(32);
        for v in 1..=500 {
            s.update(v as f64);
        }
        assert!((s.cdf(500.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cdf_is_monotonic() {
        let mut s = KllSketch::new(32);
        for v in 1..=1000 {
            s.update(v as f64);
        }
        let mut prev = 0.0;
        for step in 0..20 {
            let v = step as f64 * 50.0;
            let c = s.cdf(v);
            assert!(c >= prev - 1e-9, "cdf should be nondecreasing");
            prev = c;
        }
    }

    #[test]
    fn zeroes_tracked_separately() {
        let mut s = KllSketch::new(8);
        for _ in 0..1000 {
            s.update(0.0);
        }
        assert_eq!(s.zeroes, 1000);
        assert_eq!(s.len(), 1000);
        assert!((s.cdf(0.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn max_value_tracks_top_item() {
        let mut s = KllSketch::new(50);
        assert_eq!(s.max_value(), 0.0);
        for v in [3.0, 9.0, 1.0, 7.0] {
            s.update(v);
        }
        assert_eq!(s.max_value(), 9.0);
    }

    #[test]
    fn merge_combines_weight() {
        let mut a = KllSketch::new(50);
        let mut b = KllSketch::new(50);
        for v in 1..=200 {
            a.update(v as f64);
        }
        for v in 201..=400 {
            b.update(v as f64);
        }
        a.merge(&b);
        assert!((a.cdf(400.0) - 1.0).abs() < 1e-9);
        assert!(a.cdf(200.0) < a.cdf(400.0));
    }

    #[test]
    fn size_is_sum_not_last_level_assignment() {
        let mut s = KllSketch::new(4);
        // Enough updates to force at least one compaction across
        // multiple levels; if `size` were a mis-assignment from a
        // single compactor's length this would drift from the true
        // observation count.
        for v in 1..=2000 {
            s.update(v as f64);
        }
        let counted: u64 =
            s.compactors.iter().map(|c| c.items.len() as u64).sum::<u64>() + s.zeroes;
        assert_eq!(s.size, counted);
    }
}
