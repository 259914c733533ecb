//! # End-of-pass-0 normalization
//!
//! After every shard has scanned its slice once and reconciliation has
//! folded straddling tiles back in, each zoom has a complete KLL sketch
//! of its cell counts and a raw maximum cell value. This module derives
//! the per-zoom ceiling (`zoom_max`) that pass 1's emit stage divides
//! by, plus a least-squares diagnostic over how that ceiling grows with
//! zoom — kept for its original purpose as an operator sanity check,
//! not as an input to anything downstream.

use crate::kll::KllSketch;
use crate::tile::Tile;

/// Fold reconciled partial tiles into the pass-0 accumulators the same
/// way a fully-owned tile would have been folded in by whichever shard
/// happened to finish scanning it — arbitrarily, the first shard's
/// accumulators, matching the upstream tool folding partials into
/// `tilers[0]`.
pub fn absorb_partials(quantiles: &mut [KllSketch], max: &mut [u64], partials: &[Tile]) {
    for t in partials {
        let z = t.z as usize;
        for &count in &t.count {
            quantiles[z].update(count as f64);
            if count > max[z] {
                max[z] = count;
            }
        }
    }
}

/// Per-zoom ceilings derived once pass 0 is complete.
pub struct Normalization {
    /// Divisor applied to every cell before level-mapping in pass 1:
    /// half the largest cell value the quantile sketch ever saw.
    pub zoom_max: Vec<u64>,
    /// Raw maximum cell value observed per zoom, pre-normalization —
    /// the input to the diagnostic regression.
    pub raw_max: Vec<u64>,
}

/// Merge every shard's per-zoom sketch and raw maximum into one set of
/// sketches, then derive `zoom_max[z] = top_value(sketch_z) / 2`.
pub fn normalize(per_shard_quantiles: &[Vec<KllSketch>], per_shard_max: &[Vec<u64>]) -> Normalization {
    let zooms = per_shard_quantiles.first().map(|v| v.len()).unwrap_or(0);
    let mut merged: Vec<KllSketch> = (0..zooms).map(|_| KllSketch::new(KllSketch::DEFAULT_K)).collect();
    let mut raw_max = vec![0u64; zooms];

    for shard_quantiles in per_shard_quantiles {
        for (z, sketch) in shard_quantiles.iter().enumerate() {
            merged[z].merge(sketch);
        }
    }
    for shard_max in per_shard_max {
        for (z, &m) in shard_max.iter().enumerate() {
            raw_max[z] = raw_max[z].max(m);
        }
    }

    let zoom_max = merged.iter().map(|s| (s.max_value() / 2.0) as u64).collect();

    Normalization { zoom_max, raw_max }
}

/// Ordinary least squares fit of `ln(raw_max[z])` against zoom index
/// `z`, printed as a diagnostic exactly as the upstream tool does —
/// its fitted values are never fed back into `zoom_max`, only reported.
pub fn regress(raw_max: &[u64]) {
    let n = raw_max.len() as f64;
    if n == 0.0 {
        return;
    }

    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2) = (0.0, 0.0, 0.0, 0.0);
    for (i, &m) in raw_max.iter().enumerate() {
        let x = i as f64;
        let y = (m.max(1) as f64).ln();
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_x2 += x * x;
    }

    let denom = n * sum_x2 - sum_x * sum_x;
    if denom == 0.0 {
        return;
    }
    let m = (n * sum_xy - sum_x * sum_y) / denom;
    let b = (sum_y * sum_x2 - sum_x * sum_xy) / denom;

    println!("chose {}", 1.0 / m.exp());
    for (i, &raw) in raw_max.iter().enumerate() {
        let fitted = (m * i as f64 + b).exp().max(1.0);
        println!("{i} {raw} {fitted}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zoom_max_is_half_the_top_observed_value() {
        let mut sketch = KllSketch::new(200);
        for v in 1..=1000 {
            sketch.update(v as f64);
        }
        let normalized = normalize(&[vec![sketch]], &[vec![1000]]);
        assert_eq!(normalized.zoom_max[0], 500);
        assert_eq!(normalized.raw_max[0], 1000);
    }

    #[test]
    fn zoom_max_is_zero_for_all_zero_input() {
        // spec.md §8 S4: an all-zero pass 0 must leave zoom_max at 0,
        // not clamp it — the division-by-zero guard lives in emit's
        // normalize_cell, not here.
        let sketch = KllSketch::new(200);
        let normalized = normalize(&[vec![sketch]], &[vec![0]]);
        assert_eq!(normalized.zoom_max[0], 0);
    }

    #[test]
    fn absorb_partials_feeds_sketch_and_max() {
        let mut quantiles = vec![KllSketch::new(50)];
        let mut max = vec![0u64];
        let mut t = Tile::new(2);
        t.reset(0, 0, 0);
        t.add(0, 0, 42);
        absorb_partials(&mut quantiles, &mut max, std::slice::from_ref(&t));
        assert_eq!(max[0], 42);
        assert!(quantiles[0].len() > 0);
    }

    #[test]
    fn regress_handles_empty_input_without_panicking() {
        regress(&[]);
    }
}
