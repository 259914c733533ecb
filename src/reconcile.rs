//! # Partial tile reconciliation
//!
//! Tiles whose Morton range straddled a shard boundary come back from
//! [`crate::shard::run_shard`] tagged "partial." This module sums the
//! ones sharing a `(z, x, y)` key into a single tile each, the same way
//! every other shard's contribution to that tile would have been
//! summed had it scanned the records itself.

use std::collections::HashMap;

use crate::tile::Tile;

/// Merge every partial tile sharing a `(z, x, y)` key into one, summing
/// cell counts elementwise. Order of input tiles doesn't matter.
pub fn reconcile(partials: Vec<Tile>) -> Vec<Tile> {
    let mut merged: HashMap<(u8, u32, u32), Tile> = HashMap::new();

    for t in partials {
        merged
            .entry((t.z, t.x, t.y))
            .and_modify(|existing| {
                for (dst, src) in existing.count.iter_mut().zip(t.count.iter()) {
                    *dst += src;
                }
            })
            .or_insert(t);
    }

    merged.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile_with(z: u8, x: u32, y: u32, detail: u8, fill: u64) -> Tile {
        let mut t = Tile::new(detail);
        t.reset(z, x, y);
        for c in t.count.iter_mut() {
            *c = fill;
        }
        t
    }

    #[test]
    fn sums_matching_keys() {
        let a = tile_with(3, 1, 2, 2, 5);
        let b = tile_with(3, 1, 2, 2, 7);
        let merged = reconcile(vec![a, b]);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].count.iter().all(|&c| c == 12));
    }

    #[test]
    fn keeps_distinct_keys_separate() {
        let a = tile_with(3, 1, 2, 2, 5);
        let b = tile_with(3, 1, 3, 2, 7);
        let merged = reconcile(vec![a, b]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(reconcile(Vec::new()).is_empty());
    }

    #[test]
    fn three_way_merge_sums_exactly_once_each() {
        let tiles = vec![
            tile_with(5, 0, 0, 1, 1),
            tile_with(5, 0, 0, 1, 2),
            tile_with(5, 0, 0, 1, 3),
        ];
        let merged = reconcile(tiles);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].count.iter().all(|&c| c == 6));
    }
}
