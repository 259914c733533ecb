//! # Per-tile normalization, encoding, and sink dispatch
//!
//! `emit_tile` is pass 1's leaf operation: take one fully-reconciled
//! tile, rescale every cell from a raw count into a bounded density
//! level, decide whether the tile has anything worth keeping, encode it
//! (bitmap or vector, per the run configuration), and hand the bytes to
//! the sink. Encoding is pulled behind a trait so the rescaling logic
//! above it stays a pure function you can unit test without touching
//! either codec.

use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use mvt::{GeomEncoder, GeomType, Tile as MvtTile};

use crate::config::RunConfig;
use crate::error::CoreError;
use crate::sink::TileSink;
use crate::tile::Tile;

/// Cap matching the upstream tool's hard limit on an encoded tile's
/// byte size; exceeding it is a fatal [`CoreError::Capacity`].
const MAX_TILE_BYTES: usize = 500_000;

/// `v^(1/gamma)`, zero at zero. The inverse of the `L^gamma` scaling
/// applied before normalization.
fn root(val: f64, gamma: f64) -> f64 {
    if val == 0.0 {
        0.0
    } else {
        (val.ln() / gamma).exp()
    }
}

/// Rescale one raw cell count into a density level in `0..levels`,
/// using the per-zoom ceiling derived in the normalization pass.
fn normalize_cell(count: u64, zoom_max: u64, cfg: &RunConfig) -> u32 {
    let zoom_max = zoom_max.max(1) as f64;
    let scaled = (cfg.levels as f64).powf(cfg.count_gamma) * count as f64 / zoom_max;
    let level = root(scaled, cfg.count_gamma) as i64;
    level.clamp(0, cfg.levels as i64 - 1) as u32
}

/// Normalize every cell of `tile` in place, returning whether any cell
/// both survived normalization and cleared `first_level` — tiles that
/// don't are dropped without encoding or a sink write.
fn normalize_tile(tile: &mut Tile, zoom_max: u64, cfg: &RunConfig) -> bool {
    let mut anything = false;
    for raw in tile.count.iter_mut() {
        let level = normalize_cell(*raw, zoom_max, cfg);
        *raw = level as u64;
        if level != 0 && level >= cfg.first_level {
            anything = true;
        }
    }
    anything
}

/// Normalize, encode, and write one tile, or silently drop it if
/// nothing in it survives normalization.
pub fn emit_tile(cfg: &RunConfig, tile: &mut Tile, zoom_max: u64, sink: &dyn TileSink) -> Result<(), CoreError> {
    if !normalize_tile(tile, zoom_max, cfg) {
        return Ok(());
    }

    let encoded = if cfg.bitmap {
        encode_bitmap(tile, cfg)
    } else {
        encode_vector(tile, cfg)?
    };

    let Some(bytes) = encoded else { return Ok(()) };

    if bytes.len() > MAX_TILE_BYTES {
        return Err(CoreError::capacity(tile.z, tile.x, tile.y, bytes.len(), MAX_TILE_BYTES));
    }

    sink.write_tile(tile.z, tile.x, tile.y, &bytes)
}

/// Render the tile's normalized grid as an RGBA PNG: cells below the
/// half-level point fade the base color in via alpha; cells above it
/// are fully opaque and fade from the foreground color toward the base
/// color.
fn encode_bitmap(tile: &Tile, cfg: &RunConfig) -> Option<Vec<u8>> {
    let side = Tile::side(tile.detail);
    let half = cfg.levels / 2;
    let fg: u8 = if cfg.white { 0x00 } else { 0xFF };
    let base_r = ((cfg.color >> 16) & 0xFF) as f64;
    let base_g = ((cfg.color >> 8) & 0xFF) as f64;
    let base_b = (cfg.color & 0xFF) as f64;

    let mut rgba = vec![0u8; side * side * 4];
    for (i, &level) in tile.count.iter().enumerate() {
        let level = level as u32;
        let (r, g, b, a) = if level <= half {
            let a = (255 * level / half.max(1)) as u8;
            (base_r as u8, base_g as u8, base_b as u8, a)
        } else {
            let along = (level - half) as f64 / (cfg.levels - half).max(1) as f64;
            let r = (base_r * along + fg as f64 * (1.0 - along)) as u8;
            let g = (base_g * along + fg as f64 * (1.0 - along)) as u8;
            let b = (base_b * along + fg as f64 * (1.0 - along)) as u8;
            (r, g, b, 255u8)
        };
        rgba[i * 4] = r;
        rgba[i * 4 + 1] = g;
        rgba[i * 4 + 2] = b;
        rgba[i * 4 + 3] = a;
    }

    let mut out = Vec::new();
    PngEncoder::new(&mut out)
        .write_image(&rgba, side as u32, side as u32, ExtendedColorType::Rgba8)
        .ok()?;
    Some(out)
}

/// Render the tile's normalized grid as a single-layer vector tile
/// named `"count"`: one polygon per nonzero cell, tagged with its
/// integer `density` level, at MVT extent 4096.
fn encode_vector(tile: &Tile, cfg: &RunConfig) -> Result<Option<Vec<u8>>, CoreError> {
    let detail = tile.detail;
    let side = Tile::side(detail);
    let shift = 12 - detail as u32;

    let mut mvt_tile = MvtTile::new(4096);
    let mut layer = mvt_tile.create_layer("count");

    // One geometry accumulator per density level: every cell sharing a
    // level becomes part of the same multi-part polygon feature,
    // matching the upstream tool's `features[count]` bucketing rather
    // than emitting a feature per cell.
    let mut geom_by_level: Vec<Option<GeomEncoder>> = (0..cfg.levels).map(|_| None).collect();

    for y in 0..side {
        for x in 0..side {
            let level = tile.count[y * side + x] as u32;
            if level == 0 {
                continue;
            }

            let x0 = ((x as u32) << shift) as i32;
            let y0 = ((y as u32) << shift) as i32;
            let x1 = (((x + 1) as u32) << shift) as i32;
            let y1 = (((y + 1) as u32) << shift) as i32;

            let enc = geom_by_level[level as usize]
                .get_or_insert_with(|| GeomEncoder::new(GeomType::Polygon));
            enc.point(x0, y0).map_err(|e| CoreError::sink("mvt encode", e.to_string()))?;
            enc.point(x1, y0).map_err(|e| CoreError::sink("mvt encode", e.to_string()))?;
            enc.point(x1, y1).map_err(|e| CoreError::sink("mvt encode", e.to_string()))?;
            enc.point(x0, y1).map_err(|e| CoreError::sink("mvt encode", e.to_string()))?;
            enc.point(x0, y0).map_err(|e| CoreError::sink("mvt encode", e.to_string()))?;
        }
    }

    let mut any_feature = false;
    for level in cfg.first_level as usize..cfg.levels as usize {
        let Some(enc) = geom_by_level[level].take() else { continue };
        let geom_data = enc.encode().map_err(|e| CoreError::sink("mvt encode", e.to_string()))?;

        let mut feature = layer.into_feature(geom_data);
        feature
            .add_tag_uint("density", level as u32)
            .map_err(|e| CoreError::sink("mvt tag", e.to_string()))?;
        layer = feature.into_layer();
        any_feature = true;
    }

    if !any_feature {
        return Ok(None);
    }

    mvt_tile.add_layer(layer).map_err(|e| CoreError::sink("mvt layer", e.to_string()))?;
    let bytes = mvt_tile.to_bytes().map_err(|e| CoreError::sink("mvt encode", e.to_string()))?;
    Ok(Some(bytes))
}

/// One directed edge of a polygon ring, as the tiler's in-progress
/// geometry represents it before ring-closing.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Edge {
    from: (i32, i32),
    to: (i32, i32),
}

/// Stitch a soup of square-cell outlines back into merged ring
/// boundaries by cancelling shared edges and walking the remainder
/// into closed cycles. Exists because the normalization pass emits one
/// independent square per cell rather than a merged polygon, but it's
/// not wired into [`encode_vector`] — adjacent same-level cells are
/// currently emitted as separate overlapping squares, matching the
/// upstream tool's own disabled call site.
#[allow(dead_code)]
fn merge_rings(edges: Vec<Edge>) -> Result<Vec<(i32, i32)>, CoreError> {
    let mut remaining: Vec<Edge> = Vec::with_capacity(edges.len());

    for e in edges {
        if let Some(pos) = remaining.iter().position(|r| r.from == e.to && r.to == e.from) {
            remaining.remove(pos);
        } else {
            remaining.push(e);
        }
    }

    let mut out = Vec::new();
    while !remaining.is_empty() {
        let start_edge = remaining.remove(0);
        let start = start_edge.from;
        let mut here = start_edge.to;
        out.push(start);
        out.push(here);

        loop {
            let pos = remaining.iter().position(|e| e.from == here);
            let Some(pos) = pos else {
                return Err(CoreError::internal("merge_rings: no path continuing a cycle"));
            };
            let edge = remaining.remove(pos);
            here = edge.to;
            out.push(here);
            if here == start {
                break;
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(levels: u32, first_level: u32, gamma: f64) -> RunConfig {
        RunConfig {
            input_path: "x".into(),
            output_path: "y".into(),
            zoom: 10,
            detail: 4,
            levels,
            first_level,
            count_gamma: gamma,
            bitmap: false,
            color: 0x888888,
            white: false,
            force: false,
        }
    }

    #[test]
    fn normalize_zero_count_stays_zero() {
        assert_eq!(normalize_cell(0, 100, &cfg(50, 6, 2.5)), 0);
    }

    #[test]
    fn normalize_caps_at_levels_minus_one() {
        let level = normalize_cell(u64::MAX / 2, 1, &cfg(50, 6, 2.5));
        assert_eq!(level, 49);
    }

    #[test]
    fn normalize_is_monotonic_in_count() {
        let c = cfg(50, 1, 2.5);
        let a = normalize_cell(10, 1000, &c);
        let b = normalize_cell(100, 1000, &c);
        let d = normalize_cell(900, 1000, &c);
        assert!(a <= b);
        assert!(b <= d);
    }

    #[test]
    fn normalize_tile_drops_all_below_first_level() {
        let mut t = Tile::new(1);
        t.reset(3, 0, 0);
        t.add(0, 0, 1);
        let c = cfg(50, 40, 2.5);
        let anything = normalize_tile(&mut t, 1_000_000, &c);
        assert!(!anything);
    }

    #[test]
    fn root_zero_is_zero() {
        assert_eq!(root(0.0, 2.5), 0.0);
    }

    #[test]
    fn root_inverts_power() {
        let v = 81.0;
        let gamma = 4.0;
        let r = root(v, gamma);
        assert!((r.powf(gamma) - v).abs() < 1e-6);
    }

    #[test]
    fn merge_rings_closes_single_square() {
        let edges = vec![
            Edge { from: (0, 0), to: (1, 0) },
            Edge { from: (1, 0), to: (1, 1) },
            Edge { from: (1, 1), to: (0, 1) },
            Edge { from: (0, 1), to: (0, 0) },
        ];
        let ring = merge_rings(edges).unwrap();
        assert_eq!(ring.first(), ring.last());
    }

    #[test]
    fn merge_rings_cancels_shared_edge_between_adjacent_squares() {
        // Two unit squares sharing the edge (1,0)-(1,1) should merge
        // into one rectangle, with the shared edge cancelled in both
        // directions.
        let mut edges = vec![
            Edge { from: (0, 0), to: (1, 0) },
            Edge { from: (1, 0), to: (1, 1) },
            Edge { from: (1, 1), to: (0, 1) },
            Edge { from: (0, 1), to: (0, 0) },
        ];
        edges.extend([
            Edge { from: (1, 0), to: (2, 0) },
            Edge { from: (2, 0), to: (2, 1) },
            Edge { from: (2, 1), to: (1, 1) },
            Edge { from: (1, 1), to: (1, 0) },
        ]);
        let ring = merge_rings(edges).unwrap();
        assert_eq!(ring.first(), ring.last());
        assert!(ring.len() < 10);
    }

    #[test]
    fn merge_rings_errors_on_dangling_edge() {
        let edges = vec![Edge { from: (0, 0), to: (1, 0) }];
        assert!(merge_rings(edges).is_err());
    }
}
