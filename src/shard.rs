//! # Shard worker
//!
//! One shard owns a contiguous, record-aligned slice of the input file
//! and scans it once, maintaining one in-progress [`Tile`] per zoom
//! level. A tile is "fully owned" by the shard if its complete Morton
//! index range falls inside the shard's slice; otherwise it's handed
//! off to cross-shard reconciliation. No suspension points run inside
//! this scan — it's a plain, synchronous loop over a `&[u8]` slice, run
//! on its own `std::thread::spawn` OS thread per the driver.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::config::RunConfig;
use crate::emit;
use crate::error::CoreResult;
use crate::kll::KllSketch;
use crate::record;
use crate::sink::TileSink;
use crate::tile::Tile;

/// Inclusive Morton-index range fully spanned by tile `(z, x, y)`, at
/// tile-pyramid zoom `z` (not `z + detail`).
pub fn calc_tile_edges(z: u8, x: u32, y: u32) -> (u64, u64) {
    let shift = 32 - z as u32;
    let start = record::encode(shl32(x, shift), shl32(y, shift));
    let mut end = start;
    for i in 0..shift {
        end |= 3u64 << (2 * i);
    }
    (start, end)
}

#[inline]
fn shl32(v: u32, shift: u32) -> u32 {
    if shift >= 32 {
        0
    } else {
        v << shift
    }
}

/// Everything one shard produces from one pass over its slice.
pub struct ShardOutput {
    /// Tiles that straddled the shard boundary, to be merged with the
    /// same tiles from neighboring shards.
    pub partial_tiles: Vec<Tile>,
    /// Per-zoom quantile sketch, populated on pass 0 only.
    pub quantiles: Vec<KllSketch>,
    /// Per-zoom maximum cell value seen, populated on pass 0 only.
    pub max: Vec<u64>,
    /// `[min_wx, min_wy, max_wx, max_wy]` over every record this shard touched.
    pub bbox: [u32; 4],
    /// Largest single cell value seen across every zoom this shard
    /// touched, tracked without resetting between zooms or tiles —
    /// matching the upstream tool's single running comparison variable.
    pub shard_max: u64,
    pub midx: u32,
    pub midy: u32,
}

impl ShardOutput {
    fn new(zooms: usize) -> Self {
        Self {
            partial_tiles: Vec::new(),
            quantiles: (0..zooms).map(|_| KllSketch::new(KllSketch::DEFAULT_K)).collect(),
            max: vec![0; zooms],
            bbox: [u32::MAX, u32::MAX, 0, 0],
            shard_max: 0,
            midx: 0,
            midy: 0,
        }
    }
}

/// Absorb one finished tile's cells into the pass-0 quantile sketch
/// for its zoom, tracking the raw maximum cell value alongside it.
fn gather_quantile(sketch: &mut KllSketch, max: &mut u64, tile: &Tile) {
    for &count in &tile.count {
        sketch.update(count as f64);
        if count > *max {
            *max = count;
        }
    }
}

/// Scan one shard's record range for one pass.
///
/// `zoom_max` is empty on pass 0 (not yet known) and holds one entry
/// per zoom on pass 1. `sink` is `None` on pass 0 and required on pass
/// 1 — every fully-owned tile is normalized, encoded, and written as
/// it's discovered rather than held in memory.
pub fn run_shard(
    cfg: &RunConfig,
    map: &[u8],
    start: usize,
    end: usize,
    pass: usize,
    zoom_max: &[u64],
    sink: Option<&dyn TileSink>,
    progress: &[AtomicU8],
    shard_idx: usize,
) -> CoreResult<ShardOutput> {
    let zooms = cfg.zooms() as usize;
    let mut out = ShardOutput::new(zooms);
    let mut tiles: Vec<Tile> = (0..zooms).map(|_| Tile::new(cfg.detail)).collect();

    if start >= end {
        return Ok(out);
    }

    let first = record::read_index(map, start);
    let last = record::read_index(map, end - 1);
    let span = (end - start) as u64;
    let mut seq: u64 = 0;
    let mut last_percent: i64 = -1;
    let mut oindex: u64 = 0;

    for i in start..end {
        let index = record::read_index(map, i);
        let count = record::read_count(map, i) as u64;
        seq += 1;

        if oindex > index {
            eprintln!("out of order: {oindex:x} vs {index:x}");
        }
        oindex = index;

        let percent = (100 * seq / span) as i64;
        if percent != last_percent {
            last_percent = percent;
            progress[shard_idx].store(percent as u8, Ordering::Relaxed);
            let sum: u32 = progress.iter().map(|p| p.load(Ordering::Relaxed) as u32).sum();
            let avg = sum / progress.len() as u32;
            eprint!("  {}%\r", avg / 2 + 50 * pass as u32);
        }

        let (wx, wy) = record::decode(index);
        out.bbox[0] = out.bbox[0].min(wx);
        out.bbox[1] = out.bbox[1].min(wy);
        out.bbox[2] = out.bbox[2].max(wx);
        out.bbox[3] = out.bbox[3].max(wy);

        for z in 0..zooms {
            let zu = z as u8;
            let shift = 32 - (zu as u32 + cfg.detail as u32);
            let mut tx = wx;
            let mut ty = wy;
            if shift > 0 {
                tx >>= shift;
                ty >>= shift;
            }
            let px = tx & ((1u32 << cfg.detail) - 1);
            let py = ty & ((1u32 << cfg.detail) - 1);
            let tx = tx >> cfg.detail;
            let ty = ty >> cfg.detail;

            if tiles[z].x != tx || tiles[z].y != ty || !tiles[z].active {
                if tiles[z].active {
                    finalize_tile(cfg, &mut tiles[z], zu, first, last, pass, &mut out, zoom_max, sink)?;
                }
                tiles[z].reset(zu, tx, ty);
            }

            tiles[z].add(px as usize, py as usize, count);

            let cell = tiles[z].count[py as usize * (1usize << cfg.detail) + px as usize];
            if cell > out.shard_max {
                out.shard_max = cell;
                out.midx = wx;
                out.midy = wy;
            }
        }
    }

    for (z, t) in tiles.iter_mut().enumerate() {
        if t.active {
            finalize_tile(cfg, t, z as u8, first, last, pass, &mut out, zoom_max, sink)?;
        }
    }

    Ok(out)
}

/// Decide whether `tile` is fully spanned by this shard's `[first,
/// last]` record range; if so, fold it into the pass-appropriate
/// output (quantile gathering or emit), otherwise queue it as partial.
#[allow(clippy::too_many_arguments)]
fn finalize_tile(
    cfg: &RunConfig,
    t: &mut Tile,
    z: u8,
    first: u64,
    last: u64,
    pass: usize,
    out: &mut ShardOutput,
    zoom_max: &[u64],
    sink: Option<&dyn TileSink>,
) -> CoreResult<()> {
    let (first_for_tile, last_for_tile) = calc_tile_edges(z, t.x, t.y);

    if first_for_tile >= first && last_for_tile <= last {
        if pass == 0 {
            gather_quantile(&mut out.quantiles[z as usize], &mut out.max[z as usize], t);
        } else {
            let sink = sink.expect("pass 1 requires a sink");
            emit::emit_tile(cfg, t, zoom_max[z as usize], sink)?;
        }
    } else {
        out.partial_tiles.push(t.clone());
    }
    Ok(())
}
