//! # Two-pass driver
//!
//! Orchestrates the whole run: memory-map the input once, split its
//! records evenly (aligned only to record boundaries, never to tile
//! boundaries) across one OS thread per available CPU, and make two
//! synchronized passes over every shard — pass 0 gathers per-zoom
//! quantile sketches, pass 1 normalizes and emits tiles. Each pass is a
//! hard barrier: every shard's thread is joined before the next pass
//! (or the final metadata write) begins.

use std::fs::File;
use std::sync::atomic::AtomicU8;
use std::thread;

use memmap2::Mmap;

use crate::config::RunConfig;
use crate::error::{CoreError, CoreResult};
use crate::kll::KllSketch;
use crate::normalize::{self, Normalization};
use crate::reconcile;
use crate::record;
use crate::shard::{self, ShardOutput};
use crate::sink::{Metadata, MbtilesSink, TileSink};
use crate::tile::Tile;

/// Split `record_count` records into `shards` contiguous, record-
/// aligned ranges as evenly as integer division allows.
fn shard_ranges(record_count: usize, shards: usize) -> Vec<(usize, usize)> {
    let mut ranges = Vec::with_capacity(shards);
    let mut start = 0;
    for j in 0..shards {
        let end = if j + 1 == shards { record_count } else { (j + 1) * record_count / shards };
        ranges.push((start, end));
        start = end;
    }
    ranges
}

/// Convert a 32-bit world coordinate pair into (lon, lat), treating the
/// pair as the upper-left corner of the cell it addresses at full
/// (zoom-32) precision.
fn world_to_lonlat(wx: u32, wy: u32) -> (f64, f64) {
    use std::f64::consts::PI;
    let n = 2f64.powi(32);
    let lon = (wx as f64 / n) * 360.0 - 180.0;
    let y_frac = wy as f64 / n;
    let lat_rad = (PI * (1.0 - 2.0 * y_frac)).sinh().atan();
    (lon, lat_rad.to_degrees())
}

/// Run one full two-pass pipeline and write the MBTiles output.
pub fn run(cfg: RunConfig) -> CoreResult<()> {
    let file = File::open(&cfg.input_path)
        .map_err(|e| CoreError::io(format!("opening {}", cfg.input_path.display()), e))?;
    let map = unsafe { Mmap::map(&file) }
        .map_err(|e| CoreError::io(format!("mapping {}", cfg.input_path.display()), e))?;
    let path_str = cfg.input_path.display().to_string();
    let header = record::Header::parse(&map, &path_str)?;

    let sink = MbtilesSink::open(&cfg.output_path, cfg.force)?;

    let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

    let mut zoom_max: Vec<u64> = Vec::new();
    let mut file_bbox = [u32::MAX, u32::MAX, 0u32, 0u32];
    let mut midx = 0u32;
    let mut midy = 0u32;

    for pass in 0..2usize {
        let ranges = shard_ranges(header.record_count, cpus);
        let progress: Vec<AtomicU8> = (0..cpus).map(|_| AtomicU8::new(0)).collect();

        let map_slice: &[u8] = &map[..];
        let sink_ref: Option<&dyn TileSink> = if pass == 1 { Some(&sink) } else { None };

        let results: Vec<CoreResult<ShardOutput>> = thread::scope(|scope| {
            let handles: Vec<_> = ranges
                .iter()
                .enumerate()
                .map(|(shard_idx, &(start, end))| {
                    let cfg = &cfg;
                    let zoom_max = &zoom_max;
                    let progress = &progress;
                    scope.spawn(move || {
                        shard::run_shard(
                            cfg, map_slice, start, end, pass, zoom_max, sink_ref, progress,
                            shard_idx,
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("shard thread panicked")).collect()
        });
        eprintln!();

        let mut outputs: Vec<ShardOutput> = results.into_iter().collect::<CoreResult<Vec<_>>>()?;

        let mut all_partials: Vec<Tile> = Vec::new();
        for out in outputs.iter_mut() {
            all_partials.append(&mut out.partial_tiles);
        }
        let reconciled = reconcile::reconcile(all_partials);

        if pass == 0 {
            if let Some(first) = outputs.first_mut() {
                normalize::absorb_partials(&mut first.quantiles, &mut first.max, &reconciled);
            }

            let quantiles: Vec<Vec<KllSketch>> =
                outputs.iter().map(|o| o.quantiles.clone()).collect();
            let maxes: Vec<Vec<u64>> = outputs.iter().map(|o| o.max.clone()).collect();
            let Normalization { zoom_max: zm, raw_max } = normalize::normalize(&quantiles, &maxes);
            zoom_max = zm;
            normalize::regress(&raw_max);
        } else {
            for mut tile in reconciled {
                let z = tile.z as usize;
                crate::emit::emit_tile(&cfg, &mut tile, zoom_max[z], &sink)?;
            }

            for out in &outputs {
                file_bbox[0] = file_bbox[0].min(out.bbox[0]);
                file_bbox[1] = file_bbox[1].min(out.bbox[1]);
                file_bbox[2] = file_bbox[2].max(out.bbox[2]);
                file_bbox[3] = file_bbox[3].max(out.bbox[3]);
            }

            // Matches the upstream tool's own choice: only the first
            // shard's hottest-cell coordinate is used for the file's
            // reported midpoint, not the true maximum across shards.
            if let Some(first) = outputs.first() {
                midx = first.midx;
                midy = first.midy;
            }
        }
    }

    let (midlon, midlat) = world_to_lonlat(midx, midy);
    let (minlon, maxlat) = world_to_lonlat(file_bbox[0], file_bbox[1]);
    let (maxlon, minlat) = world_to_lonlat(file_bbox[2], file_bbox[3]);

    sink.write_metadata(&Metadata {
        minzoom: 0,
        maxzoom: cfg.maxzoom(),
        minlon,
        minlat,
        maxlon,
        maxlat,
        midlon,
        midlat,
        vector_layer: if cfg.bitmap { None } else { Some("count") },
    })?;
    sink.close()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_ranges_cover_every_record_exactly_once() {
        let ranges = shard_ranges(103, 4);
        assert_eq!(ranges[0].0, 0);
        assert_eq!(ranges.last().unwrap().1, 103);
        for w in ranges.windows(2) {
            assert_eq!(w[0].1, w[1].0);
        }
    }

    #[test]
    fn shard_ranges_handles_fewer_records_than_shards() {
        let ranges = shard_ranges(2, 8);
        let total: usize = ranges.iter().map(|&(s, e)| e - s).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn world_to_lonlat_origin_is_far_corner() {
        let (lon, lat) = world_to_lonlat(0, 0);
        assert!((lon - (-180.0)).abs() < 1e-6);
        assert!(lat > 85.0);
    }

    #[test]
    fn world_to_lonlat_center_is_near_equator_prime_meridian() {
        let half = 1u32 << 31;
        let (lon, lat) = world_to_lonlat(half, half);
        assert!(lon.abs() < 1e-3);
        assert!(lat.abs() < 1.0);
    }
}
