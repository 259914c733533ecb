use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tile_count::config::RunConfig;

/// Aggregate a sorted `(index, count)` record file into a pyramid of
/// density tiles written to an MBTiles file.
#[derive(Parser, Debug)]
#[command(name = "tile-count")]
#[command(about = "Aggregate counted points into a density tile pyramid")]
#[command(long_about = "Two-pass, sharded aggregation of a sorted record file into a quadtree \
of density tiles, normalized against a streaming quantile sketch and written \
to an MBTiles file as either PNG bitmaps or vector tiles.")]
struct Args {
    /// Sorted input file of (index, count) records
    input: PathBuf,

    /// Output MBTiles file
    #[arg(short = 'o', long, help = "Path to the MBTiles file to create")]
    output: PathBuf,

    /// Effective maximum resolution: tile zoom plus dense-grid detail bits
    #[arg(short = 'z', long, help = "Maximum zoom (tile zoom + detail bits)")]
    zoom: u8,

    /// log2 of the per-tile dense grid side length
    #[arg(short = 'd', long, default_value_t = 9, help = "Detail bits per tile")]
    detail: u8,

    /// Number of discrete normalized density levels
    #[arg(short = 'l', long, default_value_t = 50, help = "Number of density levels")]
    levels: u32,

    /// Levels below this are dropped as noise
    #[arg(short = 'm', long, default_value_t = 6, help = "Minimum level kept in output")]
    first_level: u32,

    /// Gamma applied before bucketing into levels
    #[arg(short = 'g', long, default_value_t = 2.5, help = "Normalization gamma")]
    count_gamma: f64,

    /// Render bitmap (PNG) tiles instead of vector tiles
    #[arg(short = 'b', long, help = "Render PNG bitmap tiles instead of vector tiles")]
    bitmap: bool,

    /// Base color for bitmap rendering, as a hex RGB value
    #[arg(short = 'c', long, default_value = "888888", help = "Bitmap base color (hex RGB)")]
    color: String,

    /// Fade toward black instead of white at high density (bitmap only)
    #[arg(short = 'w', long, help = "Fade toward black instead of white")]
    white: bool,

    /// Overwrite the output file if it already exists
    #[arg(short = 'f', long, help = "Overwrite an existing output file")]
    force: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let color = u32::from_str_radix(args.color.trim_start_matches("0x"), 16)
        .map_err(|_| anyhow::anyhow!("invalid color '{}': expected hex RGB", args.color))?;

    let config = RunConfig {
        input_path: args.input,
        output_path: args.output,
        zoom: args.zoom,
        detail: args.detail,
        levels: args.levels,
        first_level: args.first_level,
        count_gamma: args.count_gamma,
        bitmap: args.bitmap,
        color,
        white: args.white,
        force: args.force,
    }
    .validate()?;

    tile_count::run(config)?;
    Ok(())
}
