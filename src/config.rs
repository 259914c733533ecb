//! # Run configuration
//!
//! `RunConfig` is the validated, immutable settings bundle threaded
//! into every shard worker and the emit stage — the same separation the
//! teacher draws between its CLI-facing `Args` and the `CaptureConfig`/
//! options struct the capture engine actually reads.

use std::path::PathBuf;

use crate::error::CoreError;

/// Validated settings for one pipeline run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Effective maximum resolution: tile zoom plus dense-grid detail bits.
    pub zoom: u8,
    /// `log2` of the per-tile dense grid side length.
    pub detail: u8,
    /// Number of discrete normalized density levels.
    pub levels: u32,
    /// Levels below this are dropped as noise when emitting a tile.
    pub first_level: u32,
    /// Gamma applied to the normalized count before bucketing into levels.
    pub count_gamma: f64,
    pub bitmap: bool,
    /// Base color (0xRRGGBB) used by the bitmap renderer.
    pub color: u32,
    pub white: bool,
    /// Overwrite an existing output file instead of failing.
    pub force: bool,
}

impl RunConfig {
    /// Number of tile-pyramid zoom levels this run will produce:
    /// `zoom - detail + 1`, covering zoom indices `0..=maxzoom()`.
    pub fn zooms(&self) -> u8 {
        self.zoom - self.detail + 1
    }

    pub fn maxzoom(&self) -> u8 {
        self.zooms() - 1
    }

    pub fn validate(self) -> Result<Self, CoreError> {
        if (self.zoom as i32) < self.detail as i32 + 1 {
            return Err(CoreError::config(
                "zoom",
                format!("detail ({}) too low for zoom ({})", self.detail, self.zoom),
            ));
        }
        if self.detail == 0 || self.detail > 12 {
            return Err(CoreError::config("detail", "must be in 1..=12"));
        }
        if self.zoom > 32 {
            return Err(CoreError::config("zoom", "must be <= 32 (world coordinates are 32-bit)"));
        }
        if self.levels < 2 {
            return Err(CoreError::config("levels", "must be at least 2"));
        }
        if self.count_gamma <= 0.0 {
            return Err(CoreError::config("count-gamma", "must be positive"));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RunConfig {
        RunConfig {
            input_path: "in.count".into(),
            output_path: "out.mbtiles".into(),
            zoom: 14,
            detail: 9,
            levels: 50,
            first_level: 6,
            count_gamma: 2.5,
            bitmap: false,
            color: 0x88_88_88,
            white: false,
            force: false,
        }
    }

    #[test]
    fn zooms_matches_original_formula() {
        let cfg = base().validate().unwrap();
        assert_eq!(cfg.zooms(), 6);
        assert_eq!(cfg.maxzoom(), 5);
    }

    #[test]
    fn rejects_detail_too_high_for_zoom() {
        let mut cfg = base();
        cfg.detail = 14;
        cfg.zoom = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_levels() {
        let mut cfg = base();
        cfg.levels = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_detail_above_vector_extent_bits() {
        let mut cfg = base();
        cfg.detail = 13;
        cfg.zoom = 20;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zoom_above_32() {
        let mut cfg = base();
        cfg.zoom = 33;
        assert!(cfg.validate().is_err());
    }
}
