//! # Error taxonomy
//!
//! The pipeline recognizes a small, closed set of fault categories (see
//! the error handling design in the project notes): configuration
//! faults and input-format faults are caught before any shard starts
//! work; capacity faults, sink faults, and internal invariant faults
//! abort the running process. Ordering violations are warnings, not
//! errors, and are never represented here — they go straight to stderr
//! from the shard worker that notices them.
//!
//! A hand-rolled enum with named fields per variant, `Display`/
//! `std::error::Error` impls, and `From` conversions at the edges,
//! rather than pulling in `thiserror`.

use std::fmt;

/// Top-level error type for the tiling pipeline.
#[derive(Debug)]
pub enum CoreError {
    /// Bad CLI options (zoom/detail relationship, missing output path, ...).
    Config { field: String, reason: String },
    /// The input file's header or size doesn't match the expected record layout.
    InputFormat { path: String, reason: String },
    /// An encoded tile exceeded the sink's size ceiling.
    Capacity { z: u8, x: u32, y: u32, bytes: usize, limit: usize },
    /// The tile sink rejected a write or failed to open/close.
    Sink { operation: String, reason: String },
    /// An invariant the pipeline relies on did not hold.
    Internal { what: String },
    /// Wrapped I/O failure (mmap, file open, ...).
    Io { operation: String, source: std::io::Error },
}

impl CoreError {
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config { field: field.into(), reason: reason.into() }
    }

    pub fn input_format(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InputFormat { path: path.into(), reason: reason.into() }
    }

    pub fn capacity(z: u8, x: u32, y: u32, bytes: usize, limit: usize) -> Self {
        Self::Capacity { z, x, y, bytes, limit }
    }

    pub fn sink(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Sink { operation: operation.into(), reason: reason.into() }
    }

    pub fn internal(what: impl Into<String>) -> Self {
        Self::Internal { what: what.into() }
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { operation: operation.into(), source }
    }

    /// Stable category name, for log lines that want a short tag.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::InputFormat { .. } => "input_format",
            Self::Capacity { .. } => "capacity",
            Self::Sink { .. } => "sink",
            Self::Internal { .. } => "internal",
            Self::Io { .. } => "io",
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { field, reason } => {
                write!(f, "configuration error in '{field}': {reason}")
            }
            Self::InputFormat { path, reason } => {
                write!(f, "input format error in '{path}': {reason}")
            }
            Self::Capacity { z, x, y, bytes, limit } => write!(
                f,
                "tile {z}/{x}/{y} encoded to {bytes} bytes, over the {limit} byte limit"
            ),
            Self::Sink { operation, reason } => {
                write!(f, "sink failure during {operation}: {reason}")
            }
            Self::Internal { what } => write!(f, "internal invariant violated: {what}"),
            Self::Io { operation, source } => write!(f, "I/O error during {operation}: {source}"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(source: std::io::Error) -> Self {
        Self::io("unknown", source)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
