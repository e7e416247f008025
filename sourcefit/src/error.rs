use std::collections::TryReserveError;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the extraction core.
///
/// Only [`Error::Allocation`] is fatal for a running extraction. Degenerate
/// inputs are reported through detection and fit flags, never here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("allocation failed: {0}")]
    Allocation(#[from] TryReserveError),

    #[error("PSF kernel has no positive flux")]
    EmptyPsf,

    #[error("raster size mismatch: expected {expected} samples, got {actual}")]
    InvalidRaster { expected: usize, actual: usize },

    #[error("work queue is shut down")]
    QueueClosed,

    #[error("failed to read configuration '{path}': {source}")]
    ConfigIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yml::Error),
}

impl Error {
    /// Whether the error must abort the whole extraction.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Allocation(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
