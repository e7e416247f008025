//! Source extraction and profile fitting for astronomical images.
//!
//! The pipeline runs in three stages over a background-subtracted field:
//!
//! 1. [`segment`] extracts 8-connected groups of above-threshold pixels in a
//!    single scan, storing their pixels as chains in an arena.
//! 2. [`deblend`] splits each blend group by iteratively fitting Moffat
//!    models to every member and re-detecting the residual.
//! 3. [`fit_profile`] fits a PSF-convolved sum of galaxy components to each
//!    detection and derives fluxes, positions and shapes with errors.
//!
//! [`pipeline::extract`] chains the three stages and spreads the per-group
//! work over a [`WorkQueue`].

pub mod check;
pub mod config;
pub mod constants;
pub mod deblend;
pub mod error;
pub mod field;
pub mod fit;
pub mod objlist;
pub mod pipeline;
pub mod profile;
pub mod psf;
pub mod queue;
pub mod segment;
pub mod subimage;

#[cfg(test)]
mod test_utils;

pub use check::{CheckImage, CheckSink};
pub use config::Config;
pub use deblend::{deblend, DeblendChecks};
pub use error::{Error, Result};
pub use field::{Field, ImageField};
pub use fit::{fit_profile, fit_profile_with, FitFlags, LevenbergMarquardt, LmConfig, Minimizer, ProfileFit};
pub use objlist::{Detection, DetectionFlags, ObjectList, PixelArena};
pub use pipeline::extract;
pub use profile::{ComponentKind, ProfileModel};
pub use psf::{Psf, RasterPsf};
pub use queue::WorkQueue;
pub use segment::{segment, ScanBounds, Threshold};
pub use subimage::{FillMode, FilterKernel, SubImage};
