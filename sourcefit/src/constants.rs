//! Numeric constants shared across the extraction core.

/// Magnitude of the "no data" sentinel. Pixels at or below `-BIG` are
/// treated as missing everywhere.
pub const BIG: f32 = 1e30;

/// Sample value stored for pixels without data.
pub const NO_DATA: f32 = -BIG;

/// Detection-array growth and shrink increment of an `ObjectList`.
pub const OBJLIST_CAPACITY_STEP: usize = 16;

/// Margin in pixels around a detection's bounding box for its full cutout.
pub const CUTOUT_MARGIN: i32 = 4;

/// Half-width of the Lanczos resampling window, in samples.
pub const LANCZOS_ORDER: usize = 3;

/// Taps of the separable resampling kernel (`2 * LANCZOS_ORDER`).
pub const LANCZOS_TAPS: usize = 2 * LANCZOS_ORDER;

/// Relative width of the cross-fade zone at the inner edge of bars and arms.
pub const BAR_CROSSFADE: f64 = 0.1;

/// Saturation value of the logistic parameter transform.
pub const UNBOUND_LIMIT: f64 = 50.0;

/// Sentinel magnitude for non-positive fluxes.
pub const MAG_SENTINEL: f64 = 99.0;

/// Half-light radius of an exponential disk in units of its scale length.
pub const EXP_HALF_LIGHT: f64 = 1.67835;

/// `b_n` of the de Vaucouleurs law (Sérsic n = 4).
pub const DEVAUC_BN: f64 = 7.66924944;

/// Side of the tabulated Sérsic cube, in table pixels.
pub const TAB_RES: usize = 128;

/// Number of Sérsic indices sampled by the tabulated cube.
pub const TAB_NSUB: usize = 16;

/// Sérsic index of the first plane of the tabulated cube.
pub const TAB_N_ZERO: f64 = 0.2;

/// Sérsic index step between planes of the tabulated cube.
pub const TAB_N_STEP: f64 = 8.0 / TAB_NSUB as f64;
