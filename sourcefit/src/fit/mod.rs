//! Profile fitting of single detections.
//!
//! [`fit_model`] drives one bounded least-squares fit of a
//! [`ProfileModel`] against the pixels of a source window. [`fit_profile`]
//! wraps it for catalog measurement: it sizes the frame, cuts the window
//! out of the field, and derives fluxes, errors and shapes from the fitted
//! parameters.

mod bridge;
mod linear_solver;
mod lm;
mod residuals;


pub use bridge::{covariance_to_bounded, slot_to_bounded, slot_to_unbounded, to_bounded, to_unbounded};
pub use lm::{LevenbergMarquardt, LmConfig, MinimizeOutcome, Minimizer, ResidualFn};
pub use residuals::{compress, FitContext};

use bitflags::bitflags;
use tracing::debug;

use crate::config::Config;
use crate::constants::MAG_SENTINEL;
use crate::error::Result;
use crate::field::ImageField;
use crate::objlist::Detection;
use crate::profile::{
    ComponentKind, FrameLimits, ModelFrame, NoiseModel, ObjectCutout, ParamKind, ParamSeed, ParamSlot,
    ProfileModel,
};
use crate::psf::Psf;
use crate::subimage::SubImage;

/// Fraction of a component's flux allowed outside the model frame before
/// the fit is flagged.
const MAX_LOST_FLUX: f64 = 0.2;

/// Sentinel concentration for undefined flux ratios.
const CONCENTRATION_SENTINEL: f64 = 99.0;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FitFlags: u32 {
        /// Fewer valid pixels than free parameters; nothing was fitted.
        const NOT_CONSTRAINED = 1 << 0;
        /// A component loses a large part of its flux outside the frame.
        const APERTURE_PROBLEM = 1 << 1;
        /// The fitting window bins several detector pixels per pixel.
        const OBJECT_SUBSAMPLED = 1 << 2;
        /// The model raster was coarsened to fit the size limit.
        const MODEL_SUBSAMPLED = 1 << 3;
    }
}

/// Per-fit settings taken from the configuration and the field.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOptions {
    pub limits: FrameLimits,
    pub noise: NoiseModel,
    pub background_noise: f64,
    pub max_iterations: usize,
    pub compression: Option<f64>,
}

impl FitOptions {
    pub fn new(config: &Config, field: &dyn ImageField) -> Self {
        Self {
            limits: FrameLimits {
                max_object_size: config.max_object_size,
                max_model_size: config.max_model_size,
                oversampling: config.oversampling,
            },
            noise: NoiseModel {
                gain: field.gain(),
                saturation: field.saturation(),
            },
            background_noise: field.background_noise() as f64,
            max_iterations: config.max_fit_iterations,
            compression: config.dynamic_compression,
        }
    }
}

/// Bookkeeping of one minimization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitRun {
    pub iterations: usize,
    pub chi2: f64,
    /// Valid pixels in the fitting window.
    pub nresi: usize,
    pub nfree: usize,
    pub flags: FitFlags,
}

/// Fitted parameters of one component, after aspect and angle folding.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentShape {
    pub kind: ComponentKind,
    pub flux: f64,
    pub scale: f64,
    pub aspect: f64,
    pub posang: f64,
    pub sersic_n: Option<f64>,
    /// Second moments `(mx2, my2, mxy)` of the analytic laws.
    pub moments: Option<(f64, f64, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileFit {
    pub components: Vec<ComponentKind>,
    /// Fitted slots, aspects folded below 1 and angles into (-90, 90].
    pub params: Vec<ParamSlot>,
    /// Slot covariance, row-major.
    pub covariance: Vec<f64>,
    pub iterations: usize,
    pub flags: FitFlags,
    pub nresi: usize,
    pub nfree: usize,
    pub chi2: f64,
    pub reduced_chi2: f64,

    pub flux: f64,
    pub flux_err: f64,
    pub mag: f64,
    pub mag_err: f64,

    /// Profile centre in parent-field pixels.
    pub x: f64,
    pub y: f64,
    pub x_err: f64,
    pub y_err: f64,
    /// Position error ellipse, angle in degrees.
    pub err_a: f64,
    pub err_b: f64,
    pub err_theta: f64,

    pub shapes: Vec<ComponentShape>,

    /// Point-source likelihood in [0, 1].
    pub class_star: Option<f64>,
    /// Magnitude difference between the point-source and full fits.
    pub concentration: Option<f64>,
}

impl ProfileFit {
    /// Collects the results of `run` from the fitted `model`.
    pub fn from_model(model: &ProfileModel, run: &FitRun, zeropoint: f64) -> Self {
        let registry = model.registry();
        let values = registry.values();
        let n = registry.len();
        let mut covariance = model.covariance().to_vec();
        if covariance.len() != n * n {
            covariance = vec![0.0; n * n];
        }
        let cov = |a: usize, b: usize| covariance[a * n + b];

        let mut params = registry.slots().to_vec();
        fold_geometry(&mut params);

        let frame = model.frame();
        let slot_value = |kind: ParamKind| registry.index_of(kind).map_or(0.0, |i| values[i]);
        let x = frame.ix as f64 + slot_value(ParamKind::X);
        let y = frame.iy as f64 + slot_value(ParamKind::Y);
        let (vx, vy, vxy) = match (registry.index_of(ParamKind::X), registry.index_of(ParamKind::Y)) {
            (Some(ix), Some(iy)) => (cov(ix, ix), cov(iy, iy), cov(ix, iy)),
            _ => (0.0, 0.0, 0.0),
        };
        let (err_a, err_b, err_theta) = error_ellipse(vx, vy, vxy);

        let mut flux_slots: Vec<usize> = model
            .components()
            .iter()
            .filter(|c| c.kind() != ComponentKind::Background)
            .map(|c| c.amplitude_slot())
            .collect();
        flux_slots.sort_unstable();
        flux_slots.dedup();
        let flux = model.flux(&values);
        let flux_var: f64 = flux_slots
            .iter()
            .flat_map(|&a| flux_slots.iter().map(move |&b| (a, b)))
            .map(|(a, b)| cov(a, b))
            .sum();
        let flux_err = flux_var.max(0.0).sqrt();

        let shapes = model
            .components()
            .iter()
            .filter(|c| c.kind() != ComponentKind::Background)
            .map(|c| {
                let folded = |kind: ParamKind| {
                    c.slot(kind).map_or(0.0, |i| params[i].value)
                };
                let (scale, aspect, posang) = match c.kind() {
                    ComponentKind::Sersic | ComponentKind::DeVaucouleurs | ComponentKind::Tabulated => (
                        folded(ParamKind::SpheroidReff),
                        folded(ParamKind::SpheroidAspect),
                        folded(ParamKind::SpheroidPosang),
                    ),
                    ComponentKind::Moffat => (
                        folded(ParamKind::MoffatAlpha),
                        folded(ParamKind::MoffatAspect),
                        folded(ParamKind::MoffatPosang),
                    ),
                    ComponentKind::Dirac => (0.0, 1.0, 0.0),
                    _ => (
                        folded(ParamKind::DiskScale),
                        folded(ParamKind::DiskAspect),
                        folded(ParamKind::DiskPosang),
                    ),
                };
                ComponentShape {
                    kind: c.kind(),
                    flux: c.amplitude(&values),
                    scale,
                    aspect,
                    posang,
                    sersic_n: c.slot(ParamKind::SersicN).map(|i| values[i]),
                    moments: c.moments(&values),
                }
            })
            .collect();

        let reduced_chi2 = if run.nresi > run.nfree {
            run.chi2 / (run.nresi - run.nfree) as f64
        } else {
            0.0
        };
        let mag_err = if flux > 0.0 { 1.085_736 * flux_err / flux } else { MAG_SENTINEL };

        Self {
            components: model.components().iter().map(|c| c.kind()).collect(),
            params,
            covariance,
            iterations: run.iterations,
            flags: run.flags,
            nresi: run.nresi,
            nfree: run.nfree,
            chi2: run.chi2,
            reduced_chi2,
            flux,
            flux_err,
            mag: flux_to_mag(flux, zeropoint),
            mag_err,
            x,
            y,
            x_err: vx.max(0.0).sqrt(),
            y_err: vy.max(0.0).sqrt(),
            err_a,
            err_b,
            err_theta,
            shapes,
            class_star: None,
            concentration: None,
        }
    }

    /// Value of a fitted parameter after folding.
    pub fn param(&self, kind: ParamKind) -> Option<f64> {
        self.params.iter().find(|s| s.kind == kind).map(|s| s.value)
    }

    /// Fills in `class_star` and `concentration` from a point-source refit
    /// of the same window.
    pub fn set_point_source_fit(&mut self, chi2_psf: f64, flux_psf: f64) {
        self.class_star = Some(class_star(self.chi2, chi2_psf));
        self.concentration = Some(concentration(flux_psf, self.flux));
    }
}

/// Magnitude of `flux` at `zeropoint`, [`MAG_SENTINEL`] when not positive.
pub fn flux_to_mag(flux: f64, zeropoint: f64) -> f64 {
    if flux > 0.0 {
        zeropoint - 2.5 * flux.log10()
    } else {
        MAG_SENTINEL
    }
}

/// `2 / (1 + exp((chi2_psf - chi2) / 2))`, clamped to [0, 1].
pub fn class_star(chi2: f64, chi2_psf: f64) -> f64 {
    (2.0 / (1.0 + (0.5 * (chi2_psf - chi2)).exp())).clamp(0.0, 1.0)
}

/// `-2.5 log10(flux_psf / flux)`, ±99 when either flux is not positive.
pub fn concentration(flux_psf: f64, flux: f64) -> f64 {
    if flux <= 0.0 {
        -CONCENTRATION_SENTINEL
    } else if flux_psf <= 0.0 {
        CONCENTRATION_SENTINEL
    } else {
        -2.5 * (flux_psf / flux).log10()
    }
}

/// Folds an angle in degrees into (-90, 90].
pub fn fold_angle(degrees: f64) -> f64 {
    let mut a = degrees % 180.0;
    if a <= -90.0 {
        a += 180.0;
    } else if a > 90.0 {
        a -= 180.0;
    }
    a
}

/// Brings aspect ratios below 1, swapping axes, then folds every angle.
fn fold_geometry(params: &mut [ParamSlot]) {
    const GEOMETRY: [(ParamKind, ParamKind, ParamKind); 3] = [
        (ParamKind::SpheroidReff, ParamKind::SpheroidAspect, ParamKind::SpheroidPosang),
        (ParamKind::DiskScale, ParamKind::DiskAspect, ParamKind::DiskPosang),
        (ParamKind::MoffatAlpha, ParamKind::MoffatAspect, ParamKind::MoffatPosang),
    ];
    fn find(params: &[ParamSlot], kind: ParamKind) -> Option<usize> {
        params.iter().position(|s| s.kind == kind)
    }
    for (scale, aspect, posang) in GEOMETRY {
        let (Some(si), Some(ai), Some(pi)) = (find(params, scale), find(params, aspect), find(params, posang))
        else {
            continue;
        };
        let q = params[ai].value;
        if q > 1.0 {
            params[ai].value = 1.0 / q;
            params[si].value *= q;
            params[pi].value += 90.0;
        }
    }
    for slot in params.iter_mut().filter(|s| s.kind.is_angle()) {
        slot.value = fold_angle(slot.value);
    }
}

/// Semi-axes and angle of the ellipse of covariance `(vx, vy, vxy)`.
fn error_ellipse(vx: f64, vy: f64, vxy: f64) -> (f64, f64, f64) {
    let mean = 0.5 * (vx + vy);
    let half_diff = 0.5 * (vx - vy);
    let root = (half_diff * half_diff + vxy * vxy).sqrt();
    let theta = if vxy == 0.0 && half_diff == 0.0 {
        0.0
    } else {
        0.5 * (2.0 * vxy).atan2(vx - vy).to_degrees()
    };
    ((mean + root).max(0.0).sqrt(), (mean - root).max(0.0).sqrt(), theta)
}

/// Starting point of a fit of `detection` on `frame`.
pub fn seed_for(detection: &Detection, frame: &ModelFrame, background_noise: f64) -> ParamSeed {
    ParamSeed {
        flux: detection.flux,
        half_light: detection.half_light_radius(),
        a: detection.a,
        b: detection.b,
        theta: detection.theta,
        dx: detection.mx - frame.ix as f64,
        dy: detection.my - frame.iy as f64,
        noise: background_noise,
        extent: (frame.object_size * frame.subsample) as f64,
    }
}

/// Starting point of the point-source refit: the fitted centre and total
/// flux, falling back to `seed` when the fit left no usable flux.
pub fn point_source_seed(seed: &ParamSeed, frame: &ModelFrame, fit: &ProfileFit) -> ParamSeed {
    if !(fit.flux > 0.0 && fit.x.is_finite() && fit.y.is_finite()) {
        return *seed;
    }
    ParamSeed {
        flux: fit.flux,
        dx: fit.x - frame.ix as f64,
        dy: fit.y - frame.iy as f64,
        ..*seed
    }
}

/// Detector pixels covered by the fitting window of `frame`.
pub fn window_source(field: &dyn ImageField, frame: &ModelFrame) -> Result<SubImage> {
    let (x0, y0) = frame.object_origin();
    let span = frame.object_size * frame.subsample;
    SubImage::from_field(field, x0, y0, span, span, field.fallback_variance())
}

/// Fits `model` to the pixels of `source` from the starting point `seed`.
///
/// Pinned slots are held fixed. When the window has fewer valid pixels
/// than free parameters nothing is fitted: the parameters are zeroed and
/// the run is flagged [`FitFlags::NOT_CONSTRAINED`]. On return the model's
/// registry, covariance and window describe the fitted state.
pub fn fit_model(
    model: &mut ProfileModel,
    source: &SubImage,
    seed: &ParamSeed,
    options: &FitOptions,
    minimizer: &dyn Minimizer,
) -> Result<FitRun> {
    model.reset(seed);
    for i in 0..model.registry().len() {
        let slot = model.registry_mut().slot_mut(i);
        slot.free = !slot.is_pinned();
    }

    let frame = *model.frame();
    let mut flags = FitFlags::empty();
    flags.set(FitFlags::OBJECT_SUBSAMPLED, frame.object_subsampled);
    flags.set(FitFlags::MODEL_SUBSAMPLED, frame.model_subsampled);

    let cutout = ObjectCutout::extract(source, &frame, &options.noise)?;
    let free = model.registry().free_indices();
    let nfree = free.len();

    if cutout.valid < nfree {
        debug!(
            valid = cutout.valid,
            nfree,
            x = frame.ix,
            y = frame.iy,
            "Too few valid pixels for the free parameters, fit skipped"
        );
        let n = model.registry().len();
        model.registry_mut().set_values(&vec![0.0; n]);
        model.set_covariance(vec![0.0; n * n]);
        return Ok(FitRun {
            iterations: 0,
            chi2: 0.0,
            nresi: cutout.valid,
            nfree,
            flags: flags | FitFlags::NOT_CONSTRAINED,
        });
    }

    let init = to_unbounded(model.registry(), &free);
    let (outcome, error) = {
        let mut context = FitContext::new(model, &cutout, &free, options.compression);
        let outcome = minimizer.minimize(&mut context, &init, options.max_iterations);
        (outcome, context.take_error())
    };
    if let Some(err) = error {
        return Err(err);
    }

    let mut values = model.registry().values();
    to_bounded(model.registry(), &free, &outcome.params, &mut values);
    model.registry_mut().set_values(&values);
    let covariance = covariance_to_bounded(model.registry(), &free, &outcome.covariance);
    model.set_covariance(covariance);
    model.render(&values)?;

    if model.max_lost_flux() > MAX_LOST_FLUX {
        flags |= FitFlags::APERTURE_PROBLEM;
    }

    Ok(FitRun {
        iterations: outcome.iterations,
        chi2: outcome.chi2,
        nresi: cutout.valid,
        nfree,
        flags,
    })
}

/// Fits the configured model to `detection` with the default
/// Levenberg-Marquardt kernel.
pub fn fit_profile(
    detection: &Detection,
    field: &dyn ImageField,
    psf: Option<&dyn Psf>,
    config: &Config,
) -> Result<ProfileFit> {
    let minimizer = LevenbergMarquardt::new(config.lm.clone());
    fit_profile_with(detection, field, psf, config, &minimizer)
}

/// [`fit_profile`] with a caller-supplied minimizer.
pub fn fit_profile_with(
    detection: &Detection,
    field: &dyn ImageField,
    psf: Option<&dyn Psf>,
    config: &Config,
    minimizer: &dyn Minimizer,
) -> Result<ProfileFit> {
    let options = FitOptions::new(config, field);
    let frame = ModelFrame::for_detection(detection, psf, &options.limits);
    let source = window_source(field, &frame)?;
    let seed = seed_for(detection, &frame, options.background_noise);

    let mut model = ProfileModel::new(&config.model, frame, psf)?;
    let run = fit_model(&mut model, &source, &seed, &options, minimizer)?;
    let mut fit = ProfileFit::from_model(&model, &run, config.mag_zeropoint);

    if config.classify && !run.flags.contains(FitFlags::NOT_CONSTRAINED) {
        let point_like = config
            .model
            .iter()
            .all(|&k| matches!(k, ComponentKind::Dirac | ComponentKind::Background));
        if point_like {
            fit.set_point_source_fit(fit.chi2, fit.flux);
        } else {
            let mut kinds = vec![ComponentKind::Dirac];
            if config.model.contains(&ComponentKind::Background) {
                kinds.insert(0, ComponentKind::Background);
            }
            let mut point = ProfileModel::new(&kinds, frame, psf)?;
            let point_seed = point_source_seed(&seed, &frame, &fit);
            let point_run = fit_model(&mut point, &source, &point_seed, &options, minimizer)?;
            if !point_run.flags.contains(FitFlags::NOT_CONSTRAINED) {
                let flux_psf = point.flux(&point.registry().values());
                fit.set_point_source_fit(point_run.chi2, flux_psf);
            }
        }
    }

    debug!(
        number = detection.number,
        iterations = fit.iterations,
        flux = fit.flux,
        chi2 = fit.reduced_chi2,
        flags = ?fit.flags,
        "Profile fit done"
    );
    Ok(fit)
}
