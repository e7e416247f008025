//! Parametric brightness models.
//!
//! A [`ProfileModel`] is an ordered list of [`Component`]s sharing one
//! [`ParamRegistry`]. Evaluating it rasterizes every component on the
//! oversampled model grid, convolves the sum with the PSF and resamples the
//! result onto the fitting window, shifted by the X/Y parameters.
//!
//! The last full build is cached per component. Evaluations that differ
//! from the cached state in a single parameter (the Jacobian columns of the
//! minimizer) only redo the work that parameter touches, and leave the
//! cache untouched.

mod component;
mod convolve;
mod frame;
mod gamma;
mod params;
mod resample;


pub use component::{Component, ComponentKind};
pub use convolve::PsfTransform;
pub use frame::{FrameLimits, ModelFrame, NoiseModel, ObjectCutout};
pub use gamma::{gamma_p, ln_gamma, sersic_bn};
pub use params::{ParamKind, ParamRegistry, ParamSeed, ParamSlot};
pub use resample::lanczos3;

use common::Buffer2;

use crate::error::Result;
use crate::psf::Psf;

#[derive(Debug)]
struct BuildCache {
    values: Vec<f64>,
    /// Unit-flux, PSF-convolved image of each component on the model grid.
    unit: Vec<Buffer2<f32>>,
    /// Amplitude-weighted sum of `unit`.
    total: Buffer2<f32>,
}

#[derive(Debug)]
pub struct ProfileModel {
    components: Vec<Component>,
    registry: ParamRegistry,
    frame: ModelFrame,
    psf: Option<PsfTransform>,
    cache: Option<BuildCache>,
    raster: Buffer2<f32>,
    scratch: Buffer2<f32>,
    window: Buffer2<f32>,
    covariance: Vec<f64>,
}

impl ProfileModel {
    /// Model made of `kinds` on `frame`. Parameters shared between
    /// components are registered once.
    pub fn new(kinds: &[ComponentKind], frame: ModelFrame, psf: Option<&dyn Psf>) -> Result<Self> {
        let mut registry = ParamRegistry::new();
        let components = kinds
            .iter()
            .map(|&kind| Component::new(kind, &mut registry))
            .collect();
        let psf = psf.map(|psf| PsfTransform::new(psf, &frame)).transpose()?;
        let m = frame.model_size;
        let n = frame.object_size;
        Ok(Self {
            components,
            registry,
            frame,
            psf,
            cache: None,
            raster: Buffer2::try_new_filled(m, m, 0.0)?,
            scratch: Buffer2::try_new_filled(m, m, 0.0)?,
            window: Buffer2::try_new_filled(n, n, 0.0)?,
            covariance: Vec::new(),
        })
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn registry(&self) -> &ParamRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ParamRegistry {
        &mut self.registry
    }

    pub fn frame(&self) -> &ModelFrame {
        &self.frame
    }

    /// Starting values and bounds for a new fit.
    pub fn reset(&mut self, seed: &ParamSeed) {
        self.registry.reset(seed);
        self.cache = None;
        self.covariance.clear();
    }

    /// Covariance over registry slots, row-major, empty before a fit.
    pub fn covariance(&self) -> &[f64] {
        &self.covariance
    }

    pub fn set_covariance(&mut self, covariance: Vec<f64>) {
        debug_assert!(covariance.is_empty() || covariance.len() == self.registry.len().pow(2));
        self.covariance = covariance;
    }

    /// Total flux of the non-background components at `values`.
    pub fn flux(&self, values: &[f64]) -> f64 {
        self.components
            .iter()
            .filter(|c| c.kind() != ComponentKind::Background)
            .map(|c| c.amplitude(values))
            .sum()
    }

    /// Largest fraction of flux lost outside the model frame by any
    /// component in the last full build.
    pub fn max_lost_flux(&self) -> f64 {
        self.components.iter().map(Component::lost_flux).fold(0.0, f64::max)
    }

    /// Model at `values` on the fitting window, in window-pixel flux units.
    pub fn evaluate(&mut self, values: &[f64]) -> Result<&Buffer2<f32>> {
        debug_assert_eq!(values.len(), self.registry.len());
        let delta = self.cache.as_ref().map_or(Delta::Many, |cache| Delta::between(&cache.values, values));
        match delta {
            Delta::Same => {
                if let Some(cache) = self.cache.take() {
                    self.resample(&cache.total, values);
                    self.cache = Some(cache);
                }
            }
            Delta::One(slot) => self.evaluate_changed(values, slot),
            Delta::Many => self.build(values)?,
        }
        Ok(&self.window)
    }

    /// Like [`ProfileModel::evaluate`] but always rebuilds every component,
    /// so that lost-flux figures describe `values`.
    pub fn render(&mut self, values: &[f64]) -> Result<&Buffer2<f32>> {
        self.build(values)?;
        Ok(&self.window)
    }

    /// Last evaluated window spread over detector pixels: each window pixel
    /// covers `subsample x subsample` detector pixels. Pixel `(0, 0)` sits
    /// at [`ModelFrame::object_origin`].
    pub fn detector_image(&self) -> Buffer2<f32> {
        let s = self.frame.subsample;
        if s == 1 {
            return self.window.clone();
        }
        let n = self.frame.object_size * s;
        let inv = 1.0 / (s * s) as f32;
        let mut out = Buffer2::new_filled(n, n, 0.0f32);
        for y in 0..n {
            for x in 0..n {
                out[(x, y)] = self.window[(x / s, y / s)] * inv;
            }
        }
        out
    }

    /// Rebuilds every component and refreshes the cache.
    fn build(&mut self, values: &[f64]) -> Result<()> {
        let m = self.frame.model_size;
        let mut cache = match self.cache.take() {
            Some(cache) => cache,
            None => BuildCache {
                values: Vec::new(),
                unit: self
                    .components
                    .iter()
                    .map(|_| Buffer2::try_new_filled(m, m, 0.0f32))
                    .collect::<std::result::Result<_, _>>()?,
                total: Buffer2::try_new_filled(m, m, 0.0)?,
            },
        };

        for (component, unit) in self.components.iter_mut().zip(cache.unit.iter_mut()) {
            component.rasterize(values, &self.frame, &mut self.raster);
            convolve_into(self.psf.as_ref(), component.kind(), &self.raster, unit);
        }
        cache.values.clear();
        cache.values.extend_from_slice(values);
        sum_components(&self.components, &cache.unit, values, &mut cache.total);
        self.resample(&cache.total, values);
        self.cache = Some(cache);
        Ok(())
    }

    /// Evaluates a state differing from the cache in `slot` only.
    fn evaluate_changed(&mut self, values: &[f64], slot: usize) {
        let Some(cache) = self.cache.take() else {
            return;
        };
        let kind = self.registry.slots()[slot].kind;

        if kind.is_position() {
            self.resample(&cache.total, values);
            self.cache = Some(cache);
            return;
        }

        self.scratch.copy_from(&cache.total);
        for (k, component) in self.components.iter().enumerate() {
            if !component.uses(slot) {
                continue;
            }
            let old = component.amplitude(&cache.values) as f32;
            let new = component.amplitude(values) as f32;
            if component.amplitude_slot() == slot {
                self.scratch.add_scaled(&cache.unit[k], 0, 0, new - old);
            } else {
                let mut probe = component.clone();
                probe.rasterize(values, &self.frame, &mut self.raster);
                let mut unit = Buffer2::new_filled(self.raster.width(), self.raster.height(), 0.0f32);
                convolve_into(self.psf.as_ref(), probe.kind(), &self.raster, &mut unit);
                self.scratch.add_scaled(&cache.unit[k], 0, 0, -old);
                self.scratch.add_scaled(&unit, 0, 0, new);
            }
        }
        let total = std::mem::replace(&mut self.scratch, Buffer2::default());
        self.resample(&total, values);
        self.scratch = total;
        self.cache = Some(cache);
    }

    fn resample(&mut self, total: &Buffer2<f32>, values: &[f64]) {
        let dx = self.registry.index_of(ParamKind::X).map_or(0.0, |i| values[i]);
        let dy = self.registry.index_of(ParamKind::Y).map_or(0.0, |i| values[i]);
        let factor = self.frame.resample_factor() as f32;
        resample::resample(total, &self.frame, dx, dy, factor, &mut self.window);
    }
}

/// How a parameter vector differs from the cached one.
enum Delta {
    Same,
    One(usize),
    Many,
}

impl Delta {
    fn between(cached: &[f64], values: &[f64]) -> Self {
        if cached.len() != values.len() {
            return Delta::Many;
        }
        let mut changed = cached.iter().zip(values).enumerate().filter(|(_, (a, b))| a != b);
        match (changed.next(), changed.next()) {
            (None, _) => Delta::Same,
            (Some((slot, _)), None) => Delta::One(slot),
            _ => Delta::Many,
        }
    }
}

fn convolve_into(psf: Option<&PsfTransform>, kind: ComponentKind, raster: &Buffer2<f32>, out: &mut Buffer2<f32>) {
    match psf {
        // A constant is invariant under a unit-sum kernel.
        Some(psf) if kind != ComponentKind::Background => psf.convolve(raster, out),
        _ => out.copy_from(raster),
    }
}

fn sum_components(components: &[Component], unit: &[Buffer2<f32>], values: &[f64], total: &mut Buffer2<f32>) {
    total.fill(0.0);
    for (component, image) in components.iter().zip(unit) {
        total.add_scaled(image, 0, 0, component.amplitude(values) as f32);
    }
}
