//! Model-based deblending of blend groups.
//!
//! Every member of a group gets a Moffat model fitted on its own cutout,
//! with the current models of the other members subtracted. The stacked
//! models are then subtracted from the joint window and the residual is
//! segmented again: anything left above the residual threshold becomes a
//! new member. The cycle repeats for a fixed number of passes or until the
//! residual is clean.
//!
//! Deblend models are not PSF-convolved; the PSF only sizes their frames.
//! With `Config::blank` set, the pixels of residual detections are masked
//! out of their parents' cutouts.


use common::Buffer2;
use tracing::{debug, trace};

use crate::check::CheckSink;
use crate::config::Config;
use crate::constants::{CUTOUT_MARGIN, NO_DATA};
use crate::error::Result;
use crate::field::ImageField;
use crate::fit::{fit_model, seed_for, FitFlags, FitOptions, LevenbergMarquardt, Minimizer};
use crate::objlist::{DetectionFlags, ObjectList};
use crate::profile::{ComponentKind, ModelFrame, ParamKind, ParamSeed, ProfileModel};
use crate::psf::Psf;
use crate::segment::{segment, ScanBounds, Threshold};
use crate::subimage::{FillMode, SubImage};

/// Optional diagnostic sinks fed with the final stacked models of a group.
#[derive(Clone, Copy, Default)]
pub struct DeblendChecks<'a> {
    /// Receives the stacked models.
    pub models: Option<&'a dyn CheckSink>,
    /// Receives the negated stacked models.
    pub subtracted: Option<&'a dyn CheckSink>,
}

/// Per-member fitting state, index-aligned with the group list.
struct Member {
    /// Field pixels of the member's full cutout, never modified.
    pristine: SubImage,
    model: ProfileModel,
    seed: ParamSeed,
    /// Last fitted model on detector pixels, pixel `(0, 0)` at `origin`.
    image: Buffer2<f32>,
    origin: (i32, i32),
}

impl Member {
    fn fit(&mut self, cutout: &SubImage, options: &FitOptions, minimizer: &dyn Minimizer) -> Result<()> {
        let run = fit_model(&mut self.model, cutout, &self.seed, options, minimizer)?;
        if run.flags.contains(FitFlags::NOT_CONSTRAINED) {
            self.image.fill(0.0);
        } else {
            self.image = self.model.detector_image();
        }
        Ok(())
    }

    /// Adds `factor` times the member's model to `target`.
    fn add_to(&self, target: &mut SubImage, factor: f32) {
        target.add_raster(&self.image, self.origin.0, self.origin.1, factor);
    }

    fn fwhm(&self) -> f64 {
        let registry = self.model.registry();
        let value = |kind| registry.value(kind).unwrap_or(0.0);
        moffat_fwhm(
            value(ParamKind::MoffatAlpha),
            value(ParamKind::MoffatBeta),
            value(ParamKind::MoffatOffset),
            value(ParamKind::MoffatAspect),
        )
    }
}

/// Diameter at half maximum of a Moffat law, scaled by the square root of
/// the axis ratio folded below 1. Zero for degenerate parameters.
pub fn moffat_fwhm(alpha: f64, beta: f64, offset: f64, aspect: f64) -> f64 {
    if beta <= 0.0 || aspect <= 0.0 {
        return 0.0;
    }
    let axis = aspect.min(1.0 / aspect).sqrt();
    2.0 * alpha * (offset + (2f64.powf(1.0 / beta) - 1.0).sqrt()) * axis
}

/// Shared inputs of one deblend call.
struct Deblender<'a> {
    field: &'a dyn ImageField,
    psf: &'a dyn Psf,
    config: &'a Config,
    options: FitOptions,
    minimizer: LevenbergMarquardt,
}

/// Deblends the blend group of detection `index` of `list`.
///
/// Every detection sharing its blend id is moved out of `list`; the
/// returned list holds them plus the sources recovered from the fit
/// residuals, each with `deblend_fwhm` set. Only allocation failures are
/// reported as errors.
pub fn deblend(
    field: &dyn ImageField,
    psf: &dyn Psf,
    index: usize,
    list: &mut ObjectList,
    config: &Config,
    checks: DeblendChecks<'_>,
) -> Result<ObjectList> {
    let blend = list.get(index).blend;
    let mut last_number = list.iter().map(|d| d.number).max().unwrap_or(0);
    let mut group = list.extract_blend(blend)?;
    last_number = last_number.max(group.iter().map(|d| d.number).max().unwrap_or(0));

    let deblender = Deblender {
        field,
        psf,
        config,
        options: FitOptions::new(config, field),
        minimizer: LevenbergMarquardt::new(config.lm.clone()),
    };
    deblender.run(&mut group, blend, &mut last_number, checks)?;
    Ok(group)
}

impl Deblender<'_> {
    fn run(
        &self,
        group: &mut ObjectList,
        blend: u32,
        last_number: &mut u32,
        checks: DeblendChecks<'_>,
    ) -> Result<()> {
        if group.is_empty() {
            return Ok(());
        }
        let config = self.config;

        let bounds = ScanBounds {
            xmin: group.iter().map(|d| d.xmin).min().unwrap_or(0),
            xmax: group.iter().map(|d| d.xmax + 1).max().unwrap_or(0),
            ymin: group.iter().map(|d| d.ymin).min().unwrap_or(0),
            ymax: group.iter().map(|d| d.ymax + 1).max().unwrap_or(0),
        };
        let margin = config.filter.as_ref().map_or(1, |f| f.half_width() as i32 + 1);
        let mut joint = SubImage::from_field(
            self.field,
            bounds.xmin - margin,
            bounds.ymin - margin,
            (bounds.width() as i32 + 2 * margin) as usize,
            (bounds.height() as i32 + 2 * margin) as usize,
            self.field.fallback_variance(),
        )?;

        let mut members: Vec<Member> = Vec::new();
        members.try_reserve(group.len())?;
        for k in 0..group.len() {
            members.push(self.attach(group, k, &joint)?);
        }
        if config.blank {
            for iso in group.iter().filter_map(|d| d.iso.as_ref()) {
                joint.fill_masked(iso, FillMode::Input);
            }
        }
        if let Some(kernel) = &config.filter {
            joint.apply_filter(kernel)?;
        }
        let backup = joint.try_clone()?;

        let mut stack = Buffer2::try_new_filled(joint.width(), joint.height(), 0.0f32)?;
        for pass in 0..=config.deblend_iterations {
            self.multifit(group, &mut members)?;

            stack.fill(0.0);
            for member in &members {
                stack.add_scaled(
                    &member.image,
                    (member.origin.0 - joint.xmin()) as i64,
                    (member.origin.1 - joint.ymin()) as i64,
                    1.0,
                );
            }
            if pass == config.deblend_iterations {
                break;
            }

            subtract_models(&mut joint, &stack, config.model_tolerance);
            if let Some(kernel) = &config.filter {
                joint.apply_filter(kernel)?;
            }
            let mut residual = segment(
                &joint,
                Threshold::Relative(config.residual_threshold),
                bounds,
                config.min_area,
            )?;
            if residual.is_empty() {
                trace!(blend, pass, "Residual clean");
                break;
            }
            joint = backup.try_clone()?;

            let before = group.len();
            self.adopt(&mut residual, group, &mut members, &joint, blend, pass, last_number)?;
            debug!(
                blend,
                pass,
                found = group.len() - before,
                members = group.len(),
                "Deblend pass"
            );
        }

        if let Some(sink) = checks.models {
            sink.accumulate(&stack, stack.width(), stack.height(), joint.xmin() as i64, joint.ymin() as i64, 1.0);
        }
        if let Some(sink) = checks.subtracted {
            sink.accumulate(&stack, stack.width(), stack.height(), joint.xmin() as i64, joint.ymin() as i64, -1.0);
        }

        let merged = group.len() > 1;
        for (detection, member) in group.iter_mut().zip(&members) {
            detection.deblend_fwhm = member.fwhm();
            if merged {
                detection.flags |= DetectionFlags::MERGED;
            }
        }
        Ok(())
    }

    /// Cutouts and Moffat model of group member `k`.
    fn attach(&self, group: &mut ObjectList, k: usize, joint: &SubImage) -> Result<Member> {
        let iso = SubImage::from_chain(group.arena(), group.get(k), 0, joint)?;
        let detection = group.get_mut(k);
        let mut pristine = SubImage::from_field(
            self.field,
            detection.xmin - CUTOUT_MARGIN,
            detection.ymin - CUTOUT_MARGIN,
            (detection.width() + 2 * CUTOUT_MARGIN) as usize,
            (detection.height() + 2 * CUTOUT_MARGIN) as usize,
            self.field.fallback_variance(),
        )?;
        if self.config.blank {
            pristine.fill_masked(&iso, FillMode::Input);
        }
        let frame = ModelFrame::for_detection(detection, Some(self.psf), &self.options.limits);
        let model = ProfileModel::new(&[ComponentKind::Moffat], frame, None)?;
        let seed = seed_for(detection, &frame, self.options.background_noise);
        let n = frame.object_size * frame.subsample;

        detection.iso = Some(iso);
        detection.full = Some(pristine.try_clone()?);
        Ok(Member {
            pristine,
            model,
            seed,
            image: Buffer2::try_new_filled(n, n, 0.0)?,
            origin: frame.object_origin(),
        })
    }

    /// Alternates fitting every member and subtracting the neighbours'
    /// models from each member's cutout.
    fn multifit(&self, group: &mut ObjectList, members: &mut [Member]) -> Result<()> {
        let iterations = self.config.multifit_iterations;
        let factor = if members.len() > 1 {
            -self.config.neighbor_attenuation as f32
        } else {
            -1.0
        };
        for j in 0..=iterations {
            for (k, member) in members.iter_mut().enumerate() {
                if let Some(cutout) = &group.get(k).full {
                    member.fit(cutout, &self.options, &self.minimizer)?;
                }
            }
            if j == iterations || members.len() <= 1 {
                break;
            }
            for k in 0..members.len() {
                let Some(cutout) = group.get_mut(k).full.as_mut() else {
                    continue;
                };
                cutout.fill_from(&members[k].pristine);
                for (m, other) in members.iter().enumerate() {
                    if m != k {
                        other.add_to(cutout, factor);
                    }
                }
            }
        }
        Ok(())
    }

    /// Moves the residual detections worth keeping into the group.
    #[allow(clippy::too_many_arguments)]
    fn adopt(
        &self,
        residual: &mut ObjectList,
        group: &mut ObjectList,
        members: &mut Vec<Member>,
        joint: &SubImage,
        blend: u32,
        pass: usize,
        last_number: &mut u32,
    ) -> Result<()> {
        let max_area = self.config.deblend_max_area;
        let mut index = 0;
        while index < residual.len() {
            if residual.get(index).npix > max_area {
                residual.remove(index);
                continue;
            }
            index += 1;
        }

        for k in 0..residual.len() {
            refresh_values(residual, k, joint);
            *last_number += 1;
            let detection = residual.get_mut(k);
            detection.number = *last_number;
            detection.blend = blend;
            detection.deblend_pass = pass as u32 + 1;
            detection.flags |= DetectionFlags::DEBLENDED;
        }

        let parents = members.len();
        members.try_reserve(residual.len())?;
        while !residual.is_empty() {
            let k = residual.move_to(residual.len() - 1, group)?;
            let member = self.attach(group, k, joint)?;
            if let Some(cutout) = group.get_mut(k).full.as_mut() {
                for parent in &members[..parents] {
                    parent.add_to(cutout, -1.0);
                }
            }
            if self.config.blank {
                blank_in_parents(group, &mut members[..parents], k);
            }
            members.push(member);
        }
        Ok(())
    }
}

/// Blanks the pixels of group member `k` in the cutouts of the first
/// `parents.len()` members.
fn blank_in_parents(group: &mut ObjectList, parents: &mut [Member], k: usize) {
    let Some(iso) = group.get_mut(k).iso.take() else {
        return;
    };
    for (p, parent) in parents.iter_mut().enumerate() {
        parent.pristine.fill_masked(&iso, FillMode::Blank);
        if let Some(cutout) = group.get_mut(p).full.as_mut() {
            cutout.fill_masked(&iso, FillMode::Blank);
        }
    }
    group.get_mut(k).iso = Some(iso);
}

/// Replaces the residual values of detection `k`'s pixels with those of
/// `joint` and reruns the preanalysis on them.
fn refresh_values(list: &mut ObjectList, k: usize, joint: &SubImage) {
    let head = list.get(k).head;
    let arena = list.arena_mut();
    let mut cursor = head;
    while cursor >= 0 {
        let pixel = arena.get_mut(cursor);
        if let Some(value) = joint.value_at(pixel.x, pixel.y) {
            pixel.value = value;
            pixel.filtered = None;
        }
        cursor = pixel.next;
    }
    list.preanalyse(k);
}

/// Subtracts `stack` from the image and adds `(tolerance * model)^2` to the
/// variance of every valid pixel.
fn subtract_models(joint: &mut SubImage, stack: &Buffer2<f32>, tolerance: f32) {
    for (i, &model) in stack.iter().enumerate() {
        if joint.image()[i] <= NO_DATA {
            continue;
        }
        joint.image_mut()[i] -= model;
        let v = tolerance * model;
        joint.variance_mut()[i] += v * v;
    }
}
