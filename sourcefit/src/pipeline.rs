//! End-to-end extraction: segmentation, deblending and profile fitting.
//!
//! The driver thread segments the whole field and submits one object list
//! per blend group to a [`WorkQueue`]. Workers deblend each group and fit
//! every member on its neighbour-subtracted cutout. Groups come back in
//! submission order and receive their final catalog numbers there.

use std::thread;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::constants::NO_DATA;
use crate::deblend::{deblend, DeblendChecks};
use crate::error::{Error, Result};
use crate::field::ImageField;
use crate::fit::{fit_profile, FitFlags};
use crate::objlist::{DetectionFlags, ObjectList};
use crate::psf::Psf;
use crate::queue::WorkQueue;
use crate::segment::{segment, ScanBounds, Threshold};
use crate::subimage::SubImage;

/// Runs the full extraction over `field` and returns the measured blend
/// groups in catalog order.
pub fn extract(
    field: &dyn ImageField,
    psf: &dyn Psf,
    config: &Config,
    checks: DeblendChecks<'_>,
) -> Result<Vec<ObjectList>> {
    config.validate();
    let queue = WorkQueue::new(config.queue_capacity);
    let failure: Mutex<Option<Error>> = Mutex::new(None);
    let mut groups = Vec::new();
    let mut last_number = 0u32;

    let driven = thread::scope(|scope| {
        scope.spawn(|| {
            queue.run_workers(
                config.workers,
                |list: &mut ObjectList| {
                    if let Err(err) = measure(list, field, psf, config, checks) {
                        warn!(error = %err, "Blend group measurement failed");
                        let mut failure = failure.lock();
                        if failure.is_none() {
                            *failure = Some(err);
                        }
                        *list = ObjectList::new();
                    }
                },
                |_, mut list: ObjectList| {
                    for detection in list.iter_mut() {
                        last_number += 1;
                        detection.number = last_number;
                    }
                    groups.push(list);
                },
            );
        });
        let result = submit_groups(field, config, &queue);
        queue.shutdown();
        result
    });
    driven?;
    if let Some(err) = failure.into_inner() {
        return Err(err);
    }

    info!(
        groups = groups.len(),
        detections = last_number,
        "Extraction done"
    );
    Ok(groups)
}

/// Segments the field and submits every blend group to `queue`.
fn submit_groups(field: &dyn ImageField, config: &Config, queue: &WorkQueue) -> Result<()> {
    let mut sub = SubImage::from_field(
        field,
        0,
        0,
        field.width(),
        field.height(),
        field.fallback_variance(),
    )?;
    if let Some(kernel) = &config.filter {
        sub.apply_filter(kernel)?;
    }
    let mut list = segment(
        &sub,
        Threshold::Relative(config.detect_threshold),
        ScanBounds::of(&sub),
        config.min_area,
    )?;
    drop(sub);
    info!(detections = list.len(), pixels = list.total_pixels(), "Field segmented");

    while !list.is_empty() {
        let blend = list.get(0).blend;
        let group = list.extract_blend(blend)?;
        queue.submit(group)?;
    }
    Ok(())
}

/// Deblends one group and fits every resulting member.
fn measure(
    list: &mut ObjectList,
    field: &dyn ImageField,
    psf: &dyn Psf,
    config: &Config,
    checks: DeblendChecks<'_>,
) -> Result<()> {
    if list.is_empty() {
        return Ok(());
    }
    let mut group = deblend(field, psf, 0, list, config, checks)?;
    for detection in group.iter_mut() {
        let fit = match &detection.full {
            Some(cutout) => {
                let view = CutoutField { cutout, parent: field };
                fit_profile(detection, &view, Some(psf), config)?
            }
            None => fit_profile(detection, field, Some(psf), config)?,
        };
        if fit.flags.contains(FitFlags::NOT_CONSTRAINED) {
            detection.flags |= DetectionFlags::NOT_CONSTRAINED;
        }
        if fit.flags.contains(FitFlags::APERTURE_PROBLEM) {
            detection.flags |= DetectionFlags::APERTURE_PROBLEM;
        }
        detection.fit = Some(fit);
    }
    *list = group;
    Ok(())
}

/// The parent field seen through a cutout: pixels outside the cutout are
/// missing.
struct CutoutField<'a> {
    cutout: &'a SubImage,
    parent: &'a dyn ImageField,
}

impl ImageField for CutoutField<'_> {
    fn width(&self) -> usize {
        self.parent.width()
    }

    fn height(&self) -> usize {
        self.parent.height()
    }

    fn sample(&self, x: usize, y: usize) -> f32 {
        self.cutout.value_at(x as i32, y as i32).unwrap_or(NO_DATA)
    }

    fn variance(&self, x: usize, y: usize) -> Option<f32> {
        self.cutout.variance_at(x as i32, y as i32)
    }

    fn background_noise(&self) -> f32 {
        self.parent.background_noise()
    }

    fn gain(&self) -> f32 {
        self.parent.gain()
    }

    fn saturation(&self) -> f32 {
        self.parent.saturation()
    }

    fn fallback_variance(&self) -> f32 {
        self.parent.fallback_variance()
    }
}
