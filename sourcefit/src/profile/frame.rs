//! Geometry of the two rasters a fit works on: the oversampled model frame
//! and the detector-resolution fitting window.

use common::Buffer2;

use crate::constants::NO_DATA;
use crate::error::Result;
use crate::objlist::Detection;
use crate::psf::Psf;
use crate::subimage::SubImage;

/// Size limits and sampling used when sizing a [`ModelFrame`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameLimits {
    pub max_object_size: usize,
    pub max_model_size: usize,
    pub oversampling: f64,
}

/// Fitting window around one detection and the model raster behind it.
///
/// The window is `object_size` pixels square, each pixel binning
/// `subsample x subsample` detector pixels, centred on detector pixel
/// `(ix, iy)`. The model raster is `model_size` square with pixels of
/// `pixel_step` detector pixels; its pixel `model_size / 2` holds the
/// profile centre.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelFrame {
    pub ix: i32,
    pub iy: i32,
    pub object_size: usize,
    pub subsample: usize,
    pub model_size: usize,
    pub pixel_step: f64,
    pub oversampling: f64,
    pub object_subsampled: bool,
    pub model_subsampled: bool,
}

impl ModelFrame {
    /// Sizes the frame for `detection`, widened by the PSF footprint when a
    /// PSF is given. Without a PSF the model is sampled at detector
    /// resolution.
    pub fn for_detection(detection: &Detection, psf: Option<&dyn Psf>, limits: &FrameLimits) -> Self {
        let (pixel_step, psf_extent) = match psf {
            Some(psf) => (
                psf.pixel_step(),
                psf.raster().width() as f64 * psf.pixel_step(),
            ),
            None => (1.0, 0.0),
        };
        let side = detection.width().max(detection.height()).max(1) as f64;
        Self::new(
            (detection.mx + 0.49999).floor() as i32,
            (detection.my + 0.49999).floor() as i32,
            side + psf_extent,
            pixel_step,
            limits,
        )
    }

    /// Frame of at least `extent` detector pixels around `(ix, iy)`.
    pub fn new(ix: i32, iy: i32, extent: f64, pixel_step: f64, limits: &FrameLimits) -> Self {
        let base = (extent + 0.499) as usize;
        let mut object_size = (base * 12 / 10 / 2) * 2 + 1;
        let mut subsample = 1;
        let mut object_subsampled = false;
        if object_size > limits.max_object_size {
            subsample = object_size.div_ceil(limits.max_object_size);
            object_size /= subsample;
            object_subsampled = true;
        }

        let mut pixel_step = pixel_step;
        let span = (object_size * subsample) as f64 / pixel_step;
        let mut model_size = ((span + 0.4999) as usize / 2 + 1) * 2;
        let mut model_subsampled = false;
        if model_size > limits.max_model_size {
            pixel_step = model_size as f64 / limits.max_model_size as f64 * pixel_step;
            model_size = limits.max_model_size;
            model_subsampled = true;
        }

        Self {
            ix,
            iy,
            object_size,
            subsample,
            model_size,
            pixel_step,
            oversampling: limits.oversampling,
            object_subsampled,
            model_subsampled,
        }
    }

    /// Model pixel holding the profile centre.
    #[inline]
    pub fn model_centre(&self) -> f64 {
        (self.model_size / 2) as f64
    }

    /// Detector-pixel offset from `ix` (or `iy`) of the centre of window
    /// pixel `i`.
    #[inline]
    pub fn object_offset(&self, i: usize) -> f64 {
        let s = self.subsample;
        (i * s) as f64 - ((self.object_size * s) / 2) as f64 + (s as f64 - 1.0) / 2.0
    }

    /// Detector coordinates of the first pixel binned into window pixel
    /// `(0, 0)`.
    #[inline]
    pub fn object_origin(&self) -> (i32, i32) {
        let half = ((self.object_size * self.subsample) / 2) as i32;
        (self.ix - half, self.iy - half)
    }

    /// Scale turning model-pixel surface brightness into window-pixel flux.
    #[inline]
    pub fn resample_factor(&self) -> f64 {
        let ratio = self.subsample as f64 / self.pixel_step;
        ratio * ratio
    }
}

/// Detector properties needed to weight the fitting window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseModel {
    /// e-/ADU, 0 disables the photon-noise term.
    pub gain: f32,
    pub saturation: f32,
}

/// Observed pixels and weights on the fitting window.
#[derive(Debug, Clone)]
pub struct ObjectCutout {
    pub data: Buffer2<f32>,
    /// Inverse noise sigma, 0 for pixels excluded from the fit.
    pub weight: Buffer2<f32>,
    /// Number of pixels with positive weight.
    pub valid: usize,
}

impl ObjectCutout {
    /// Bins `source` onto the window of `frame`. A window pixel is excluded
    /// when any detector pixel it bins is missing, saturated or has no
    /// variance, or when it lies outside the inscribed circle.
    pub fn extract(source: &SubImage, frame: &ModelFrame, noise: &NoiseModel) -> Result<Self> {
        let n = frame.object_size;
        let s = frame.subsample as i32;
        let mut data = Buffer2::try_new_filled(n, n, NO_DATA)?;
        let mut weight = Buffer2::try_new_filled(n, n, 0.0f32)?;
        let inv_gain = if noise.gain > 0.0 { 1.0 / noise.gain } else { 0.0 };
        let radius = (n * frame.subsample) as f64 / 2.0;
        let radius2 = radius * radius;
        let (x0, y0) = frame.object_origin();
        let mut valid = 0;

        for j in 0..n {
            let oy = frame.object_offset(j);
            for i in 0..n {
                let ox = frame.object_offset(i);
                if ox * ox + oy * oy >= radius2 {
                    continue;
                }
                let (mut value, mut variance) = (0.0f32, 0.0f32);
                let mut ok = true;
                'bin: for sy in 0..s {
                    for sx in 0..s {
                        let px = x0 + i as i32 * s + sx;
                        let py = y0 + j as i32 * s + sy;
                        match (source.value_at(px, py), source.variance_at(px, py)) {
                            (Some(v), Some(var))
                                if v > NO_DATA && v < noise.saturation && var > 0.0 =>
                            {
                                value += v;
                                variance += var;
                            }
                            _ => {
                                ok = false;
                                break 'bin;
                            }
                        }
                    }
                }
                if !ok {
                    continue;
                }
                data[(i, j)] = value;
                weight[(i, j)] = 1.0 / (variance + value.max(0.0) * inv_gain).sqrt();
                valid += 1;
            }
        }

        Ok(Self { data, weight, valid })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.width()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: FrameLimits = FrameLimits {
        max_object_size: 512,
        max_model_size: 512,
        oversampling: 11.0,
    };

    fn detection(w: i32, mx: f64, my: f64) -> Detection {
        Detection {
            xmin: 10,
            xmax: 10 + w - 1,
            ymin: 10,
            ymax: 10 + w - 1,
            mx,
            my,
            ..Detection::default()
        }
    }

    #[test]
    fn test_frame_sizes_are_odd_window_even_model() {
        let frame = ModelFrame::for_detection(&detection(10, 14.6, 14.4), None, &LIMITS);
        // int(10.499) = 10, * 1.2 = 12, -> 13.
        assert_eq!(frame.object_size, 13);
        assert_eq!(frame.model_size, 14);
        assert_eq!((frame.ix, frame.iy), (15, 14));
        assert_eq!(frame.subsample, 1);
        assert!(!frame.object_subsampled && !frame.model_subsampled);
        assert_eq!(frame.object_offset(6), 0.0);
        assert_eq!(frame.object_origin(), (9, 8));
    }

    #[test]
    fn test_large_detection_is_subsampled() {
        let limits = FrameLimits {
            max_object_size: 21,
            max_model_size: 16,
            ..LIMITS
        };
        let frame = ModelFrame::for_detection(&detection(40, 30.0, 30.0), None, &limits);
        // 40 -> 49, ceil(49 / 21) = 3, 49 / 3 = 16.
        assert!(frame.object_subsampled);
        assert_eq!(frame.subsample, 3);
        assert_eq!(frame.object_size, 16);
        assert!(frame.model_subsampled);
        assert_eq!(frame.model_size, 16);
        assert!(frame.pixel_step > 1.0);
        // Offsets of a 3x binned window are centred on the middle pixel.
        assert_eq!(frame.object_offset(8), 1.0);
    }

    #[test]
    fn test_cutout_weights_and_exclusions() {
        let frame = ModelFrame::new(5, 5, 8.0, 1.0, &LIMITS);
        let n = 20;
        let mut image = Buffer2::new_filled(n, n, 4.0f32);
        image[(5, 5)] = NO_DATA;
        image[(6, 5)] = 1000.0;
        let sub = SubImage::new(0, 0, image, Buffer2::new_filled(n, n, 1.0)).unwrap();
        let noise = NoiseModel {
            gain: 4.0,
            saturation: 500.0,
        };

        let cutout = ObjectCutout::extract(&sub, &frame, &noise).unwrap();

        let c = frame.object_size / 2;
        assert_eq!(cutout.weight[(c, c)], 0.0);
        assert_eq!(cutout.weight[(c + 1, c)], 0.0);
        // Corners fall outside the inscribed circle.
        assert_eq!(cutout.weight[(0, 0)], 0.0);
        // var 1 + 4 / gain 4 = 2.
        let w = cutout.weight[(c, c + 1)];
        assert!((w - 1.0 / 2f32.sqrt()).abs() < 1e-6);
        assert_eq!(cutout.data[(c, c + 1)], 4.0);
        let counted = cutout.weight.iter().filter(|&&w| w > 0.0).count();
        assert_eq!(counted, cutout.valid);
    }
}
