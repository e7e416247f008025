//! PSF accessor consumed by the profile-fitting engine.

use common::Buffer2;

/// A resampled PSF kernel.
pub trait Psf: Sync {
    /// Kernel raster, centred on pixel `(width / 2, height / 2)`.
    fn raster(&self) -> &Buffer2<f32>;

    /// Size of one kernel pixel in detector pixels.
    fn pixel_step(&self) -> f64;

    /// Full width at half maximum in detector pixels.
    fn fwhm(&self) -> f64;
}

#[derive(Debug, Clone)]
pub struct RasterPsf {
    raster: Buffer2<f32>,
    pixel_step: f64,
    fwhm: f64,
}

impl RasterPsf {
    pub fn new(raster: Buffer2<f32>, pixel_step: f64, fwhm: f64) -> Self {
        Self {
            raster,
            pixel_step,
            fwhm,
        }
    }

    /// Circular Moffat kernel sampled at detector resolution.
    pub fn moffat(size: usize, fwhm: f64, beta: f64) -> Self {
        let alpha = fwhm / (2.0 * (2f64.powf(1.0 / beta) - 1.0).sqrt());
        Self::from_radial(size, fwhm, |r2| (1.0 + r2 / (alpha * alpha)).powf(-beta))
    }

    /// Circular Gaussian kernel sampled at detector resolution.
    pub fn gaussian(size: usize, fwhm: f64) -> Self {
        let sigma = fwhm / 2.354_820_045;
        let inv = 0.5 / (sigma * sigma);
        Self::from_radial(size, fwhm, |r2| (-r2 * inv).exp())
    }

    fn from_radial(size: usize, fwhm: f64, profile: impl Fn(f64) -> f64) -> Self {
        let c = (size / 2) as f64;
        let mut raster = Buffer2::new_filled(size, size, 0.0f32);
        for y in 0..size {
            let dy = y as f64 - c;
            for x in 0..size {
                let dx = x as f64 - c;
                raster[(x, y)] = profile(dx * dx + dy * dy) as f32;
            }
        }
        let total = raster.sum() as f32;
        if total > 0.0 {
            raster.iter_mut().for_each(|v| *v /= total);
        }
        Self::new(raster, 1.0, fwhm)
    }
}

impl Psf for RasterPsf {
    fn raster(&self) -> &Buffer2<f32> {
        &self.raster
    }

    fn pixel_step(&self) -> f64 {
        self.pixel_step
    }

    fn fwhm(&self) -> f64 {
        self.fwhm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moffat_kernel_is_normalized_and_centred() {
        let psf = RasterPsf::moffat(15, 3.0, 2.5);
        assert!((psf.raster().sum() - 1.0).abs() < 1e-5);

        let peak = psf.raster()[(7, 7)];
        assert!(psf.raster().iter().all(|&v| v <= peak));
        assert_eq!(psf.pixel_step(), 1.0);
        assert_eq!(psf.fwhm(), 3.0);
    }

    #[test]
    fn test_gaussian_half_maximum_at_half_fwhm() {
        // FWHM 4 puts half maximum exactly two pixels from the centre.
        let psf = RasterPsf::gaussian(21, 4.0);
        let peak = psf.raster()[(10, 10)];
        let half = psf.raster()[(12, 10)];
        assert!((half / peak - 0.5).abs() < 1e-3);
    }
}
