//! PSF convolution of model rasters in Fourier space.
//!
//! The PSF is remapped once to the model pixel grid. Its transform is
//! computed on the first convolution and kept for the lifetime of the
//! model.

use std::sync::{Arc, OnceLock};

use common::Buffer2;
use rustfft::{num_complex::Complex, Fft, FftPlanner};

use super::frame::ModelFrame;
use super::resample;
use crate::error::{Error, Result};
use crate::psf::Psf;

pub struct PsfTransform {
    size: usize,
    /// PSF on the model grid, centred on pixel `size / 2`, unit sum.
    kernel: Buffer2<f32>,
    spectrum: OnceLock<Vec<Complex<f32>>>,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

impl std::fmt::Debug for PsfTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PsfTransform")
            .field("size", &self.size)
            .field("transformed", &self.spectrum.get().is_some())
            .finish()
    }
}

impl PsfTransform {
    /// Remaps `psf` onto the model grid of `frame` with Lanczos-3,
    /// tapers its outer annulus to zero and normalizes it to unit sum.
    pub fn new(psf: &dyn Psf, frame: &ModelFrame) -> Result<Self> {
        let n = frame.model_size;
        let raster = psf.raster();
        let ratio = frame.pixel_step / psf.pixel_step();
        let centre = frame.model_centre();
        let (pcx, pcy) = ((raster.width() / 2) as f64, (raster.height() / 2) as f64);

        let mut kernel = Buffer2::try_new_filled(n, n, 0.0f32)?;
        for y in 0..n {
            let sy = (y as f64 - centre) * ratio + pcy;
            for x in 0..n {
                let sx = (x as f64 - centre) * ratio + pcx;
                kernel[(x, y)] = resample::sample(raster, sx, sy);
            }
        }

        taper(&mut kernel, psf.fwhm() / frame.pixel_step);

        let total = kernel.sum();
        if total <= 0.0 {
            return Err(Error::EmptyPsf);
        }
        let inv = (1.0 / total) as f32;
        kernel.iter_mut().for_each(|v| *v *= inv);

        let mut planner = FftPlanner::new();
        Ok(Self {
            size: n,
            kernel,
            spectrum: OnceLock::new(),
            forward: planner.plan_fft_forward(n),
            inverse: planner.plan_fft_inverse(n),
        })
    }

    pub fn kernel(&self) -> &Buffer2<f32> {
        &self.kernel
    }

    /// Circular convolution of `raster` with the PSF, written to `out`.
    pub fn convolve(&self, raster: &Buffer2<f32>, out: &mut Buffer2<f32>) {
        debug_assert_eq!(raster.width(), self.size);
        let spectrum = self.spectrum.get_or_init(|| {
            let mut swapped = quadrant_swap(&self.kernel, self.size);
            self.fft_2d(&mut swapped, &self.forward);
            swapped
        });

        let mut data: Vec<Complex<f32>> = raster.iter().map(|&v| Complex::new(v, 0.0)).collect();
        self.fft_2d(&mut data, &self.forward);
        for (d, s) in data.iter_mut().zip(spectrum) {
            *d *= *s;
        }
        self.fft_2d(&mut data, &self.inverse);

        let norm = 1.0 / (self.size * self.size) as f32;
        for (o, d) in out.iter_mut().zip(&data) {
            *o = d.re * norm;
        }
    }

    /// 2D transform by row-column decomposition.
    fn fft_2d(&self, data: &mut [Complex<f32>], fft: &Arc<dyn Fft<f32>>) {
        let n = self.size;
        for row in data.chunks_exact_mut(n) {
            fft.process(row);
        }
        transpose_inplace(data, n);
        for row in data.chunks_exact_mut(n) {
            fft.process(row);
        }
        transpose_inplace(data, n);
    }
}

fn transpose_inplace(data: &mut [Complex<f32>], n: usize) {
    for i in 0..n {
        for j in (i + 1)..n {
            data.swap(i * n + j, j * n + i);
        }
    }
}

/// Moves pixel `(n / 2, n / 2)` to `(0, 0)`, wrapping around.
fn quadrant_swap(kernel: &Buffer2<f32>, n: usize) -> Vec<Complex<f32>> {
    let h = n / 2;
    let mut out = vec![Complex::new(0.0, 0.0); n * n];
    for y in 0..n {
        let ty = (y + n - h) % n;
        for x in 0..n {
            let tx = (x + n - h) % n;
            out[ty * n + tx] = Complex::new(kernel[(x, y)], 0.0);
        }
    }
    out
}

/// Gaussian roll-off over the outer `3 * sigma` of the inscribed circle,
/// zero beyond it.
fn taper(kernel: &mut Buffer2<f32>, sigma: f64) {
    let n = kernel.width();
    let h = (n / 2) as f64;
    let rmax = (h - 1.0).max(1.0);
    let rmin = rmax - 3.0 * sigma;
    if rmin <= 0.0 || sigma <= 0.0 {
        return;
    }
    let (rmin2, rmax2) = (rmin * rmin, rmax * rmax);
    let inv_2sig2 = 0.5 / (sigma * sigma);
    for y in 0..n {
        let dy = y as f64 - h;
        for x in 0..n {
            let dx = x as f64 - h;
            let r2 = dx * dx + dy * dy;
            if r2 <= rmin2 {
                continue;
            }
            let factor = if r2 > rmax2 {
                0.0
            } else {
                let r = r2.sqrt();
                (-(r - rmin) * (r - rmin) * inv_2sig2).exp()
            };
            kernel[(x, y)] *= factor as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::frame::FrameLimits;
    use crate::psf::RasterPsf;

    fn frame(extent: f64) -> ModelFrame {
        let limits = FrameLimits {
            max_object_size: 512,
            max_model_size: 512,
            oversampling: 1.0,
        };
        ModelFrame::new(0, 0, extent, 1.0, &limits)
    }

    #[test]
    fn test_kernel_is_normalized_and_centred() {
        let frame = frame(30.0);
        let transform = PsfTransform::new(&RasterPsf::gaussian(15, 3.0), &frame).unwrap();
        let kernel = transform.kernel();
        assert!((kernel.sum() - 1.0).abs() < 1e-5);
        let c = frame.model_size / 2;
        let peak = kernel[(c, c)];
        assert!(kernel.iter().all(|&v| v <= peak + 1e-7));
    }

    #[test]
    fn test_convolution_preserves_flux_and_position() {
        let frame = frame(30.0);
        let n = frame.model_size;
        let transform = PsfTransform::new(&RasterPsf::moffat(15, 2.5, 3.0), &frame).unwrap();
        let mut raster = Buffer2::new_filled(n, n, 0.0f32);
        raster[(n / 2 + 3, n / 2 - 2)] = 5.0;
        let mut out = Buffer2::new_filled(n, n, 0.0f32);

        transform.convolve(&raster, &mut out);

        assert!((out.sum() - 5.0).abs() < 1e-3);
        let (mut best, mut at) = (f32::MIN, (0, 0));
        for y in 0..n {
            for x in 0..n {
                if out[(x, y)] > best {
                    best = out[(x, y)];
                    at = (x, y);
                }
            }
        }
        assert_eq!(at, (n / 2 + 3, n / 2 - 2));
    }

    #[test]
    fn test_empty_psf_is_rejected() {
        let psf = RasterPsf::new(Buffer2::new_filled(9, 9, 0.0), 1.0, 2.0);
        let err = PsfTransform::new(&psf, &frame(20.0)).unwrap_err();
        assert!(matches!(err, Error::EmptyPsf));
    }
}
