//! Synthetic rasters shared by unit tests.

use common::Buffer2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::field::Field;
use crate::subimage::SubImage;

/// Window at the origin over `image` with a constant variance.
pub fn flat_sub(image: Buffer2<f32>, variance: f32) -> SubImage {
    let (w, h) = (image.width(), image.height());
    SubImage::new(0, 0, image, Buffer2::new_filled(w, h, variance)).unwrap()
}

/// Fills a `size x size` square with `value`, clipped to the raster.
pub fn draw_square(image: &mut Buffer2<f32>, x0: usize, y0: usize, size: usize, value: f32) {
    for y in y0..(y0 + size).min(image.height()) {
        for x in x0..(x0 + size).min(image.width()) {
            image[(x, y)] = value;
        }
    }
}

/// Adds a circular Moffat source of total `flux` centred at `(cx, cy)`,
/// sampled at pixel centres.
pub fn add_moffat(
    image: &mut Buffer2<f32>,
    cx: f64,
    cy: f64,
    flux: f64,
    fwhm: f64,
    beta: f64,
) {
    let alpha = fwhm / (2.0 * (2f64.powf(1.0 / beta) - 1.0).sqrt());
    let peak = flux * (beta - 1.0) / (std::f64::consts::PI * alpha * alpha);
    for y in 0..image.height() {
        let dy = y as f64 - cy;
        for x in 0..image.width() {
            let dx = x as f64 - cx;
            let r2 = (dx * dx + dy * dy) / (alpha * alpha);
            image[(x, y)] += (peak * (1.0 + r2).powf(-beta)) as f32;
        }
    }
}

/// Adds a circular Gaussian of total `flux` centred at `(cx, cy)`.
pub fn add_gaussian(image: &mut Buffer2<f32>, cx: f64, cy: f64, flux: f64, fwhm: f64) {
    let sigma = fwhm / 2.354_820_045;
    let norm = flux / (2.0 * std::f64::consts::PI * sigma * sigma);
    for y in 0..image.height() {
        let dy = y as f64 - cy;
        for x in 0..image.width() {
            let dx = x as f64 - cx;
            image[(x, y)] += (norm * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()) as f32;
        }
    }
}

/// Adds zero-mean Gaussian noise of standard deviation `sigma`.
pub fn add_noise(image: &mut Buffer2<f32>, sigma: f32, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for v in image.iter_mut() {
        // Box-Muller.
        let u1: f32 = rng.random::<f32>().max(f32::MIN_POSITIVE);
        let u2: f32 = rng.random();
        let n = (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos();
        *v += sigma * n;
    }
}

/// Field with sources already drawn, constant noise level and no
/// variance map.
pub fn field_from(image: Buffer2<f32>, noise: f32) -> Field {
    Field::new(image, noise)
}
