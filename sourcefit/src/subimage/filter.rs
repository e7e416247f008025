use common::Buffer2;
use serde::{Deserialize, Serialize};

use crate::constants::NO_DATA;
use crate::error::Result;

/// Small convolution kernel used to smooth images before thresholding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterKernel {
    pub width: usize,
    pub height: usize,
    pub coefficients: Vec<f32>,
}

impl FilterKernel {
    /// Normalized circular Gaussian of the given FWHM on a `size x size`
    /// grid.
    pub fn gaussian(fwhm: f64, size: usize) -> Self {
        let sigma = fwhm / 2.354_820_045;
        let inv = 0.5 / (sigma * sigma);
        let c = (size / 2) as f64;
        let mut coefficients = Vec::with_capacity(size * size);
        for y in 0..size {
            for x in 0..size {
                let (dx, dy) = (x as f64 - c, y as f64 - c);
                coefficients.push((-(dx * dx + dy * dy) * inv).exp() as f32);
            }
        }
        let total: f32 = coefficients.iter().sum();
        coefficients.iter_mut().for_each(|v| *v /= total);
        Self {
            width: size,
            height: size,
            coefficients,
        }
    }

    pub fn half_width(&self) -> usize {
        self.width.max(self.height) / 2
    }

    pub fn validate(&self) {
        assert!(
            self.width % 2 == 1 && self.height % 2 == 1,
            "filter dimensions must be odd, got {}x{}",
            self.width,
            self.height
        );
        assert_eq!(
            self.coefficients.len(),
            self.width * self.height,
            "filter coefficient count must equal width * height"
        );
    }

    /// Correlates `src` with the kernel. Missing pixels contribute nothing
    /// and stay missing in the output; the kernel weight is renormalized
    /// over the valid neighbours.
    pub fn apply(&self, src: &Buffer2<f32>) -> Result<Buffer2<f32>> {
        let (w, h) = (src.width() as i64, src.height() as i64);
        let (hw, hh) = ((self.width / 2) as i64, (self.height / 2) as i64);
        let total: f32 = self.coefficients.iter().sum();
        let mut out = Buffer2::try_new_filled(src.width(), src.height(), 0.0f32)?;

        for y in 0..h {
            for x in 0..w {
                if src[(x as usize, y as usize)] <= NO_DATA {
                    out[(x as usize, y as usize)] = NO_DATA;
                    continue;
                }
                let mut sum = 0.0f32;
                let mut norm = 0.0f32;
                for ky in 0..self.height as i64 {
                    let sy = y + ky - hh;
                    for kx in 0..self.width as i64 {
                        let sx = x + kx - hw;
                        let Some(&v) = src.checked(sx, sy) else {
                            continue;
                        };
                        if v <= NO_DATA {
                            continue;
                        }
                        let k = self.coefficients[(ky as usize) * self.width + kx as usize];
                        sum += k * v;
                        norm += k;
                    }
                }
                out[(x as usize, y as usize)] = if norm > 0.0 { sum * total / norm } else { 0.0 };
            }
        }
        Ok(out)
    }
}
