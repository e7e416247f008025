//! Weighted residuals of a profile model against a fitting window.

use super::bridge;
use super::lm::ResidualFn;
use crate::error::Error;
use crate::profile::{ObjectCutout, ProfileModel};

/// Everything the residual callback needs, passed explicitly.
///
/// Model evaluation can only fail on allocation. The first such error is
/// kept and the residuals are zeroed from then on; the caller checks
/// [`FitContext::take_error`] once the minimizer returns.
pub struct FitContext<'a> {
    model: &'a mut ProfileModel,
    cutout: &'a ObjectCutout,
    free: &'a [usize],
    values: Vec<f64>,
    compression: Option<f64>,
    error: Option<Error>,
}

impl<'a> FitContext<'a> {
    pub fn new(
        model: &'a mut ProfileModel,
        cutout: &'a ObjectCutout,
        free: &'a [usize],
        compression: Option<f64>,
    ) -> Self {
        let values = model.registry().values();
        Self {
            model,
            cutout,
            free,
            values,
            compression,
            error: None,
        }
    }

    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }
}

/// `sign(r) * ln(1 + |r| / scale) * scale`: linear for small residuals,
/// logarithmic for large ones.
#[inline]
pub fn compress(residual: f64, scale: f64) -> f64 {
    residual.signum() * (1.0 + residual.abs() / scale).ln() * scale
}

impl ResidualFn for FitContext<'_> {
    fn len(&self) -> usize {
        self.cutout.valid
    }

    fn residuals(&mut self, params: &[f64], out: &mut [f64]) {
        bridge::to_bounded(self.model.registry(), self.free, params, &mut self.values);
        if self.error.is_some() {
            out.fill(0.0);
            return;
        }
        let window = match self.model.evaluate(&self.values) {
            Ok(window) => window,
            Err(err) => {
                self.error = Some(err);
                out.fill(0.0);
                return;
            }
        };

        let cutout = self.cutout;
        let weighted = cutout
            .data
            .iter()
            .zip(cutout.weight.iter())
            .zip(window.iter())
            .filter(|((_, &w), _)| w > 0.0)
            .map(|((&d, &w), &m)| ((m - d) * w) as f64);
        match self.compression {
            Some(scale) => {
                for (o, r) in out.iter_mut().zip(weighted) {
                    *o = compress(r, scale);
                }
            }
            None => {
                for (o, r) in out.iter_mut().zip(weighted) {
                    *o = r;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_is_odd_and_sublinear() {
        assert_eq!(compress(0.0, 10.0), 0.0);
        assert!((compress(0.01, 10.0) - 0.01).abs() < 1e-5);
        assert_eq!(compress(-50.0, 10.0), -compress(50.0, 10.0));
        assert!(compress(1000.0, 10.0) < 50.0);
    }
}
