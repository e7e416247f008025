//! Separable Lanczos-3 resampling between the model raster and the
//! fitting window.

use std::f32::consts::PI;
use std::sync::OnceLock;

use common::Buffer2;

use super::frame::ModelFrame;
use crate::constants::{LANCZOS_ORDER, LANCZOS_TAPS};

/// Samples per unit interval of the kernel table.
const LUT_RESOLUTION: usize = 2048;

static LANCZOS3_LUT: OnceLock<Vec<f32>> = OnceLock::new();

fn lanczos3_direct(x: f32) -> f32 {
    if x.abs() < 1e-6 {
        return 1.0;
    }
    let a = LANCZOS_ORDER as f32;
    if x.abs() >= a {
        return 0.0;
    }
    let pi_x = PI * x;
    let pi_x_a = pi_x / a;
    (pi_x.sin() / pi_x) * (pi_x_a.sin() / pi_x_a)
}

/// `sinc(x) * sinc(x / 3)` for `|x| < 3`, 0 beyond.
#[inline]
pub fn lanczos3(x: f32) -> f32 {
    let table = LANCZOS3_LUT.get_or_init(|| {
        (0..=LANCZOS_ORDER * LUT_RESOLUTION)
            .map(|i| lanczos3_direct(i as f32 / LUT_RESOLUTION as f32))
            .collect()
    });
    let abs_x = x.abs();
    if abs_x >= LANCZOS_ORDER as f32 {
        return 0.0;
    }
    table[(abs_x * LUT_RESOLUTION as f32 + 0.5) as usize]
}

/// Interpolation taps for coordinate `pos` on an axis of `len` samples.
///
/// Taps falling outside the axis are dropped and the remaining weights
/// renormalized. Returns the first tap index and the weights, or `None`
/// when no tap lands inside.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Taps {
    pub start: usize,
    pub count: usize,
    pub weights: [f32; LANCZOS_TAPS],
}

impl Taps {
    pub(crate) fn at(pos: f64, len: usize) -> Option<Self> {
        let x0 = pos.floor() as i64;
        let fx = (pos - x0 as f64) as f32;
        let first = x0 - LANCZOS_ORDER as i64 + 1;
        let mut weights = [0.0f32; LANCZOS_TAPS];
        let mut start = None;
        let mut count = 0;
        let mut sum = 0.0f32;
        for k in 0..LANCZOS_TAPS {
            let index = first + k as i64;
            if index < 0 || index >= len as i64 {
                continue;
            }
            let w = lanczos3(fx - (k as f32 - LANCZOS_ORDER as f32 + 1.0));
            if start.is_none() {
                start = Some(index as usize);
            }
            weights[count] = w;
            count += 1;
            sum += w;
        }
        let start = start?;
        if sum.abs() < 1e-6 {
            return None;
        }
        weights[..count].iter_mut().for_each(|w| *w /= sum);
        Some(Self {
            start,
            count,
            weights,
        })
    }

    #[inline]
    fn apply(&self, samples: &[f32]) -> f32 {
        self.weights[..self.count]
            .iter()
            .zip(&samples[self.start..self.start + self.count])
            .map(|(w, v)| w * v)
            .sum()
    }
}

/// Interpolated value of `src` at fractional pixel `(x, y)`, 0 outside.
pub fn sample(src: &Buffer2<f32>, x: f64, y: f64) -> f32 {
    let (Some(tx), Some(ty)) = (Taps::at(x, src.width()), Taps::at(y, src.height())) else {
        return 0.0;
    };
    (0..ty.count)
        .map(|k| ty.weights[k] * tx.apply(src.row(ty.start + k)))
        .sum()
}

/// Resamples the model raster `src` onto the fitting window `out`, with
/// the profile centre shifted by `(dx, dy)` detector pixels from the frame
/// centre. Values are multiplied by `factor`.
pub fn resample(src: &Buffer2<f32>, frame: &ModelFrame, dx: f64, dy: f64, factor: f32, out: &mut Buffer2<f32>) {
    let n = frame.object_size;
    debug_assert_eq!(out.width(), n);
    let centre = frame.model_centre();
    let inv_step = 1.0 / frame.pixel_step;

    let x_taps: Vec<Option<Taps>> = (0..n)
        .map(|i| Taps::at(centre + (frame.object_offset(i) - dx) * inv_step, src.width()))
        .collect();

    // Horizontal pass over every model row, then vertical per window row.
    let mut rows = Buffer2::new_filled(n, src.height(), 0.0f32);
    for y in 0..src.height() {
        let row = src.row(y);
        for (i, taps) in x_taps.iter().enumerate() {
            if let Some(taps) = taps {
                rows[(i, y)] = taps.apply(row);
            }
        }
    }

    let mut column = vec![0.0f32; src.height()];
    for j in 0..n {
        let Some(ty) = Taps::at(centre + (frame.object_offset(j) - dy) * inv_step, src.height()) else {
            out.row_mut(j).fill(0.0);
            continue;
        };
        for i in 0..n {
            for k in 0..ty.count {
                column[ty.start + k] = rows[(i, ty.start + k)];
            }
            out[(i, j)] = factor * ty.apply(&column);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::frame::FrameLimits;

    #[test]
    fn test_kernel_shape() {
        assert_eq!(lanczos3(0.0), 1.0);
        assert!(lanczos3(1.0).abs() < 1e-3);
        assert!(lanczos3(2.0).abs() < 1e-3);
        assert_eq!(lanczos3(3.5), 0.0);
        assert!((lanczos3(0.5) - lanczos3(-0.5)).abs() < 1e-6);
    }

    #[test]
    fn test_integer_positions_reproduce_samples() {
        let pixels = (0..64).map(|i| (i * i) as f32).collect();
        let src = Buffer2::new(8, 8, pixels);
        assert!((sample(&src, 3.0, 4.0) - src[(3, 4)]).abs() < 1e-2);
        assert_eq!(sample(&src, -10.0, 4.0), 0.0);
    }

    #[test]
    fn test_constant_is_preserved() {
        let limits = FrameLimits {
            max_object_size: 512,
            max_model_size: 512,
            oversampling: 1.0,
        };
        let frame = ModelFrame::new(0, 0, 20.0, 0.5, &limits);
        let src = Buffer2::new_filled(frame.model_size, frame.model_size, 2.0f32);
        let mut out = Buffer2::new_filled(frame.object_size, frame.object_size, 0.0f32);

        resample(&src, &frame, 0.3, -0.7, 1.0, &mut out);

        let n = frame.object_size;
        for j in 2..n - 2 {
            for i in 2..n - 2 {
                assert!((out[(i, j)] - 2.0).abs() < 1e-3, "({}, {}) = {}", i, j, out[(i, j)]);
            }
        }
    }

    #[test]
    fn test_shift_moves_peak() {
        let limits = FrameLimits {
            max_object_size: 512,
            max_model_size: 512,
            oversampling: 1.0,
        };
        let frame = ModelFrame::new(0, 0, 10.0, 1.0, &limits);
        let m = frame.model_size;
        let mut src = Buffer2::new_filled(m, m, 0.0f32);
        src[(m / 2, m / 2)] = 1.0;
        let mut out = Buffer2::new_filled(frame.object_size, frame.object_size, 0.0f32);

        resample(&src, &frame, 2.0, -1.0, 1.0, &mut out);

        let c = frame.object_size / 2;
        assert!((out[(c + 2, c - 1)] - 1.0).abs() < 1e-2);
        assert!(out[(c, c)].abs() < 1e-2);
    }
}
