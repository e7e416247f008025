//! Check-image sinks.
//!
//! Diagnostic rasters (stacked deblend models, their negatives, residuals)
//! are accumulated into sinks shared between threads. Sinks never affect
//! the measurements.

use common::Buffer2;
use parking_lot::Mutex;

pub trait CheckSink: Sync {
    /// Adds `scale * buffer` with pixel `(0, 0)` at `(x0, y0)` of the sink.
    fn accumulate(
        &self,
        buffer: &[f32],
        width: usize,
        height: usize,
        x0: i64,
        y0: i64,
        scale: f32,
    );
}

/// Full-field accumulator.
#[derive(Debug)]
pub struct CheckImage {
    image: Mutex<Buffer2<f32>>,
}

impl CheckImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            image: Mutex::new(Buffer2::new_filled(width, height, 0.0)),
        }
    }

    pub fn snapshot(&self) -> Buffer2<f32> {
        self.image.lock().clone()
    }

    pub fn into_inner(self) -> Buffer2<f32> {
        self.image.into_inner()
    }
}

impl CheckSink for CheckImage {
    fn accumulate(
        &self,
        buffer: &[f32],
        width: usize,
        height: usize,
        x0: i64,
        y0: i64,
        scale: f32,
    ) {
        debug_assert_eq!(buffer.len(), width * height);
        let src = Buffer2::new(width, height, buffer.to_vec());
        self.image.lock().add_scaled(&src, x0, y0, scale);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_and_negative_cancel() {
        let sink = CheckImage::new(8, 8);
        let stamp = vec![1.0f32; 9];
        sink.accumulate(&stamp, 3, 3, 2, 2, 1.0);
        sink.accumulate(&stamp, 3, 3, 2, 2, -1.0);
        assert_eq!(sink.snapshot().sum(), 0.0);
    }

    #[test]
    fn test_accumulate_clips_at_border() {
        let sink = CheckImage::new(4, 4);
        sink.accumulate(&[1.0; 4], 2, 2, 3, 3, 0.5);
        let image = sink.into_inner();
        assert_eq!(image[(3, 3)], 0.5);
        assert!((image.sum() - 0.5).abs() < 1e-9);
    }
}
