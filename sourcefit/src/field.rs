//! Image accessor consumed by the extraction core.

use common::Buffer2;

use crate::constants::NO_DATA;
use crate::error::{Error, Result};

/// Read access to a background-subtracted science image and its noise
/// properties.
pub trait ImageField: Sync {
    fn width(&self) -> usize;
    fn height(&self) -> usize;

    /// Sample value, [`NO_DATA`] for masked pixels.
    fn sample(&self, x: usize, y: usize) -> f32;

    /// Per-pixel variance, `None` when the field has no variance map.
    fn variance(&self, x: usize, y: usize) -> Option<f32>;

    /// RMS of the background noise.
    fn background_noise(&self) -> f32;

    /// Detector gain in e-/ADU, 0 for infinite gain (no Poisson term).
    fn gain(&self) -> f32;

    /// Pixel value at which the detector saturates.
    fn saturation(&self) -> f32;

    /// Variance used when the field carries no variance map.
    fn fallback_variance(&self) -> f32 {
        let noise = self.background_noise();
        noise * noise
    }
}

/// In-memory [`ImageField`].
#[derive(Debug, Clone)]
pub struct Field {
    image: Buffer2<f32>,
    variance: Option<Buffer2<f32>>,
    background_noise: f32,
    gain: f32,
    saturation: f32,
}

impl Field {
    pub fn new(image: Buffer2<f32>, background_noise: f32) -> Self {
        Self {
            image,
            variance: None,
            background_noise,
            gain: 0.0,
            saturation: f32::MAX,
        }
    }

    pub fn with_variance(mut self, variance: Buffer2<f32>) -> Result<Self> {
        if variance.width() != self.image.width() || variance.height() != self.image.height() {
            return Err(Error::InvalidRaster {
                expected: self.image.len(),
                actual: variance.len(),
            });
        }
        self.variance = Some(variance);
        Ok(self)
    }

    pub fn with_gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_saturation(mut self, saturation: f32) -> Self {
        self.saturation = saturation;
        self
    }

    pub fn image(&self) -> &Buffer2<f32> {
        &self.image
    }

    /// Marks a pixel as missing.
    pub fn mask(&mut self, x: usize, y: usize) {
        self.image[(x, y)] = NO_DATA;
    }
}

impl ImageField for Field {
    fn width(&self) -> usize {
        self.image.width()
    }

    fn height(&self) -> usize {
        self.image.height()
    }

    fn sample(&self, x: usize, y: usize) -> f32 {
        self.image[(x, y)]
    }

    fn variance(&self, x: usize, y: usize) -> Option<f32> {
        self.variance.as_ref().map(|v| v[(x, y)])
    }

    fn background_noise(&self) -> f32 {
        self.background_noise
    }

    fn gain(&self) -> f32 {
        self.gain
    }

    fn saturation(&self) -> f32 {
        self.saturation
    }
}
