//! Raster windows cut out of the parent field.
//!
//! A [`SubImage`] carries image and variance samples for a rectangle of the
//! parent field, plus optional smoothed copies used for thresholding. Its
//! `(xmin, ymin)` offset maps local pixel `(0, 0)` to parent coordinates.
//! Each window has exactly one owner; operations mutate it in place.

mod filter;


pub use filter::FilterKernel;

use common::Buffer2;

use crate::constants::NO_DATA;
use crate::error::{Error, Result};
use crate::field::ImageField;
use crate::objlist::{Detection, PixelArena};

/// How [`SubImage::fill_masked`] treats the pixels covered by the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// Copy the mask's image and variance values.
    Input,
    /// Mark the pixels missing.
    Blank,
}

#[derive(Debug, Clone)]
pub struct SubImage {
    xmin: i32,
    ymin: i32,
    image: Buffer2<f32>,
    variance: Buffer2<f32>,
    filtered: Option<Buffer2<f32>>,
    filtered_variance: Option<Buffer2<f32>>,
}

impl SubImage {
    pub fn new(xmin: i32, ymin: i32, image: Buffer2<f32>, variance: Buffer2<f32>) -> Result<Self> {
        if image.width() != variance.width() || image.height() != variance.height() {
            return Err(Error::InvalidRaster {
                expected: image.len(),
                actual: variance.len(),
            });
        }
        Ok(Self {
            xmin,
            ymin,
            image,
            variance,
            filtered: None,
            filtered_variance: None,
        })
    }

    /// Window with every pixel missing.
    pub fn blank(xmin: i32, ymin: i32, width: usize, height: usize) -> Result<Self> {
        Self::new(
            xmin,
            ymin,
            Buffer2::try_new_filled(width, height, NO_DATA)?,
            Buffer2::try_new_filled(width, height, 0.0)?,
        )
    }

    /// Copies a rectangle of `field`. Pixels outside the field are missing;
    /// `fallback_variance` fills the variance when the field has no map.
    pub fn from_field(
        field: &dyn ImageField,
        xmin: i32,
        ymin: i32,
        width: usize,
        height: usize,
        fallback_variance: f32,
    ) -> Result<Self> {
        let mut sub = Self::blank(xmin, ymin, width, height)?;
        let (fw, fh) = (field.width() as i64, field.height() as i64);
        for y in 0..height {
            let py = ymin as i64 + y as i64;
            if py < 0 || py >= fh {
                continue;
            }
            for x in 0..width {
                let px = xmin as i64 + x as i64;
                if px < 0 || px >= fw {
                    continue;
                }
                let (px, py) = (px as usize, py as usize);
                sub.image[(x, y)] = field.sample(px, py);
                sub.variance[(x, y)] = field.variance(px, py).unwrap_or(fallback_variance);
            }
        }
        Ok(sub)
    }

    /// Window over the bounding box of `detection` grown by `margin`, with
    /// only the detection's own pixels filled in. Variances are taken from
    /// `reference` where it overlaps.
    pub fn from_chain(
        arena: &PixelArena,
        detection: &Detection,
        margin: i32,
        reference: &SubImage,
    ) -> Result<Self> {
        let xmin = detection.xmin - margin;
        let ymin = detection.ymin - margin;
        let width = (detection.width() + 2 * margin).max(0) as usize;
        let height = (detection.height() + 2 * margin).max(0) as usize;
        let mut sub = Self::blank(xmin, ymin, width, height)?;
        for (_, pixel) in arena.chain(detection.head) {
            let (lx, ly) = ((pixel.x - xmin) as usize, (pixel.y - ymin) as usize);
            sub.image[(lx, ly)] = pixel.value;
            sub.variance[(lx, ly)] = reference.variance_at(pixel.x, pixel.y).unwrap_or(0.0);
        }
        Ok(sub)
    }

    #[inline]
    pub fn xmin(&self) -> i32 {
        self.xmin
    }

    #[inline]
    pub fn ymin(&self) -> i32 {
        self.ymin
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.image.width()
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.image.height()
    }

    pub fn image(&self) -> &Buffer2<f32> {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut Buffer2<f32> {
        &mut self.image
    }

    pub fn variance(&self) -> &Buffer2<f32> {
        &self.variance
    }

    pub fn variance_mut(&mut self) -> &mut Buffer2<f32> {
        &mut self.variance
    }

    pub fn filtered(&self) -> Option<&Buffer2<f32>> {
        self.filtered.as_ref()
    }

    /// Whether the parent pixel `(x, y)` lies inside the window.
    #[inline]
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.xmin
            && y >= self.ymin
            && ((x - self.xmin) as usize) < self.width()
            && ((y - self.ymin) as usize) < self.height()
    }

    /// Raw sample at parent coordinates.
    pub fn value_at(&self, x: i32, y: i32) -> Option<f32> {
        self.contains(x, y)
            .then(|| self.image[((x - self.xmin) as usize, (y - self.ymin) as usize)])
    }

    /// Variance at parent coordinates.
    pub fn variance_at(&self, x: i32, y: i32) -> Option<f32> {
        self.contains(x, y)
            .then(|| self.variance[((x - self.xmin) as usize, (y - self.ymin) as usize)])
    }

    /// Value compared against the detection threshold at local `(x, y)`.
    #[inline]
    pub fn detection_value(&self, x: usize, y: usize) -> f32 {
        match &self.filtered {
            Some(filtered) => filtered[(x, y)],
            None => self.image[(x, y)],
        }
    }

    /// Variance matching [`SubImage::detection_value`].
    #[inline]
    pub fn detection_variance(&self, x: usize, y: usize) -> f32 {
        match &self.filtered_variance {
            Some(variance) => variance[(x, y)],
            None => self.variance[(x, y)],
        }
    }

    /// Recomputes the smoothed copies of image and variance.
    pub fn apply_filter(&mut self, kernel: &FilterKernel) -> Result<()> {
        self.filtered = Some(kernel.apply(&self.image)?);
        self.filtered_variance = Some(kernel.apply(&self.variance)?);
        Ok(())
    }

    pub fn clear_filter(&mut self) {
        self.filtered = None;
        self.filtered_variance = None;
    }

    /// Adds `factor * raster` to the image, with raster pixel `(0, 0)` at
    /// parent coordinates `(x0, y0)`. Missing pixels stay missing.
    pub fn add_raster(&mut self, raster: &Buffer2<f32>, x0: i32, y0: i32, factor: f32) {
        let ox = (x0 - self.xmin) as i64;
        let oy = (y0 - self.ymin) as i64;
        for y in 0..raster.height() {
            let ly = oy + y as i64;
            if ly < 0 || ly >= self.height() as i64 {
                continue;
            }
            for x in 0..raster.width() {
                let lx = ox + x as i64;
                if lx < 0 || lx >= self.width() as i64 {
                    continue;
                }
                let pixel = &mut self.image[(lx as usize, ly as usize)];
                if *pixel > NO_DATA {
                    *pixel += factor * raster[(x, y)];
                }
            }
        }
    }

    /// Deep copy that reports allocation failure.
    pub fn try_clone(&self) -> Result<Self> {
        let copy = |b: &Option<Buffer2<f32>>| b.as_ref().map(Buffer2::try_clone).transpose();
        Ok(Self {
            xmin: self.xmin,
            ymin: self.ymin,
            image: self.image.try_clone()?,
            variance: self.variance.try_clone()?,
            filtered: copy(&self.filtered)?,
            filtered_variance: copy(&self.filtered_variance)?,
        })
    }

    /// Applies `mode` to every pixel where `mask` holds a valid sample.
    /// Missing mask pixels leave this window untouched.
    pub fn fill_masked(&mut self, mask: &SubImage, mode: FillMode) {
        for y in 0..mask.height() {
            let py = mask.ymin + y as i32;
            for x in 0..mask.width() {
                let value = mask.image[(x, y)];
                if value <= NO_DATA {
                    continue;
                }
                let px = mask.xmin + x as i32;
                if !self.contains(px, py) {
                    continue;
                }
                let local = ((px - self.xmin) as usize, (py - self.ymin) as usize);
                match mode {
                    FillMode::Input => {
                        self.image[local] = value;
                        self.variance[local] = mask.variance[(x, y)];
                    }
                    FillMode::Blank => {
                        self.image[local] = NO_DATA;
                        self.variance[local] = 0.0;
                    }
                }
            }
        }
    }

    /// Overwrites the overlapping part of this window with `other`.
    pub fn fill_from(&mut self, other: &SubImage) {
        for y in 0..self.height() {
            let py = self.ymin + y as i32;
            for x in 0..self.width() {
                let px = self.xmin + x as i32;
                if let (Some(v), Some(var)) = (other.value_at(px, py), other.variance_at(px, py)) {
                    self.image[(x, y)] = v;
                    self.variance[(x, y)] = var;
                }
            }
        }
    }
}
