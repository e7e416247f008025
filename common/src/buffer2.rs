//! Row-major 2D raster.
//!
//! `Buffer2` is the storage type behind every image-like array in the
//! workspace: detection windows, variance maps, model rasters and check
//! images. Fallible constructors report allocation failure instead of
//! aborting so callers can surface it as a recoverable error.

use std::collections::TryReserveError;
use std::ops::{Deref, DerefMut, Index, IndexMut};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Buffer2<T> {
    pixels: Vec<T>,
    width: usize,
    height: usize,
}

impl<T> Buffer2<T> {
    pub fn new(width: usize, height: usize, pixels: Vec<T>) -> Self {
        assert_eq!(
            pixels.len(),
            width * height,
            "pixels length must equal width * height"
        );
        Self {
            pixels,
            width,
            height,
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    #[inline]
    pub fn index_of(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }

    /// Returns the pixel at signed coordinates, `None` outside the raster.
    #[inline]
    pub fn checked(&self, x: i64, y: i64) -> Option<&T> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        Some(&self.pixels[y as usize * self.width + x as usize])
    }

    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        let start = y * self.width;
        &self.pixels[start..start + self.width]
    }

    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [T] {
        let start = y * self.width;
        &mut self.pixels[start..start + self.width]
    }

    #[inline]
    pub fn pixels(&self) -> &[T] {
        &self.pixels
    }

    #[inline]
    pub fn pixels_mut(&mut self) -> &mut [T] {
        &mut self.pixels
    }

    #[inline]
    pub fn into_vec(self) -> Vec<T> {
        self.pixels
    }

    pub fn copy_from(&mut self, other: &Self)
    where
        T: Copy,
    {
        assert_eq!(self.width, other.width, "width mismatch");
        assert_eq!(self.height, other.height, "height mismatch");
        self.pixels.copy_from_slice(&other.pixels);
    }
}

impl<T: Clone> Buffer2<T> {
    pub fn new_filled(width: usize, height: usize, value: T) -> Self {
        Self {
            pixels: vec![value; width * height],
            width,
            height,
        }
    }

    /// Like [`Buffer2::new_filled`] but reports allocation failure.
    pub fn try_new_filled(width: usize, height: usize, value: T) -> Result<Self, TryReserveError> {
        let len = width * height;
        let mut pixels = Vec::new();
        pixels.try_reserve_exact(len)?;
        pixels.resize(len, value);
        Ok(Self {
            pixels,
            width,
            height,
        })
    }

    /// Clone that reports allocation failure.
    pub fn try_clone(&self) -> Result<Self, TryReserveError> {
        let mut pixels = Vec::new();
        pixels.try_reserve_exact(self.pixels.len())?;
        pixels.extend_from_slice(&self.pixels);
        Ok(Self {
            pixels,
            width: self.width,
            height: self.height,
        })
    }

    #[inline]
    pub fn fill(&mut self, value: T) {
        self.pixels.fill(value);
    }
}

impl<T: Default + Clone> Buffer2<T> {
    pub fn new_default(width: usize, height: usize) -> Self {
        Self::new_filled(width, height, T::default())
    }
}

impl Buffer2<f32> {
    /// Adds `factor * src` into `self`, with `src` placed so that its pixel
    /// (0, 0) lands on `(x0, y0)` of `self`. Pixels falling outside are
    /// clipped.
    pub fn add_scaled(&mut self, src: &Buffer2<f32>, x0: i64, y0: i64, factor: f32) {
        let xs = x0.max(0);
        let ys = y0.max(0);
        let xe = (x0 + src.width as i64).min(self.width as i64);
        let ye = (y0 + src.height as i64).min(self.height as i64);
        if xs >= xe || ys >= ye {
            return;
        }
        for y in ys..ye {
            let dst_row = self.row_mut(y as usize);
            let src_row = src.row((y - y0) as usize);
            for x in xs..xe {
                dst_row[x as usize] += factor * src_row[(x - x0) as usize];
            }
        }
    }

    pub fn sum(&self) -> f64 {
        self.pixels.iter().map(|&v| v as f64).sum()
    }
}

impl<T> Index<(usize, usize)> for Buffer2<T> {
    type Output = T;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &Self::Output {
        &self.pixels[y * self.width + x]
    }
}

impl<T> IndexMut<(usize, usize)> for Buffer2<T> {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut Self::Output {
        &mut self.pixels[y * self.width + x]
    }
}

impl<T> Index<usize> for Buffer2<T> {
    type Output = T;

    #[inline]
    fn index(&self, idx: usize) -> &Self::Output {
        &self.pixels[idx]
    }
}

impl<T> IndexMut<usize> for Buffer2<T> {
    #[inline]
    fn index_mut(&mut self, idx: usize) -> &mut Self::Output {
        &mut self.pixels[idx]
    }
}

impl<T> Deref for Buffer2<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.pixels
    }
}

impl<T> DerefMut for Buffer2<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_stores_dimensions() {
        let buf = Buffer2::new(3, 2, vec![10, 20, 30, 40, 50, 60]);
        assert_eq!(buf.width(), 3);
        assert_eq!(buf.height(), 2);
        assert_eq!(buf.len(), 6);
    }

    #[test]
    #[should_panic(expected = "pixels length must equal width * height")]
    fn test_new_panics_on_size_mismatch() {
        Buffer2::new(3, 2, vec![1, 2, 3]);
    }

    #[test]
    fn test_tuple_index_is_row_major() {
        let buf = Buffer2::new(3, 2, vec![10, 20, 30, 40, 50, 60]);
        assert_eq!(buf[(0, 0)], 10);
        assert_eq!(buf[(2, 0)], 30);
        assert_eq!(buf[(0, 1)], 40);
        assert_eq!(buf[(2, 1)], 60);
        assert_eq!(buf.index_of(1, 1), 4);
    }

    #[test]
    fn test_checked_rejects_outside() {
        let buf = Buffer2::new(2, 2, vec![1, 2, 3, 4]);
        assert_eq!(buf.checked(1, 1), Some(&4));
        assert_eq!(buf.checked(-1, 0), None);
        assert_eq!(buf.checked(0, 2), None);
    }

    #[test]
    fn test_rows() {
        let mut buf = Buffer2::new(3, 2, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(buf.row(1), &[4, 5, 6]);
        buf.row_mut(0)[2] = 9;
        assert_eq!(buf[(2, 0)], 9);
    }

    #[test]
    fn test_try_new_filled_and_clone() {
        let buf = Buffer2::try_new_filled(4, 3, 1.5f32).unwrap();
        assert_eq!(buf.len(), 12);
        assert!(buf.iter().all(|&v| v == 1.5));

        let copy = buf.try_clone().unwrap();
        assert_eq!(copy, buf);
    }

    #[test]
    fn test_add_scaled_clips_to_destination() {
        let mut dst = Buffer2::new_filled(4, 4, 0.0f32);
        let src = Buffer2::new_filled(3, 3, 1.0f32);

        // Upper-left corner hangs off the raster by one pixel in each axis.
        dst.add_scaled(&src, -1, -1, 2.0);

        assert_eq!(dst[(0, 0)], 2.0);
        assert_eq!(dst[(1, 1)], 2.0);
        assert_eq!(dst[(2, 2)], 0.0);
        assert!((dst.sum() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_add_scaled_disjoint_is_noop() {
        let mut dst = Buffer2::new_filled(2, 2, 0.0f32);
        let src = Buffer2::new_filled(2, 2, 1.0f32);
        dst.add_scaled(&src, 5, 5, 1.0);
        assert_eq!(dst.sum(), 0.0);
    }

    #[test]
    #[should_panic(expected = "width mismatch")]
    fn test_copy_from_panics_on_width_mismatch() {
        let src = Buffer2::new(3, 2, vec![0; 6]);
        let mut dst = Buffer2::new(2, 3, vec![0; 6]);
        dst.copy_from(&src);
    }
}
