use bitflags::bitflags;

use super::arena::{PixelArena, END_OF_CHAIN};
use crate::fit::ProfileFit;
use crate::subimage::SubImage;

bitflags! {
    /// Per-detection condition flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DetectionFlags: u32 {
        /// Touches the edge of the scanned area.
        const TRUNCATED = 1 << 0;
        /// Member of a blend group with more than one component.
        const MERGED = 1 << 1;
        /// Found by re-segmenting a deblending residual.
        const DEBLENDED = 1 << 2;
        /// Too few valid pixels for the number of fitted parameters.
        const NOT_CONSTRAINED = 1 << 3;
        /// The fitting frame is too small to hold the fitted profile.
        const APERTURE_PROBLEM = 1 << 4;
    }
}

/// A connected group of above-threshold pixels.
///
/// `head`/`tail` index the pixel chain inside the arena of the owning
/// `ObjectList`. Cutouts and the fit result are owned and move with the
/// detection.
#[derive(Debug, Clone)]
pub struct Detection {
    pub number: u32,
    pub blend: u32,
    pub xmin: i32,
    pub xmax: i32,
    pub ymin: i32,
    pub ymax: i32,
    pub npix: usize,
    pub head: i32,
    pub tail: i32,
    pub flags: DetectionFlags,

    /// Sum of pixel values.
    pub flux: f64,
    pub peak: f32,
    pub peak_x: i32,
    pub peak_y: i32,
    /// Flux-weighted barycentre.
    pub mx: f64,
    pub my: f64,
    /// Second central moments.
    pub mx2: f64,
    pub my2: f64,
    pub mxy: f64,
    /// Isophotal ellipse: semi-axes and position angle in degrees.
    pub a: f64,
    pub b: f64,
    pub theta: f64,

    /// Outer deblend iteration that produced this detection, 0 if primary.
    pub deblend_pass: u32,
    /// Effective diameter derived from the deblend model.
    pub deblend_fwhm: f64,

    pub iso: Option<SubImage>,
    pub full: Option<SubImage>,
    pub fit: Option<ProfileFit>,
}

impl Default for Detection {
    fn default() -> Self {
        Self {
            number: 0,
            blend: 0,
            xmin: 0,
            xmax: -1,
            ymin: 0,
            ymax: -1,
            npix: 0,
            head: END_OF_CHAIN,
            tail: END_OF_CHAIN,
            flags: DetectionFlags::empty(),
            flux: 0.0,
            peak: 0.0,
            peak_x: 0,
            peak_y: 0,
            mx: 0.0,
            my: 0.0,
            mx2: 0.0,
            my2: 0.0,
            mxy: 0.0,
            a: 0.0,
            b: 0.0,
            theta: 0.0,
            deblend_pass: 0,
            deblend_fwhm: 0.0,
            iso: None,
            full: None,
            fit: None,
        }
    }
}

impl Detection {
    /// Detection over the chain `(head, tail)` carrying `flags`; call
    /// [`Detection::preanalyse`] to fill in geometry and photometry.
    pub fn from_chain(head: i32, tail: i32, npix: usize, flags: DetectionFlags) -> Self {
        Self {
            head,
            tail,
            npix,
            flags,
            ..Self::default()
        }
    }

    #[inline]
    pub fn has_pixels(&self) -> bool {
        self.head != END_OF_CHAIN
    }

    #[inline]
    pub fn width(&self) -> i32 {
        self.xmax - self.xmin + 1
    }

    #[inline]
    pub fn height(&self) -> i32 {
        self.ymax - self.ymin + 1
    }

    /// Half-light radius estimate from the isophotal ellipse.
    pub fn half_light_radius(&self) -> f64 {
        (1.18 * (self.a * self.b).sqrt()).max(0.5)
    }

    /// Fast single-pass analysis of the pixel chain: bounding box, pixel
    /// count, flux, peak, barycentre, second moments and isophotal ellipse.
    pub fn preanalyse(&mut self, arena: &PixelArena) {
        let (mut xmin, mut xmax) = (i32::MAX, i32::MIN);
        let (mut ymin, mut ymax) = (i32::MAX, i32::MIN);
        let mut npix = 0usize;
        let mut flux = 0.0f64;
        let mut peak = f32::MIN;
        let (mut peak_x, mut peak_y) = (0, 0);
        let (mut sx, mut sy, mut sxx, mut syy, mut sxy, mut wsum) = (0.0, 0.0, 0.0, 0.0, 0.0, 0.0);

        for (_, pixel) in arena.chain(self.head) {
            xmin = xmin.min(pixel.x);
            xmax = xmax.max(pixel.x);
            ymin = ymin.min(pixel.y);
            ymax = ymax.max(pixel.y);
            npix += 1;
            flux += pixel.value as f64;
            let v = pixel.detection_value();
            if v > peak {
                peak = v;
                peak_x = pixel.x;
                peak_y = pixel.y;
            }
            let w = (pixel.value as f64).max(0.0);
            let (x, y) = (pixel.x as f64, pixel.y as f64);
            sx += w * x;
            sy += w * y;
            sxx += w * x * x;
            syy += w * y * y;
            sxy += w * x * y;
            wsum += w;
        }
        if npix == 0 {
            return;
        }

        self.xmin = xmin;
        self.xmax = xmax;
        self.ymin = ymin;
        self.ymax = ymax;
        self.npix = npix;
        self.flux = flux;
        self.peak = peak;
        self.peak_x = peak_x;
        self.peak_y = peak_y;

        if wsum > 0.0 {
            self.mx = sx / wsum;
            self.my = sy / wsum;
            self.mx2 = (sxx / wsum - self.mx * self.mx).max(0.0);
            self.my2 = (syy / wsum - self.my * self.my).max(0.0);
            self.mxy = sxy / wsum - self.mx * self.my;
        } else {
            self.mx = 0.5 * (xmin + xmax) as f64;
            self.my = 0.5 * (ymin + ymax) as f64;
            self.mx2 = 1.0 / 12.0;
            self.my2 = 1.0 / 12.0;
            self.mxy = 0.0;
        }
        // Single-pixel or line-like objects: floor the moments at a uniformly
        // filled pixel.
        if self.mx2 * self.my2 - self.mxy * self.mxy < 1.0 / 144.0 {
            self.mx2 += 1.0 / 12.0;
            self.my2 += 1.0 / 12.0;
        }

        let half_diff = 0.5 * (self.mx2 - self.my2);
        let root = (half_diff * half_diff + self.mxy * self.mxy).sqrt();
        let mean = 0.5 * (self.mx2 + self.my2);
        self.a = (mean + root).max(0.0).sqrt();
        self.b = (mean - root).max(0.0).sqrt();
        self.theta = if self.mxy == 0.0 && half_diff == 0.0 {
            0.0
        } else {
            0.5 * (2.0 * self.mxy).atan2(self.mx2 - self.my2).to_degrees()
        };
    }
}
