//! Profile components and their rasterization on the model grid.
//!
//! Every component reads its parameters from the shared registry through
//! slot indices and renders a unit-flux image centred on the model frame.
//! Analytic laws (Sérsic family, exponential, Moffat) are truncated at the
//! largest ellipse that fits the frame and carry the analytic fraction of
//! flux lost beyond it. Structured components (bar, arms, rings, tabulated
//! Sérsic) are cut at the brightest value met on the frame's inscribed
//! circle instead.

use std::sync::OnceLock;

use common::Buffer2;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

use super::frame::ModelFrame;
use super::gamma::{gamma_p, ln_gamma, sersic_bn};
use super::params::{ParamKind as P, ParamRegistry};
use crate::constants::{BAR_CROSSFADE, DEVAUC_BN, TAB_NSUB, TAB_N_STEP, TAB_N_ZERO, TAB_RES};

/// Table pixels per effective radius in the tabulated Sérsic cube.
const TAB_TYPSCALE: f64 = TAB_RES as f64 / 64.0;

/// Width exponent of the spiral arm pattern.
const ARM_WIDTH_POWER: i32 = 3;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter,
)]
pub enum ComponentKind {
    Background,
    Sersic,
    DeVaucouleurs,
    Exponential,
    Bar,
    Arms,
    InnerRing,
    OuterRing,
    Tabulated,
    Dirac,
    Moffat,
}

impl ComponentKind {
    /// Parameters read by the component, in slot order.
    pub fn parameters(self) -> &'static [P] {
        match self {
            ComponentKind::Background => &[P::Background],
            ComponentKind::Sersic | ComponentKind::Tabulated => &[
                P::X,
                P::Y,
                P::SpheroidFlux,
                P::SpheroidReff,
                P::SpheroidAspect,
                P::SpheroidPosang,
                P::SersicN,
            ],
            ComponentKind::DeVaucouleurs => &[
                P::X,
                P::Y,
                P::SpheroidFlux,
                P::SpheroidReff,
                P::SpheroidAspect,
                P::SpheroidPosang,
            ],
            ComponentKind::Exponential => &[
                P::X,
                P::Y,
                P::DiskFlux,
                P::DiskScale,
                P::DiskAspect,
                P::DiskPosang,
            ],
            ComponentKind::Arms => &[
                P::X,
                P::Y,
                P::DiskScale,
                P::DiskAspect,
                P::DiskPosang,
                P::ArmsFlux,
                P::ArmsQuadfrac,
                P::ArmsStart,
                P::ArmsPitch,
                P::ArmsPosang,
            ],
            ComponentKind::Bar => &[
                P::X,
                P::Y,
                P::DiskScale,
                P::DiskAspect,
                P::DiskPosang,
                P::ArmsStart,
                P::BarFlux,
                P::BarAspect,
                P::ArmsPosang,
            ],
            ComponentKind::InnerRing => &[
                P::X,
                P::Y,
                P::DiskScale,
                P::DiskAspect,
                P::DiskPosang,
                P::ArmsStart,
                P::InRingFlux,
                P::InRingWidth,
                P::InRingAspect,
            ],
            ComponentKind::OuterRing => &[
                P::X,
                P::Y,
                P::DiskScale,
                P::DiskAspect,
                P::DiskPosang,
                P::OutRingStart,
                P::OutRingFlux,
                P::OutRingWidth,
            ],
            ComponentKind::Dirac => &[P::X, P::Y, P::DiskFlux],
            ComponentKind::Moffat => &[
                P::X,
                P::Y,
                P::MoffatFlux,
                P::MoffatAlpha,
                P::MoffatBeta,
                P::MoffatOffset,
                P::MoffatAspect,
                P::MoffatPosang,
            ],
        }
    }

    /// Parameter scaling the unit image into the model.
    pub fn amplitude(self) -> P {
        match self {
            ComponentKind::Background => P::Background,
            ComponentKind::Sersic | ComponentKind::DeVaucouleurs | ComponentKind::Tabulated => {
                P::SpheroidFlux
            }
            ComponentKind::Exponential | ComponentKind::Dirac => P::DiskFlux,
            ComponentKind::Arms => P::ArmsFlux,
            ComponentKind::Bar => P::BarFlux,
            ComponentKind::InnerRing => P::InRingFlux,
            ComponentKind::OuterRing => P::OutRingFlux,
            ComponentKind::Moffat => P::MoffatFlux,
        }
    }

    /// Components truncated at the frame's inscribed circle.
    pub fn is_structured(self) -> bool {
        matches!(
            self,
            ComponentKind::Bar
                | ComponentKind::Arms
                | ComponentKind::InnerRing
                | ComponentKind::OuterRing
                | ComponentKind::Tabulated
        )
    }

    /// Scale, aspect and position-angle parameters of the component.
    fn geometry(self) -> Option<(P, P, P)> {
        match self {
            ComponentKind::Sersic | ComponentKind::DeVaucouleurs | ComponentKind::Tabulated => {
                Some((P::SpheroidReff, P::SpheroidAspect, P::SpheroidPosang))
            }
            ComponentKind::Exponential
            | ComponentKind::Arms
            | ComponentKind::Bar
            | ComponentKind::InnerRing
            | ComponentKind::OuterRing => Some((P::DiskScale, P::DiskAspect, P::DiskPosang)),
            ComponentKind::Moffat => Some((P::MoffatAlpha, P::MoffatAspect, P::MoffatPosang)),
            ComponentKind::Background | ComponentKind::Dirac => None,
        }
    }
}

/// Pixel-to-profile linear map: model pixel offsets to profile units.
#[derive(Debug, Clone, Copy)]
struct Affine {
    cd11: f64,
    cd12: f64,
    cd21: f64,
    cd22: f64,
}

impl Affine {
    fn new(scale: f64, aspect: f64, posang_deg: f64, pixel_step: f64) -> Self {
        let (s, c) = posang_deg.to_radians().sin_cos();
        let xscale = pixel_step / scale.abs().max(1e-10);
        let yscale = xscale / aspect.abs().max(1e-10);
        Self {
            cd11: xscale * c,
            cd12: xscale * s,
            cd21: -yscale * s,
            cd22: yscale * c,
        }
    }

    #[inline]
    fn map(&self, dx: f64, dy: f64) -> (f64, f64) {
        (self.cd11 * dx + self.cd12 * dy, self.cd21 * dx + self.cd22 * dy)
    }

    /// Largest squared profile radius whose ellipse stays `half - 1` pixels
    /// from the centre along both axes.
    fn max_r2(&self, half: f64) -> f64 {
        let det = self.cd11 * self.cd22 - self.cd12 * self.cd21;
        let det2 = det * det;
        let edge = (half - 1.0).max(0.0);
        let r2x = det2 / (self.cd12 * self.cd12 + self.cd22 * self.cd22).max(1e-30);
        let r2y = det2 / (self.cd11 * self.cd11 + self.cd21 * self.cd21).max(1e-30);
        edge * edge * r2x.min(r2y)
    }
}

#[derive(Debug, Clone)]
pub struct Component {
    kind: ComponentKind,
    slots: Vec<usize>,
    flux_factor: f64,
    lost_flux: f64,
}

impl Component {
    /// Registers the parameters of `kind`, reusing slots already present.
    pub fn new(kind: ComponentKind, registry: &mut ParamRegistry) -> Self {
        let slots = kind.parameters().iter().map(|&p| registry.register(p)).collect();
        Self {
            kind,
            slots,
            flux_factor: 1.0,
            lost_flux: 0.0,
        }
    }

    #[inline]
    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// Slot of parameter `param`, if the component reads it.
    pub fn slot(&self, param: P) -> Option<usize> {
        self.kind
            .parameters()
            .iter()
            .position(|&p| p == param)
            .map(|i| self.slots[i])
    }

    pub fn uses(&self, slot: usize) -> bool {
        self.slots.contains(&slot)
    }

    pub fn amplitude_slot(&self) -> usize {
        self.slot(self.kind.amplitude())
            .unwrap_or_else(|| unreachable!("amplitude is always registered"))
    }

    /// Multiplier of the unit image. The background level enters by
    /// magnitude.
    pub fn amplitude(&self, values: &[f64]) -> f64 {
        let value = values[self.amplitude_slot()];
        match self.kind {
            ComponentKind::Background => value.abs(),
            _ => value,
        }
    }

    /// Fraction of the total flux falling outside the model frame, from the
    /// last rasterization.
    pub fn lost_flux(&self) -> f64 {
        self.lost_flux
    }

    pub fn flux_factor(&self) -> f64 {
        self.flux_factor
    }

    #[inline]
    fn value(&self, values: &[f64], param: P) -> f64 {
        self.slot(param).map_or(0.0, |i| values[i])
    }

    fn affine(&self, values: &[f64], frame: &ModelFrame) -> Affine {
        let (scale, aspect, posang) = self
            .kind
            .geometry()
            .map(|(s, a, p)| (self.value(values, s), self.value(values, a), self.value(values, p)))
            .unwrap_or((1.0, 1.0, 0.0));
        Affine::new(scale, aspect, posang, frame.pixel_step)
    }

    /// Renders the component at `values` into `buffer`, a square raster of
    /// the model frame's size. The image sums to `1 - lost_flux`; the
    /// background renders one unit per detector pixel.
    pub fn rasterize(&mut self, values: &[f64], frame: &ModelFrame, buffer: &mut Buffer2<f32>) {
        let n = frame.model_size;
        debug_assert_eq!(buffer.width(), n);
        let half = frame.model_centre();
        let os = frame.oversampling;

        let lost = match self.kind {
            ComponentKind::Background => {
                let step = frame.pixel_step;
                buffer.fill((step * step) as f32);
                self.flux_factor = 1.0;
                self.lost_flux = 0.0;
                return;
            }
            ComponentKind::Dirac => {
                buffer.fill(0.0);
                buffer[(n / 2, n / 2)] = 1.0;
                0.0
            }
            ComponentKind::Sersic => {
                let sersic_n = self.value(values, P::SersicN).abs().max(0.1);
                let bn = sersic_bn(sersic_n);
                let hinvn = 0.5 / sersic_n;
                let cd = self.affine(values, frame);
                let r2max = cd.max_r2(half);
                radial(
                    buffer,
                    &cd,
                    r2max,
                    |v| (v * os + 0.1) as usize,
                    |r2| (-bn * r2.powf(hinvn)).exp(),
                );
                1.0 - gamma_p(2.0 * sersic_n, bn * r2max.powf(hinvn))
            }
            ComponentKind::DeVaucouleurs => {
                let cd = self.affine(values, frame);
                let r2max = cd.max_r2(half);
                radial(
                    buffer,
                    &cd,
                    r2max,
                    |v| (v.sqrt() * os + 0.1) as usize,
                    |r2| (-DEVAUC_BN * r2.powf(0.125)).exp(),
                );
                1.0 - gamma_p(8.0, DEVAUC_BN * r2max.powf(0.125))
            }
            ComponentKind::Exponential => {
                let cd = self.affine(values, frame);
                let r2max = cd.max_r2(half);
                let os_root = os.sqrt();
                radial(
                    buffer,
                    &cd,
                    r2max,
                    |v| (v * os_root + 0.1) as usize,
                    |r2| (-r2.sqrt()).exp(),
                );
                let rmax = r2max.sqrt();
                (1.0 + rmax) * (-rmax).exp()
            }
            ComponentKind::Moffat => {
                let beta = self.value(values, P::MoffatBeta).max(1.0 + 1e-6);
                let offset = self.value(values, P::MoffatOffset).max(0.0);
                let cd = self.affine(values, frame);
                let r2max = cd.max_r2(half);
                let law = |r2: f64| {
                    let r = (r2.sqrt() - offset).max(0.0);
                    (1.0 + r * r).powf(-beta)
                };
                radial(buffer, &cd, r2max, |v| (v * os + 0.1) as usize, law);
                let r = (r2max.sqrt() - offset).max(0.0);
                (1.0 + r * r).powf(1.0 - beta)
            }
            ComponentKind::Arms => {
                let cd = self.affine(values, frame);
                let start = self.value(values, P::ArmsStart);
                let r2min = start * start;
                let xin = r2min * (1.0 - BAR_CROSSFADE).powi(2);
                let xout = r2min * (1.0 + BAR_CROSSFADE).powi(2);
                let inv_dif = if xout > xin { 1.0 / (xout - xin) } else { 1.0 };
                let quad = self.value(values, P::ArmsQuadfrac);
                let winding = 1.0 / self.value(values, P::ArmsPitch).to_radians().tan();
                let posang = self.value(values, P::ArmsPosang).to_radians();
                plane(buffer, &cd, |x1, x2| {
                    let r2 = x1 * x1 + x2 * x2;
                    if r2 <= xin {
                        return 0.0;
                    }
                    let u = 0.5 * (r2 + 1e-5).ln();
                    let (sa, ca) = (winding * u + posang).sin_cos();
                    let x1in = x1 * ca - x2 * sa;
                    let x2in = x1 * sa + x2 * ca;
                    let mut amp = (-r2.sqrt()).exp();
                    if r2 < xout {
                        amp *= (r2 - xin) * inv_dif;
                    }
                    let ra = x1in * x1in / r2;
                    let rb = x2in * x2in / r2;
                    amp * ((1.0 - quad) * ra.powi(ARM_WIDTH_POWER) + quad * rb.powi(ARM_WIDTH_POWER))
                });
                0.0
            }
            ComponentKind::Bar => {
                let cd = self.affine(values, frame);
                let start = self.value(values, P::ArmsStart);
                let r2min = start * start;
                let xin = r2min * (1.0 - BAR_CROSSFADE).powi(2);
                let xout = r2min * (1.0 + BAR_CROSSFADE).powi(2);
                let inv_dif = if xout > xin { 1.0 / (xout - xin) } else { 1.0 };
                let inv_width = (1.0 / (start * self.value(values, P::BarAspect))).abs();
                let (sa, ca) = self.value(values, P::ArmsPosang).to_radians().sin_cos();
                plane(buffer, &cd, |x1, x2| {
                    let r2 = x1 * x1 + x2 * x2;
                    if r2 >= xout {
                        return 0.0;
                    }
                    let across = inv_width * (x1 * sa + x2 * ca);
                    let core = (-across * across).exp();
                    if r2 > xin {
                        (xout - r2) * inv_dif * core
                    } else {
                        core
                    }
                });
                0.0
            }
            ComponentKind::InnerRing | ComponentKind::OuterRing => {
                let mut cd = self.affine(values, frame);
                let (start, width) = if self.kind == ComponentKind::InnerRing {
                    let aspect = self.value(values, P::InRingAspect).abs().max(1e-10);
                    cd.cd21 /= aspect;
                    cd.cd22 /= aspect;
                    (self.value(values, P::ArmsStart), self.value(values, P::InRingWidth))
                } else {
                    (self.value(values, P::OutRingStart), self.value(values, P::OutRingWidth))
                };
                let width = width.abs().max(1e-10);
                let lo = (start - 4.0 * width).max(0.0).powi(2);
                let hi = (start + 4.0 * width).powi(2);
                let inv_width2 = 0.5 / (width * width);
                plane(buffer, &cd, |x1, x2| {
                    let r2 = x1 * x1 + x2 * x2;
                    if r2 > lo && r2 < hi {
                        let r = r2.sqrt() - start;
                        (-inv_width2 * r * r).exp()
                    } else {
                        0.0
                    }
                });
                0.0
            }
            ComponentKind::Tabulated => {
                let sersic_n = self.value(values, P::SersicN).abs();
                let cd = self.affine(values, frame);
                let plane_pos = ((sersic_n - TAB_N_ZERO) / TAB_N_STEP).clamp(0.0, (TAB_NSUB - 1) as f64);
                let cube = sersic_cube();
                let tc = (TAB_RES / 2) as f64;
                plane(buffer, &cd, |x1, x2| {
                    sample_cube(cube, tc + TAB_TYPSCALE * x1, tc + TAB_TYPSCALE * x2, plane_pos)
                });
                0.0
            }
        };

        if self.kind.is_structured() {
            truncate_at_border(buffer);
        }

        let mut flux = buffer.sum();
        if lost < 1.0 {
            flux /= 1.0 - lost;
        }
        self.flux_factor = if flux.abs() > 0.0 { 1.0 / flux } else { 0.0 };
        self.lost_flux = lost;
        let factor = self.flux_factor as f32;
        buffer.iter_mut().for_each(|v| *v *= factor);
    }

    /// Second moments in detector pixels of the analytic laws.
    pub fn moments(&self, values: &[f64]) -> Option<(f64, f64, f64)> {
        let (scale, aspect, posang) = self.kind.geometry()?;
        let s = self.value(values, scale);
        let m20 = match self.kind {
            ComponentKind::Sersic => {
                let n = self.value(values, P::SersicN).abs().max(0.1);
                let bn = sersic_bn(n);
                0.5 * s * s * (ln_gamma(4.0 * n) - ln_gamma(2.0 * n) - 2.0 * n * bn.ln()).exp()
            }
            ComponentKind::DeVaucouleurs => 10.83995 * s * s,
            ComponentKind::Exponential => 3.0 * s * s,
            _ => return None,
        };
        let q = self.value(values, aspect);
        let (sn, cs) = self.value(values, posang).to_radians().sin_cos();
        let q2 = q * q;
        Some((
            m20 * (cs * cs + q2 * sn * sn),
            m20 * (sn * sn + q2 * cs * cs),
            m20 * (1.0 - q2) * cs * sn,
        ))
    }
}

/// Renders a point-symmetric radial law. Only the first half of the rows
/// is evaluated; the rest is mirrored through the centre. Pixels whose
/// profile value calls for it are averaged over `oversample(value)^2`
/// sub-samples.
fn radial(
    buffer: &mut Buffer2<f32>,
    cd: &Affine,
    r2max: f64,
    oversample: impl Fn(f64) -> usize,
    law: impl Fn(f64) -> f64,
) {
    let n = buffer.width();
    let c = n / 2;
    let cf = c as f64;
    for y in 0..=c.min(n - 1) {
        let dy = y as f64 - cf;
        for x in 0..n {
            let dx = x as f64 - cf;
            let (u, v) = cd.map(dx, dy);
            let r2 = u * u + v * v;
            let value = if r2 > r2max {
                0.0
            } else {
                let value = law(r2);
                let nos = oversample(value);
                if nos < 2 {
                    value
                } else {
                    let step = 1.0 / nos as f64;
                    let first = 0.5 * (step - 1.0);
                    let mut sum = 0.0;
                    for j in 0..nos {
                        let sy = dy + first + j as f64 * step;
                        for i in 0..nos {
                            let (u, v) = cd.map(dx + first + i as f64 * step, sy);
                            sum += law(u * u + v * v);
                        }
                    }
                    sum * step * step
                }
            };
            buffer[(x, y)] = value as f32;
        }
    }
    for y in c + 1..n {
        for x in 0..n {
            buffer[(x, y)] = if x == 0 { 0.0 } else { buffer[(n - x, n - y)] };
        }
    }
}

/// Evaluates `law` at the profile coordinates of every model pixel.
fn plane(buffer: &mut Buffer2<f32>, cd: &Affine, law: impl Fn(f64, f64) -> f64) {
    let n = buffer.width();
    let cf = (n / 2) as f64;
    for y in 0..n {
        let dy = y as f64 - cf;
        for x in 0..n {
            let (u, v) = cd.map(x as f64 - cf, dy);
            buffer[(x, y)] = law(u, v) as f32;
        }
    }
}

/// Zeroes every pixel fainter than the brightest one on the one-pixel
/// annulus inscribed in the frame.
fn truncate_at_border(buffer: &mut Buffer2<f32>) {
    let n = buffer.width();
    let cf = (n / 2) as f64;
    let rmax = (cf + 0.01).max(1.0);
    let rmin = rmax - 1.0;
    let (r2min, r2max) = (rmin * rmin, rmax * rmax);
    let mut threshold = f32::NEG_INFINITY;
    for y in 0..n {
        let dy = y as f64 - cf;
        for x in 0..n {
            let dx = x as f64 - cf;
            let r2 = dx * dx + dy * dy;
            let v = buffer[(x, y)];
            if v > threshold && r2 > r2min && r2 < r2max {
                threshold = v;
            }
        }
    }
    buffer.iter_mut().filter(|v| **v < threshold).for_each(|v| *v = 0.0);
}

static SERSIC_CUBE: OnceLock<Vec<f32>> = OnceLock::new();

/// `TAB_NSUB` planes of `TAB_RES x TAB_RES` Sérsic images with the
/// effective radius at `TAB_TYPSCALE` table pixels.
fn sersic_cube() -> &'static [f32] {
    SERSIC_CUBE.get_or_init(|| {
        let c = (TAB_RES / 2) as f64;
        let r2cut = (c - 1.0) * (c - 1.0);
        let mut cube = Vec::with_capacity(TAB_NSUB * TAB_RES * TAB_RES);
        for s in 0..TAB_NSUB {
            let n = TAB_N_ZERO + s as f64 * TAB_N_STEP;
            let bn = sersic_bn(n);
            for y in 0..TAB_RES {
                let dy = y as f64 - c;
                for x in 0..TAB_RES {
                    let dx = x as f64 - c;
                    let r2 = dx * dx + dy * dy;
                    let value = if r2 < r2cut {
                        (-bn * (r2.sqrt() / TAB_TYPSCALE).powf(1.0 / n)).exp()
                    } else {
                        0.0
                    };
                    cube.push(value as f32);
                }
            }
        }
        cube
    })
}

/// Bilinear in position, linear across planes; 0 outside the table.
fn sample_cube(cube: &[f32], x: f64, y: f64, plane_pos: f64) -> f64 {
    let last = (TAB_RES - 1) as f64;
    if !(0.0..last).contains(&x) || !(0.0..last).contains(&y) {
        return 0.0;
    }
    let (ix, iy) = (x as usize, y as usize);
    let (fx, fy) = (x - ix as f64, y - iy as f64);
    let s0 = plane_pos as usize;
    let s1 = (s0 + 1).min(TAB_NSUB - 1);
    let fs = plane_pos - s0 as f64;
    let bilinear = |s: usize| {
        let base = s * TAB_RES * TAB_RES;
        let at = |xx: usize, yy: usize| cube[base + yy * TAB_RES + xx] as f64;
        let top = at(ix, iy) * (1.0 - fx) + at(ix + 1, iy) * fx;
        let bottom = at(ix, iy + 1) * (1.0 - fx) + at(ix + 1, iy + 1) * fx;
        top * (1.0 - fy) + bottom * fy
    };
    bilinear(s0) * (1.0 - fs) + bilinear(s1) * fs
}
