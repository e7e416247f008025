//! Shared parameter registry of a profile model.
//!
//! Every fitted quantity is a [`ParamSlot`] in one flat vector, addressed by
//! index. Components ask the registry for the kinds they need; asking twice
//! for the same kind hands back the same slot, which is how a bar and a
//! spiral pattern end up sharing the disk geometry.

use strum::EnumCount;
use strum_macros::{Display, EnumCount, EnumIter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumCount)]
pub enum ParamKind {
    Background,
    X,
    Y,
    SpheroidFlux,
    SpheroidReff,
    SpheroidAspect,
    SpheroidPosang,
    SersicN,
    DiskFlux,
    DiskScale,
    DiskAspect,
    DiskPosang,
    ArmsFlux,
    ArmsQuadfrac,
    ArmsStart,
    ArmsPitch,
    ArmsPosang,
    BarFlux,
    BarAspect,
    InRingFlux,
    InRingWidth,
    InRingAspect,
    OutRingFlux,
    OutRingStart,
    OutRingWidth,
    MoffatFlux,
    MoffatAlpha,
    MoffatBeta,
    MoffatOffset,
    MoffatAspect,
    MoffatPosang,
}

impl ParamKind {
    /// Amplitude parameters, which enter the model linearly.
    pub fn is_flux(self) -> bool {
        matches!(
            self,
            ParamKind::SpheroidFlux
                | ParamKind::DiskFlux
                | ParamKind::ArmsFlux
                | ParamKind::BarFlux
                | ParamKind::InRingFlux
                | ParamKind::OutRingFlux
                | ParamKind::MoffatFlux
        )
    }

    pub fn is_position(self) -> bool {
        matches!(self, ParamKind::X | ParamKind::Y)
    }

    /// Angles in degrees, folded into (-90, 90] after fitting.
    pub fn is_angle(self) -> bool {
        matches!(
            self,
            ParamKind::SpheroidPosang
                | ParamKind::DiskPosang
                | ParamKind::ArmsPosang
                | ParamKind::MoffatPosang
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSlot {
    pub kind: ParamKind,
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
    /// Excluded from the minimizer's free vector when false.
    pub free: bool,
}

impl ParamSlot {
    fn new(kind: ParamKind) -> Self {
        Self {
            kind,
            value: 0.0,
            lower: 0.0,
            upper: 0.0,
            free: true,
        }
    }

    /// Equal bounds: the transform degenerates to a linear scaling and the
    /// covariance of the slot is zeroed.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.lower == self.upper
    }

    fn set(&mut self, value: f64, lower: f64, upper: f64) {
        self.lower = lower;
        self.upper = upper;
        self.value = if lower != upper && (value <= lower || value >= upper) {
            0.5 * (lower + upper)
        } else {
            value
        };
    }
}

/// Starting point of a fit, measured on the detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSeed {
    /// Isophotal flux.
    pub flux: f64,
    /// Half-light radius estimate.
    pub half_light: f64,
    /// Isophotal semi-axes and position angle in degrees.
    pub a: f64,
    pub b: f64,
    pub theta: f64,
    /// Barycentre offset from the frame centre pixel.
    pub dx: f64,
    pub dy: f64,
    /// Background noise RMS.
    pub noise: f64,
    /// Side of the fitting window in detector pixels.
    pub extent: f64,
}

#[derive(Debug, Clone)]
pub struct ParamRegistry {
    slots: Vec<ParamSlot>,
    index: [Option<usize>; ParamKind::COUNT],
}

impl Default for ParamRegistry {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            index: [None; ParamKind::COUNT],
        }
    }
}

impl ParamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot index of `kind`, allocating it on first request.
    pub fn register(&mut self, kind: ParamKind) -> usize {
        if let Some(index) = self.index[kind as usize] {
            return index;
        }
        let index = self.slots.len();
        self.slots.push(ParamSlot::new(kind));
        self.index[kind as usize] = Some(index);
        index
    }

    #[inline]
    pub fn index_of(&self, kind: ParamKind) -> Option<usize> {
        self.index[kind as usize]
    }

    pub fn get(&self, kind: ParamKind) -> Option<&ParamSlot> {
        self.index_of(kind).map(|i| &self.slots[i])
    }

    pub fn value(&self, kind: ParamKind) -> Option<f64> {
        self.get(kind).map(|slot| slot.value)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[ParamSlot] {
        &self.slots
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut ParamSlot {
        &mut self.slots[index]
    }

    pub fn values(&self) -> Vec<f64> {
        self.slots.iter().map(|slot| slot.value).collect()
    }

    pub fn set_values(&mut self, values: &[f64]) {
        debug_assert_eq!(values.len(), self.slots.len());
        for (slot, &value) in self.slots.iter_mut().zip(values) {
            slot.value = value;
        }
    }

    /// Indices of the slots handed to the minimizer.
    pub fn free_indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.free)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn set_free(&mut self, kind: ParamKind, free: bool) {
        if let Some(index) = self.index_of(kind) {
            self.slots[index].free = free;
        }
    }

    /// Sets every registered slot to its starting value and bounds. Values
    /// on or outside their bounds restart at the midpoint.
    pub fn reset(&mut self, seed: &ParamSeed) {
        let flux = if seed.flux > 0.0 { seed.flux } else { 1.0 };
        let hl = seed.half_light.max(0.5);
        let a = seed.a.max(0.5);
        let b = seed.b.max(0.05 * a);
        let aspect = (b / a).clamp(0.01, 1.0);
        let theta = seed.theta;
        let has_disk = self.index_of(ParamKind::DiskFlux).is_some();
        let shift = (4.0 * hl).min(2.0 * seed.extent);
        let disk_scale = hl / crate::constants::EXP_HALF_LIGHT * (1.0 / aspect).sqrt();
        let sigma = seed.noise.max(0.0);

        for slot in &mut self.slots {
            let (value, lower, upper) = match slot.kind {
                ParamKind::Background => (0.0, -6.0 * sigma, 6.0 * sigma),
                ParamKind::X => (seed.dx, -shift, shift),
                ParamKind::Y => (seed.dy, -shift, shift),
                ParamKind::SpheroidFlux | ParamKind::DiskFlux => {
                    (flux / 2.0, -flux / 1000.0, 2.0 * flux)
                }
                ParamKind::SpheroidReff => (hl, 0.1, 4.0 * hl),
                ParamKind::SpheroidAspect if has_disk => (1.0, 0.5, 2.0),
                ParamKind::SpheroidAspect => (aspect, 0.01, 100.0),
                ParamKind::SpheroidPosang | ParamKind::DiskPosang => {
                    (theta, theta - 90.0, theta + 90.0)
                }
                ParamKind::SersicN => (4.0, 1.0, 10.0),
                ParamKind::DiskScale => (disk_scale, disk_scale / 4.0, disk_scale * 4.0),
                ParamKind::DiskAspect => (aspect, 0.01, 100.0),
                ParamKind::ArmsFlux => (flux / 2.0, 0.0, 2.0 * flux),
                ParamKind::ArmsQuadfrac => (0.5, 0.0, 1.0),
                ParamKind::ArmsStart => (0.5, 0.0, 3.0),
                ParamKind::ArmsPitch => (20.0, 5.0, 50.0),
                ParamKind::ArmsPosang => (0.0, 0.0, 0.0),
                ParamKind::BarFlux => (flux / 10.0, 0.0, 2.0 * flux),
                ParamKind::BarAspect => (0.3, 0.2, 0.5),
                ParamKind::InRingFlux => (flux / 10.0, 0.0, 2.0 * flux),
                ParamKind::InRingWidth => (0.3, 0.0, 0.5),
                ParamKind::InRingAspect => (0.8, 0.4, 1.0),
                ParamKind::OutRingFlux => (flux / 10.0, 0.0, 2.0 * flux),
                ParamKind::OutRingStart => (4.0, 3.5, 6.0),
                ParamKind::OutRingWidth => (0.3, 0.0, 0.5),
                ParamKind::MoffatFlux => (flux, 0.0, 4.0 * flux),
                ParamKind::MoffatAlpha => (hl, 0.1, 4.0 * hl + 1.0),
                ParamKind::MoffatBeta => (2.5, 1.0, 10.0),
                ParamKind::MoffatOffset => (0.5, 0.0, 4.0),
                ParamKind::MoffatAspect => (aspect, 0.01, 100.0),
                ParamKind::MoffatPosang => (theta, theta - 90.0, theta + 90.0),
            };
            slot.set(value, lower, upper);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> ParamSeed {
        ParamSeed {
            flux: 1000.0,
            half_light: 2.0,
            a: 3.0,
            b: 1.5,
            theta: 30.0,
            dx: 0.2,
            dy: -0.3,
            noise: 1.0,
            extent: 25.0,
        }
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = ParamRegistry::new();
        let x = registry.register(ParamKind::X);
        let scale = registry.register(ParamKind::DiskScale);
        assert_eq!(registry.register(ParamKind::X), x);
        assert_eq!(registry.register(ParamKind::DiskScale), scale);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.index_of(ParamKind::Y), None);
    }

    #[test]
    fn test_reset_applies_defaults() {
        let mut registry = ParamRegistry::new();
        for kind in [
            ParamKind::X,
            ParamKind::SpheroidFlux,
            ParamKind::SpheroidAspect,
            ParamKind::SersicN,
            ParamKind::ArmsPosang,
        ] {
            registry.register(kind);
        }
        registry.reset(&seed());

        assert_eq!(registry.value(ParamKind::X), Some(0.2));
        let flux = registry.get(ParamKind::SpheroidFlux).unwrap();
        assert_eq!((flux.value, flux.lower, flux.upper), (500.0, -1.0, 2000.0));
        assert_eq!(registry.value(ParamKind::SpheroidAspect), Some(0.5));
        assert_eq!(registry.value(ParamKind::SersicN), Some(4.0));
        assert!(registry.get(ParamKind::ArmsPosang).unwrap().is_pinned());
    }

    #[test]
    fn test_spheroid_aspect_is_tighter_with_disk() {
        let mut registry = ParamRegistry::new();
        registry.register(ParamKind::SpheroidAspect);
        registry.register(ParamKind::DiskFlux);
        registry.reset(&seed());
        let slot = registry.get(ParamKind::SpheroidAspect).unwrap();
        assert_eq!((slot.value, slot.lower, slot.upper), (1.0, 0.5, 2.0));
    }

    #[test]
    fn test_value_on_bound_restarts_at_midpoint() {
        let mut registry = ParamRegistry::new();
        registry.register(ParamKind::X);
        let mut far = seed();
        far.dx = 50.0;
        registry.reset(&far);
        // Bounds are +-min(4 * 2, 50) = +-8, and 50 lies outside.
        assert_eq!(registry.value(ParamKind::X), Some(0.0));
    }

    #[test]
    fn test_zero_noise_pins_background() {
        let mut registry = ParamRegistry::new();
        registry.register(ParamKind::Background);
        registry.reset(&ParamSeed { noise: 0.0, ..seed() });
        let slot = registry.get(ParamKind::Background).unwrap();
        assert!(slot.is_pinned());
        assert_eq!(slot.value, 0.0);
    }

    #[test]
    fn test_free_indices_skip_fixed_slots() {
        let mut registry = ParamRegistry::new();
        registry.register(ParamKind::X);
        registry.register(ParamKind::Y);
        registry.register(ParamKind::MoffatFlux);
        registry.set_free(ParamKind::Y, false);
        assert_eq!(registry.free_indices(), vec![0, 2]);
    }
}
