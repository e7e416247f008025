//! Mapping between bounded model parameters and the unbounded vector the
//! minimizer works on.
//!
//! A slot with distinct bounds goes through the logistic transform
//! `y = ln((x - lo) / (hi - x))`, saturated at `±UNBOUND_LIMIT`. A pinned
//! slot (`lo == hi`) maps linearly and always comes back at its bound.

use crate::constants::UNBOUND_LIMIT;
use crate::profile::{ParamRegistry, ParamSlot};

pub fn slot_to_unbounded(slot: &ParamSlot) -> f64 {
    if slot.is_pinned() {
        return if slot.upper != 0.0 { slot.value / slot.upper } else { 0.0 };
    }
    let num = slot.value - slot.lower;
    let den = slot.upper - slot.value;
    if num <= 0.0 {
        -UNBOUND_LIMIT
    } else if den <= 0.0 {
        UNBOUND_LIMIT
    } else {
        (num / den).ln().clamp(-UNBOUND_LIMIT, UNBOUND_LIMIT)
    }
}

pub fn slot_to_bounded(slot: &ParamSlot, y: f64) -> f64 {
    if slot.is_pinned() {
        return slot.lower;
    }
    let y = y.clamp(-UNBOUND_LIMIT, UNBOUND_LIMIT);
    (slot.upper - slot.lower) / (1.0 + (-y).exp()) + slot.lower
}

/// `dx/dy` of the transform at the slot's current value, 0 when pinned.
pub fn slot_derivative(slot: &ParamSlot) -> f64 {
    if slot.is_pinned() {
        return 0.0;
    }
    (slot.value - slot.lower) * (slot.upper - slot.value) / (slot.upper - slot.lower)
}

/// Unbounded vector of the slots listed in `free`.
pub fn to_unbounded(registry: &ParamRegistry, free: &[usize]) -> Vec<f64> {
    free.iter()
        .map(|&i| slot_to_unbounded(&registry.slots()[i]))
        .collect()
}

/// Writes the bounded values of `free` slots from `y` into `values`, a
/// full slot vector. Other entries are left as they are.
pub fn to_bounded(registry: &ParamRegistry, free: &[usize], y: &[f64], values: &mut [f64]) {
    debug_assert_eq!(free.len(), y.len());
    for (&i, &yi) in free.iter().zip(y) {
        values[i] = slot_to_bounded(&registry.slots()[i], yi);
    }
}

/// Full slot covariance from the covariance of the free unbounded vector,
/// propagated through the transform at the registry's current values.
pub fn covariance_to_bounded(registry: &ParamRegistry, free: &[usize], unbounded: &[f64]) -> Vec<f64> {
    let n = registry.len();
    let k = free.len();
    let mut covariance = vec![0.0; n * n];
    if unbounded.len() != k * k {
        return covariance;
    }
    let dxdy: Vec<f64> = free.iter().map(|&i| slot_derivative(&registry.slots()[i])).collect();
    for (a, &i) in free.iter().enumerate() {
        for (b, &j) in free.iter().enumerate() {
            covariance[i * n + j] = dxdy[a] * dxdy[b] * unbounded[a * k + b];
        }
    }
    covariance
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ParamKind, ParamSeed};

    fn registry() -> ParamRegistry {
        let mut registry = ParamRegistry::new();
        registry.register(ParamKind::MoffatFlux);
        registry.register(ParamKind::MoffatBeta);
        registry.register(ParamKind::ArmsPosang);
        registry.reset(&ParamSeed {
            flux: 100.0,
            half_light: 2.0,
            a: 2.0,
            b: 2.0,
            theta: 0.0,
            dx: 0.0,
            dy: 0.0,
            noise: 1.0,
            extent: 20.0,
        });
        registry
    }

    #[test]
    fn test_round_trip_inside_bounds() {
        let registry = registry();
        let free = [0, 1];
        let y = to_unbounded(&registry, &free);
        let mut values = vec![0.0; registry.len()];
        to_bounded(&registry, &free, &y, &mut values);
        assert!((values[0] - 100.0).abs() < 1e-9);
        assert!((values[1] - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_extreme_values_stay_inside_bounds() {
        let registry = registry();
        let slot = &registry.slots()[1];
        let low = slot_to_bounded(slot, -1e6);
        let high = slot_to_bounded(slot, 1e6);
        assert!(low >= slot.lower && low < slot.lower + 1e-9);
        assert!(high <= slot.upper && high > slot.upper - 1e-9);
    }

    #[test]
    fn test_values_on_bounds_saturate() {
        let mut slot = registry().slots()[1];
        slot.value = slot.lower;
        assert_eq!(slot_to_unbounded(&slot), -UNBOUND_LIMIT);
        slot.value = slot.upper;
        assert_eq!(slot_to_unbounded(&slot), UNBOUND_LIMIT);
    }

    #[test]
    fn test_pinned_slot_returns_bound() {
        let registry = registry();
        let slot = &registry.slots()[2];
        assert!(slot.is_pinned());
        assert_eq!(slot_to_unbounded(slot), 0.0);
        assert_eq!(slot_to_bounded(slot, 12.0), slot.lower);
        assert_eq!(slot_derivative(slot), 0.0);
    }

    #[test]
    fn test_covariance_scales_by_derivatives() {
        let registry = registry();
        let free = [0, 1, 2];
        let unbounded = [1.0, 0.5, 0.0, 0.5, 2.0, 0.0, 0.0, 0.0, 3.0];
        let cov = covariance_to_bounded(&registry, &free, &unbounded);

        let d0 = slot_derivative(&registry.slots()[0]);
        let d1 = slot_derivative(&registry.slots()[1]);
        assert!((cov[0] - d0 * d0).abs() < 1e-9);
        assert!((cov[1] - 0.5 * d0 * d1).abs() < 1e-9);
        assert_eq!(cov[1], cov[3]);
        // Pinned slot.
        assert_eq!(cov[8], 0.0);
    }
}
