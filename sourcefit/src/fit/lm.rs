//! Levenberg-Marquardt minimizer over an opaque residual function.
//!
//! The minimizer only sees an unbounded parameter vector and a residual
//! callback. The Jacobian is built by forward differences through the
//! callback, one parameter at a time, which is the access pattern the
//! profile model's single-parameter fast path is built for.

use serde::{Deserialize, Serialize};

use super::linear_solver::{invert_semidefinite, solve};

/// Weighted residuals of a model against data.
pub trait ResidualFn {
    /// Number of residuals written by [`ResidualFn::residuals`].
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn residuals(&mut self, params: &[f64], out: &mut [f64]);
}

/// Outcome of a minimization.
#[derive(Debug, Clone, PartialEq)]
pub struct MinimizeOutcome {
    pub params: Vec<f64>,
    /// `(J^T J)^-1` at `params`, row-major, zero when not estimable.
    pub covariance: Vec<f64>,
    /// Sum of squared residuals at `params`.
    pub chi2: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Bounded-iteration nonlinear least-squares kernel.
pub trait Minimizer: Sync {
    fn minimize(&self, f: &mut dyn ResidualFn, init: &[f64], max_iterations: usize) -> MinimizeOutcome;
}

/// Configuration for Levenberg-Marquardt optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LmConfig {
    /// Convergence threshold for parameter changes.
    pub convergence_threshold: f64,
    /// Initial damping parameter.
    pub initial_lambda: f64,
    /// Factor to increase lambda on failed step.
    pub lambda_up: f64,
    /// Factor to decrease lambda on successful step.
    pub lambda_down: f64,
    /// Forward-difference step of the numerical Jacobian.
    pub jacobian_step: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            convergence_threshold: 1e-8,
            initial_lambda: 0.001,
            lambda_up: 10.0,
            lambda_down: 0.1,
            jacobian_step: 1e-4,
        }
    }
}

impl LmConfig {
    pub fn validate(&self) {
        assert!(
            self.convergence_threshold > 0.0,
            "convergence_threshold must be positive, got {}",
            self.convergence_threshold
        );
        assert!(
            self.initial_lambda > 0.0,
            "initial_lambda must be positive, got {}",
            self.initial_lambda
        );
        assert!(
            self.lambda_up > 1.0,
            "lambda_up must be > 1, got {}",
            self.lambda_up
        );
        assert!(
            self.lambda_down > 0.0 && self.lambda_down < 1.0,
            "lambda_down must be in (0, 1), got {}",
            self.lambda_down
        );
        assert!(
            self.jacobian_step > 0.0,
            "jacobian_step must be positive, got {}",
            self.jacobian_step
        );
    }
}

#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardt {
    pub config: LmConfig,
}

impl LevenbergMarquardt {
    pub fn new(config: LmConfig) -> Self {
        Self { config }
    }

    /// Column-major forward-difference Jacobian at `params`, given the
    /// residuals `base` there.
    fn jacobian(&self, f: &mut dyn ResidualFn, params: &[f64], base: &[f64], jacobian: &mut [f64], probe: &mut [f64]) {
        let m = base.len();
        let mut shifted = params.to_vec();
        for j in 0..params.len() {
            let h = self.config.jacobian_step * params[j].abs().max(1.0);
            shifted[j] = params[j] + h;
            f.residuals(&shifted, probe);
            shifted[j] = params[j];
            let column = &mut jacobian[j * m..(j + 1) * m];
            for ((c, &p), &b) in column.iter_mut().zip(probe.iter()).zip(base) {
                *c = (p - b) / h;
            }
        }
    }
}

/// `J^T J` and `-J^T r` for a column-major Jacobian. Only the upper
/// triangle is accumulated, then mirrored.
pub fn compute_hessian_gradient(jacobian: &[f64], residuals: &[f64], n: usize) -> (Vec<f64>, Vec<f64>) {
    let m = residuals.len();
    let mut hessian = vec![0.0; n * n];
    let mut gradient = vec![0.0; n];
    for i in 0..n {
        let ci = &jacobian[i * m..(i + 1) * m];
        gradient[i] = -ci.iter().zip(residuals).map(|(a, r)| a * r).sum::<f64>();
        for j in i..n {
            let cj = &jacobian[j * m..(j + 1) * m];
            hessian[i * n + j] = ci.iter().zip(cj).map(|(a, b)| a * b).sum();
        }
    }
    for i in 1..n {
        for j in 0..i {
            hessian[i * n + j] = hessian[j * n + i];
        }
    }
    (hessian, gradient)
}

fn sum_sq(r: &[f64]) -> f64 {
    r.iter().map(|v| v * v).sum()
}

impl Minimizer for LevenbergMarquardt {
    fn minimize(&self, f: &mut dyn ResidualFn, init: &[f64], max_iterations: usize) -> MinimizeOutcome {
        let n = init.len();
        let m = f.len();
        let mut params = init.to_vec();
        let mut residuals = vec![0.0; m];
        let mut trial = vec![0.0; m];
        let mut jacobian = vec![0.0; n * m];
        f.residuals(&params, &mut residuals);
        let mut chi2 = sum_sq(&residuals);

        if n == 0 {
            return MinimizeOutcome {
                params,
                covariance: Vec::new(),
                chi2,
                iterations: 0,
                converged: true,
            };
        }

        let mut lambda = self.config.initial_lambda;
        let mut converged = false;
        let mut iterations = 0;
        let mut stale_jacobian = true;
        let mut hessian = Vec::new();
        let mut gradient = Vec::new();

        for iter in 0..max_iterations {
            iterations = iter + 1;

            if stale_jacobian {
                self.jacobian(f, &params, &residuals, &mut jacobian, &mut trial);
                (hessian, gradient) = compute_hessian_gradient(&jacobian, &residuals, n);
                stale_jacobian = false;
            }

            let max_diag = (0..n).fold(0.0f64, |a, i| a.max(hessian[i * n + i]));
            let mut damped = hessian.clone();
            for i in 0..n {
                let d = &mut damped[i * n + i];
                // Parameters without leverage still get a finite step.
                *d = if *d > 0.0 { *d * (1.0 + lambda) } else { lambda * max_diag.max(1.0) };
            }

            let Some(delta) = solve(&damped, &gradient) else {
                break;
            };

            let new_params: Vec<f64> = params.iter().zip(&delta).map(|(p, d)| p + d).collect();
            f.residuals(&new_params, &mut trial);
            let new_chi2 = sum_sq(&trial);

            if new_chi2 < chi2 {
                params = new_params;
                std::mem::swap(&mut residuals, &mut trial);
                chi2 = new_chi2;
                lambda *= self.config.lambda_down;
                stale_jacobian = true;

                let max_delta = delta.iter().fold(0.0f64, |a, d| a.max(d.abs()));
                if max_delta < self.config.convergence_threshold {
                    converged = true;
                    break;
                }
            } else {
                lambda *= self.config.lambda_up;
                if lambda > 1e10 {
                    break;
                }
            }
        }

        // Leave the callback on the returned state.
        f.residuals(&params, &mut residuals);
        self.jacobian(f, &params, &residuals, &mut jacobian, &mut trial);
        let (hessian, _) = compute_hessian_gradient(&jacobian, &residuals, n);
        let covariance = invert_semidefinite(&hessian, n).unwrap_or_else(|| vec![0.0; n * n]);

        MinimizeOutcome {
            params,
            covariance,
            chi2,
            iterations,
            converged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// y = a * exp(-b * t) sampled without noise.
    struct Decay {
        t: Vec<f64>,
        y: Vec<f64>,
    }

    impl Decay {
        fn new(a: f64, b: f64) -> Self {
            let t: Vec<f64> = (0..40).map(|i| i as f64 * 0.1).collect();
            let y = t.iter().map(|t| a * (-b * t).exp()).collect();
            Self { t, y }
        }
    }

    impl ResidualFn for Decay {
        fn len(&self) -> usize {
            self.t.len()
        }

        fn residuals(&mut self, params: &[f64], out: &mut [f64]) {
            for ((o, t), y) in out.iter_mut().zip(&self.t).zip(&self.y) {
                *o = params[0] * (-params[1] * t).exp() - y;
            }
        }
    }

    #[test]
    fn test_recovers_exponential_decay() {
        let mut problem = Decay::new(3.0, 1.5);
        let lm = LevenbergMarquardt::default();

        let outcome = lm.minimize(&mut problem, &[1.0, 0.5], 200);

        assert!((outcome.params[0] - 3.0).abs() < 1e-4, "{:?}", outcome.params);
        assert!((outcome.params[1] - 1.5).abs() < 1e-4, "{:?}", outcome.params);
        assert!(outcome.chi2 < 1e-8);
        assert!(outcome.iterations > 0);
        assert_eq!(outcome.covariance.len(), 4);
        assert!(outcome.covariance[0] > 0.0 && outcome.covariance[3] > 0.0);
    }

    #[test]
    fn test_zero_iterations_keeps_start() {
        let mut problem = Decay::new(3.0, 1.5);
        let outcome = LevenbergMarquardt::default().minimize(&mut problem, &[1.0, 0.5], 0);
        assert_eq!(outcome.params, vec![1.0, 0.5]);
        assert_eq!(outcome.iterations, 0);
        assert!(!outcome.converged);
    }

    #[test]
    fn test_hessian_is_symmetric() {
        // Columns (1, 2) and (3, 4).
        let jacobian = [1.0, 2.0, 3.0, 4.0];
        let (h, g) = compute_hessian_gradient(&jacobian, &[1.0, -1.0], 2);
        assert_eq!(h, vec![5.0, 11.0, 11.0, 25.0]);
        assert_eq!(g, vec![1.0, 1.0]);
    }

    #[test]
    #[should_panic(expected = "lambda_down must be in (0, 1)")]
    fn test_invalid_lambda_down_rejected() {
        let config = LmConfig {
            lambda_down: 2.0,
            ..LmConfig::default()
        };
        config.validate();
    }
}
