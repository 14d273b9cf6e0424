//! Step-size control shared by the adaptive methods.

use crate::solvers::SolverStats;
use crate::traits::DynamicalSystem;
use nalgebra::DMatrix;
use thiserror::Error;

pub const SAFETY: f64 = 0.9;
pub const MIN_FACTOR: f64 = 0.2;
pub const MAX_FACTOR: f64 = 10.0;
pub const EPS: f64 = f64::EPSILON;

/// Tolerances and step limits handed to every stepper.
#[derive(Debug, Clone, Copy)]
pub struct StepControl {
    pub rtol: f64,
    pub atol: f64,
    pub max_step: f64,
    pub first_step: Option<f64>,
}

/// Why an adaptive stepper gave up.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepFailure {
    #[error("required step size is less than spacing between numbers at t={t}")]
    StepSizeTooSmall { t: f64 },
    #[error("non-finite values encountered at t={t}")]
    NonFinite { t: f64 },
    #[error("maximum number of steps ({limit}) exceeded at t={t}")]
    TooManySteps { t: f64, limit: usize },
}

impl StepFailure {
    pub fn time(&self) -> f64 {
        match self {
            StepFailure::StepSizeTooSmall { t }
            | StepFailure::NonFinite { t }
            | StepFailure::TooManySteps { t, .. } => *t,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            StepFailure::StepSizeTooSmall { .. } => "step size underflow",
            StepFailure::NonFinite { .. } => "non-finite values",
            StepFailure::TooManySteps { .. } => "step budget exhausted",
        }
    }
}

/// One adaptive method. A stepper owns its current `(t, y)` and advances it
/// by accepted steps.
pub trait Stepper {
    /// True when output samples are read from an interpolant instead of
    /// being landed on exactly.
    const INTERPOLATES: bool = false;

    fn t(&self) -> f64;

    fn y(&self) -> &[f64];

    /// Takes one accepted step that does not pass `t_bound`.
    fn step<S: DynamicalSystem>(&mut self, system: &S, t_bound: f64)
        -> Result<(), StepFailure>;

    /// State at `t` inside the last accepted step.
    fn interpolate(&self, _t: f64) -> Vec<f64> {
        self.y().to_vec()
    }

    fn stats(&self) -> SolverStats;
}

/// Root-mean-square norm.
pub fn rms_norm(x: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = x.fold((0.0, 0usize), |(s, c), v| (s + v * v, c + 1));
    if count == 0 {
        0.0
    } else {
        (sum / count as f64).sqrt()
    }
}

/// `rms(x / scale)`.
pub fn scaled_norm(x: &[f64], scale: &[f64]) -> f64 {
    rms_norm(x.iter().zip(scale).map(|(v, s)| v / s))
}

/// `atol + rtol * max(|y|, |y_new|)` elementwise.
pub fn error_scale(atol: f64, rtol: f64, y: &[f64], y_new: &[f64]) -> Vec<f64> {
    y.iter()
        .zip(y_new)
        .map(|(a, b)| atol + rtol * a.abs().max(b.abs()))
        .collect()
}

/// Distance from `t` to the next representable number above it.
pub fn spacing(t: f64) -> f64 {
    let a = t.abs();
    f64::from_bits(a.to_bits() + 1) - a
}

/// Smallest step allowed at `t`.
pub fn min_step(t: f64) -> f64 {
    10.0 * spacing(t)
}

pub fn all_finite(x: &[f64]) -> bool {
    x.iter().all(|v| v.is_finite())
}

/// Empirical initial step for a method whose error estimator has the given
/// order (Hairer, Nørsett & Wanner, II.4).
pub fn select_initial_step<S: DynamicalSystem>(
    system: &S,
    t0: f64,
    y0: &[f64],
    f0: &[f64],
    t_bound: f64,
    control: &StepControl,
    error_order: usize,
    stats: &mut SolverStats,
) -> f64 {
    let interval = (t_bound - t0).abs();
    if y0.is_empty() || interval == 0.0 {
        return interval;
    }
    let scale: Vec<f64> = y0
        .iter()
        .map(|v| control.atol + v.abs() * control.rtol)
        .collect();
    let d0 = scaled_norm(y0, &scale);
    let d1 = scaled_norm(f0, &scale);
    let h0 = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    };
    let h0 = h0.min(interval);

    let y1: Vec<f64> = y0.iter().zip(f0).map(|(y, f)| y + h0 * f).collect();
    let mut f1 = vec![0.0; y0.len()];
    system.apply(t0 + h0, &y1, &mut f1);
    stats.nfev += 1;
    let diff: Vec<f64> = f1.iter().zip(f0).map(|(a, b)| a - b).collect();
    let d2 = scaled_norm(&diff, &scale) / h0;

    let h1 = if d1 <= 1e-15 && d2 <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d1.max(d2)).powf(1.0 / (error_order as f64 + 1.0))
    };
    let h = (100.0 * h0).min(h1).min(interval).min(control.max_step);
    if h.is_finite() && h > 0.0 {
        h
    } else {
        h0
    }
}

/// Forward-difference Jacobian of `system` at `(t, y)` where `f = f(t, y)`.
pub fn numerical_jacobian<S: DynamicalSystem>(
    system: &S,
    t: f64,
    y: &[f64],
    f: &[f64],
    stats: &mut SolverStats,
) -> DMatrix<f64> {
    let n = y.len();
    let mut jac = DMatrix::zeros(n, n);
    let mut y_pert = y.to_vec();
    let mut f_pert = vec![0.0; n];
    for j in 0..n {
        let delta_raw = EPS.sqrt() * y[j].abs().max(1.0);
        y_pert[j] = y[j] + delta_raw;
        // Use the step that was actually representable.
        let delta = y_pert[j] - y[j];
        system.apply(t, &y_pert, &mut f_pert);
        for i in 0..n {
            jac[(i, j)] = (f_pert[i] - f[i]) / delta;
        }
        y_pert[j] = y[j];
    }
    stats.nfev += n;
    stats.njev += 1;
    jac
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Linear;

    impl DynamicalSystem for Linear {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = 2.0 * x[0] + x[1];
            out[1] = -3.0 * x[1];
        }
    }

    #[test]
    fn rms_norm_of_constant_vector() {
        assert_eq!(rms_norm([3.0, 3.0, 3.0, 3.0].into_iter()), 3.0);
        assert_eq!(rms_norm(std::iter::empty()), 0.0);
    }

    #[test]
    fn spacing_is_one_ulp() {
        assert_eq!(spacing(1.0), EPS);
        assert!(spacing(0.0) > 0.0);
        assert!(min_step(1e6) > min_step(1.0));
    }

    #[test]
    fn numerical_jacobian_of_linear_system() {
        let mut stats = SolverStats::default();
        let y = [1.0, 2.0];
        let mut f = [0.0; 2];
        Linear.apply(0.0, &y, &mut f);
        let jac = numerical_jacobian(&Linear, 0.0, &y, &f, &mut stats);
        assert!((jac[(0, 0)] - 2.0).abs() < 1e-6);
        assert!((jac[(0, 1)] - 1.0).abs() < 1e-6);
        assert!(jac[(1, 0)].abs() < 1e-6);
        assert!((jac[(1, 1)] + 3.0).abs() < 1e-6);
        assert_eq!(stats.nfev, 2);
        assert_eq!(stats.njev, 1);
    }

    #[test]
    fn initial_step_is_positive_and_bounded() {
        let control = StepControl {
            rtol: 1e-6,
            atol: 1e-9,
            max_step: f64::INFINITY,
            first_step: None,
        };
        let mut stats = SolverStats::default();
        let y0 = [1.0, 1.0];
        let mut f0 = [0.0; 2];
        Linear.apply(0.0, &y0, &mut f0);
        let h = select_initial_step(&Linear, 0.0, &y0, &f0, 10.0, &control, 4, &mut stats);
        assert!(h > 0.0 && h <= 10.0);
        assert_eq!(stats.nfev, 1);
    }
}
