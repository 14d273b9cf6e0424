//! Implicit Runge-Kutta of the Radau IIA family, order 5.
//!
//! The three collocation stages are solved together by a simplified Newton
//! iteration on the full `3n` system `(I - h A ⊗ J) ΔZ = -G(Z)`, where `J` is a
//! finite-difference Jacobian reused across steps while convergence stays
//! fast.

use super::common::{
    all_finite, min_step, numerical_jacobian, scaled_norm, select_initial_step, StepControl,
    StepFailure, Stepper, EPS, MAX_FACTOR, MIN_FACTOR,
};
use crate::solvers::SolverStats;
use crate::traits::DynamicalSystem;
use nalgebra::{DMatrix, DVector, LU};

type Lu = LU<f64, nalgebra::Dyn, nalgebra::Dyn>;

const NEWTON_MAXITER: usize = 6;

struct Coefficients {
    c: [f64; 3],
    a: [[f64; 3]; 3],
    e: [f64; 3],
    mu_real: f64,
}

fn coefficients() -> Coefficients {
    let s6 = 6f64.sqrt();
    Coefficients {
        c: [(4.0 - s6) / 10.0, (4.0 + s6) / 10.0, 1.0],
        a: [
            [
                (88.0 - 7.0 * s6) / 360.0,
                (296.0 - 169.0 * s6) / 1800.0,
                (-2.0 + 3.0 * s6) / 225.0,
            ],
            [
                (296.0 + 169.0 * s6) / 1800.0,
                (88.0 + 7.0 * s6) / 360.0,
                (-2.0 - 3.0 * s6) / 225.0,
            ],
            [(16.0 - s6) / 36.0, (16.0 + s6) / 36.0, 1.0 / 9.0],
        ],
        e: [
            (-13.0 - 7.0 * s6) / 3.0,
            (-13.0 + 7.0 * s6) / 3.0,
            -1.0 / 3.0,
        ],
        // Real eigenvalue of inv(A).
        mu_real: 3.0 + 3f64.powf(2.0 / 3.0) - 3f64.powf(1.0 / 3.0),
    }
}

struct Collocation {
    converged: bool,
    iterations: usize,
    z: Vec<f64>,
    rate: Option<f64>,
}

pub struct Radau {
    control: StepControl,
    coef: Coefficients,
    t: f64,
    y: Vec<f64>,
    f: Vec<f64>,
    h_abs: f64,
    h_abs_old: Option<f64>,
    error_norm_old: Option<f64>,
    newton_tol: f64,
    jac: DMatrix<f64>,
    current_jac: bool,
    /// Factorisations for the current step size, dropped when it changes.
    lu: Option<(Lu, Lu)>,
    stats: SolverStats,
}

impl Radau {
    pub fn new<S: DynamicalSystem>(
        system: &S,
        t0: f64,
        y0: &[f64],
        t_bound: f64,
        control: StepControl,
    ) -> Self {
        let mut stats = SolverStats::default();
        let mut f = vec![0.0; y0.len()];
        system.apply(t0, y0, &mut f);
        stats.nfev += 1;
        let h_abs = match control.first_step {
            Some(h) => h,
            None => select_initial_step(system, t0, y0, &f, t_bound, &control, 3, &mut stats),
        };
        let jac = numerical_jacobian(system, t0, y0, &f, &mut stats);
        let newton_tol = (10.0 * EPS / control.rtol).max(0.03f64.min(control.rtol.sqrt()));
        Self {
            control,
            coef: coefficients(),
            t: t0,
            y: y0.to_vec(),
            f,
            h_abs,
            h_abs_old: None,
            error_norm_old: None,
            newton_tol,
            jac,
            current_jac: true,
            lu: None,
            stats,
        }
    }

    fn factorize(&mut self, h: f64) -> (Lu, Lu) {
        let n = self.y.len();
        let mut full = DMatrix::identity(3 * n, 3 * n);
        for bi in 0..3 {
            for bj in 0..3 {
                let w = h * self.coef.a[bi][bj];
                for r in 0..n {
                    for c in 0..n {
                        full[(bi * n + r, bj * n + c)] -= w * self.jac[(r, c)];
                    }
                }
            }
        }
        let real = DMatrix::identity(n, n) * (self.coef.mu_real / h) - &self.jac;
        self.stats.nlu += 2;
        (full.lu(), real.lu())
    }

    fn solve_collocation<S: DynamicalSystem>(
        &mut self,
        system: &S,
        h: f64,
        full: &Lu,
        scale: &[f64],
    ) -> Collocation {
        let n = self.y.len();
        let mut z = vec![0.0; 3 * n];
        let mut stage = vec![0.0; n];
        let mut fz = vec![0.0; 3 * n];
        let mut dz_norm_old: Option<f64> = None;
        let mut rate = None;
        let mut converged = false;
        let mut iterations = 0;

        for k in 0..NEWTON_MAXITER {
            iterations = k + 1;
            for s in 0..3 {
                for i in 0..n {
                    stage[i] = self.y[i] + z[s * n + i];
                }
                system.apply(self.t + self.coef.c[s] * h, &stage, &mut fz[s * n..(s + 1) * n]);
            }
            self.stats.nfev += 3;
            if !all_finite(&fz) {
                break;
            }

            // -G(Z) = h (A ⊗ I) F(Z) - Z
            let rhs = DVector::from_fn(3 * n, |row, _| {
                let (bi, i) = (row / n, row % n);
                let hf: f64 = (0..3).map(|bj| self.coef.a[bi][bj] * fz[bj * n + i]).sum();
                h * hf - z[row]
            });
            let Some(dz) = full.solve(&rhs) else {
                break;
            };
            let dz_norm = rms_norm_blocks(dz.as_slice(), scale);
            rate = dz_norm_old.map(|old| dz_norm / old);
            if let Some(r) = rate {
                if r >= 1.0 || r.powi((NEWTON_MAXITER - k) as i32) / (1.0 - r) * dz_norm > self.newton_tol {
                    break;
                }
            }
            for (zi, di) in z.iter_mut().zip(dz.iter()) {
                *zi += di;
            }
            if dz_norm == 0.0 || rate.is_some_and(|r| r / (1.0 - r) * dz_norm < self.newton_tol) {
                converged = true;
                break;
            }
            dz_norm_old = Some(dz_norm);
        }

        Collocation {
            converged,
            iterations,
            z,
            rate,
        }
    }

    fn predict_factor(&self, h_abs: f64, error_norm: f64) -> f64 {
        let multiplier = match (self.error_norm_old, self.h_abs_old) {
            (Some(err_old), Some(h_old)) if error_norm != 0.0 => {
                h_abs / h_old * (err_old / error_norm).powf(0.25)
            }
            _ => 1.0,
        };
        multiplier.min(1.0) * error_norm.powf(-0.25)
    }
}

/// RMS norm of a stacked `3n` vector, each block scaled by `scale`.
fn rms_norm_blocks(x: &[f64], scale: &[f64]) -> f64 {
    let n = scale.len();
    if n == 0 {
        return 0.0;
    }
    let repeated: Vec<f64> = (0..x.len()).map(|i| scale[i % n]).collect();
    scaled_norm(x, &repeated)
}

impl Stepper for Radau {
    fn t(&self) -> f64 {
        self.t
    }

    fn y(&self) -> &[f64] {
        &self.y
    }

    fn step<S: DynamicalSystem>(&mut self, system: &S, t_bound: f64) -> Result<(), StepFailure> {
        let n = self.y.len();
        let min_step = min_step(self.t);
        let mut h_abs = self.h_abs.clamp(min_step, self.control.max_step.max(min_step));
        if h_abs != self.h_abs {
            self.lu = None;
        }
        let mut rejected = false;

        let (t_new, y_new, error_norm, safety, collocation) = loop {
            if h_abs < min_step {
                return Err(StepFailure::StepSizeTooSmall { t: self.t });
            }
            let mut t_new = self.t + h_abs;
            if t_new > t_bound {
                t_new = t_bound;
                self.lu = None;
            }
            let h = t_new - self.t;
            h_abs = h.abs();

            let scale: Vec<f64> = self
                .y
                .iter()
                .map(|v| self.control.atol + v.abs() * self.control.rtol)
                .collect();

            let mut collocation;
            loop {
                let (full, real) = match self.lu.take() {
                    Some(pair) => pair,
                    None => self.factorize(h),
                };
                collocation = self.solve_collocation(system, h, &full, &scale);
                self.lu = Some((full, real));
                if collocation.converged || self.current_jac {
                    break;
                }
                self.jac = numerical_jacobian(system, self.t, &self.y, &self.f, &mut self.stats);
                self.current_jac = true;
                self.lu = None;
            }

            if !collocation.converged {
                h_abs *= 0.5;
                self.lu = None;
                self.stats.rejected_steps += 1;
                continue;
            }

            let z = &collocation.z;
            let y_new: Vec<f64> = (0..n).map(|i| self.y[i] + z[2 * n + i]).collect();
            if !all_finite(&y_new) {
                h_abs *= 0.5;
                self.lu = None;
                self.stats.rejected_steps += 1;
                continue;
            }
            let ze: Vec<f64> = (0..n)
                .map(|i| (0..3).map(|s| self.coef.e[s] * z[s * n + i]).sum::<f64>() / h)
                .collect();
            let Some((_, real)) = self.lu.as_ref() else {
                continue;
            };
            let rhs = DVector::from_fn(n, |i, _| self.f[i] + ze[i]);
            let mut error = real.solve(&rhs).map(|v| v.as_slice().to_vec());

            let scale: Vec<f64> = self
                .y
                .iter()
                .zip(&y_new)
                .map(|(a, b)| self.control.atol + a.abs().max(b.abs()) * self.control.rtol)
                .collect();
            let mut error_norm = error
                .as_deref()
                .map_or(f64::INFINITY, |e| scaled_norm(e, &scale));
            let safety = 0.9 * (2 * NEWTON_MAXITER + 1) as f64
                / (2 * NEWTON_MAXITER + collocation.iterations) as f64;

            if rejected && error_norm > 1.0 {
                if let Some(e) = error.as_deref() {
                    let shifted: Vec<f64> = self.y.iter().zip(e).map(|(y, e)| y + e).collect();
                    let mut f_shift = vec![0.0; n];
                    system.apply(self.t, &shifted, &mut f_shift);
                    self.stats.nfev += 1;
                    let rhs = DVector::from_fn(n, |i, _| f_shift[i] + ze[i]);
                    error = real.solve(&rhs).map(|v| v.as_slice().to_vec());
                    error_norm = error
                        .as_deref()
                        .map_or(f64::INFINITY, |e| scaled_norm(e, &scale));
                }
            }

            if !error_norm.is_finite() || error_norm > 1.0 {
                let factor = if error_norm.is_finite() {
                    self.predict_factor(h_abs, error_norm)
                } else {
                    0.0
                };
                h_abs *= MIN_FACTOR.max(safety * factor);
                self.lu = None;
                rejected = true;
                self.stats.rejected_steps += 1;
                continue;
            }

            break (t_new, y_new, error_norm, safety, collocation);
        };

        let recompute_jac = collocation.iterations > 2 && collocation.rate.is_some_and(|r| r > 1e-3);
        let mut factor = MAX_FACTOR.min(safety * self.predict_factor(h_abs, error_norm));
        if !recompute_jac && factor < 1.2 {
            factor = 1.0;
        } else {
            self.lu = None;
        }

        let mut f_new = vec![0.0; n];
        system.apply(t_new, &y_new, &mut f_new);
        self.stats.nfev += 1;

        if recompute_jac {
            self.jac = numerical_jacobian(system, t_new, &y_new, &f_new, &mut self.stats);
            self.current_jac = true;
        } else {
            self.current_jac = false;
        }

        self.h_abs_old = Some(h_abs);
        self.error_norm_old = Some(error_norm);
        self.h_abs = h_abs * factor;
        self.t = t_new;
        self.y = y_new;
        self.f = f_new;
        self.stats.accepted_steps += 1;
        Ok(())
    }

    fn stats(&self) -> SolverStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Robertson-like stiff linear pair with eigenvalues -1 and -1000.
    struct StiffLinear;

    impl DynamicalSystem for StiffLinear {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = -x[0];
            out[1] = -1000.0 * (x[1] - x[0]);
        }
    }

    #[test]
    fn collocation_coefficients_are_consistent() {
        let coef = coefficients();
        for (row, c) in coef.a.iter().zip(coef.c) {
            assert!((row.iter().sum::<f64>() - c).abs() < 1e-14);
        }
        // Last row carries the quadrature weights.
        assert!((coef.a[2].iter().sum::<f64>() - 1.0).abs() < 1e-14);
    }

    #[test]
    fn integrates_stiff_system_in_few_steps() {
        let control = StepControl {
            rtol: 1e-6,
            atol: 1e-9,
            max_step: f64::INFINITY,
            first_step: None,
        };
        let mut stepper = Radau::new(&StiffLinear, 0.0, &[1.0, 0.0], 10.0, control);
        while stepper.t() < 10.0 {
            stepper.step(&StiffLinear, 10.0).expect("step");
        }
        let expected = (-10.0f64).exp();
        assert!((stepper.y()[0] - expected).abs() < 1e-7);
        // An explicit method would need thousands of steps here.
        assert!(stepper.stats().accepted_steps < 500);
    }
}
