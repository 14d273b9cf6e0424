//! Variable-order (1 to 5) backward differentiation in the
//! numerical-differentiation-formula variant, with quasi-constant step size
//! kept as a modified divided-difference array.

use super::common::{
    all_finite, min_step, numerical_jacobian, scaled_norm, select_initial_step, StepControl,
    StepFailure, Stepper, EPS, MAX_FACTOR, MIN_FACTOR,
};
use crate::solvers::SolverStats;
use crate::traits::DynamicalSystem;
use nalgebra::{DMatrix, DVector, LU};

type Lu = LU<f64, nalgebra::Dyn, nalgebra::Dyn>;

const MAX_ORDER: usize = 5;
const NEWTON_MAXITER: usize = 4;
const KAPPA: [f64; MAX_ORDER + 1] = [0.0, -0.1850, -1.0 / 9.0, -0.0823, -0.0415, 0.0];

/// Transformation matrix that rescales the difference array for a step-size
/// change by `factor`.
fn compute_r(order: usize, factor: f64) -> DMatrix<f64> {
    let mut m = DMatrix::zeros(order + 1, order + 1);
    for j in 0..=order {
        m[(0, j)] = 1.0;
    }
    for i in 1..=order {
        for j in 1..=order {
            m[(i, j)] = (i as f64 - 1.0 - factor * j as f64) / i as f64;
        }
    }
    // Cumulative product down each column.
    for i in 1..=order {
        for j in 0..=order {
            m[(i, j)] *= m[(i - 1, j)];
        }
    }
    m
}

/// Rescales `d[..=order]` in place for a step-size change by `factor`.
fn change_d(d: &mut [Vec<f64>], order: usize, factor: f64) {
    let r = compute_r(order, factor);
    let u = compute_r(order, 1.0);
    let ru = r * u;
    let n = d[0].len();
    let mut updated = vec![vec![0.0; n]; order + 1];
    for (i, row) in updated.iter_mut().enumerate() {
        for (k, dk) in d.iter().take(order + 1).enumerate() {
            let w = ru[(k, i)];
            if w != 0.0 {
                for (r, v) in row.iter_mut().zip(dk) {
                    *r += w * v;
                }
            }
        }
    }
    for (i, row) in updated.into_iter().enumerate() {
        d[i] = row;
    }
}

struct NewtonResult {
    converged: bool,
    iterations: usize,
    y: Vec<f64>,
    d: Vec<f64>,
}

pub struct Bdf {
    control: StepControl,
    t: f64,
    y: Vec<f64>,
    h_abs: f64,
    newton_tol: f64,
    gamma: [f64; MAX_ORDER + 1],
    alpha: [f64; MAX_ORDER + 1],
    error_const: [f64; MAX_ORDER + 1],
    /// Modified divided differences, `MAX_ORDER + 3` rows.
    d: Vec<Vec<f64>>,
    order: usize,
    n_equal_steps: usize,
    jac: DMatrix<f64>,
    lu: Option<Lu>,
    stats: SolverStats,
}

impl Bdf {
    pub fn new<S: DynamicalSystem>(
        system: &S,
        t0: f64,
        y0: &[f64],
        t_bound: f64,
        control: StepControl,
    ) -> Self {
        let n = y0.len();
        let mut stats = SolverStats::default();
        let mut f = vec![0.0; n];
        system.apply(t0, y0, &mut f);
        stats.nfev += 1;
        let h_abs = match control.first_step {
            Some(h) => h,
            None => select_initial_step(system, t0, y0, &f, t_bound, &control, 1, &mut stats),
        };
        let jac = numerical_jacobian(system, t0, y0, &f, &mut stats);

        let mut gamma = [0.0; MAX_ORDER + 1];
        for k in 1..=MAX_ORDER {
            gamma[k] = gamma[k - 1] + 1.0 / k as f64;
        }
        let mut alpha = [0.0; MAX_ORDER + 1];
        let mut error_const = [0.0; MAX_ORDER + 1];
        for k in 0..=MAX_ORDER {
            alpha[k] = (1.0 - KAPPA[k]) * gamma[k];
            error_const[k] = KAPPA[k] * gamma[k] + 1.0 / (k as f64 + 1.0);
        }

        let mut d = vec![vec![0.0; n]; MAX_ORDER + 3];
        d[0] = y0.to_vec();
        d[1] = f.iter().map(|v| v * h_abs).collect();

        Self {
            control,
            t: t0,
            y: y0.to_vec(),
            h_abs,
            newton_tol: (10.0 * EPS / control.rtol).max(0.03f64.min(control.rtol.sqrt())),
            gamma,
            alpha,
            error_const,
            d,
            order: 1,
            n_equal_steps: 0,
            jac,
            lu: None,
            stats,
        }
    }

    fn factorize(&mut self, c: f64) -> Lu {
        let n = self.y.len();
        self.stats.nlu += 1;
        (DMatrix::identity(n, n) - &self.jac * c).lu()
    }

    #[allow(clippy::too_many_arguments)]
    fn solve_system<S: DynamicalSystem>(
        &mut self,
        system: &S,
        t_new: f64,
        y_predict: &[f64],
        c: f64,
        psi: &[f64],
        lu: &Lu,
        scale: &[f64],
    ) -> NewtonResult {
        let n = y_predict.len();
        let mut y = y_predict.to_vec();
        let mut d = vec![0.0; n];
        let mut f = vec![0.0; n];
        let mut dy_norm_old: Option<f64> = None;
        let mut converged = false;
        let mut iterations = 0;

        for k in 0..NEWTON_MAXITER {
            iterations = k + 1;
            system.apply(t_new, &y, &mut f);
            self.stats.nfev += 1;
            if !all_finite(&f) {
                break;
            }
            let rhs = DVector::from_fn(n, |i, _| c * f[i] - psi[i] - d[i]);
            let Some(dy) = lu.solve(&rhs) else {
                break;
            };
            let dy_norm = scaled_norm(dy.as_slice(), scale);
            let rate = dy_norm_old.map(|old| dy_norm / old);
            if let Some(r) = rate {
                if r >= 1.0 || r.powi((NEWTON_MAXITER - k) as i32) / (1.0 - r) * dy_norm > self.newton_tol {
                    break;
                }
            }
            for i in 0..n {
                y[i] += dy[i];
                d[i] += dy[i];
            }
            if dy_norm == 0.0 || rate.is_some_and(|r| r / (1.0 - r) * dy_norm < self.newton_tol) {
                converged = true;
                break;
            }
            dy_norm_old = Some(dy_norm);
        }

        NewtonResult {
            converged,
            iterations,
            y,
            d,
        }
    }

    fn predict(&self) -> Vec<f64> {
        let n = self.y.len();
        (0..n)
            .map(|i| self.d[..=self.order].iter().map(|row| row[i]).sum())
            .collect()
    }

    fn rescale(&mut self, factor: f64) {
        change_d(&mut self.d, self.order, factor);
        self.n_equal_steps = 0;
    }
}

impl Stepper for Bdf {
    const INTERPOLATES: bool = true;

    fn t(&self) -> f64 {
        self.t
    }

    fn y(&self) -> &[f64] {
        &self.y
    }

    fn step<S: DynamicalSystem>(&mut self, system: &S, t_bound: f64) -> Result<(), StepFailure> {
        let n = self.y.len();
        let t = self.t;
        let min_step = min_step(t);
        let max_step = self.control.max_step;
        let mut h_abs = if self.h_abs > max_step {
            self.rescale(max_step / self.h_abs);
            self.lu = None;
            max_step
        } else if self.h_abs < min_step {
            self.rescale(min_step / self.h_abs);
            self.lu = None;
            min_step
        } else {
            self.h_abs
        };

        let order = self.order;
        let mut current_jac = false;

        let (t_new, result, error_norm, safety, scale) = loop {
            if h_abs < min_step {
                return Err(StepFailure::StepSizeTooSmall { t });
            }
            let mut t_new = t + h_abs;
            if t_new > t_bound {
                t_new = t_bound;
                self.rescale((t_new - t).abs() / h_abs);
                self.lu = None;
            }
            let h = t_new - t;
            h_abs = h.abs();

            let y_predict = self.predict();
            let scale: Vec<f64> = y_predict
                .iter()
                .map(|v| self.control.atol + self.control.rtol * v.abs())
                .collect();
            let psi: Vec<f64> = (0..n)
                .map(|i| {
                    (1..=order)
                        .map(|j| self.d[j][i] * self.gamma[j])
                        .sum::<f64>()
                        / self.alpha[order]
                })
                .collect();
            let c = h / self.alpha[order];

            let mut result;
            loop {
                let lu = match self.lu.take() {
                    Some(lu) => lu,
                    None => self.factorize(c),
                };
                result = self.solve_system(system, t_new, &y_predict, c, &psi, &lu, &scale);
                self.lu = Some(lu);
                if result.converged || current_jac {
                    break;
                }
                let mut f = vec![0.0; n];
                system.apply(t_new, &y_predict, &mut f);
                self.stats.nfev += 1;
                self.jac = numerical_jacobian(system, t_new, &y_predict, &f, &mut self.stats);
                self.lu = None;
                current_jac = true;
            }

            if !result.converged || !all_finite(&result.y) {
                h_abs *= 0.5;
                self.rescale(0.5);
                self.lu = None;
                self.stats.rejected_steps += 1;
                continue;
            }

            let safety = 0.9 * (2 * NEWTON_MAXITER + 1) as f64
                / (2 * NEWTON_MAXITER + result.iterations) as f64;
            let scale: Vec<f64> = result
                .y
                .iter()
                .map(|v| self.control.atol + self.control.rtol * v.abs())
                .collect();
            let error: Vec<f64> = result.d.iter().map(|v| self.error_const[order] * v).collect();
            let error_norm = scaled_norm(&error, &scale);

            if !error_norm.is_finite() || error_norm > 1.0 {
                let factor = if error_norm.is_finite() {
                    MIN_FACTOR.max(safety * error_norm.powf(-1.0 / (order as f64 + 1.0)))
                } else {
                    MIN_FACTOR
                };
                h_abs *= factor;
                self.rescale(factor);
                self.stats.rejected_steps += 1;
                continue;
            }
            break (t_new, result, error_norm, safety, scale);
        };

        self.n_equal_steps += 1;
        self.t = t_new;
        self.h_abs = h_abs;
        self.stats.accepted_steps += 1;

        // D^{j+1} y_n = D^j y_n - D^j y_{n-1}, differences taken on predictions.
        let d_vec = result.d;
        self.d[order + 2] = d_vec
            .iter()
            .zip(&self.d[order + 1])
            .map(|(a, b)| a - b)
            .collect();
        self.d[order + 1] = d_vec;
        for i in (0..=order).rev() {
            let (head, tail) = self.d.split_at_mut(i + 1);
            for (a, b) in head[i].iter_mut().zip(&tail[0]) {
                *a += b;
            }
        }
        self.y = result.y;

        if self.n_equal_steps < order + 1 {
            return Ok(());
        }

        let error_m_norm = if order > 1 {
            let e: Vec<f64> = self.d[order].iter().map(|v| self.error_const[order - 1] * v).collect();
            scaled_norm(&e, &scale)
        } else {
            f64::INFINITY
        };
        let error_p_norm = if order < MAX_ORDER {
            let e: Vec<f64> = self.d[order + 2]
                .iter()
                .map(|v| self.error_const[order + 1] * v)
                .collect();
            scaled_norm(&e, &scale)
        } else {
            f64::INFINITY
        };

        let norms = [error_m_norm, error_norm, error_p_norm];
        let factors: Vec<f64> = norms
            .iter()
            .enumerate()
            .map(|(k, e)| e.powf(-1.0 / (order + k) as f64))
            .collect();
        let (best, best_factor) = factors
            .iter()
            .copied()
            .enumerate()
            .fold((0, factors[0]), |acc, (k, f)| if f > acc.1 { (k, f) } else { acc });
        let new_order = (order + best).saturating_sub(1).clamp(1, MAX_ORDER);
        self.order = new_order;

        let factor = MAX_FACTOR.min(safety * best_factor);
        self.h_abs *= factor;
        self.rescale(factor);
        self.lu = None;
        Ok(())
    }

    /// Evaluates the interpolating polynomial through the stored differences.
    fn interpolate(&self, t: f64) -> Vec<f64> {
        let h = self.h_abs;
        let mut y = self.d[0].clone();
        let mut p = 1.0;
        for m in 0..self.order {
            let t_shift = self.t - h * m as f64;
            let denom = h * (m as f64 + 1.0);
            p *= (t - t_shift) / denom;
            for (yi, di) in y.iter_mut().zip(&self.d[m + 1]) {
                *yi += di * p;
            }
        }
        y
    }

    fn stats(&self) -> SolverStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Decay;

    impl DynamicalSystem for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = -x[0];
        }
    }

    #[test]
    fn coefficient_tables_match_ndf_definitions() {
        let stepper = Bdf::new(
            &Decay,
            0.0,
            &[1.0],
            1.0,
            StepControl {
                rtol: 1e-6,
                atol: 1e-9,
                max_step: f64::INFINITY,
                first_step: None,
            },
        );
        assert_eq!(stepper.gamma[1], 1.0);
        assert!((stepper.gamma[2] - 1.5).abs() < 1e-15);
        assert!((stepper.alpha[1] - 1.185).abs() < 1e-12);
        assert!((stepper.error_const[1] - (-0.185 + 0.5)).abs() < 1e-12);
        assert_eq!(stepper.order, 1);
    }

    #[test]
    fn compute_r_with_unit_factor_is_an_involution() {
        // U = R(order, 1) satisfies U * U = I.
        for order in 1..=MAX_ORDER {
            let u = compute_r(order, 1.0);
            let uu = &u * &u;
            let identity = DMatrix::<f64>::identity(order + 1, order + 1);
            assert!((uu - identity).abs().max() < 1e-12, "order {order}");
        }
    }

    #[test]
    fn interpolant_matches_current_state() {
        let control = StepControl {
            rtol: 1e-8,
            atol: 1e-10,
            max_step: f64::INFINITY,
            first_step: None,
        };
        let mut stepper = Bdf::new(&Decay, 0.0, &[1.0], 2.0, control);
        while stepper.t() < 2.0 {
            stepper.step(&Decay, 2.0).expect("step");
            let at_t = stepper.interpolate(stepper.t());
            assert!((at_t[0] - stepper.y()[0]).abs() < 1e-12);
        }
        assert!((stepper.y()[0] - (-2.0f64).exp()).abs() < 1e-6);
    }
}
