use super::events::detect_on_grid;
use super::{
    check_options, resolve_grid, validate_problem, BatchSolution, Solution, Solver, SolverStats,
};
use crate::error::{Result, SolverError};
use crate::options::{Backend, IntegratorOptions};
use crate::traits::{BoundField, DynamicalSystem, EventFunction, Params, Steppable, VectorField};
use rayon::prelude::*;
use tracing::debug;

const METHOD: &str = "RK4";

/// Classic Runge-Kutta 4th Order Solver
pub struct RK4 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    tmp: Vec<f64>,
}

impl RK4 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }
}

impl Steppable for RK4 {
    fn step(&mut self, system: &impl DynamicalSystem, t: &mut f64, state: &mut [f64], dt: f64) {
        let t0 = *t;

        // k1 = f(t, y)
        system.apply(t0, state, &mut self.k1);

        // k2 = f(t + dt/2, y + dt*k1/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + 0.5 * dt * self.k1[i];
        }
        system.apply(t0 + 0.5 * dt, &self.tmp, &mut self.k2);

        // k3 = f(t + dt/2, y + dt*k2/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + 0.5 * dt * self.k2[i];
        }
        system.apply(t0 + 0.5 * dt, &self.tmp, &mut self.k3);

        // k4 = f(t + dt, y + dt*k3)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        system.apply(t0 + dt, &self.tmp, &mut self.k4);

        // y_next = y + dt/6 * (k1 + 2k2 + 2k3 + k4)
        for i in 0..state.len() {
            state[i] += dt / 6.0 * (self.k1[i] + 2.0 * self.k2[i] + 2.0 * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
    }
}

/// RK4 marched along the output grid: one step per grid interval, so the
/// grid density alone sets the accuracy.
#[derive(Debug, Clone)]
pub struct FixedStepSolver {
    options: IntegratorOptions,
}

impl Default for FixedStepSolver {
    fn default() -> Self {
        Self::new(IntegratorOptions::default().with_backend(Backend::FixedStep))
    }
}

impl FixedStepSolver {
    pub fn new(options: IntegratorOptions) -> Self {
        Self { options }
    }

    fn integrate(
        &self,
        field: &dyn VectorField,
        t0: f64,
        y0: &[f64],
        params: &Params,
        grid: &[f64],
    ) -> Result<(Vec<Vec<f64>>, SolverStats)> {
        let system = BoundField::new(field, params);
        let mut stepper = RK4::new(y0.len());
        let mut stats = SolverStats::default();
        let mut t = t0;
        let mut state = y0.to_vec();
        let mut states = Vec::with_capacity(grid.len());

        for (index, &target) in grid.iter().enumerate() {
            let dt = target - t;
            if dt > 0.0 {
                stepper.step(&system, &mut t, &mut state, dt);
                stats.nfev += 4;
                stats.accepted_steps += 1;
            }
            // Land exactly on the sample time.
            t = target;
            if state.iter().any(|v| !v.is_finite()) {
                return Err(SolverError::new(
                    "fixed_step",
                    METHOD,
                    format!("integration diverged: non-finite state at t={t}"),
                )
                .with_detail("reason", "non-finite state")
                .with_detail("time", t)
                .with_detail("sample", index)
                .into());
            }
            states.push(state.clone());
        }
        Ok((states, stats))
    }
}

impl Solver for FixedStepSolver {
    fn name(&self) -> &'static str {
        "fixed_step"
    }

    fn options(&self) -> &IntegratorOptions {
        &self.options
    }

    fn solve(
        &self,
        field: &dyn VectorField,
        span: (f64, f64),
        y0: &[f64],
        params: &Params,
        t_eval: Option<&[f64]>,
        events: &[&dyn EventFunction],
    ) -> Result<Solution> {
        check_options(self.name(), METHOD, &self.options)?;
        validate_problem(field.dimension(), span, std::slice::from_ref(&y0), t_eval)?;
        let times = resolve_grid(span, t_eval);
        let (states, stats) = self.integrate(field, span.0, y0, params, &times)?;
        let events = detect_on_grid(events, &times, &states);
        debug!(
            backend = self.name(),
            samples = times.len(),
            steps = stats.accepted_steps,
            "fixed-step solve finished"
        );
        Ok(Solution {
            times,
            states,
            events,
            stats,
        })
    }

    fn solve_batch(
        &self,
        field: &dyn VectorField,
        span: (f64, f64),
        y0_batch: &[Vec<f64>],
        params: &Params,
        t_eval: Option<&[f64]>,
        events: &[&dyn EventFunction],
    ) -> Result<BatchSolution> {
        check_options(self.name(), METHOD, &self.options)?;
        validate_problem(field.dimension(), span, y0_batch, t_eval)?;
        let times = resolve_grid(span, t_eval);

        // Rows are independent; collect() keeps row order.
        let rows = y0_batch
            .par_iter()
            .map(|y0| {
                let (states, stats) = self.integrate(field, span.0, y0, params, &times)?;
                let log = detect_on_grid(events, &times, &states);
                Ok(Solution {
                    times: Vec::new(),
                    states,
                    events: log,
                    stats,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            backend = self.name(),
            rows = rows.len(),
            samples = times.len(),
            "fixed-step batch finished"
        );
        Ok(BatchSolution::from_rows(times, rows))
    }
}
