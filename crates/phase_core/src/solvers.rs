//! Integration backends behind a common [`Solver`] contract.

pub mod adaptive;
pub mod events;
pub mod fixed_step;

pub use adaptive::AdaptiveSolver;
pub use events::EventLog;
pub use fixed_step::{FixedStepSolver, RK4};

use crate::error::{Error, InputError, Result, SolverError};
use crate::options::{Backend, IntegratorOptions};
use crate::traits::{EventFunction, Params, VectorField};
use serde::{Deserialize, Serialize};

/// Number of output samples used when no time grid is supplied.
pub const DEFAULT_SAMPLES: usize = 201;

/// Work counters for one trajectory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverStats {
    pub nfev: usize,
    pub njev: usize,
    pub nlu: usize,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
}

/// One integrated trajectory sampled at `times`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub times: Vec<f64>,
    /// `states[i]` is the state at `times[i]`.
    pub states: Vec<Vec<f64>>,
    pub events: EventLog,
    pub stats: SolverStats,
}

/// Trajectories for a batch of initial conditions sharing one time grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSolution {
    pub times: Vec<f64>,
    /// Indexed as `[initial condition][sample][dimension]`.
    pub trajectories: Vec<Vec<Vec<f64>>>,
    pub events: Vec<EventLog>,
    pub stats: Vec<SolverStats>,
}

impl BatchSolution {
    /// Stacks per-row solutions; row order is preserved.
    pub fn from_rows(times: Vec<f64>, rows: Vec<Solution>) -> Self {
        let mut trajectories = Vec::with_capacity(rows.len());
        let mut events = Vec::with_capacity(rows.len());
        let mut stats = Vec::with_capacity(rows.len());
        for row in rows {
            trajectories.push(row.states);
            events.push(row.events);
            stats.push(row.stats);
        }
        Self {
            times,
            trajectories,
            events,
            stats,
        }
    }
}

pub trait Solver: Sync {
    /// Backend name as reported in error details.
    fn name(&self) -> &'static str;

    fn options(&self) -> &IntegratorOptions;

    /// Integrates one initial condition over `span`, sampled at `t_eval`
    /// (201 evenly spaced points when omitted).
    fn solve(
        &self,
        field: &dyn VectorField,
        span: (f64, f64),
        y0: &[f64],
        params: &Params,
        t_eval: Option<&[f64]>,
        events: &[&dyn EventFunction],
    ) -> Result<Solution>;

    /// Integrates every row of `y0_batch`. Row i of the result corresponds
    /// to `y0_batch[i]`. The whole batch is validated before any row runs.
    fn solve_batch(
        &self,
        field: &dyn VectorField,
        span: (f64, f64),
        y0_batch: &[Vec<f64>],
        params: &Params,
        t_eval: Option<&[f64]>,
        events: &[&dyn EventFunction],
    ) -> Result<BatchSolution> {
        let options = self.options();
        check_options(self.name(), options.method.name(), options)?;
        validate_problem(field.dimension(), span, y0_batch, t_eval)?;
        let times = resolve_grid(span, t_eval);
        let rows = y0_batch
            .iter()
            .map(|y0| self.solve(field, span, y0, params, Some(times.as_slice()), events))
            .collect::<Result<Vec<_>>>()?;
        Ok(BatchSolution::from_rows(times, rows))
    }
}

/// `n` evenly spaced points from `start` to `end` inclusive.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            let mut points: Vec<f64> = (0..n).map(|i| start + step * i as f64).collect();
            points[n - 1] = end;
            points
        }
    }
}

pub fn default_time_grid(t0: f64, tf: f64) -> Vec<f64> {
    linspace(t0, tf, DEFAULT_SAMPLES)
}

pub(crate) fn resolve_grid(span: (f64, f64), t_eval: Option<&[f64]>) -> Vec<f64> {
    match t_eval {
        Some(grid) => grid.to_vec(),
        None => default_time_grid(span.0, span.1),
    }
}

/// Checks shapes and the time grid before any integration starts.
pub fn validate_problem<Y: AsRef<[f64]>>(
    dimension: usize,
    span: (f64, f64),
    y0_batch: &[Y],
    t_eval: Option<&[f64]>,
) -> std::result::Result<(), InputError> {
    let (t0, tf) = span;
    if !(t0.is_finite() && tf.is_finite() && t0 < tf) {
        return Err(InputError::InvalidSpan { t0, tf });
    }
    if y0_batch.is_empty() {
        return Err(InputError::EmptyBatch);
    }
    for row in y0_batch {
        let found = row.as_ref().len();
        if found != dimension {
            return Err(InputError::DimensionMismatch {
                expected: dimension,
                found,
            });
        }
    }
    if let Some(grid) = t_eval {
        validate_grid(grid, span)?;
    }
    Ok(())
}

fn validate_grid(grid: &[f64], (t0, tf): (f64, f64)) -> std::result::Result<(), InputError> {
    if grid.is_empty() {
        return Err(InputError::EmptyGrid);
    }
    for (index, &value) in grid.iter().enumerate() {
        if !(value >= t0 && value <= tf) {
            return Err(InputError::GridOutsideSpan {
                index,
                value,
                t0,
                tf,
            });
        }
        if index > 0 && value <= grid[index - 1] {
            return Err(InputError::NonIncreasingGrid { index });
        }
    }
    Ok(())
}

/// Rejects invalid options that reach a backend without going through
/// [`build_solver`].
pub(crate) fn check_options(backend: &str, method: &str, options: &IntegratorOptions) -> Result<()> {
    options.validate().map_err(|err| {
        Error::from(
            SolverError::new(backend, method, format!("invalid configuration: {err}"))
                .with_detail("reason", "invalid configuration"),
        )
    })
}

/// Builds the backend selected by `options.backend`.
pub fn build_solver(options: IntegratorOptions) -> Result<Box<dyn Solver>> {
    options.validate()?;
    let solver: Box<dyn Solver> = match options.backend {
        Backend::Adaptive => Box::new(AdaptiveSolver::new(options)),
        Backend::FixedStep => Box::new(FixedStepSolver::new(options)),
    };
    Ok(solver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linspace_includes_both_endpoints() {
        let grid = linspace(0.0, 2.0, 5);
        assert_eq!(grid, vec![0.0, 0.5, 1.0, 1.5, 2.0]);
        assert_eq!(linspace(1.0, 3.0, 1), vec![1.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }

    #[test]
    fn default_grid_has_201_samples() {
        let grid = default_time_grid(0.0, 10.0);
        assert_eq!(grid.len(), DEFAULT_SAMPLES);
        assert_eq!(grid[0], 0.0);
        assert_eq!(grid[200], 10.0);
        assert!((grid[1] - 0.05).abs() < 1e-15);
    }

    #[test]
    fn validate_problem_checks_span_and_shapes() {
        let batch = vec![vec![1.0, 2.0]];
        assert_eq!(
            validate_problem(2, (1.0, 1.0), &batch, None),
            Err(InputError::InvalidSpan { t0: 1.0, tf: 1.0 })
        );
        assert_eq!(
            validate_problem(3, (0.0, 1.0), &batch, None),
            Err(InputError::DimensionMismatch {
                expected: 3,
                found: 2
            })
        );
        let empty: Vec<Vec<f64>> = Vec::new();
        assert_eq!(
            validate_problem(2, (0.0, 1.0), &empty, None),
            Err(InputError::EmptyBatch)
        );
        let ragged = vec![vec![1.0, 2.0], vec![1.0]];
        assert!(validate_problem(2, (0.0, 1.0), &ragged, None).is_err());
    }

    #[test]
    fn validate_problem_checks_time_grid() {
        let batch = vec![vec![1.0]];
        assert_eq!(
            validate_problem(1, (0.0, 1.0), &batch, Some(&[0.0, 0.5, 0.5][..])),
            Err(InputError::NonIncreasingGrid { index: 2 })
        );
        assert_eq!(
            validate_problem(1, (0.0, 1.0), &batch, Some(&[0.0, 1.5][..])),
            Err(InputError::GridOutsideSpan {
                index: 1,
                value: 1.5,
                t0: 0.0,
                tf: 1.0
            })
        );
        assert_eq!(
            validate_problem(1, (0.0, 1.0), &batch, Some(&[][..])),
            Err(InputError::EmptyGrid)
        );
        assert!(validate_problem(1, (0.0, 1.0), &batch, Some(&[0.25, 0.75][..])).is_ok());
    }

    #[test]
    fn build_solver_selects_backend_and_validates() {
        let adaptive = build_solver(IntegratorOptions::default()).expect("adaptive");
        assert_eq!(adaptive.name(), "adaptive");
        let fixed = build_solver(IntegratorOptions::default().with_backend(Backend::FixedStep))
            .expect("fixed");
        assert_eq!(fixed.name(), "fixed_step");
        let bad = build_solver(IntegratorOptions::default().with_tolerances(-1.0, 1e-9));
        assert!(matches!(bad, Err(Error::Input(InputError::InvalidOption { .. }))));
    }
}
