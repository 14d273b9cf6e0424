//! Variable-step integration with error control.
//!
//! Four methods share one driver: the stepper advances by accepted steps and
//! the driver samples the state at every output time. Explicit methods and
//! Radau land exactly on each output time; BDF steps freely and evaluates
//! its interpolating polynomial instead.

pub mod bdf;
pub mod common;
pub mod radau;
pub mod runge_kutta;

use self::bdf::Bdf;
use self::common::{StepControl, StepFailure, Stepper, EPS};
use self::radau::Radau;
use self::runge_kutta::{RungeKutta, DORMAND_PRINCE_54, DORMAND_PRINCE_853};
use super::events::{detect_on_grid, CrossingTracker};
use super::{check_options, resolve_grid, validate_problem, Solution, Solver, SolverStats};
use crate::error::{Result, SolverError};
use crate::options::{IntegratorOptions, Method};
use crate::traits::{BoundField, DynamicalSystem, EventFunction, Params, VectorField};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct AdaptiveSolver {
    options: IntegratorOptions,
}

impl AdaptiveSolver {
    pub fn new(options: IntegratorOptions) -> Self {
        Self { options }
    }

    fn control(&self) -> StepControl {
        let floor = 100.0 * EPS;
        let rtol = if self.options.rtol < floor {
            warn!(rtol = self.options.rtol, floor, "rtol too small, raising it");
            floor
        } else {
            self.options.rtol
        };
        StepControl {
            rtol,
            atol: self.options.atol,
            max_step: self.options.max_step.unwrap_or(f64::INFINITY),
            first_step: self.options.first_step(),
        }
    }

    fn failure(&self, failure: &StepFailure, stats: SolverStats) -> SolverError {
        SolverError::new(self.name(), self.options.method.name(), failure.to_string())
            .with_detail("reason", failure.reason())
            .with_detail("time", failure.time())
            .with_detail("nfev", stats.nfev)
    }
}

/// Output of one driven integration.
struct Driven {
    states: Vec<Vec<f64>>,
    native_times: Vec<Vec<f64>>,
    stats: SolverStats,
}

/// Advances `stepper` through every time in `grid`, recording the state there.
fn drive<M: Stepper, S: DynamicalSystem>(
    mut stepper: M,
    system: &S,
    grid: &[f64],
    t_final: f64,
    max_steps: usize,
    events: &[&dyn EventFunction],
) -> std::result::Result<Driven, (StepFailure, SolverStats)> {
    let mut tracker = CrossingTracker::new(events, stepper.t(), stepper.y());
    let mut states = Vec::with_capacity(grid.len());
    let mut steps = 0usize;

    for &target in grid {
        while stepper.t() < target {
            if steps >= max_steps {
                let failure = StepFailure::TooManySteps {
                    t: stepper.t(),
                    limit: max_steps,
                };
                return Err((failure, stepper.stats()));
            }
            let t_old = stepper.t();
            let bound = if M::INTERPOLATES { t_final } else { target };
            stepper
                .step(system, bound)
                .map_err(|failure| (failure, stepper.stats()))?;
            // Steps clipped onto an output time are not charged to the budget.
            if M::INTERPOLATES || stepper.t() != target {
                steps += 1;
            }
            if !stepper.y().iter().all(|v| v.is_finite()) {
                return Err((StepFailure::NonFinite { t: stepper.t() }, stepper.stats()));
            }
            tracker.observe(t_old, stepper.t(), stepper.y());
        }
        let sample = if M::INTERPOLATES && stepper.t() != target {
            stepper.interpolate(target)
        } else {
            stepper.y().to_vec()
        };
        states.push(sample);
    }

    Ok(Driven {
        states,
        native_times: tracker.into_times(),
        stats: stepper.stats(),
    })
}

impl Solver for AdaptiveSolver {
    fn name(&self) -> &'static str {
        "adaptive"
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
        check_options(self.name(), self.options.method.name(), &self.options)?;
        validate_problem(field.dimension(), span, std::slice::from_ref(&y0), t_eval)?;
        let times = resolve_grid(span, t_eval);
        let system = BoundField::new(field, params);
        let control = self.control();
        let (t0, tf) = span;
        let max_steps = self.options.max_steps();
        let method = self.options.method;

        debug!(
            backend = self.name(),
            method = method.name(),
            rtol = control.rtol,
            atol = control.atol,
            samples = times.len(),
            "adaptive solve started"
        );

        let driven = match method {
            Method::RK45 => drive(
                RungeKutta::new(DORMAND_PRINCE_54, &system, t0, y0, tf, control),
                &system,
                &times,
                tf,
                max_steps,
                events,
            ),
            Method::DOP853 => drive(
                RungeKutta::new(DORMAND_PRINCE_853, &system, t0, y0, tf, control),
                &system,
                &times,
                tf,
                max_steps,
                events,
            ),
            Method::Radau => drive(
                Radau::new(&system, t0, y0, tf, control),
                &system,
                &times,
                tf,
                max_steps,
                events,
            ),
            Method::BDF => drive(
                Bdf::new(&system, t0, y0, tf, control),
                &system,
                &times,
                tf,
                max_steps,
                events,
            ),
        };

        let driven = match driven {
            Ok(driven) => driven,
            Err((failure, stats)) => {
                warn!(
                    method = method.name(),
                    time = failure.time(),
                    reason = failure.reason(),
                    "adaptive integration failed"
                );
                return Err(self.failure(&failure, stats).into());
            }
        };

        let mut log = detect_on_grid(events, &times, &driven.states);
        log.native_times = driven.native_times;

        debug!(
            method = method.name(),
            nfev = driven.stats.nfev,
            accepted = driven.stats.accepted_steps,
            rejected = driven.stats.rejected_steps,
            "adaptive solve finished"
        );

        Ok(Solution {
            times,
            states: driven.states,
            events: log,
            stats: driven.stats,
        })
    }
}
