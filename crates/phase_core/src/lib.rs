pub mod equation_engine;
pub mod error;
pub mod options;
pub mod solvers;
/// The `phase_core` crate turns Mathematica-like ODE text into a vector field
/// and integrates it for batches of initial conditions.
///
/// Key components:
/// - **Equation Engine**: tokenizer, translator and parser producing a closed expression tree per equation.
/// - **Traits**: `VectorField` (the parser/solver boundary), `DynamicalSystem`, `Steppable`, `EventFunction`.
/// - **Solvers**: the `Solver` contract with adaptive (RK45, DOP853, Radau, BDF) and fixed-step RK4 backends.
/// - **Options**: `IntegratorOptions` with serde defaults and validation.
pub mod traits;

pub use equation_engine::{parse, parse_scalar, translate, EquationSystem, ScalarExpression};
pub use error::{Error, InputError, ParseError, Result, SolverError};
pub use options::{Backend, IntegratorOptions, Method};
pub use solvers::{
    build_solver, default_time_grid, validate_problem, AdaptiveSolver, BatchSolution, EventLog,
    FixedStepSolver, Solution, Solver, SolverStats,
};
pub use traits::{EventFunction, Params, VectorField};
