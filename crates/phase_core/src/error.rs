use std::collections::BTreeMap;
use thiserror::Error;

/// Failures raised while turning an equation string into a vector field.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("equations: input is empty")]
    Empty,
    #[error("equations: equation string must contain '==' separating LHS and RHS")]
    MissingEquality,
    #[error("equations: unbalanced delimiter '{delimiter}' in '{fragment}'")]
    UnbalancedDelimiter { delimiter: char, fragment: String },
    #[error("lhs: unable to identify dependent variable in element '{element}'")]
    UnrecognizedDerivative { element: String },
    #[error("lhs: no dependent variables found (expected forms like x'[t] or D(x[t], t))")]
    NoStateVariables,
    #[error("lhs: '{name}' is reserved and cannot be used as a state variable")]
    ReservedName { name: String },
    #[error(
        "rhs: number of RHS expressions ({expressions}) does not match number of state variables ({variables})"
    )]
    CountMismatch { expressions: usize, variables: usize },
    #[error("rhs: unexpected character '{found}' in '{fragment}'")]
    UnexpectedCharacter { found: char, fragment: String },
    #[error("rhs: malformed number '{literal}' in '{fragment}'")]
    InvalidNumber { literal: String, fragment: String },
    #[error("rhs: expression contains unsupported construct '{token}' in '{fragment}'")]
    UnsafeToken { token: String, fragment: String },
    #[error("rhs: unknown function '{name}' in '{fragment}'")]
    UnknownFunction { name: String, fragment: String },
    #[error(
        "rhs: failed to parse expression after translation: {reason}\nOriginal: {original}\nTranslated: {translated}"
    )]
    InvalidExpression {
        reason: String,
        original: String,
        translated: String,
    },
}

/// An integration failure reported by a backend.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct SolverError {
    pub message: String,
    pub details: BTreeMap<String, String>,
}

impl SolverError {
    pub fn new(backend: &str, method: &str, message: impl Into<String>) -> Self {
        let mut details = BTreeMap::new();
        details.insert("backend".to_string(), backend.to_string());
        details.insert("method".to_string(), method.to_string());
        Self {
            message: message.into(),
            details,
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }
}

/// Shape and configuration problems detected before integration starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InputError {
    #[error("timespan must be finite and satisfy t0 < tf (got [{t0}, {tf}])")]
    InvalidSpan { t0: f64, tf: f64 },
    #[error("initial condition length ({found}) does not match number of state variables ({expected})")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("initial condition batch is empty")]
    EmptyBatch,
    #[error("t_eval must contain at least one sample")]
    EmptyGrid,
    #[error("t_eval must be strictly increasing (violated at index {index})")]
    NonIncreasingGrid { index: usize },
    #[error("t_eval value {value} at index {index} lies outside the timespan [{t0}, {tf}]")]
    GridOutsideSpan {
        index: usize,
        value: f64,
        t0: f64,
        tf: f64,
    },
    #[error("integrator.{field}: {message}")]
    InvalidOption { field: String, message: String },
    #[error("unsupported integrator method: {0}. Allowed: BDF, DOP853, RK45, Radau")]
    UnknownMethod(String),
    #[error("unsupported backend: {0}. Allowed: adaptive, fixed_step")]
    UnknownBackend(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Solver(#[from] SolverError),
    #[error(transparent)]
    Input(#[from] InputError),
}

pub type Result<T> = std::result::Result<T, Error>;
