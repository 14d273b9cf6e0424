use std::collections::HashMap;

/// Parameter values handed to a vector field at evaluation time.
/// Names that are missing from the map evaluate to 0.
pub type Params = HashMap<String, f64>;

/// The boundary contract between the equation parser and the integrators:
/// `(t, y, params) -> dy/dt`.
///
/// Implementations must be pure: identical inputs give identical outputs and
/// no state is kept between calls.
pub trait VectorField: Sync {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// t: current time
    /// y: current state
    /// params: name -> value lookup
    /// out: buffer to write dy/dt into, same length as `y`
    ///
    /// Both `y` and `out` must have length `dimension()`; implementations
    /// may panic otherwise.
    fn apply(&self, t: f64, y: &[f64], params: &Params, out: &mut [f64]);
}

/// A vector field whose parameters have already been resolved.
/// This is the form the steppers consume.
pub trait DynamicalSystem {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field at (t, x) into `out`.
    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]);
}

/// A scalar function g(t, y) whose zero crossings are reported during
/// integration.
pub trait EventFunction: Sync {
    fn evaluate(&self, t: f64, y: &[f64]) -> f64;
}

impl<F> EventFunction for F
where
    F: Fn(f64, &[f64]) -> f64 + Sync,
{
    fn evaluate(&self, t: f64, y: &[f64]) -> f64 {
        self(t, y)
    }
}

/// A trait for solvers that can step a system forward by an externally
/// chosen step size.
pub trait Steppable {
    /// Performs one step of size dt.
    /// t: current time (updated after step)
    /// state: current state (updated after step)
    /// dt: step size
    fn step(&mut self, system: &impl DynamicalSystem, t: &mut f64, state: &mut [f64], dt: f64);
}

/// Binds a `VectorField` to a fixed parameter map so it can be driven by a
/// stepper.
pub struct BoundField<'a, F: VectorField + ?Sized> {
    field: &'a F,
    params: &'a Params,
}

impl<'a, F: VectorField + ?Sized> BoundField<'a, F> {
    pub fn new(field: &'a F, params: &'a Params) -> Self {
        Self { field, params }
    }
}

impl<F: VectorField + ?Sized> DynamicalSystem for BoundField<'_, F> {
    fn dimension(&self) -> usize {
        self.field.dimension()
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        self.field.apply(t, x, self.params, out);
    }
}
