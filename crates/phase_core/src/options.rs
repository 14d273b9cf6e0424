use crate::error::InputError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

pub const DEFAULT_RTOL: f64 = 1e-6;
pub const DEFAULT_ATOL: f64 = 1e-9;
pub const DEFAULT_MAX_STEPS: usize = 100_000;

/// Adaptive integration methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum Method {
    /// Dormand–Prince 5(4).
    RK45,
    /// Radau IIA, order 5. Implicit.
    Radau,
    /// Variable-order backward differentiation. Implicit.
    BDF,
    /// Dormand–Prince 8(5,3).
    DOP853,
}

impl Method {
    pub const ALL: [Method; 4] = [Method::RK45, Method::Radau, Method::BDF, Method::DOP853];

    pub fn name(self) -> &'static str {
        match self {
            Method::RK45 => "RK45",
            Method::Radau => "Radau",
            Method::BDF => "BDF",
            Method::DOP853 => "DOP853",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Method {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| InputError::UnknownMethod(s.to_string()))
    }
}

impl TryFrom<String> for Method {
    type Error = InputError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Which integration engine handles a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Adaptive,
    FixedStep,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::Adaptive => "adaptive",
            Backend::FixedStep => "fixed_step",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "adaptive" => Ok(Backend::Adaptive),
            "fixed_step" | "rk4" => Ok(Backend::FixedStep),
            other => Err(InputError::UnknownBackend(other.to_string())),
        }
    }
}

impl TryFrom<String> for Backend {
    type Error = InputError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Settings for one solve call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorOptions {
    pub method: Method,
    pub rtol: f64,
    pub atol: f64,
    pub max_step: Option<f64>,
    pub backend: Backend,
    /// Backend-specific knobs. Recognised: `first_step`, `max_steps`.
    pub extras: BTreeMap<String, f64>,
}

impl Default for IntegratorOptions {
    fn default() -> Self {
        Self {
            method: Method::RK45,
            rtol: DEFAULT_RTOL,
            atol: DEFAULT_ATOL,
            max_step: None,
            backend: Backend::Adaptive,
            extras: BTreeMap::new(),
        }
    }
}

impl IntegratorOptions {
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.rtol = rtol;
        self.atol = atol;
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Initial step requested for adaptive methods, if any.
    pub fn first_step(&self) -> Option<f64> {
        self.extras.get("first_step").copied()
    }

    pub fn max_steps(&self) -> usize {
        self.extras
            .get("max_steps")
            .map_or(DEFAULT_MAX_STEPS, |&n| n as usize)
    }

    pub fn validate(&self) -> Result<(), InputError> {
        positive("rtol", self.rtol)?;
        positive("atol", self.atol)?;
        if let Some(max_step) = self.max_step {
            positive("max_step", max_step)?;
        }
        if let Some(first_step) = self.first_step() {
            positive("extras.first_step", first_step)?;
        }
        if let Some(&max_steps) = self.extras.get("max_steps") {
            if !(max_steps >= 1.0 && max_steps.is_finite()) {
                return Err(InputError::InvalidOption {
                    field: "extras.max_steps".to_string(),
                    message: format!("must be at least 1 (got {max_steps})"),
                });
            }
        }
        for key in self.extras.keys() {
            if key != "first_step" && key != "max_steps" {
                debug!(key = %key, "ignoring unrecognised integrator extra");
            }
        }
        Ok(())
    }
}

fn positive(field: &str, value: f64) -> Result<(), InputError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(InputError::InvalidOption {
            field: field.to_string(),
            message: format!("must be positive and finite (got {value})"),
        })
    }
}
