//! Mathematica-like equation parsing.
//!
//! `parse` turns a string such as `{x'[t], y'[t]} == {x[t] - y[t], x[t]*y[t]}`
//! into an [`EquationSystem`]: the ordered state variables plus one
//! expression tree per derivative.

pub mod lexer;
pub mod translate;

use crate::error::ParseError;
use crate::traits::{EventFunction, Params, VectorField};
use lexer::{
    match_explicit_derivative, match_primed_derivative, match_state_access, tokenize, Delimiter,
};
use std::fmt;
use tracing::debug;
pub use translate::{translate, BinaryOp, Expr, Function};

/// Names that cannot be declared as state variables.
const RESERVED_NAMES: &[&str] = &["t", "D", "Pi"];

/// A compiled vector field: one expression per state variable.
#[derive(Debug, Clone, PartialEq)]
pub struct EquationSystem {
    variables: Vec<String>,
    parameters: Vec<String>,
    pub equations: Vec<Expr>,
}

impl EquationSystem {
    /// Ordered state variable names; index i is entry i of the state vector.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Parameter names in order of first use across the right-hand side.
    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    /// Allocating convenience wrapper around [`VectorField::apply`].
    pub fn evaluate(&self, t: f64, y: &[f64], params: &Params) -> Vec<f64> {
        let mut out = vec![0.0; self.equations.len()];
        self.apply(t, y, params, &mut out);
        out
    }
}

impl VectorField for EquationSystem {
    fn dimension(&self) -> usize {
        self.equations.len()
    }

    fn apply(&self, t: f64, y: &[f64], params: &Params, out: &mut [f64]) {
        debug_assert_eq!(y.len(), self.dimension(), "state length must match the system");
        debug_assert_eq!(out.len(), self.dimension(), "output length must match the system");
        for (slot, eq) in out.iter_mut().zip(&self.equations) {
            *slot = eq.eval(t, y, params);
        }
    }
}

impl fmt::Display for EquationSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, eq)) in self.variables.iter().zip(&self.equations).enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "d{name}/dt = {eq}")?;
        }
        Ok(())
    }
}

/// Parses a Mathematica-like equation string.
///
/// Examples accepted:
///  - `x'[t] == -x[t] + y[t]^2`
///  - `{x'[t], y'[t]} == {x[t] - y[t], x[t]*y[t]}`
///  - `x'(t) == Sin(x(t))`
///  - `D(x[t], t) == x[t] - k`
pub fn parse(equations: &str) -> Result<EquationSystem, ParseError> {
    let source = equations.trim();
    if source.is_empty() {
        return Err(ParseError::Empty);
    }
    let (lhs, rhs) = source
        .split_once("==")
        .ok_or(ParseError::MissingEquality)?;
    check_balanced(source)?;

    let variables = identify_state_vars(lhs.trim())?;

    let rhs = rhs.trim();
    let rhs_items: Vec<&str> = match strip_enclosing(rhs, &[Delimiter::Brace, Delimiter::Paren]) {
        Some(inner) => split_top_level(inner, ','),
        None => vec![rhs],
    }
    .into_iter()
    .map(str::trim)
    .filter(|item| !item.is_empty())
    .collect();

    if rhs_items.len() != variables.len() {
        return Err(ParseError::CountMismatch {
            expressions: rhs_items.len(),
            variables: variables.len(),
        });
    }

    let equations = rhs_items
        .iter()
        .map(|item| translate(item, &variables))
        .collect::<Result<Vec<_>, _>>()?;

    let mut parameters = Vec::new();
    for eq in &equations {
        eq.collect_params(&mut parameters);
    }

    debug!(
        variables = ?variables,
        parameters = ?parameters,
        "parsed equation system"
    );

    Ok(EquationSystem {
        variables,
        parameters,
        equations,
    })
}

/// Determines the ordered dependent variables from the LHS.
fn identify_state_vars(lhs: &str) -> Result<Vec<String>, ParseError> {
    let content = strip_enclosing(lhs, &[Delimiter::Brace]).unwrap_or(lhs);

    let mut vars_found: Vec<String> = Vec::new();
    for item in split_top_level(content, ',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let tokens = tokenize(item)?;
        let matched = match_explicit_derivative(&tokens)
            .or_else(|| match_primed_derivative(&tokens))
            .or_else(|| match_state_access(&tokens))
            .filter(|(_, used)| *used == tokens.len());
        let Some((name, _)) = matched else {
            return Err(ParseError::UnrecognizedDerivative {
                element: item.to_string(),
            });
        };
        if RESERVED_NAMES.contains(&name.as_str()) || Function::from_name(&name).is_some() {
            return Err(ParseError::ReservedName { name });
        }
        if !vars_found.contains(&name) {
            vars_found.push(name);
        }
    }
    if vars_found.is_empty() {
        return Err(ParseError::NoStateVariables);
    }
    Ok(vars_found)
}

/// Splits `s` on `sep` only at top level (not inside parentheses, brackets or
/// braces). Parts are trimmed and empty parts dropped.
pub fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (idx, ch) in s.char_indices() {
        if Delimiter::from_open(ch).is_some() {
            depth += 1;
        } else if Delimiter::from_close(ch).is_some() {
            depth = depth.saturating_sub(1);
        } else if ch == sep && depth == 0 {
            let part = s[start..idx].trim();
            if !part.is_empty() {
                parts.push(part);
            }
            start = idx + ch.len_utf8();
        }
    }
    let last = s[start..].trim();
    if !last.is_empty() {
        parts.push(last);
    }
    parts
}

/// Returns the inside of `s` when one delimiter pair of an allowed kind wraps
/// the whole string, e.g. `{a, b}` but not `{a}, {b}`.
fn strip_enclosing<'a>(s: &'a str, allowed: &[Delimiter]) -> Option<&'a str> {
    let first = s.chars().next()?;
    let delim = Delimiter::from_open(first).filter(|d| allowed.contains(d))?;
    if !s.ends_with(delim.close_char()) {
        return None;
    }
    let mut depth = 0usize;
    for (idx, ch) in s.char_indices() {
        if Delimiter::from_open(ch).is_some() {
            depth += 1;
        } else if Delimiter::from_close(ch).is_some() {
            depth = depth.saturating_sub(1);
            if depth == 0 && idx + ch.len_utf8() < s.len() {
                return None;
            }
        }
    }
    Some(&s[first.len_utf8()..s.len() - delim.close_char().len_utf8()])
}

fn check_balanced(s: &str) -> Result<(), ParseError> {
    let mut stack = Vec::new();
    for ch in s.chars() {
        if let Some(open) = Delimiter::from_open(ch) {
            stack.push(open);
        } else if let Some(close) = Delimiter::from_close(ch) {
            if stack.pop() != Some(close) {
                return Err(ParseError::UnbalancedDelimiter {
                    delimiter: ch,
                    fragment: s.to_string(),
                });
            }
        }
    }
    match stack.pop() {
        Some(open) => Err(ParseError::UnbalancedDelimiter {
            delimiter: open.open_char(),
            fragment: s.to_string(),
        }),
        None => Ok(()),
    }
}

/// A standalone scalar expression over a system's state variables, e.g. an
/// event function written as `x[t] - 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarExpression {
    pub expr: Expr,
    parameters: Vec<String>,
}

impl ScalarExpression {
    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn evaluate(&self, t: f64, y: &[f64], params: &Params) -> f64 {
        self.expr.eval(t, y, params)
    }

    /// Fixes the parameter values so the expression can serve as an event.
    pub fn bind<'a>(&'a self, params: &'a Params) -> BoundScalar<'a> {
        BoundScalar { scalar: self, params }
    }
}

pub struct BoundScalar<'a> {
    scalar: &'a ScalarExpression,
    params: &'a Params,
}

impl EventFunction for BoundScalar<'_> {
    fn evaluate(&self, t: f64, y: &[f64]) -> f64 {
        self.scalar.evaluate(t, y, self.params)
    }
}

/// Compiles a scalar expression against an existing variable ordering.
pub fn parse_scalar(expression: &str, state_vars: &[String]) -> Result<ScalarExpression, ParseError> {
    check_balanced(expression)?;
    let expr = translate(expression, state_vars)?;
    let mut parameters = Vec::new();
    expr.collect_params(&mut parameters);
    Ok(ScalarExpression { expr, parameters })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T, ParseError>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn parse_scalar_equation() {
        let system = parse("x'[t] == -x[t]").expect("parse");
        assert_eq!(system.variables(), &["x".to_string()]);
        assert_eq!(system.evaluate(0.0, &[2.0], &Params::new()), vec![-2.0]);
    }

    #[test]
    fn parse_vector_equation() {
        let system = parse("{x'[t], y'[t]} == {x[t] - y[t], x[t]*y[t]}").expect("parse");
        assert_eq!(system.variables(), &["x".to_string(), "y".to_string()]);
        assert_eq!(system.evaluate(0.0, &[1.0, 3.0], &Params::new()), vec![-2.0, 3.0]);
    }

    #[test]
    fn lhs_order_fixes_indices() {
        let system = parse("{y'[t], x'[t]} == {x[t], 2*y[t]}").expect("parse");
        assert_eq!(system.variables(), &["y".to_string(), "x".to_string()]);
        // y is index 0, x is index 1.
        assert_eq!(system.evaluate(0.0, &[5.0, 7.0], &Params::new()), vec![7.0, 10.0]);
    }

    #[test]
    fn lhs_accepts_all_derivative_forms() {
        let system = parse("{D(a[t], t), b'(t), D[c(t), t]} == {1, 2, 3}").expect("parse");
        assert_eq!(
            system.variables(),
            &["a".to_string(), "b".to_string(), "c".to_string()]
        );
        let bare = parse("x[t] == 1").expect("bare access fallback");
        assert_eq!(bare.variables(), &["x".to_string()]);
    }

    #[test]
    fn duplicate_lhs_variables_collapse() {
        let err = parse("{x'[t], x'[t]} == {1, 2}").expect_err("one variable, two expressions");
        assert_eq!(
            err,
            ParseError::CountMismatch {
                expressions: 2,
                variables: 1
            }
        );
    }

    #[test]
    fn parameters_default_to_zero_and_are_listed() {
        let system = parse("{x'[t], v'[t]} == {v[t], -k*x[t] - c*v[t]}").expect("parse");
        assert_eq!(system.parameters(), &["k".to_string(), "c".to_string()]);
        let mut params = Params::new();
        params.insert("k".to_string(), 4.0);
        assert_eq!(system.evaluate(0.0, &[1.0, 2.0], &params), vec![2.0, -4.0]);
    }

    #[test]
    fn rhs_may_use_parentheses_and_time() {
        let system = parse("{x'[t], y'[t]} == (Sin(t), x[t] + 1)").expect("parse");
        let out = system.evaluate(0.0, &[1.0, 0.0], &Params::new());
        assert_eq!(out, vec![0.0, 2.0]);
        let grouped = parse("x'[t] == (x[t] + 1)*(x[t] - 1)").expect("not a vector");
        assert_eq!(grouped.evaluate(0.0, &[3.0], &Params::new()), vec![8.0]);
    }

    #[test]
    fn nested_commas_do_not_split_elements() {
        let system = parse("{x'[t], y'[t]} == {Max(x[t], y[t]), Min(x[t], 0)}").expect("parse");
        assert_eq!(system.evaluate(0.0, &[-1.0, 2.0], &Params::new()), vec![2.0, -1.0]);
    }

    #[test]
    fn parse_rejects_missing_equality() {
        assert_eq!(parse("x'[t] = -x[t]"), Err(ParseError::MissingEquality));
        assert_eq!(parse("   "), Err(ParseError::Empty));
    }

    #[test]
    fn parse_rejects_count_mismatch() {
        assert_eq!(
            parse("{x'[t], y'[t]} == {x[t], y[t], 1}"),
            Err(ParseError::CountMismatch {
                expressions: 3,
                variables: 2
            })
        );
    }

    #[test]
    fn parse_rejects_bad_lhs_and_delimiters() {
        assert_err_contains(parse("{x'[t], 3} == {1, 2}"), "unable to identify");
        assert_err_contains(parse("{x'[t] == {1}"), "unbalanced");
        assert_err_contains(parse("x'[t] == (x[t] + 1"), "unbalanced");
        assert_err_contains(parse("t'[t] == 1"), "reserved");
        assert_err_contains(parse("Sin'[t] == 1"), "reserved");
    }

    #[test]
    fn parse_rejects_unsafe_rhs() {
        assert_err_contains(parse("x'[t] == __import__(x)"), "unsupported construct");
        assert_err_contains(parse("x'[t] == exec(x[t])"), "unsupported construct");
        assert_err_contains(parse("x'[t] == x[t] == 1"), "unexpected character");
    }

    #[test]
    fn split_top_level_respects_nesting() {
        assert_eq!(
            split_top_level("a, f(b, c), {d, e}, g[h, i]", ','),
            vec!["a", "f(b, c)", "{d, e}", "g[h, i]"]
        );
        assert_eq!(split_top_level(" , a ,, ", ','), vec!["a"]);
    }

    #[test]
    fn strip_enclosing_requires_a_wrapping_pair() {
        let braces = [Delimiter::Brace];
        assert_eq!(strip_enclosing("{a, b}", &braces), Some("a, b"));
        assert_eq!(strip_enclosing("{a}, {b}", &braces), None);
        assert_eq!(strip_enclosing("(a)", &braces), None);
    }

    #[test]
    fn scalar_expression_binds_as_event() {
        let vars = vec!["x".to_string(), "y".to_string()];
        let scalar = parse_scalar("y[t] - level", &vars).expect("parse scalar");
        assert_eq!(scalar.parameters(), &["level".to_string()]);
        let mut params = Params::new();
        params.insert("level".to_string(), 1.5);
        let event = scalar.bind(&params);
        assert_eq!(event.evaluate(0.0, &[0.0, 2.0]), 0.5);
    }

    #[test]
    fn display_renders_translated_form() {
        let system = parse("{x'[t], y'[t]} == {x[t] - y[t], k}").expect("parse");
        assert_eq!(
            system.to_string(),
            "dx/dt = (y[0] - y[1])\ndy/dt = params[\"k\"]"
        );
    }

    #[test]
    fn deeply_nested_equation_is_a_parse_error() {
        let rhs = format!("{}x[t]{}", "(".repeat(200_000), ")".repeat(200_000));
        assert_err_contains(parse(&format!("x'[t] == {rhs}")), "nests deeper");
    }

    #[test]
    #[should_panic]
    fn short_state_is_a_caller_bug() {
        let system = parse("{x'[t], y'[t]} == {y[t], -x[t]}").expect("parse");
        system.evaluate(0.0, &[1.0], &Params::new());
    }
}
