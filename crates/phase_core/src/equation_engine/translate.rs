//! Translation of one side of an equation into a closed expression tree.
//!
//! The tree can only ever read state entries, parameters and time, apply
//! the four arithmetic operators plus power, and call one of the
//! whitelisted functions. Nothing in it can name or run arbitrary code.

use super::lexer::{
    match_explicit_derivative, match_primed_derivative, match_state_access, tokenize, Delimiter,
    Token,
};
use crate::error::ParseError;
use crate::traits::Params;
use std::fmt;

/// Identifiers that are never accepted, even as parameter names.
const DENIED_IDENTIFIERS: &[&str] = &[
    "import", "exec", "eval", "open", "compile", "lambda", "globals", "getattr",
];

/// Whitelisted functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sin,
    Cos,
    Exp,
    Log,
    Sqrt,
    Abs,
    Min,
    Max,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Sin" => Some(Function::Sin),
            "Cos" => Some(Function::Cos),
            "Exp" => Some(Function::Exp),
            "Log" => Some(Function::Log),
            "Sqrt" => Some(Function::Sqrt),
            "Abs" => Some(Function::Abs),
            "Min" => Some(Function::Min),
            "Max" => Some(Function::Max),
            _ => None,
        }
    }

    /// Name used when rendering a translated expression.
    pub fn target_name(self) -> &'static str {
        match self {
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Exp => "exp",
            Function::Log => "ln",
            Function::Sqrt => "sqrt",
            Function::Abs => "abs",
            Function::Min => "min",
            Function::Max => "max",
        }
    }

    fn is_variadic(self) -> bool {
        matches!(self, Function::Min | Function::Max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
        }
    }
}

/// Abstract Syntax Tree nodes for translated expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    /// Read of the state vector entry at the given index.
    State(usize),
    /// Parameter lookup; missing parameters evaluate to 0.
    Param(String),
    /// The independent variable `t`.
    Time,
    Neg(Box<Expr>),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Call(Function, Vec<Expr>),
}

impl Expr {
    /// Evaluates the tree by direct traversal.
    pub fn eval(&self, t: f64, y: &[f64], params: &Params) -> f64 {
        match self {
            Expr::Number(n) => *n,
            Expr::State(idx) => y[*idx],
            Expr::Param(name) => params.get(name).copied().unwrap_or(0.0),
            Expr::Time => t,
            Expr::Neg(inner) => -inner.eval(t, y, params),
            Expr::Binary(left, op, right) => {
                let a = left.eval(t, y, params);
                let b = right.eval(t, y, params);
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Pow => a.powf(b),
                }
            }
            Expr::Call(func, args) => {
                let first = args.first().map_or(f64::NAN, |a| a.eval(t, y, params));
                match func {
                    Function::Sin => first.sin(),
                    Function::Cos => first.cos(),
                    Function::Exp => first.exp(),
                    Function::Log => first.ln(),
                    Function::Sqrt => first.sqrt(),
                    Function::Abs => first.abs(),
                    Function::Min => args
                        .iter()
                        .skip(1)
                        .fold(first, |acc, a| nan_aware_min(acc, a.eval(t, y, params))),
                    Function::Max => args
                        .iter()
                        .skip(1)
                        .fold(first, |acc, a| nan_aware_max(acc, a.eval(t, y, params))),
                }
            }
        }
    }

    /// Collects parameter names in order of first appearance.
    pub fn collect_params(&self, names: &mut Vec<String>) {
        match self {
            Expr::Param(name) => {
                if !names.iter().any(|n| n == name) {
                    names.push(name.clone());
                }
            }
            Expr::Neg(inner) => inner.collect_params(names),
            Expr::Binary(left, _, right) => {
                left.collect_params(names);
                right.collect_params(names);
            }
            Expr::Call(_, args) => {
                for arg in args {
                    arg.collect_params(names);
                }
            }
            Expr::Number(_) | Expr::State(_) | Expr::Time => {}
        }
    }
}

// Elementwise min/max propagate NaN like the array minimum/maximum they replace.
fn nan_aware_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.min(b)
    }
}

fn nan_aware_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{n:?}"),
            Expr::State(idx) => write!(f, "y[{idx}]"),
            Expr::Param(name) => write!(f, "params[\"{name}\"]"),
            Expr::Time => write!(f, "t"),
            Expr::Neg(inner) => write!(f, "(-{inner})"),
            Expr::Binary(left, op, right) => write!(f, "({left} {} {right})", op.symbol()),
            Expr::Call(func, args) => {
                write!(f, "{}(", func.target_name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Token stream after substitution: every state access, parameter, time
/// reference and constant has been collapsed into an atom.
#[derive(Debug, Clone, PartialEq)]
enum Rewritten {
    Atom(Expr),
    Func(Function),
    Op(Token),
}

impl fmt::Display for Rewritten {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rewritten::Atom(expr) => write!(f, "{expr}"),
            Rewritten::Func(func) => write!(f, "{}", func.target_name()),
            Rewritten::Op(token) => write!(f, "{token}"),
        }
    }
}

fn render(tokens: &[Rewritten]) -> String {
    tokens
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Translates one expression into an `Expr` over `state_vars`.
///
/// State names map to indexed reads, whitelisted names to functions, `t` to
/// time, `Pi` to the constant, and every other identifier to a parameter
/// lookup.
pub fn translate(expr: &str, state_vars: &[String]) -> Result<Expr, ParseError> {
    let original = expr.trim();
    let tokens = tokenize(original)?;
    reject_unsafe_identifiers(&tokens, original)?;
    let rewritten = substitute(&tokens, state_vars, original)?;

    let mut parser = Parser {
        tokens: &rewritten,
        pos: 0,
        depth: 0,
    };
    let invalid = |reason: String| ParseError::InvalidExpression {
        reason,
        original: original.to_string(),
        translated: render(&rewritten),
    };
    if rewritten.is_empty() {
        return Err(invalid("empty expression".to_string()));
    }
    let (tree, _) = parser.parse_expression().map_err(invalid)?;
    if let Some(extra) = parser.peek() {
        return Err(invalid(format!("unexpected '{extra}' after expression")));
    }
    Ok(tree)
}

fn reject_unsafe_identifiers(tokens: &[Token], fragment: &str) -> Result<(), ParseError> {
    for token in tokens {
        if let Token::Identifier(name) = token {
            if name.contains("__") || DENIED_IDENTIFIERS.contains(&name.as_str()) {
                return Err(ParseError::UnsafeToken {
                    token: name.clone(),
                    fragment: fragment.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn lookup(name: &str, state_vars: &[String]) -> Expr {
    match state_vars.iter().position(|v| v == name) {
        Some(idx) => Expr::State(idx),
        None => Expr::Param(name.to_string()),
    }
}

fn substitute(
    tokens: &[Token],
    state_vars: &[String],
    fragment: &str,
) -> Result<Vec<Rewritten>, ParseError> {
    let mut out = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        let rest = &tokens[i..];
        // Derivative forms on the right-hand side read the state itself.
        if let Some((name, used)) = match_explicit_derivative(rest) {
            out.push(Rewritten::Atom(lookup(&name, state_vars)));
            i += used;
            continue;
        }
        if let Some((name, used)) = match_primed_derivative(rest) {
            out.push(Rewritten::Atom(lookup(&name, state_vars)));
            i += used;
            continue;
        }
        match &tokens[i] {
            Token::Identifier(name) => {
                if let Some(func) = Function::from_name(name) {
                    out.push(Rewritten::Func(func));
                    i += 1;
                    continue;
                }
                if let Some((name, used)) = match_state_access(rest) {
                    out.push(Rewritten::Atom(lookup(&name, state_vars)));
                    i += used;
                    continue;
                }
                if matches!(
                    tokens.get(i + 1),
                    Some(Token::Open(Delimiter::Paren | Delimiter::Bracket))
                ) {
                    return Err(ParseError::UnknownFunction {
                        name: name.clone(),
                        fragment: fragment.to_string(),
                    });
                }
                let atom = match name.as_str() {
                    "t" => Expr::Time,
                    "Pi" => Expr::Number(std::f64::consts::PI),
                    _ => lookup(name, state_vars),
                };
                out.push(Rewritten::Atom(atom));
            }
            Token::Number(n) => out.push(Rewritten::Atom(Expr::Number(*n))),
            Token::Prime => {
                return Err(ParseError::UnexpectedCharacter {
                    found: '\'',
                    fragment: fragment.to_string(),
                })
            }
            other => out.push(Rewritten::Op(other.clone())),
        }
        i += 1;
    }
    Ok(out)
}

/// Deepest expression tree (and parser recursion) accepted.
pub const MAX_DEPTH: usize = 512;

/// A parsed subtree together with its height.
type Parsed = Result<(Expr, usize), String>;

fn too_deep() -> String {
    format!("expression nests deeper than {MAX_DEPTH} levels")
}

fn checked_height(height: usize) -> Result<usize, String> {
    if height > MAX_DEPTH {
        Err(too_deep())
    } else {
        Ok(height)
    }
}

struct Parser<'a> {
    tokens: &'a [Rewritten],
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Rewritten> {
        self.tokens.get(self.pos)
    }

    fn peek_op(&self) -> Option<&Token> {
        match self.peek() {
            Some(Rewritten::Op(token)) => Some(token),
            _ => None,
        }
    }

    fn consume(&mut self) -> Option<Rewritten> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Runs `f` one recursion level deeper, failing past `MAX_DEPTH`.
    fn nested(&mut self, f: impl FnOnce(&mut Self) -> Parsed) -> Parsed {
        if self.depth >= MAX_DEPTH {
            return Err(too_deep());
        }
        self.depth += 1;
        let parsed = f(self);
        self.depth -= 1;
        parsed
    }

    fn parse_expression(&mut self) -> Parsed {
        self.nested(Self::parse_term)
    }

    fn parse_term(&mut self) -> Parsed {
        let (mut left, mut height) = self.parse_factor()?;

        while let Some(token) = self.peek_op() {
            let op = match token {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.consume();
            let (right, right_height) = self.parse_factor()?;
            height = checked_height(height.max(right_height) + 1)?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok((left, height))
    }

    fn parse_factor(&mut self) -> Parsed {
        let (mut left, mut height) = self.parse_unary()?;

        while let Some(token) = self.peek_op() {
            let op = match token {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                _ => break,
            };
            self.consume();
            let (right, right_height) = self.parse_unary()?;
            height = checked_height(height.max(right_height) + 1)?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok((left, height))
    }

    // Unary signs bind looser than '^', so -x^2 is -(x^2).
    fn parse_unary(&mut self) -> Parsed {
        match self.peek_op() {
            Some(Token::Minus) => {
                self.consume();
                let (expr, height) = self.nested(Self::parse_unary)?;
                Ok((Expr::Neg(Box::new(expr)), checked_height(height + 1)?))
            }
            Some(Token::Plus) => {
                self.consume();
                self.nested(Self::parse_unary)
            }
            _ => self.parse_power(),
        }
    }

    // Right-associative: a^b^c is a^(b^c).
    fn parse_power(&mut self) -> Parsed {
        let (base, base_height) = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek_op() {
            self.consume();
            let (exponent, exp_height) = self.nested(Self::parse_unary)?;
            let height = checked_height(base_height.max(exp_height) + 1)?;
            return Ok((
                Expr::Binary(Box::new(base), BinaryOp::Pow, Box::new(exponent)),
                height,
            ));
        }
        Ok((base, base_height))
    }

    fn parse_primary(&mut self) -> Parsed {
        match self.consume() {
            Some(Rewritten::Atom(expr)) => Ok((expr, 1)),
            Some(Rewritten::Func(func)) => self.parse_call(func),
            Some(Rewritten::Op(Token::Open(delim))) if delim != Delimiter::Bracket => {
                let parsed = self.parse_expression()?;
                self.expect_close(delim)?;
                Ok(parsed)
            }
            Some(Rewritten::Op(token)) => Err(format!("unexpected '{token}'")),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn parse_call(&mut self, func: Function) -> Parsed {
        let delim = match self.consume() {
            Some(Rewritten::Op(Token::Open(d))) if d != Delimiter::Brace => d,
            _ => return Err(format!("function '{}' requires arguments", func.target_name())),
        };
        let (first, mut height) = self.parse_expression()?;
        let mut args = vec![first];
        while let Some(Token::Comma) = self.peek_op() {
            self.consume();
            let (arg, arg_height) = self.parse_expression()?;
            height = height.max(arg_height);
            args.push(arg);
        }
        self.expect_close(delim)?;

        let arity_ok = if func.is_variadic() {
            args.len() >= 2
        } else {
            args.len() == 1
        };
        if !arity_ok {
            return Err(format!(
                "function '{}' called with {} argument(s)",
                func.target_name(),
                args.len()
            ));
        }
        Ok((Expr::Call(func, args), checked_height(height + 1)?))
    }

    fn expect_close(&mut self, delim: Delimiter) -> Result<(), String> {
        match self.consume() {
            Some(Rewritten::Op(Token::Close(d))) if d == delim => Ok(()),
            Some(other) => Err(format!("expected '{}', found '{other}'", delim.close_char())),
            None => Err(format!("expected '{}'", delim.close_char())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn eval(expr: &str, state: &[&str], y: &[f64], params: &Params) -> f64 {
        translate(expr, &vars(state))
            .expect("expression should translate")
            .eval(0.0, y, params)
    }

    #[test]
    fn translate_maps_state_access_forms_to_indices() {
        let state = vars(&["x", "y"]);
        assert_eq!(translate("y[t]", &state), Ok(Expr::State(1)));
        assert_eq!(translate("x(t)", &state), Ok(Expr::State(0)));
        assert_eq!(translate("y", &state), Ok(Expr::State(1)));
    }

    #[test]
    fn translate_treats_unknown_identifiers_as_parameters() {
        let state = vars(&["x"]);
        assert_eq!(translate("k", &state), Ok(Expr::Param("k".to_string())));
        assert_eq!(translate("k[t]", &state), Ok(Expr::Param("k".to_string())));
        let params = Params::new();
        assert_eq!(eval("k * x[t] + 1", &["x"], &[3.0], &params), 1.0);
    }

    #[test]
    fn caret_is_right_associative_and_binds_tighter_than_negation() {
        let params = Params::new();
        assert_eq!(eval("2^3^2", &[], &[], &params), 512.0);
        assert_eq!(eval("-x^2", &["x"], &[3.0], &params), -9.0);
        assert_eq!(eval("2^-1", &[], &[], &params), 0.5);
    }

    #[test]
    fn whitelisted_functions_accept_both_bracket_styles() {
        let params = Params::new();
        assert!((eval("Sin(Pi/2)", &[], &[], &params) - 1.0).abs() < 1e-15);
        assert!((eval("Cos[0]", &[], &[], &params) - 1.0).abs() < 1e-15);
        assert_eq!(eval("Sqrt(Abs(-16))", &[], &[], &params), 4.0);
        assert_eq!(eval("Min(x[t], 2, 5)", &["x"], &[3.0], &params), 2.0);
        assert_eq!(eval("Max[x[t], 2]", &["x"], &[3.0], &params), 3.0);
        assert!((eval("Log(Exp(2))", &[], &[], &params) - 2.0).abs() < 1e-15);
    }

    #[test]
    fn function_applied_to_time_is_a_call_not_a_state_access() {
        let expr = translate("Sin(t)", &vars(&["x"])).expect("translate");
        assert_eq!(expr, Expr::Call(Function::Sin, vec![Expr::Time]));
    }

    #[test]
    fn rhs_derivative_forms_read_the_state() {
        let state = vars(&["x", "v"]);
        assert_eq!(translate("D(v[t], t)", &state), Ok(Expr::State(1)));
        assert_eq!(translate("x'[t]", &state), Ok(Expr::State(0)));
    }

    #[test]
    fn translate_rejects_unsafe_identifiers() {
        let state = vars(&["x"]);
        for source in [
            "__import__(x)",
            "import + x",
            "exec(x)",
            "x + eval",
            "open(x)",
            "a__b * x",
        ] {
            let err = translate(source, &state).expect_err("unsafe input must be rejected");
            assert!(
                matches!(err, ParseError::UnsafeToken { .. }),
                "expected UnsafeToken for {source}, got {err:?}"
            );
        }
    }

    #[test]
    fn translate_rejects_unknown_function_calls() {
        let err = translate("foo(x[t])", &vars(&["x"])).expect_err("unknown call");
        assert_eq!(
            err,
            ParseError::UnknownFunction {
                name: "foo".to_string(),
                fragment: "foo(x[t])".to_string(),
            }
        );
    }

    #[test]
    fn nesting_past_the_depth_limit_is_an_error() {
        let state = vars(&["x"]);
        let too_deep = |expr: &str| {
            matches!(
                translate(expr, &state),
                Err(ParseError::InvalidExpression { ref reason, .. }) if reason.contains("nests deeper")
            )
        };
        let parens = format!("{}x{}", "(".repeat(100_000), ")".repeat(100_000));
        assert!(too_deep(&parens));
        assert!(too_deep(&format!("{}x", "-".repeat(100_000))));
        assert!(too_deep(&vec!["x"; 2 * MAX_DEPTH].join(" + ")));
        assert!(too_deep(&format!("{}x{}", "Sin(".repeat(MAX_DEPTH + 1), ")".repeat(MAX_DEPTH + 1))));

        let shallow = format!("{}x{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(translate(&shallow, &state), Ok(Expr::State(0)));
        let params = Params::new();
        let sum = vec!["x"; 200].join(" + ");
        assert_eq!(eval(&sum, &["x"], &[0.5], &params), 100.0);
    }

    #[test]
    fn invalid_expression_reports_original_and_translated_text() {
        let err = translate("x[t] +", &vars(&["x"])).expect_err("dangling operator");
        match err {
            ParseError::InvalidExpression {
                original,
                translated,
                ..
            } => {
                assert_eq!(original, "x[t] +");
                assert_eq!(translated, "y[0] +");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn translate_rejects_structural_errors() {
        let state = vars(&["x"]);
        assert!(translate("(x + 1", &state).is_err());
        assert!(translate("Sin + 1", &state).is_err());
        assert!(translate("Min(x)", &state).is_err());
        assert!(translate("Sin(x, 2)", &state).is_err());
        assert!(translate("x y", &state).is_err());
        assert!(translate("", &state).is_err());
    }

    #[test]
    fn collect_params_preserves_first_use_order() {
        let expr = translate("b * x + a - b", &vars(&["x"])).expect("translate");
        let mut names = Vec::new();
        expr.collect_params(&mut names);
        assert_eq!(names, vec!["b".to_string(), "a".to_string()]);
    }
}
