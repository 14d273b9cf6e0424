//! Tokenizer shared by the LHS matcher and the expression translator.

use crate::error::ParseError;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Comma,
    /// The derivative prime in `x'[t]`.
    Prime,
    Open(Delimiter),
    Close(Delimiter),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    Paren,
    Bracket,
    Brace,
}

impl Delimiter {
    pub fn from_open(c: char) -> Option<Self> {
        match c {
            '(' => Some(Delimiter::Paren),
            '[' => Some(Delimiter::Bracket),
            '{' => Some(Delimiter::Brace),
            _ => None,
        }
    }

    pub fn from_close(c: char) -> Option<Self> {
        match c {
            ')' => Some(Delimiter::Paren),
            ']' => Some(Delimiter::Bracket),
            '}' => Some(Delimiter::Brace),
            _ => None,
        }
    }

    pub fn open_char(self) -> char {
        match self {
            Delimiter::Paren => '(',
            Delimiter::Bracket => '[',
            Delimiter::Brace => '{',
        }
    }

    pub fn close_char(self) -> char {
        match self {
            Delimiter::Paren => ')',
            Delimiter::Bracket => ']',
            Delimiter::Brace => '}',
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{n}"),
            Token::Identifier(name) => write!(f, "{name}"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Caret => write!(f, "^"),
            Token::Comma => write!(f, ","),
            Token::Prime => write!(f, "'"),
            Token::Open(d) => write!(f, "{}", d.open_char()),
            Token::Close(d) => write!(f, "{}", d.close_char()),
        }
    }
}

/// Splits `input` into tokens. Any character outside the arithmetic grammar
/// is an error; nothing is silently skipped.
pub fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut literal = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    literal.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            // Exponent part: only consumed when digits actually follow.
            if matches!(chars.peek(), Some('e') | Some('E')) {
                let mut lookahead = chars.clone();
                let marker = lookahead.next().unwrap_or('e');
                let mut exponent = String::from(marker);
                if let Some(&sign) = lookahead.peek() {
                    if sign == '+' || sign == '-' {
                        exponent.push(sign);
                        lookahead.next();
                    }
                }
                if lookahead.peek().is_some_and(|d| d.is_ascii_digit()) {
                    while let Some(&d) = lookahead.peek() {
                        if d.is_ascii_digit() {
                            exponent.push(d);
                            lookahead.next();
                        } else {
                            break;
                        }
                    }
                    literal.push_str(&exponent);
                    chars = lookahead;
                }
            }
            let value = literal
                .parse::<f64>()
                .map_err(|_| ParseError::InvalidNumber {
                    literal: literal.clone(),
                    fragment: input.trim().to_string(),
                })?;
            tokens.push(Token::Number(value));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            let token = match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                ',' => Token::Comma,
                '\'' => Token::Prime,
                other => {
                    if let Some(d) = Delimiter::from_open(other) {
                        Token::Open(d)
                    } else if let Some(d) = Delimiter::from_close(other) {
                        Token::Close(d)
                    } else {
                        return Err(ParseError::UnexpectedCharacter {
                            found: other,
                            fragment: input.trim().to_string(),
                        });
                    }
                }
            };
            tokens.push(token);
            chars.next();
        }
    }
    Ok(tokens)
}

/// Matches `[t]` or `(t)` at the start of `tokens`, returning the number of
/// tokens consumed.
pub fn match_time_access(tokens: &[Token]) -> Option<usize> {
    match tokens {
        [Token::Open(open), Token::Identifier(arg), Token::Close(close), ..]
            if arg == "t"
                && open == close
                && matches!(open, Delimiter::Paren | Delimiter::Bracket) =>
        {
            Some(3)
        }
        _ => None,
    }
}

/// Matches the explicit derivative `D(x[t], t)` (or `D[x[t], t]`) at the start
/// of `tokens`. Returns the variable name and the number of tokens consumed.
pub fn match_explicit_derivative(tokens: &[Token]) -> Option<(String, usize)> {
    let [Token::Identifier(d), Token::Open(open), Token::Identifier(name), rest @ ..] = tokens else {
        return None;
    };
    if d != "D" || !matches!(open, Delimiter::Paren | Delimiter::Bracket) {
        return None;
    }
    let access = match_time_access(rest)?;
    match &rest[access..] {
        [Token::Comma, Token::Identifier(arg), Token::Close(close), ..] if arg == "t" && close == open => {
            Some((name.clone(), 3 + access + 3))
        }
        _ => None,
    }
}

/// Matches the primed derivative `x'[t]` / `x'(t)` at the start of `tokens`.
pub fn match_primed_derivative(tokens: &[Token]) -> Option<(String, usize)> {
    let [Token::Identifier(name), Token::Prime, rest @ ..] = tokens else {
        return None;
    };
    let access = match_time_access(rest)?;
    Some((name.clone(), 2 + access))
}

/// Matches the plain access `x[t]` / `x(t)` at the start of `tokens`.
pub fn match_state_access(tokens: &[Token]) -> Option<(String, usize)> {
    let [Token::Identifier(name), rest @ ..] = tokens else {
        return None;
    };
    let access = match_time_access(rest)?;
    Some((name.clone(), 1 + access))
}
