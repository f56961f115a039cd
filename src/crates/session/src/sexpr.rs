//! Minimal s-expression grammar for engine commands and replies.
//!
//! Replies are sequences of expressions such as `(("tran1" "tran") ("ac1" "ac"))`,
//! a bare value like `1.5e-06`, or a quoted string. Quoted strings support `\"`
//! and `\\` escapes; any other run of non-space, non-paren characters is an atom.

use std::fmt;

use thiserror::Error;

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Double-quoted string with escapes resolved.
    Str(String),
    /// Bare token such as a symbol, number, `t` or `nil`.
    Atom(String),
    List(Vec<Expr>),
}

impl Expr {
    /// Text of a string or atom.
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Expr::Str(text) | Expr::Atom(text) => Some(text),
            Expr::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Expr]> {
        match self {
            Expr::List(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Str(text) => write!(f, "{}", quote(text)),
            Expr::Atom(text) => f.write_str(text),
            Expr::List(items) => {
                f.write_str("(")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unterminated string starting at byte {0}")]
    UnterminatedString(usize),
    #[error("unexpected `)` at byte {0}")]
    UnexpectedClose(usize),
    #[error("missing `)` for list opened at byte {0}")]
    UnclosedList(usize),
}

/// True when every `)` closes an earlier `(` and nothing is left open.
///
/// Parentheses inside string literals do not count; an unterminated literal is unbalanced.
pub fn is_balanced(text: &str) -> bool {
    let mut depth: usize = 0;
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '(' => depth += 1,
            ')' => match depth.checked_sub(1) {
                Some(next) => depth = next,
                None => return false,
            },
            '"' => loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => {
                        chars.next();
                    }
                    Some(_) => {}
                    None => return false,
                }
            },
            _ => {}
        }
    }
    depth == 0
}

/// Render a string literal in engine syntax.
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for ch in text.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

/// Parse every top-level expression in `input`.
pub fn parse(input: &str) -> Result<Vec<Expr>, ParseError> {
    let mut parser = Parser {
        input,
        chars: input.char_indices().peekable(),
    };
    let mut exprs = Vec::new();
    while let Some(expr) = parser.next_expr()? {
        exprs.push(expr);
    }
    Ok(exprs)
}

struct Parser<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Parser<'a> {
    fn skip_whitespace(&mut self) {
        while matches!(self.chars.peek(), Some((_, ch)) if ch.is_whitespace()) {
            self.chars.next();
        }
    }

    fn next_expr(&mut self) -> Result<Option<Expr>, ParseError> {
        self.skip_whitespace();
        let Some(&(start, ch)) = self.chars.peek() else {
            return Ok(None);
        };
        match ch {
            '(' => {
                self.chars.next();
                self.list(start).map(Some)
            }
            ')' => Err(ParseError::UnexpectedClose(start)),
            '"' => {
                self.chars.next();
                self.string(start).map(Some)
            }
            _ => Ok(Some(self.atom(start))),
        }
    }

    fn list(&mut self, start: usize) -> Result<Expr, ParseError> {
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.chars.peek() {
                None => return Err(ParseError::UnclosedList(start)),
                Some((_, ')')) => {
                    self.chars.next();
                    return Ok(Expr::List(items));
                }
                Some(_) => {
                    if let Some(expr) = self.next_expr()? {
                        items.push(expr);
                    }
                }
            }
        }
    }

    fn string(&mut self, start: usize) -> Result<Expr, ParseError> {
        let mut text = String::new();
        while let Some((_, ch)) = self.chars.next() {
            match ch {
                '"' => return Ok(Expr::Str(text)),
                '\\' => match self.chars.next() {
                    Some((_, escaped)) => text.push(escaped),
                    None => break,
                },
                other => text.push(other),
            }
        }
        Err(ParseError::UnterminatedString(start))
    }

    fn atom(&mut self, start: usize) -> Expr {
        let mut end = self.input.len();
        while let Some(&(idx, ch)) = self.chars.peek() {
            if ch.is_whitespace() || ch == '(' || ch == ')' || ch == '"' {
                end = idx;
                break;
            }
            self.chars.next();
        }
        Expr::Atom(self.input[start..end].to_string())
    }
}

/// Collect every `(name value)` pair whose name is a quoted string, depth first.
pub fn name_value_pairs(exprs: &[Expr]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for expr in exprs {
        collect_pairs(expr, &mut pairs);
    }
    pairs
}

fn collect_pairs(expr: &Expr, pairs: &mut Vec<(String, String)>) {
    let Some(items) = expr.as_list() else {
        return;
    };
    if let [Expr::Str(name), value] = items {
        if let Some(value) = value.as_scalar() {
            pairs.push((name.clone(), value.to_string()));
            return;
        }
    }
    for item in items {
        collect_pairs(item, pairs);
    }
}

/// Collect every quoted string, depth first.
pub fn strings(exprs: &[Expr]) -> Vec<String> {
    let mut out = Vec::new();
    for expr in exprs {
        collect_strings(expr, &mut out);
    }
    out
}

fn collect_strings(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Str(text) => out.push(text.clone()),
        Expr::Atom(_) => {}
        Expr::List(items) => items.iter().for_each(|item| collect_strings(item, out)),
    }
}

/// The last top-level scalar, which is how the engine prints a single value.
pub fn last_scalar(exprs: &[Expr]) -> Option<&str> {
    exprs.iter().rev().find_map(Expr::as_scalar)
}
