//! The math sub-language: integer expressions for `math`, `sleep`, and the
//! `list_index` / `list_slice` index fields.
//!
//! Supports:
//! - Integer arithmetic: `+`, `-`, `*`, `/`, `%` (division truncates toward
//!   zero, modulo takes the sign of the dividend)
//! - Unary minus and parentheses
//! - Functions: `length(name)`, `min(...)`, `max(...)`, `round(expr)`,
//!   `sign(expr)`
//!
//! Does NOT support:
//! - Floating point — every result is an i64
//! - Wrapping arithmetic — overflow is an error (checked ops throughout)
//!
//! Input is interpolated against the store before evaluation.

use skein_types::{Error, Result, Value};

use crate::interp::interpolate;
use crate::store::InsertStore;

/// Interpolate and evaluate a math expression string.
///
/// # Example
/// ```ignore
/// let mut store = InsertStore::new();
/// store.set("xs", Value::List(vec![Value::Int(10), Value::Int(20)]));
/// assert_eq!(eval_math(&store, "max(1,2,3) + length(xs)")?, 5);
/// ```
pub fn eval_math(store: &InsertStore, input: &str) -> Result<i64> {
    let expr = interpolate(store, input)?;
    eval_expr_str(&expr, store)
}

fn eval_expr_str(expr: &str, store: &InsertStore) -> Result<i64> {
    let mut parser = MathParser::new(expr, store);
    let value = parser.parse_expr()?;
    parser.expect_end()?;
    Ok(value)
}

fn math_err(msg: impl Into<String>) -> Error {
    Error::Math(msg.into())
}

/// Simple recursive descent parser for integer expressions.
struct MathParser<'a> {
    input: &'a str,
    pos: usize,
    store: &'a InsertStore,
}

impl<'a> MathParser<'a> {
    fn new(input: &'a str, store: &'a InsertStore) -> Self {
        Self { input, pos: 0, store }
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.input.len() {
            let ch = self.input.as_bytes()[self.pos];
            if ch == b' ' || ch == b'\t' {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace();
        self.input[self.pos..].chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        self.skip_whitespace();
        let ch = self.input[self.pos..].chars().next()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn expect_end(&mut self) -> Result<()> {
        self.skip_whitespace();
        if self.pos < self.input.len() {
            return Err(math_err(format!(
                "unexpected characters at end of expression: {:?}",
                &self.input[self.pos..]
            )));
        }
        Ok(())
    }

    /// Parse an expression: handles + and - (lowest precedence)
    fn parse_expr(&mut self) -> Result<i64> {
        let mut left = self.parse_term()?;

        loop {
            match self.peek() {
                Some('+') => {
                    self.advance();
                    let right = self.parse_term()?;
                    left = left
                        .checked_add(right)
                        .ok_or_else(|| math_err("overflow in addition"))?;
                }
                Some('-') => {
                    self.advance();
                    let right = self.parse_term()?;
                    left = left
                        .checked_sub(right)
                        .ok_or_else(|| math_err("overflow in subtraction"))?;
                }
                _ => break,
            }
        }

        Ok(left)
    }

    /// Parse a term: handles * / % (higher precedence)
    fn parse_term(&mut self) -> Result<i64> {
        let mut left = self.parse_unary()?;

        loop {
            match self.peek() {
                Some('*') => {
                    self.advance();
                    let right = self.parse_unary()?;
                    left = left
                        .checked_mul(right)
                        .ok_or_else(|| math_err("overflow in multiplication"))?;
                }
                Some('/') => {
                    self.advance();
                    let right = self.parse_unary()?;
                    if right == 0 {
                        return Err(math_err("division by zero"));
                    }
                    left = left
                        .checked_div(right)
                        .ok_or_else(|| math_err("overflow in division"))?;
                }
                Some('%') => {
                    self.advance();
                    let right = self.parse_unary()?;
                    if right == 0 {
                        return Err(math_err("modulo by zero"));
                    }
                    left = left
                        .checked_rem(right)
                        .ok_or_else(|| math_err("overflow in modulo"))?;
                }
                _ => break,
            }
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<i64> {
        match self.peek() {
            Some('-') => {
                self.advance();
                let val = self.parse_unary()?;
                val.checked_neg().ok_or_else(|| math_err("overflow in negation"))
            }
            _ => self.parse_primary(),
        }
    }

    /// Parse primary: numbers, function calls, parenthesized expressions
    fn parse_primary(&mut self) -> Result<i64> {
        match self.peek() {
            Some('(') => {
                self.advance();
                let val = self.parse_expr()?;
                match self.peek() {
                    Some(')') => {
                        self.advance();
                        Ok(val)
                    }
                    _ => Err(math_err("expected ')'")),
                }
            }
            Some(c) if c.is_ascii_digit() => self.parse_number(),
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                let name = self.parse_identifier()?;
                if self.peek() != Some('(') {
                    return Err(math_err(format!("expected '(' after '{name}'")));
                }
                self.advance();
                let inner = self.capture_until_close()?;
                self.eval_function(&name, &inner)
            }
            Some(c) => Err(math_err(format!("unexpected character: {c:?}"))),
            None => Err(math_err("unexpected end of expression")),
        }
    }

    fn parse_number(&mut self) -> Result<i64> {
        self.skip_whitespace();
        let start = self.pos;
        while self.pos < self.input.len() {
            let ch = self.input.as_bytes()[self.pos];
            if ch.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }
        let num_str = &self.input[start..self.pos];
        num_str
            .parse()
            .map_err(|_| math_err(format!("invalid number '{num_str}'")))
    }

    fn parse_identifier(&mut self) -> Result<String> {
        self.skip_whitespace();
        let start = self.pos;
        while self.pos < self.input.len() {
            let ch = self.input.as_bytes()[self.pos];
            if ch.is_ascii_alphanumeric() || ch == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(math_err("expected identifier"));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    /// Capture the raw text up to the matching `)`, consuming it.
    ///
    /// Function arguments are captured raw because `length`/`min`/`max` may
    /// take an insert *name* that is not itself an expression.
    fn capture_until_close(&mut self) -> Result<String> {
        let start = self.pos;
        let mut depth = 1;
        for (offset, ch) in self.input[start..].char_indices() {
            match ch {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        let inner = self.input[start..start + offset].to_string();
                        self.pos = start + offset + 1;
                        return Ok(inner);
                    }
                }
                _ => {}
            }
        }
        Err(math_err("unclosed '(' in function call"))
    }

    fn eval_function(&self, name: &str, inner: &str) -> Result<i64> {
        match name {
            "round" => eval_expr_str(inner, self.store),
            "sign" => Ok(eval_expr_str(inner, self.store)?.signum()),
            "length" => {
                let key = inner.trim();
                match self.store.get(key)? {
                    Value::List(items) => Ok(items.len() as i64),
                    Value::String(s) => Ok(s.chars().count() as i64),
                    other => Err(math_err(format!(
                        "length() expects a list or string, got {}",
                        other.to_display()
                    ))),
                }
            }
            "min" => self.eval_min_max(inner, true),
            "max" => self.eval_min_max(inner, false),
            _ => Err(math_err(format!("unknown function '{name}'"))),
        }
    }

    /// `min`/`max` over comma-separated sub-expressions, or over a single
    /// insert name holding a list of integers.
    fn eval_min_max(&self, inner: &str, is_min: bool) -> Result<i64> {
        let parts = split_top_level_commas(inner);
        if parts.iter().all(|p| p.trim().is_empty()) {
            return Err(math_err("min/max requires at least one value"));
        }

        let evaluated: Result<Vec<i64>> = parts
            .iter()
            .map(|p| eval_expr_str(p, self.store))
            .collect();
        let nums = match evaluated {
            Ok(nums) => nums,
            Err(err) => {
                // A single non-expression argument names a list insert.
                if parts.len() != 1 {
                    return Err(err);
                }
                let value = self.store.get(parts[0].trim())?;
                let items = value
                    .as_list()
                    .ok_or_else(|| math_err("min/max expects numbers or a list insert"))?;
                if items.is_empty() {
                    return Err(math_err("min/max list is empty"));
                }
                items.iter().map(int_item).collect::<Result<Vec<_>>>()?
            }
        };

        let reduced = if is_min {
            nums.into_iter().min()
        } else {
            nums.into_iter().max()
        };
        reduced.ok_or_else(|| math_err("min/max requires at least one value"))
    }
}

fn int_item(value: &Value) -> Result<i64> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Float(f) if *f == f.trunc() && f.is_finite() => Ok(*f as i64),
        other => Err(math_err(format!(
            "min/max list must contain integers, got {}",
            other.to_display()
        ))),
    }
}

fn split_top_level_commas(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0;
    for ch in s.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth -= 1;
                current.push(ch);
            }
            ',' if depth == 0 => {
                parts.push(current);
                current = String::new();
            }
            _ => current.push(ch),
        }
    }
    parts.push(current);
    parts
}
