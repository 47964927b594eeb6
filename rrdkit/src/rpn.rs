//! Stack-based postfix (RPN) expression evaluator.
//!
//! One evaluator serves three consumers: COMPUTE data sources at ingestion
//! time, CDEF-style derived series in export and graph requests, and
//! VDEF-style reductions of a whole series to a single [`Scalar`].
//!
//! Expressions are parsed and stack-checked up front, so evaluation never
//! fails: UNKNOWN operands, division by zero and other undefined results all
//! produce UNKNOWN (`NaN`).
//!
//! ```rust
//! use rrdkit::rpn::{Expression, RowContext};
//!
//! let expr = Expression::parse("a,b,+,2,/").unwrap();
//! let mut stack = Vec::new();
//! let value = expr.evaluate(RowContext::default(), |name| match name {
//!     "a" => 10.0,
//!     _ => 20.0,
//! }, &mut stack);
//! assert_eq!(value, 15.0);
//! ```

use std::fmt;

use crate::error::ExprError;

/// An operator recognised by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `a,b,+`
    Add,
    /// `a,b,-`
    Sub,
    /// `a,b,*`
    Mul,
    /// `a,b,/`; UNKNOWN when `b` is zero.
    Div,
    /// `a,b,%`; UNKNOWN when `b` is zero.
    Mod,
    /// `a,b,LT`
    Lt,
    /// `a,b,LE`
    Le,
    /// `a,b,GT`
    Gt,
    /// `a,b,GE`
    Ge,
    /// `a,b,EQ`
    Eq,
    /// `a,b,NE`
    Ne,
    /// `cond,then,else,IF`
    If,
    /// `a,b,AND`
    And,
    /// `a,b,OR`
    Or,
    /// `a,NOT`
    Not,
    /// `a,UN`: 1 if `a` is UNKNOWN.
    Un,
    /// `a,ISINF`
    IsInf,
    /// `a,b,MIN`
    Min,
    /// `a,b,MAX`
    Max,
    /// `a,lower,upper,LIMIT`
    Limit,
    /// `a,b,ADDNAN`: addition treating UNKNOWN as zero unless both are UNKNOWN.
    AddNan,
    /// Duplicate the top of the stack.
    Dup,
    /// Discard the top of the stack.
    Pop,
    /// Swap the two topmost values.
    Exch,
    /// Absolute value.
    Abs,
    /// Round down.
    Floor,
    /// Round up.
    Ceil,
    /// Square root.
    Sqrt,
    /// Push UNKNOWN.
    Unkn,
    /// Push positive infinity.
    Inf,
    /// Push negative infinity.
    NegInf,
    /// Push the timestamp of the current row.
    Time,
    /// Push this expression's result for the previous row.
    Prev,
    /// Push the 1-based number of the current row.
    Count,
}

impl Op {
    fn from_keyword(token: &str) -> Option<Self> {
        let op = match token {
            "+" => Self::Add,
            "-" => Self::Sub,
            "*" => Self::Mul,
            "/" => Self::Div,
            "%" => Self::Mod,
            "LT" => Self::Lt,
            "LE" => Self::Le,
            "GT" => Self::Gt,
            "GE" => Self::Ge,
            "EQ" => Self::Eq,
            "NE" => Self::Ne,
            "IF" => Self::If,
            "AND" => Self::And,
            "OR" => Self::Or,
            "NOT" => Self::Not,
            "UN" => Self::Un,
            "ISINF" => Self::IsInf,
            "MIN" => Self::Min,
            "MAX" => Self::Max,
            "LIMIT" => Self::Limit,
            "ADDNAN" => Self::AddNan,
            "DUP" => Self::Dup,
            "POP" => Self::Pop,
            "EXC" | "EXCH" => Self::Exch,
            "ABS" => Self::Abs,
            "FLOOR" => Self::Floor,
            "CEIL" => Self::Ceil,
            "SQRT" => Self::Sqrt,
            "UNKN" => Self::Unkn,
            "INF" => Self::Inf,
            "NEGINF" => Self::NegInf,
            "TIME" => Self::Time,
            "PREV" => Self::Prev,
            "COUNT" => Self::Count,
            _ => return None,
        };
        Some(op)
    }

    /// Returns `(pops, pushes)` for this operator.
    fn arity(self) -> (usize, usize) {
        match self {
            Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Div
            | Self::Mod
            | Self::Lt
            | Self::Le
            | Self::Gt
            | Self::Ge
            | Self::Eq
            | Self::Ne
            | Self::And
            | Self::Or
            | Self::Min
            | Self::Max
            | Self::AddNan => (2, 1),
            Self::If | Self::Limit => (3, 1),
            Self::Not | Self::Un | Self::IsInf | Self::Abs | Self::Floor | Self::Ceil | Self::Sqrt => {
                (1, 1)
            }
            Self::Dup => (1, 2),
            Self::Pop => (1, 0),
            Self::Exch => (2, 2),
            Self::Unkn | Self::Inf | Self::NegInf | Self::Time | Self::Prev | Self::Count => (0, 1),
        }
    }
}

/// One element of a parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// A numeric literal.
    Number(f64),
    /// A reference to a named series, scalar or data source.
    Name(String),
    /// An operator.
    Op(Op),
}

/// Per-row evaluation context.
#[derive(Debug, Clone, Copy)]
pub struct RowContext {
    /// End timestamp of the row being evaluated.
    pub timestamp: u64,
    /// This expression's result for the previous row.
    pub prev: f64,
    /// 1-based row number.
    pub count: u64,
}

impl Default for RowContext {
    fn default() -> Self {
        Self {
            timestamp: 0,
            prev: f64::NAN,
            count: 1,
        }
    }
}

/// A parsed, stack-checked RPN expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    text: String,
    tokens: Vec<Token>,
}

impl Expression {
    /// Parses and validates a comma-separated postfix expression.
    ///
    /// # Errors
    ///
    /// Returns [`ExprError::InvalidExpression`] for empty expressions, unknown
    /// tokens, stack underflow, or an expression that does not leave exactly
    /// one value on the stack.
    pub fn parse(text: &str) -> Result<Self, ExprError> {
        if text.trim().is_empty() {
            return Err(ExprError::invalid(text, "expression is empty"));
        }

        let mut tokens = Vec::new();
        let mut depth = 0usize;

        for raw in text.split(',') {
            let raw = raw.trim();
            let token = parse_token(text, raw)?;

            match &token {
                Token::Number(_) | Token::Name(_) => depth += 1,
                Token::Op(op) => {
                    let (pops, pushes) = op.arity();
                    if depth < pops {
                        return Err(ExprError::invalid(
                            text,
                            format!("stack underflow at '{raw}'"),
                        ));
                    }
                    depth = depth - pops + pushes;
                }
            }
            tokens.push(token);
        }

        if depth != 1 {
            return Err(ExprError::invalid(
                text,
                format!("expression leaves {depth} values on the stack"),
            ));
        }

        Ok(Self {
            text: text.to_string(),
            tokens,
        })
    }

    /// Returns the original expression text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns the parsed tokens.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Iterates over every name referenced by the expression, in order of
    /// appearance (duplicates included).
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().filter_map(|token| match token {
            Token::Name(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Returns true if the expression reads `TIME`, `PREV` or `COUNT`.
    pub fn uses_row_context(&self) -> bool {
        self.tokens
            .iter()
            .any(|token| matches!(token, Token::Op(Op::Time | Op::Prev | Op::Count)))
    }

    /// Evaluates the expression for a single row.
    ///
    /// `lookup` resolves names to values. `stack` is scratch space reused
    /// across calls to avoid per-row allocation; it is cleared on entry.
    pub fn evaluate<F>(&self, ctx: RowContext, lookup: F, stack: &mut Vec<f64>) -> f64
    where
        F: Fn(&str) -> f64,
    {
        stack.clear();
        for token in &self.tokens {
            match token {
                Token::Number(value) => stack.push(*value),
                Token::Name(name) => stack.push(lookup(name)),
                Token::Op(op) => apply(*op, ctx, stack),
            }
        }
        stack.pop().unwrap_or(f64::NAN)
    }

    /// Evaluates the expression row by row over a time-aligned grid.
    ///
    /// Row `i` ends at `start + (i + 1) * step`. `lookup(name, row)` resolves
    /// a reference for one row.
    pub fn evaluate_series<F>(&self, start: u64, step: u64, rows: usize, lookup: F) -> Vec<f64>
    where
        F: Fn(&str, usize) -> f64,
    {
        let mut out = Vec::with_capacity(rows);
        let mut stack = Vec::with_capacity(self.tokens.len());
        let mut prev = f64::NAN;

        for row in 0..rows {
            let ctx = RowContext {
                timestamp: row_timestamp(start, step, row),
                prev,
                count: row as u64 + 1,
            };
            let value = self.evaluate(ctx, |name| lookup(name, row), &mut stack);
            out.push(value);
            prev = value;
        }
        out
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn parse_token(text: &str, raw: &str) -> Result<Token, ExprError> {
    if raw.is_empty() {
        return Err(ExprError::invalid(text, "empty token"));
    }
    if let Some(op) = Op::from_keyword(raw) {
        return Ok(Token::Op(op));
    }

    let first = raw.chars().next().unwrap_or(' ');
    if (first.is_ascii_digit() || matches!(first, '-' | '+' | '.'))
        && let Ok(value) = raw.parse::<f64>()
    {
        return Ok(Token::Number(value));
    }

    if is_identifier(raw) {
        return Ok(Token::Name(raw.to_string()));
    }

    Err(ExprError::invalid(text, format!("unknown token '{raw}'")))
}

/// Returns true if `name` is a legal reference name.
pub(crate) fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && !name.starts_with('-')
}

#[inline]
fn row_timestamp(start: u64, step: u64, row: usize) -> u64 {
    start + (row as u64 + 1) * step
}

fn bool_value(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

fn apply(op: Op, ctx: RowContext, stack: &mut Vec<f64>) {
    // Parsing guarantees enough operands; `pop` falls back to UNKNOWN.
    let mut pop = || stack.pop().unwrap_or(f64::NAN);

    let result = match op {
        Op::Add => {
            let (b, a) = (pop(), pop());
            a + b
        }
        Op::Sub => {
            let (b, a) = (pop(), pop());
            a - b
        }
        Op::Mul => {
            let (b, a) = (pop(), pop());
            a * b
        }
        Op::Div => {
            let (b, a) = (pop(), pop());
            if b == 0.0 { f64::NAN } else { a / b }
        }
        Op::Mod => {
            let (b, a) = (pop(), pop());
            if b == 0.0 { f64::NAN } else { a % b }
        }
        Op::Lt | Op::Le | Op::Gt | Op::Ge | Op::Eq | Op::Ne => {
            let (b, a) = (pop(), pop());
            if a.is_nan() || b.is_nan() {
                f64::NAN
            } else {
                bool_value(match op {
                    Op::Lt => a < b,
                    Op::Le => a <= b,
                    Op::Gt => a > b,
                    Op::Ge => a >= b,
                    Op::Eq => a == b,
                    _ => a != b,
                })
            }
        }
        Op::If => {
            let (otherwise, then, cond) = (pop(), pop(), pop());
            if cond.is_nan() {
                f64::NAN
            } else if cond != 0.0 {
                then
            } else {
                otherwise
            }
        }
        Op::And | Op::Or => {
            let (b, a) = (pop(), pop());
            if a.is_nan() || b.is_nan() {
                f64::NAN
            } else if op == Op::And {
                bool_value(a != 0.0 && b != 0.0)
            } else {
                bool_value(a != 0.0 || b != 0.0)
            }
        }
        Op::Not => {
            let a = pop();
            if a.is_nan() { f64::NAN } else { bool_value(a == 0.0) }
        }
        Op::Un => bool_value(pop().is_nan()),
        Op::IsInf => bool_value(pop().is_infinite()),
        Op::Min | Op::Max => {
            let (b, a) = (pop(), pop());
            if a.is_nan() || b.is_nan() {
                f64::NAN
            } else if op == Op::Min {
                a.min(b)
            } else {
                a.max(b)
            }
        }
        Op::Limit => {
            let (upper, lower, a) = (pop(), pop(), pop());
            if a.is_nan() || lower.is_nan() || upper.is_nan() || a < lower || a > upper {
                f64::NAN
            } else {
                a
            }
        }
        Op::AddNan => {
            let (b, a) = (pop(), pop());
            match (a.is_nan(), b.is_nan()) {
                (true, true) => f64::NAN,
                (true, false) => b,
                (false, true) => a,
                (false, false) => a + b,
            }
        }
        Op::Dup => {
            let a = pop();
            stack.push(a);
            a
        }
        Op::Pop => {
            pop();
            return;
        }
        Op::Exch => {
            let (b, a) = (pop(), pop());
            stack.push(b);
            a
        }
        Op::Abs => pop().abs(),
        Op::Floor => pop().floor(),
        Op::Ceil => pop().ceil(),
        Op::Sqrt => pop().sqrt(),
        Op::Unkn => f64::NAN,
        Op::Inf => f64::INFINITY,
        Op::NegInf => f64::NEG_INFINITY,
        #[allow(clippy::cast_precision_loss)] // Epoch seconds fit in f64 mantissa
        Op::Time => ctx.timestamp as f64,
        Op::Prev => ctx.prev,
        #[allow(clippy::cast_precision_loss)]
        Op::Count => ctx.count as f64,
    };
    stack.push(result);
}

/// A whole-series reduction function (VDEF).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reducer {
    /// Largest known value, with its timestamp.
    Maximum,
    /// Smallest known value, with its timestamp.
    Minimum,
    /// Mean of known values.
    Average,
    /// Most recent known value, with its timestamp.
    Last,
    /// Oldest known value, with its timestamp.
    First,
    /// Sum of `value * step` over known rows (rate integrated over time).
    Total,
    /// Population standard deviation of known values.
    Stdev,
    /// Nearest-rank percentile (0..=100) of known values.
    Percent(f64),
}

/// The result of a whole-series reduction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scalar {
    /// The reduced value, `NaN` if the series had no known values.
    pub value: f64,
    /// Timestamp of the row the value was taken from, when meaningful.
    pub timestamp: Option<u64>,
}

impl Scalar {
    fn unknown() -> Self {
        Self {
            value: f64::NAN,
            timestamp: None,
        }
    }
}

/// A parsed VDEF expression: `series,REDUCER` or `series,p,PERCENT`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    text: String,
    series: String,
    reducer: Reducer,
}

impl Reduction {
    /// Parses a reduction expression.
    ///
    /// # Errors
    ///
    /// Returns [`ExprError::InvalidExpression`] if the expression does not
    /// have the form `name,REDUCER` / `name,p,PERCENT` or names an unknown
    /// reducer.
    pub fn parse(text: &str) -> Result<Self, ExprError> {
        let parts: Vec<&str> = text.split(',').map(str::trim).collect();

        let (series, reducer) = match parts.as_slice() {
            [series, keyword] => {
                let reducer = match *keyword {
                    "MAXIMUM" => Reducer::Maximum,
                    "MINIMUM" => Reducer::Minimum,
                    "AVERAGE" => Reducer::Average,
                    "LAST" => Reducer::Last,
                    "FIRST" => Reducer::First,
                    "TOTAL" => Reducer::Total,
                    "STDEV" => Reducer::Stdev,
                    other => {
                        return Err(ExprError::invalid(
                            text,
                            format!("unknown reducer '{other}'"),
                        ));
                    }
                };
                (*series, reducer)
            }
            [series, percent, "PERCENT"] => {
                let p: f64 = percent.parse().map_err(|_| {
                    ExprError::invalid(text, format!("invalid percentile '{percent}'"))
                })?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(ExprError::invalid(text, "percentile must be within 0..=100"));
                }
                (*series, Reducer::Percent(p))
            }
            _ => {
                return Err(ExprError::invalid(
                    text,
                    "expected 'series,REDUCER' or 'series,p,PERCENT'",
                ));
            }
        };

        if !is_identifier(series) {
            return Err(ExprError::invalid(text, format!("invalid series name '{series}'")));
        }

        Ok(Self {
            text: text.to_string(),
            series: series.to_string(),
            reducer,
        })
    }

    /// Returns the name of the series being reduced.
    pub fn series(&self) -> &str {
        &self.series
    }

    /// Returns the reducer.
    pub fn reducer(&self) -> Reducer {
        self.reducer
    }

    /// Returns the original expression text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Reduces a time-aligned series whose row `i` ends at
    /// `start + (i + 1) * step`.
    #[allow(clippy::cast_precision_loss)]
    pub fn reduce(&self, values: &[f64], start: u64, step: u64) -> Scalar {
        let known = || {
            values
                .iter()
                .enumerate()
                .filter(|(_, v)| !v.is_nan())
                .map(|(i, v)| (i, *v))
        };
        let at = |(row, value): (usize, f64)| Scalar {
            value,
            timestamp: Some(row_timestamp(start, step, row)),
        };

        match self.reducer {
            Reducer::Maximum => known()
                .fold(None, |best: Option<(usize, f64)>, cur| match best {
                    Some(b) if b.1 >= cur.1 => Some(b),
                    _ => Some(cur),
                })
                .map_or_else(Scalar::unknown, at),
            Reducer::Minimum => known()
                .fold(None, |best: Option<(usize, f64)>, cur| match best {
                    Some(b) if b.1 <= cur.1 => Some(b),
                    _ => Some(cur),
                })
                .map_or_else(Scalar::unknown, at),
            Reducer::First => known().next().map_or_else(Scalar::unknown, at),
            Reducer::Last => known().last().map_or_else(Scalar::unknown, at),
            Reducer::Average => {
                let (sum, count) = known().fold((0.0, 0usize), |(s, c), (_, v)| (s + v, c + 1));
                if count == 0 {
                    Scalar::unknown()
                } else {
                    Scalar {
                        value: sum / count as f64,
                        timestamp: None,
                    }
                }
            }
            Reducer::Total => {
                let mut any = false;
                let sum: f64 = known()
                    .map(|(_, v)| {
                        any = true;
                        v * step as f64
                    })
                    .sum();
                if any {
                    Scalar {
                        value: sum,
                        timestamp: None,
                    }
                } else {
                    Scalar::unknown()
                }
            }
            Reducer::Stdev => {
                let samples: Vec<f64> = known().map(|(_, v)| v).collect();
                if samples.is_empty() {
                    return Scalar::unknown();
                }
                let n = samples.len() as f64;
                let mean = samples.iter().sum::<f64>() / n;
                let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                Scalar {
                    value: variance.sqrt(),
                    timestamp: None,
                }
            }
            Reducer::Percent(p) => {
                let mut samples: Vec<f64> = known().map(|(_, v)| v).collect();
                if samples.is_empty() {
                    return Scalar::unknown();
                }
                samples.sort_by(f64::total_cmp);
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let rank = ((p / 100.0) * samples.len() as f64).ceil() as usize;
                let index = rank.saturating_sub(1).min(samples.len() - 1);
                Scalar {
                    value: samples[index],
                    timestamp: None,
                }
            }
        }
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
