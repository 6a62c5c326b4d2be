use crate::domain::Value;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareKind {
    Equal,
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,
}

impl CompareKind {
    pub fn glyph(self, negate: bool) -> &'static str {
        match (self, negate) {
            (CompareKind::Equal, false) => "==",
            (CompareKind::Equal, true) => "!=",
            (CompareKind::Less, false) => "<",
            (CompareKind::Less, true) => "!<",
            (CompareKind::Greater, false) => ">",
            (CompareKind::Greater, true) => "!>",
            (CompareKind::LessOrEqual, false) => "<=",
            (CompareKind::LessOrEqual, true) => "!<=",
            (CompareKind::GreaterOrEqual, false) => ">=",
            (CompareKind::GreaterOrEqual, true) => "!>=",
        }
    }

    pub fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareKind::Equal => ordering == Ordering::Equal,
            CompareKind::Less => ordering == Ordering::Less,
            CompareKind::Greater => ordering == Ordering::Greater,
            CompareKind::LessOrEqual => ordering != Ordering::Greater,
            CompareKind::GreaterOrEqual => ordering != Ordering::Less,
        }
    }
}

/// Result of comparing two concrete values.
#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    /// The pair has a total order.
    Ordered(Ordering),
    /// The pair only supports equality (bools, containers, bool vs number).
    EqualityOnly(bool),
    /// The pair cannot be compared at all.
    Incomparable(String),
}

/// Comparison plus the per-side coercion diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct Coerced {
    pub comparison: Comparison,
    pub left: Option<Value>,
    pub right: Option<Value>,
    pub left_error: Option<String>,
    pub right_error: Option<String>,
}

impl Coerced {
    fn plain(comparison: Comparison) -> Self {
        Self {
            comparison,
            left: None,
            right: None,
            left_error: None,
            right_error: None,
        }
    }

    fn coerced_left(mut self, value: Value) -> Self {
        self.left = Some(value);
        self
    }

    fn coerced_right(mut self, value: Value) -> Self {
        self.right = Some(value);
        self
    }

    fn left_failed(mut self, reason: String) -> Self {
        self.left_error = Some(reason);
        self
    }

    fn right_failed(mut self, reason: String) -> Self {
        self.right_error = Some(reason);
        self
    }

    fn swap(self) -> Self {
        let comparison = match self.comparison {
            Comparison::Ordered(ordering) => Comparison::Ordered(ordering.reverse()),
            other => other,
        };
        Self {
            comparison,
            left: self.right,
            right: self.left,
            left_error: self.right_error,
            right_error: self.left_error,
        }
    }
}

fn incomparable(left: &Value, right: &Value) -> Comparison {
    Comparison::Incomparable(format!("cannot compare {} with {}", left.kind(), right.kind()))
}

fn float_order(a: f64, b: f64) -> Comparison {
    a.partial_cmp(&b)
        .map(Comparison::Ordered)
        .unwrap_or_else(|| Comparison::Incomparable(format!("cannot order {a} and {b}")))
}

/// Ordered comparison between two numbers, widening as needed.
fn numeric(left: &Value, right: &Value) -> Comparison {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Comparison::Ordered(a.cmp(b)),
        (Value::Float(a), Value::Float(b)) => float_order(*a, *b),
        (Value::Decimal(a), Value::Decimal(b)) => Comparison::Ordered(a.cmp(b)),
        (Value::Int(a), Value::Float(b)) => float_order(*a as f64, *b),
        (Value::Float(a), Value::Int(b)) => float_order(*a, *b as f64),
        (Value::Int(a), Value::Decimal(b)) => Comparison::Ordered(Decimal::from(*a).cmp(b)),
        (Value::Decimal(a), Value::Int(b)) => Comparison::Ordered(a.cmp(&Decimal::from(*b))),
        (Value::Float(a), Value::Decimal(b)) => match Decimal::from_f64(*a) {
            Some(a) => Comparison::Ordered(a.cmp(b)),
            None => Comparison::Incomparable(format!("{a} has no decimal representation")),
        },
        (Value::Decimal(a), Value::Float(b)) => match Decimal::from_f64(*b) {
            Some(b) => Comparison::Ordered(a.cmp(&b)),
            None => Comparison::Incomparable(format!("{b} has no decimal representation")),
        },
        _ => incomparable(left, right),
    }
}

/// Parse `text` into the numeric family of `target`.
fn parse_like(text: &str, target: &Value) -> Result<Value, String> {
    let trimmed = text.trim();
    let parsed = match target {
        Value::Int(_) => trimmed
            .parse::<i64>()
            .map(Value::Int)
            .or_else(|_| trimmed.parse::<f64>().map(Value::Float))
            .ok(),
        Value::Float(_) => trimmed.parse::<f64>().map(Value::Float).ok(),
        Value::Decimal(_) => Decimal::from_str(trimmed)
            .or_else(|_| Decimal::from_scientific(trimmed))
            .map(Value::Decimal)
            .ok(),
        _ => None,
    };
    parsed.ok_or_else(|| format!("{text:?} is not a valid {}", target.kind()))
}

fn parse_bool(text: &str) -> Result<bool, String> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(format!("{text:?} is not a valid bool")),
    }
}

/// Dispatch on the concrete pair. Coercions happen on the string (or bool)
/// side and are recorded for the operand envelope.
pub fn compare(left: &Value, right: &Value) -> Coerced {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Coerced::plain(Comparison::Ordered(a.cmp(b))),
        (Value::Bytes(a), Value::Bytes(b)) => Coerced::plain(Comparison::Ordered(a.cmp(b))),
        (Value::Bytes(a), Value::String(b)) => {
            Coerced::plain(Comparison::Ordered(a.as_slice().cmp(b.as_bytes())))
        }
        (Value::String(_), Value::Bytes(_)) => compare(right, left).swap(),
        (Value::Bool(a), Value::Bool(b)) => Coerced::plain(Comparison::EqualityOnly(a == b)),
        (a, b) if a.is_number() && b.is_number() => Coerced::plain(numeric(a, b)),

        (Value::String(text), number) if number.is_number() => match parse_like(text, number) {
            Ok(parsed) => Coerced::plain(numeric(&parsed, number)).coerced_left(parsed),
            Err(reason) => Coerced::plain(Comparison::Incomparable(reason.clone())).left_failed(reason),
        },
        (number, Value::String(_)) if number.is_number() => compare(right, left).swap(),

        (Value::Bool(flag), number) if number.is_number() => {
            let truthy = !number.is_zero();
            Coerced::plain(Comparison::EqualityOnly(*flag == truthy)).coerced_right(Value::Bool(truthy))
        }
        (number, Value::Bool(_)) if number.is_number() => compare(right, left).swap(),

        (Value::Bool(flag), Value::String(text)) => match parse_bool(text) {
            Ok(parsed) => {
                Coerced::plain(Comparison::EqualityOnly(*flag == parsed)).coerced_right(Value::Bool(parsed))
            }
            Err(reason) => Coerced::plain(Comparison::Incomparable(reason.clone())).right_failed(reason),
        },
        (Value::String(_), Value::Bool(_)) => compare(right, left).swap(),

        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            Coerced::plain(Comparison::EqualityOnly(left == right))
        }
        _ => Coerced::plain(incomparable(left, right)),
    }
}
