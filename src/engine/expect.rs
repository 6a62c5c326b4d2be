use super::compare::{compare, CompareKind, Comparison};
use super::context::Context;
use super::error::{Operand, ResolveError, UnmetError};
use super::resolve::resolve;
use crate::domain::{Frame, Value, ValueKind};
use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// Outcome of an expectation that evaluated cleanly.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Met,
    Unmet(Box<UnmetError>),
}

type Predicate = Arc<dyn Fn(&Context) -> Result<bool, String> + Send + Sync>;

#[derive(Clone)]
enum Check {
    Status(Value),
    Compare {
        left: Value,
        right: Value,
        kind: CompareKind,
        negate: bool,
    },
    Match {
        value: Value,
        pattern: String,
        regex: Result<Regex, String>,
    },
    Type {
        value: Value,
        kind: ValueKind,
    },
    Nil {
        value: Value,
        negate: bool,
    },
    Len {
        value: Value,
        expected: Value,
    },
    Properties {
        value: Value,
        keys: Vec<String>,
        exclusive: bool,
    },
    Predicate(Predicate),
}

/// A named predicate over the run context.
///
/// Asserted expectations report and let the method continue; required ones
/// (or any expectation under fail-fast) terminate the method when unmet.
#[derive(Clone)]
pub struct Expectation {
    name: String,
    frame: Frame,
    required: bool,
    check: Check,
}

impl fmt::Debug for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expectation")
            .field("name", &self.name)
            .field("frame", &self.frame)
            .field("required", &self.required)
            .finish()
    }
}

impl Expectation {
    #[track_caller]
    fn new(name: impl Into<String>, check: Check) -> Self {
        Self {
            name: name.into(),
            frame: Frame::caller(),
            required: false,
            check,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// Values the check resolves.
    pub fn operands(&self) -> Vec<&Value> {
        match &self.check {
            Check::Status(expected) => vec![expected],
            Check::Compare { left, right, .. } => vec![left, right],
            Check::Len { value, expected } => vec![value, expected],
            Check::Match { value, .. }
            | Check::Type { value, .. }
            | Check::Nil { value, .. }
            | Check::Properties { value, .. } => vec![value],
            Check::Predicate(_) => Vec::new(),
        }
    }

    fn unmet(&self, message: impl Into<String>) -> UnmetError {
        UnmetError::new(self.name.clone(), self.frame, message)
    }

    /// Evaluate against the context. Resolution problems are errors, not
    /// unmet outcomes.
    pub fn check(&self, ctx: &Context) -> Result<Verdict, ResolveError> {
        match &self.check {
            Check::Status(expected) => self.check_status(expected, ctx),
            Check::Compare {
                left,
                right,
                kind,
                negate,
            } => self.check_compare(left, right, *kind, *negate, ctx),
            Check::Match {
                value,
                pattern,
                regex,
            } => {
                let regex = regex.as_ref().map_err(|reason| ResolveError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: reason.clone(),
                })?;
                let resolved = resolve(value, ctx)?;
                let text = resolved.to_text();
                if regex.is_match(&text) {
                    return Ok(Verdict::Met);
                }
                Ok(self.verdict_unmet(
                    format!("{resolved} does not match /{pattern}/"),
                    Operand::declared(&Value::from(pattern.as_str())),
                    Operand::declared(value).with_resolved(resolved),
                ))
            }
            Check::Type { value, kind } => {
                let resolved = resolve(value, ctx)?;
                if resolved.kind() == *kind {
                    return Ok(Verdict::Met);
                }
                Ok(self.verdict_unmet(
                    format!("expected type {kind}, got {}", resolved.kind()),
                    Operand::declared(&Value::from(kind.to_string())),
                    Operand::declared(value).with_resolved(resolved),
                ))
            }
            Check::Nil { value, negate } => {
                let resolved = resolve(value, ctx)?;
                if resolved.is_null() != *negate {
                    return Ok(Verdict::Met);
                }
                let message = if *negate {
                    "expected a value, got null".to_string()
                } else {
                    format!("expected null, got {resolved}")
                };
                Ok(self.verdict_unmet(
                    message,
                    Operand::declared(&Value::Null),
                    Operand::declared(value).with_resolved(resolved),
                ))
            }
            Check::Len { value, expected } => {
                let want = as_integer(&resolve(expected, ctx)?, "length")?;
                let resolved = resolve(value, ctx)?;
                let got = resolved.len().ok_or_else(|| ResolveError::Conversion {
                    value: resolved.to_string(),
                    target: "length",
                })?;
                if i64::try_from(got).ok() == Some(want) {
                    return Ok(Verdict::Met);
                }
                let mut actual = Operand::declared(value).with_resolved(resolved);
                actual.coerced = Some(Value::from(got));
                Ok(self.verdict_unmet(
                    format!("expected length {want}, got {got}"),
                    Operand::declared(expected).with_resolved(Value::Int(want)),
                    actual,
                ))
            }
            Check::Properties {
                value,
                keys,
                exclusive,
            } => self.check_properties(value, keys, *exclusive, ctx),
            Check::Predicate(predicate) => match predicate(ctx) {
                Ok(true) => Ok(Verdict::Met),
                Ok(false) => Ok(Verdict::Unmet(Box::new(self.unmet("predicate returned false")))),
                Err(reason) => Err(ResolveError::Callback(reason)),
            },
        }
    }

    fn verdict_unmet(&self, message: String, expected: Operand, actual: Operand) -> Verdict {
        Verdict::Unmet(Box::new(self.unmet(message).with_expected(expected, actual)))
    }

    fn check_status(&self, expected: &Value, ctx: &Context) -> Result<Verdict, ResolveError> {
        let resolved = resolve(expected, ctx)?;
        let want = as_integer(&resolved, "status code")?;
        let got = ctx.status().ok_or(ResolveError::NoResponse)?;
        if i64::from(got) == want {
            return Ok(Verdict::Met);
        }

        let mut expected_operand = Operand::declared(expected).with_resolved(resolved);
        expected_operand.coerced = Some(Value::Int(want));
        Ok(self.verdict_unmet(
            format!(
                "expected status {}, got {}",
                status_phrase(want),
                status_phrase(i64::from(got))
            ),
            expected_operand,
            Operand::declared(&Value::from(got)).with_resolved(Value::from(got)),
        ))
    }

    fn check_compare(
        &self,
        left: &Value,
        right: &Value,
        kind: CompareKind,
        negate: bool,
        ctx: &Context,
    ) -> Result<Verdict, ResolveError> {
        let resolved_left = resolve(left, ctx)?;
        let resolved_right = resolve(right, ctx)?;
        let glyph = kind.glyph(negate);

        let mut left_operand = Operand::declared(left).with_resolved(resolved_left.clone());
        let mut right_operand = Operand::declared(right).with_resolved(resolved_right.clone());
        let unmet = |message: String, left: Operand, right: Operand| -> Result<Verdict, ResolveError> {
            Ok(Verdict::Unmet(Box::new(
                self.unmet(message).with_comparison(glyph, left, right),
            )))
        };

        match (resolved_left.is_null(), resolved_right.is_null()) {
            (true, true) => {
                if kind != CompareKind::Equal {
                    return unmet(
                        format!("cannot order null {glyph} null"),
                        left_operand,
                        right_operand,
                    );
                }
                if negate {
                    return unmet("expected null != null".into(), left_operand, right_operand);
                }
                return Ok(Verdict::Met);
            }
            (true, false) | (false, true) => {
                if kind != CompareKind::Equal {
                    return unmet(
                        format!("cannot order {resolved_left} {glyph} {resolved_right}: one side is null"),
                        left_operand,
                        right_operand,
                    );
                }
                if negate {
                    return Ok(Verdict::Met);
                }
                return unmet(
                    format!("expected {resolved_left} == {resolved_right}"),
                    left_operand,
                    right_operand,
                );
            }
            (false, false) => {}
        }

        let coerced = compare(&resolved_left, &resolved_right);
        left_operand.coerced = coerced.left;
        left_operand.coercion_error = coerced.left_error;
        right_operand.coerced = coerced.right;
        right_operand.coercion_error = coerced.right_error;

        let holds = match coerced.comparison {
            Comparison::Ordered(ordering) => kind.holds(ordering),
            Comparison::EqualityOnly(equal) if kind == CompareKind::Equal => equal,
            Comparison::EqualityOnly(_) => {
                return unmet(
                    format!(
                        "cannot compare {} {glyph} {}: only equality is defined",
                        resolved_left.kind(),
                        resolved_right.kind()
                    ),
                    left_operand,
                    right_operand,
                );
            }
            Comparison::Incomparable(reason) => {
                return unmet(format!("cannot compare: {reason}"), left_operand, right_operand);
            }
        };

        if holds != negate {
            Ok(Verdict::Met)
        } else {
            unmet(
                format!("expected {resolved_left} {glyph} {resolved_right}"),
                left_operand,
                right_operand,
            )
        }
    }

    fn check_properties(
        &self,
        value: &Value,
        keys: &[String],
        exclusive: bool,
        ctx: &Context,
    ) -> Result<Verdict, ResolveError> {
        let resolved = resolve(value, ctx)?;
        let expected = Operand::declared(&Value::from(keys.to_vec()));
        let Some(map) = resolved.as_object() else {
            return Ok(self.verdict_unmet(
                format!("expected an object, got {}", resolved.kind()),
                expected,
                Operand::declared(value).with_resolved(resolved),
            ));
        };

        let missing: Vec<&str> = keys
            .iter()
            .filter(|key| !map.contains_key(key.as_str()))
            .map(String::as_str)
            .collect();
        let extra: Vec<&str> = if exclusive {
            map.keys()
                .filter(|key| !keys.contains(key))
                .map(String::as_str)
                .collect()
        } else {
            Vec::new()
        };
        if missing.is_empty() && extra.is_empty() {
            return Ok(Verdict::Met);
        }

        let mut problems = Vec::new();
        if !missing.is_empty() {
            problems.push(format!("missing properties {}", missing.join(", ")));
        }
        if !extra.is_empty() {
            problems.push(format!("unexpected properties {}", extra.join(", ")));
        }
        let message = problems.join("; ");
        Ok(self.verdict_unmet(message, expected, Operand::declared(value).with_resolved(resolved)))
    }
}

fn as_integer(value: &Value, target: &'static str) -> Result<i64, ResolveError> {
    let conversion = || ResolveError::Conversion {
        value: value.to_string(),
        target,
    };
    match value {
        Value::Int(number) => Ok(*number),
        Value::Float(number) if number.fract() == 0.0 && number.is_finite() => Ok(*number as i64),
        Value::Decimal(number) if number.fract().is_zero() => {
            rust_decimal::prelude::ToPrimitive::to_i64(number).ok_or_else(conversion)
        }
        Value::String(text) => text.trim().parse().map_err(|_| conversion()),
        _ => Err(conversion()),
    }
}

/// `404 Not Found`; unknown codes render bare.
fn status_phrase(code: i64) -> String {
    u16::try_from(code)
        .ok()
        .and_then(|code| http::StatusCode::from_u16(code).ok())
        .and_then(|status| status.canonical_reason())
        .map(|reason| format!("{code} {reason}"))
        .unwrap_or_else(|| code.to_string())
}

// ─── Constructors ────────────────────────────────────────────────────────────

/// Status code of the current response equals `code` (int, float or text).
#[track_caller]
pub fn expect_status(code: impl Into<Value>) -> Expectation {
    Expectation::new("expect status", Check::Status(code.into()))
}

#[track_caller]
fn comparator(
    name: &str,
    left: impl Into<Value>,
    right: impl Into<Value>,
    kind: CompareKind,
    negate: bool,
) -> Expectation {
    Expectation::new(
        name,
        Check::Compare {
            left: left.into(),
            right: right.into(),
            kind,
            negate,
        },
    )
}

#[track_caller]
pub fn expect_equal(left: impl Into<Value>, right: impl Into<Value>) -> Expectation {
    comparator("expect equal", left, right, CompareKind::Equal, false)
}

#[track_caller]
pub fn expect_not_equal(left: impl Into<Value>, right: impl Into<Value>) -> Expectation {
    comparator("expect not equal", left, right, CompareKind::Equal, true)
}

#[track_caller]
pub fn expect_less(left: impl Into<Value>, right: impl Into<Value>) -> Expectation {
    comparator("expect less", left, right, CompareKind::Less, false)
}

#[track_caller]
pub fn expect_greater(left: impl Into<Value>, right: impl Into<Value>) -> Expectation {
    comparator("expect greater", left, right, CompareKind::Greater, false)
}

#[track_caller]
pub fn expect_less_or_equal(left: impl Into<Value>, right: impl Into<Value>) -> Expectation {
    comparator("expect less or equal", left, right, CompareKind::LessOrEqual, false)
}

#[track_caller]
pub fn expect_greater_or_equal(left: impl Into<Value>, right: impl Into<Value>) -> Expectation {
    comparator("expect greater or equal", left, right, CompareKind::GreaterOrEqual, false)
}

/// Negated form of any comparator kind.
#[track_caller]
pub fn expect_not(kind: CompareKind, left: impl Into<Value>, right: impl Into<Value>) -> Expectation {
    comparator("expect not", left, right, kind, true)
}

/// The text form of `value` matches `pattern`. The pattern is compiled once,
/// here; an invalid pattern surfaces when the expectation is evaluated.
#[track_caller]
pub fn expect_match(value: impl Into<Value>, pattern: impl Into<String>) -> Expectation {
    let pattern = pattern.into();
    let regex = Regex::new(&pattern).map_err(|err| err.to_string());
    Expectation::new(
        "expect match",
        Check::Match {
            value: value.into(),
            pattern,
            regex,
        },
    )
}

#[track_caller]
pub fn expect_type(value: impl Into<Value>, kind: ValueKind) -> Expectation {
    Expectation::new(
        "expect type",
        Check::Type {
            value: value.into(),
            kind,
        },
    )
}

/// Same dynamic type as `sample`.
#[track_caller]
pub fn expect_type_of(value: impl Into<Value>, sample: impl Into<Value>) -> Expectation {
    expect_type(value, sample.into().kind())
}

#[track_caller]
pub fn expect_nil(value: impl Into<Value>) -> Expectation {
    Expectation::new(
        "expect nil",
        Check::Nil {
            value: value.into(),
            negate: false,
        },
    )
}

#[track_caller]
pub fn expect_not_nil(value: impl Into<Value>) -> Expectation {
    Expectation::new(
        "expect not nil",
        Check::Nil {
            value: value.into(),
            negate: true,
        },
    )
}

/// Length of a string (characters), bytes, array or object.
#[track_caller]
pub fn expect_len(value: impl Into<Value>, expected: impl Into<Value>) -> Expectation {
    Expectation::new(
        "expect len",
        Check::Len {
            value: value.into(),
            expected: expected.into(),
        },
    )
}

#[track_caller]
pub fn expect_has_properties<K: Into<String>>(
    value: impl Into<Value>,
    keys: impl IntoIterator<Item = K>,
) -> Expectation {
    Expectation::new(
        "expect has properties",
        Check::Properties {
            value: value.into(),
            keys: keys.into_iter().map(Into::into).collect(),
            exclusive: false,
        },
    )
}

#[track_caller]
pub fn expect_only_has_properties<K: Into<String>>(
    value: impl Into<Value>,
    keys: impl IntoIterator<Item = K>,
) -> Expectation {
    Expectation::new(
        "expect only has properties",
        Check::Properties {
            value: value.into(),
            keys: keys.into_iter().map(Into::into).collect(),
            exclusive: true,
        },
    )
}

/// Arbitrary predicate; `Err` is reported as a failure, not an unmet.
#[track_caller]
pub fn expect_that<F>(name: impl Into<String>, predicate: F) -> Expectation
where
    F: Fn(&Context) -> Result<bool, String> + Send + Sync + 'static,
{
    Expectation::new(name, Check::Predicate(Arc::new(predicate)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::object;
    use crate::engine::resolvables::{body, body_path, var};
    use bytes::Bytes;
    use serde_json::json;

    fn unmet(verdict: Verdict) -> UnmetError {
        match verdict {
            Verdict::Unmet(unmet) => *unmet,
            Verdict::Met => panic!("expected an unmet verdict"),
        }
    }

    fn ctx_with(status: u16, body: serde_json::Value) -> Context {
        let mut ctx = Context::detached();
        let response = http::Response::builder()
            .status(status)
            .body(Bytes::new())
            .expect("response");
        ctx.set_response(response, Value::from(body));
        ctx
    }

    #[test]
    fn mixed_numeric_equality() {
        let ctx = Context::detached();
        assert_eq!(expect_equal("42", 42).check(&ctx), Ok(Verdict::Met));

        let unmet = unmet(expect_equal("42", 43).check(&ctx).expect("check"));
        assert_eq!(unmet.comparator.as_deref(), Some("=="));
        let left = unmet.left.expect("left operand");
        let right = unmet.right.expect("right operand");
        assert_eq!(left.coerced, Some(Value::Int(42)));
        assert_eq!(right.resolved, Some(Value::Int(43)));
    }

    #[test]
    fn frames_point_at_the_declaration() {
        let expectation = expect_equal(1, 1);
        assert_eq!(expectation.frame().file, file!());
        assert_eq!(expectation.frame().line, line!() - 2);
    }

    #[test]
    fn negation_and_ordering() {
        let ctx = Context::detached();
        assert_eq!(expect_not_equal(1, 2).check(&ctx), Ok(Verdict::Met));
        assert_eq!(expect_less(1, 2.5).check(&ctx), Ok(Verdict::Met));
        assert_eq!(expect_greater_or_equal("10", 10).check(&ctx), Ok(Verdict::Met));
        assert_eq!(expect_not(CompareKind::Less, 3, 2).check(&ctx), Ok(Verdict::Met));
        let failed = unmet(expect_less_or_equal(3, 2).check(&ctx).expect("check"));
        assert_eq!(failed.message, "expected 3 <= 2");
    }

    #[test]
    fn equality_only_pairs_refuse_ordering() {
        let ctx = Context::detached();
        assert_eq!(expect_equal(true, 1).check(&ctx), Ok(Verdict::Met));
        let failed = unmet(expect_less(true, 1).check(&ctx).expect("check"));
        assert!(failed.message.starts_with("cannot compare"));
        let negated = unmet(expect_not(CompareKind::Less, true, 1).check(&ctx).expect("check"));
        assert!(negated.message.starts_with("cannot compare"));
    }

    #[test]
    fn coercion_failures_are_unmet_with_diagnostics() {
        let ctx = Context::detached();
        let failed = unmet(expect_equal("abc", 1).check(&ctx).expect("check"));
        assert!(failed.message.starts_with("cannot compare"));
        assert!(failed.left.expect("left").coercion_error.is_some());
        let negated = unmet(expect_not_equal("abc", 1).check(&ctx).expect("check"));
        assert!(negated.message.starts_with("cannot compare"));
    }

    #[test]
    fn nil_handling() {
        let ctx = Context::detached();
        assert_eq!(expect_equal((), ()).check(&ctx), Ok(Verdict::Met));
        assert!(matches!(expect_not_equal((), ()).check(&ctx), Ok(Verdict::Unmet(_))));
        assert_eq!(expect_not_equal((), 1).check(&ctx), Ok(Verdict::Met));
        let ordered = unmet(expect_less((), 1).check(&ctx).expect("check"));
        assert!(ordered.message.contains("one side is null"));
        assert_eq!(expect_nil(()).check(&ctx), Ok(Verdict::Met));
        assert!(matches!(expect_not_nil(()).check(&ctx), Ok(Verdict::Unmet(_))));
    }

    #[test]
    fn resolution_errors_are_errors() {
        let ctx = Context::detached();
        assert_eq!(
            expect_equal(var("missing"), 1).check(&ctx),
            Err(ResolveError::UnknownVariable("missing".into()))
        );
    }

    #[test]
    fn status_reports_reason_phrases() {
        let ctx = ctx_with(404, json!(null));
        assert_eq!(expect_status(404).check(&ctx), Ok(Verdict::Met));
        assert_eq!(expect_status("404").check(&ctx), Ok(Verdict::Met));
        assert_eq!(expect_status(404.0).check(&ctx), Ok(Verdict::Met));
        let failed = unmet(expect_status(200).check(&ctx).expect("check"));
        assert_eq!(failed.message, "expected status 200 OK, got 404 Not Found");
        assert!(failed.expected.is_some());
        assert!(matches!(
            expect_status("abc").check(&ctx),
            Err(ResolveError::Conversion { .. })
        ));
        assert_eq!(
            expect_status(200).check(&Context::detached()),
            Err(ResolveError::NoResponse)
        );
    }

    #[test]
    fn match_type_and_len() {
        let ctx = ctx_with(200, json!({"id": "pet-12", "tags": ["a", "b"], "n": 3}));
        assert_eq!(expect_match(body_path("id"), r"^pet-\d+$").check(&ctx), Ok(Verdict::Met));
        assert_eq!(expect_match(body_path("tags"), r#"\["a""#).check(&ctx), Ok(Verdict::Met));
        assert!(matches!(
            expect_match(body_path("id"), "^cat").check(&ctx),
            Ok(Verdict::Unmet(_))
        ));
        assert!(matches!(
            expect_match(body_path("id"), "(").check(&ctx),
            Err(ResolveError::InvalidPattern { .. })
        ));

        assert_eq!(expect_type(body_path("n"), ValueKind::Int).check(&ctx), Ok(Verdict::Met));
        assert_eq!(expect_type_of(body_path("id"), "").check(&ctx), Ok(Verdict::Met));
        assert!(matches!(
            expect_type(body_path("n"), ValueKind::String).check(&ctx),
            Ok(Verdict::Unmet(_))
        ));

        assert_eq!(expect_len(body_path("tags"), 2).check(&ctx), Ok(Verdict::Met));
        assert_eq!(expect_len(body_path("id"), "6").check(&ctx), Ok(Verdict::Met));
        assert!(matches!(expect_len(body_path("tags"), 3).check(&ctx), Ok(Verdict::Unmet(_))));
        assert!(expect_len(body_path("n"), 1).check(&ctx).is_err());
    }

    #[test]
    fn properties() {
        let ctx = ctx_with(200, json!({"id": 1, "name": "rex"}));
        assert_eq!(expect_has_properties(body(), ["id"]).check(&ctx), Ok(Verdict::Met));
        assert_eq!(
            expect_only_has_properties(body(), ["name", "id"]).check(&ctx),
            Ok(Verdict::Met)
        );
        let missing = unmet(expect_has_properties(body(), ["id", "age"]).check(&ctx).expect("check"));
        assert_eq!(missing.message, "missing properties age");
        let extra = unmet(expect_only_has_properties(body(), ["id"]).check(&ctx).expect("check"));
        assert_eq!(extra.message, "unexpected properties name");
        let not_object = unmet(
            expect_has_properties(Value::from(vec![1]), ["id"])
                .check(&ctx)
                .expect("check"),
        );
        assert!(not_object.message.starts_with("expected an object"));
    }

    #[test]
    fn predicates_and_modifiers() {
        let mut ctx = Context::detached();
        ctx.set_var("items", object([("a", 1)]));
        let expectation = expect_that("has items", |ctx| Ok(ctx.var("items").is_some()))
            .named("items present")
            .required();
        assert!(expectation.is_required());
        assert_eq!(expectation.name(), "items present");
        assert_eq!(expectation.check(&ctx), Ok(Verdict::Met));
        assert_eq!(
            expect_that("boom", |_| Err("exploded".into())).check(&ctx),
            Err(ResolveError::Callback("exploded".into()))
        );
    }
}
