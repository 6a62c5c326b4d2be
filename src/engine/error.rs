use crate::domain::{Frame, Value};
use crate::report::RunReport;
use serde::Serialize;
use std::fmt::Write as _;
use thiserror::Error;

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

/// Diagnostic envelope for one operand: the declared form, the value it
/// resolved to, the value it was coerced to for comparison and the reason
/// coercion failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Operand {
    pub original: String,
    pub resolved: Option<Value>,
    pub coerced: Option<Value>,
    pub coercion_error: Option<String>,
}

impl Operand {
    pub fn declared(value: &Value) -> Self {
        Self {
            original: value.to_string(),
            ..Self::default()
        }
    }

    pub fn with_resolved(mut self, value: Value) -> Self {
        self.resolved = Some(value);
        self
    }

    fn render(&self, label: &str, out: &mut String) {
        let _ = write!(out, "\n  {label:<9}{}", self.original);
        if let Some(resolved) = &self.resolved {
            if resolved.to_string() != self.original {
                let _ = write!(out, "\n  {:<9}  resolved: {resolved}", "");
            }
        }
        if let Some(coerced) = &self.coerced {
            let _ = write!(out, "\n  {:<9}  coerced:  {coerced} ({})", "", coerced.kind());
        }
        if let Some(reason) = &self.coercion_error {
            let _ = write!(out, "\n  {:<9}  coercion error: {reason}", "");
        }
    }
}

/// A deferred value could not be evaluated.
///
/// Deep resolution has no cycle detection of its own beyond a depth bound:
/// a value that (directly or through variables) resolves to itself fails with
/// `ResolutionLoop` instead of recursing forever.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),
    #[error("environment variable `{0}` is not set")]
    MissingEnv(String),
    #[error("image `{0}` is not registered")]
    UnknownImage(String),
    #[error("image `{image}` cannot resolve `{token}`: {reason}")]
    ImageToken {
        image: String,
        token: String,
        reason: String,
    },
    #[error("template {template:?} has unresolved markers: {reasons}")]
    Template { template: String, reasons: String },
    #[error("json path `{path}`: {reason}")]
    Path { path: String, reason: String },
    #[error("database `{0}` is not registered")]
    UnknownDatabase(String),
    #[error("database `{database}`: {reason}")]
    Database { database: String, reason: String },
    #[error("no response has been received yet")]
    NoResponse,
    #[error("listener `{0}` is not registered")]
    UnknownListener(String),
    #[error("mock service `{0}` is not registered")]
    UnknownMock(String),
    #[error("cookie `{0}` not found")]
    CookieNotFound(String),
    #[error("cannot convert {value} to {target}")]
    Conversion { value: String, target: &'static str },
    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("resolution exceeded {0} nested steps; the value refers to itself")]
    ResolutionLoop(usize),
    #[error("{0}")]
    Callback(String),
}

/// A predicate evaluated cleanly but its outcome was not the expected one.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{name}: {message}")]
pub struct UnmetError {
    pub name: String,
    pub message: String,
    pub frame: Frame,
    pub comparator: Option<String>,
    pub left: Option<Operand>,
    pub right: Option<Operand>,
    pub expected: Option<Operand>,
    pub actual: Option<Operand>,
}

impl UnmetError {
    pub fn new(name: impl Into<String>, frame: Frame, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            frame,
            comparator: None,
            left: None,
            right: None,
            expected: None,
            actual: None,
        }
    }

    pub fn with_comparison(mut self, glyph: &str, left: Operand, right: Operand) -> Self {
        self.comparator = Some(glyph.to_string());
        self.left = Some(left);
        self.right = Some(right);
        self
    }

    pub fn with_expected(mut self, expected: Operand, actual: Operand) -> Self {
        self.expected = Some(expected);
        self.actual = Some(actual);
        self
    }

    pub fn is_comparator(&self) -> bool {
        self.comparator.is_some()
    }

    /// Long form used by test bridges and text reports.
    pub fn test_format(&self) -> String {
        let mut out = format!("{} (declared at {})\n  {}", self.name, self.frame, self.message);
        if let Some(glyph) = &self.comparator {
            let _ = write!(out, "\n  comparator: {glyph}");
        }
        for (label, operand) in [
            ("left:", &self.left),
            ("right:", &self.right),
            ("expected:", &self.expected),
            ("actual:", &self.actual),
        ] {
            if let Some(operand) = operand {
                operand.render(label, &mut out);
            }
        }
        out
    }
}

/// A side-effecting operation failed.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{capture}: {message}")]
pub struct CaptureError {
    pub capture: String,
    pub frame: Frame,
    pub message: String,
    #[source]
    pub cause: Option<ResolveError>,
    pub operands: Vec<Operand>,
}

impl CaptureError {
    pub fn new(capture: impl Into<String>, frame: Frame, message: impl Into<String>) -> Self {
        Self {
            capture: capture.into(),
            frame,
            message: message.into(),
            cause: None,
            operands: Vec::new(),
        }
    }

    pub fn resolving(capture: impl Into<String>, frame: Frame, cause: ResolveError) -> Self {
        Self {
            capture: capture.into(),
            frame,
            message: cause.to_string(),
            cause: Some(cause),
            operands: Vec::new(),
        }
    }

    pub fn with_operand(mut self, operand: Operand) -> Self {
        self.operands.push(operand);
        self
    }

    pub fn test_format(&self) -> String {
        let mut out = format!(
            "{} (declared at {})\n  {}",
            self.capture, self.frame, self.message
        );
        for operand in &self.operands {
            operand.render("operand:", &mut out);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("failed to build request: {0}")]
    Build(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("request failed: {0}")]
    Send(String),
    #[error("failed to read response: {0}")]
    Read(String),
    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("failed to read configuration {0}")]
    Read(String),
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Unmet(#[from] UnmetError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid request: {0}")]
    Request(String),
    #[error("failed to decode response body: {0}")]
    Decode(String),
    #[error("component `{name}` failed: {reason}")]
    Component { name: String, reason: String },
    #[error("openapi: {0}")]
    OpenApi(String),
    #[error("run failed: {}", .0.summary())]
    RunFailed(Box<RunReport>),
}

impl HarnessError {
    pub fn test_format(&self) -> String {
        match self {
            HarnessError::Capture(err) => err.test_format(),
            HarnessError::Unmet(err) => err.test_format(),
            other => other.to_string(),
        }
    }

    pub fn report(&self) -> Option<&RunReport> {
        match self {
            HarnessError::RunFailed(report) => Some(report),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame {
            file: "tests/pets.rs",
            line: 12,
            column: 5,
        }
    }

    #[test]
    fn unmet_long_form_lists_operands() {
        let mut left = Operand::declared(&Value::from("42")).with_resolved(Value::from("42"));
        left.coerced = Some(Value::Int(42));
        let right = Operand::declared(&Value::Int(43)).with_resolved(Value::Int(43));
        let unmet = UnmetError::new("equal", frame(), "expected \"42\" == 43")
            .with_comparison("==", left, right);

        let text = unmet.test_format();
        assert!(text.starts_with("equal (declared at tests/pets.rs:12)"));
        assert!(text.contains("comparator: =="));
        assert!(text.contains("coerced:  42 (int)"));
        assert!(unmet.is_comparator());
    }

    #[test]
    fn capture_error_keeps_resolution_cause() {
        let err = CaptureError::resolving(
            "set var token",
            frame(),
            ResolveError::UnknownVariable("login".into()),
        );
        assert_eq!(err.to_string(), "set var token: unknown variable `login`");
        assert_eq!(err.cause, Some(ResolveError::UnknownVariable("login".into())));
        let wrapped = HarnessError::from(err);
        assert!(wrapped.test_format().contains("declared at tests/pets.rs:12"));
    }
}
