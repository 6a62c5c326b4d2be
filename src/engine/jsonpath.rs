use super::error::ResolveError;
use crate::domain::Value;

pub const FIRST: &str = "FIRST";
pub const LAST: &str = "LAST";
pub const LEN: &str = "LEN";

/// One step of a stepwise traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Path(String),
    Index(i64),
}

impl From<&str> for Step {
    fn from(value: &str) -> Self {
        Step::Path(value.to_string())
    }
}

impl From<String> for Step {
    fn from(value: String) -> Self {
        Step::Path(value)
    }
}

impl From<i64> for Step {
    fn from(value: i64) -> Self {
        Step::Index(value)
    }
}

impl From<i32> for Step {
    fn from(value: i32) -> Self {
        Step::Index(i64::from(value))
    }
}

/// Evaluate a dot-separated path.
///
/// Objects descend by key (`a.b`, with `[n]` indexing); arrays accept
/// `LEN`, `FIRST`, `LAST` (any case) and integer positions, negative ones
/// counting from the end. `""` and `"."` return the value unchanged.
pub fn json_path(value: &Value, path: &str) -> Result<Value, ResolveError> {
    if path.is_empty() || path == "." {
        return Ok(value.clone());
    }

    let mut current = value.clone();
    for segment in path.split('.').filter(|segment| !segment.is_empty()) {
        for step in split_segment(segment, path)? {
            current = apply(&current, step, path)?;
        }
    }
    Ok(current)
}

/// Apply steps one after the other; string steps are full paths.
pub fn traverse(value: &Value, steps: &[Step]) -> Result<Value, ResolveError> {
    let mut current = value.clone();
    for step in steps {
        current = match step {
            Step::Path(path) => json_path(&current, path)?,
            Step::Index(index) => index_step(&current, *index, &index.to_string())?,
        };
    }
    Ok(current)
}

/// `items[0][LAST]` becomes `["items", "0", "LAST"]`.
fn split_segment<'a>(segment: &'a str, path: &str) -> Result<Vec<&'a str>, ResolveError> {
    let mut steps = Vec::new();
    let (key, mut rest) = match segment.find('[') {
        Some(open) => (&segment[..open], &segment[open..]),
        None => (segment, ""),
    };
    if !key.is_empty() {
        steps.push(key);
    }
    while !rest.is_empty() {
        let close = rest.find(']').ok_or_else(|| path_error(path, "unclosed `[`"))?;
        if !rest.starts_with('[') {
            return Err(path_error(path, &format!("unexpected `{rest}`")));
        }
        steps.push(&rest[1..close]);
        rest = &rest[close + 1..];
    }
    Ok(steps)
}

fn apply(current: &Value, step: &str, path: &str) -> Result<Value, ResolveError> {
    match current {
        Value::Object(map) => Ok(map.get(step).cloned().unwrap_or(Value::Null)),
        Value::Array(items) => positional(items, step, path),
        other => Err(path_error(
            path,
            &format!("cannot step `{step}` into non object/array ({})", other.kind()),
        )),
    }
}

fn index_step(current: &Value, index: i64, path: &str) -> Result<Value, ResolveError> {
    match current {
        Value::Array(items) => nth(items, index, path),
        Value::Object(map) => Ok(map.get(&index.to_string()).cloned().unwrap_or(Value::Null)),
        other => Err(path_error(
            path,
            &format!("cannot index into non object/array ({})", other.kind()),
        )),
    }
}

fn positional(items: &[Value], step: &str, path: &str) -> Result<Value, ResolveError> {
    let upper = step.to_ascii_uppercase();
    if upper == LEN {
        return Ok(Value::from(items.len()));
    }
    if items.is_empty() {
        return Err(path_error(path, &format!("step `{step}` into empty array")));
    }
    match upper.as_str() {
        FIRST => Ok(items[0].clone()),
        LAST => Ok(items[items.len() - 1].clone()),
        _ => {
            let index: i64 = step.trim().parse().map_err(|_| {
                path_error(
                    path,
                    &format!("array step `{step}` must be an index, FIRST, LAST or LEN"),
                )
            })?;
            nth(items, index, path)
        }
    }
}

/// Element at `index`; negative indices count from the end.
pub(crate) fn nth(items: &[Value], index: i64, path: &str) -> Result<Value, ResolveError> {
    if items.is_empty() {
        return Err(path_error(path, "index into empty array"));
    }
    let len = items.len() as i64;
    let position = if index < 0 { len + index } else { index };
    if position < 0 || position >= len {
        return Err(path_error(
            path,
            &format!("index {index} out of range for length {len}"),
        ));
    }
    Ok(items[position as usize].clone())
}

fn path_error(path: &str, reason: &str) -> ResolveError {
    ResolveError::Path {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}
