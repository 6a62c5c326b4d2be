use super::context::Context;
use super::error::ResolveError;
use crate::domain::{Map, Value};
use std::fmt;

/// Upper bound on nested deferred evaluations before resolution gives up.
pub const MAX_RESOLVE_DEPTH: usize = 64;

/// A lazy value evaluated against the run context.
pub trait Resolvable: Send + Sync + fmt::Debug {
    fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError>;

    /// SQL fragment to splice into statements instead of binding.
    fn raw_sql(&self) -> Option<&str> {
        None
    }

    /// Values evaluated by this one, searched by [`preload`] for queries.
    fn operands(&self) -> Vec<&Value> {
        Vec::new()
    }

    /// Database query read when this value is evaluated.
    fn query(&self) -> Option<QueryRequest<'_>> {
        None
    }
}

/// A query to run before resolution reads its rows from the context.
#[derive(Debug, Clone, Copy)]
pub struct QueryRequest<'a> {
    pub database: &'a str,
    pub sql: &'a str,
    pub args: &'a [Value],
}

/// Queries nested anywhere in `value`, innermost first.
fn collect_queries<'v>(value: &'v Value, out: &mut Vec<QueryRequest<'v>>) {
    match value {
        Value::Deferred(inner) => {
            for operand in inner.operands() {
                collect_queries(operand, out);
            }
            if let Some(query) = inner.query() {
                for arg in query.args {
                    collect_queries(arg, out);
                }
                out.push(query);
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_queries(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_queries(item, out)),
        _ => {}
    }
}

/// Run every database query nested in `values` so that resolution can read
/// the rows synchronously. Rows loaded by an earlier call are dropped first,
/// so statements executed since then are always observed.
pub async fn preload(values: &[&Value], ctx: &mut Context) -> Result<(), ResolveError> {
    let mut queries = Vec::new();
    for value in values {
        collect_queries(value, &mut queries);
    }
    ctx.clear_loaded_rows();
    for query in queries {
        let args = query
            .args
            .iter()
            .map(|arg| resolve(arg, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        ctx.load_rows(query.database, query.sql, args).await?;
    }
    Ok(())
}

/// Deep-resolve a value to a fixed point: deferred entries are evaluated
/// until the result is concrete, and arrays and objects are resolved
/// element-wise.
pub fn resolve(value: &Value, ctx: &Context) -> Result<Value, ResolveError> {
    match value {
        Value::Deferred(inner) => {
            let _depth = ctx.enter_resolution()?;
            let next = inner.resolve(ctx)?;
            resolve(&next, ctx)
        }
        Value::Array(items) => items
            .iter()
            .map(|item| resolve(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(key, item)| resolve(item, ctx).map(|item| (key.clone(), item)))
            .collect::<Result<Map, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '.')
}

/// Expand `{$name}` markers.
///
/// Backslashes immediately before a marker are counted. One of them is
/// always consumed; an odd count leaves the marker as literal text, an even
/// count substitutes it. `{$env:KEY}` reads the process environment,
/// `{$svc:image:token…}` asks the named image, anything else is a variable.
/// Unresolvable markers are collected and reported once the scan finishes.
pub fn render_template(template: &str, ctx: &Context) -> Result<String, ResolveError> {
    let mut out = String::with_capacity(template.len());
    let mut unresolved = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{$") {
        let before = &rest[..start];
        let slashes = before.len() - before.trim_end_matches('\\').len();
        out.push_str(&before[..before.len() - slashes]);

        let after = &rest[start + 2..];
        let name_len = after.find(|c: char| !is_name_char(c)).unwrap_or(after.len());
        let name = &after[..name_len];
        if name.is_empty() || !after[name_len..].starts_with('}') {
            out.push_str(&before[before.len() - slashes..]);
            out.push_str("{$");
            rest = after;
            continue;
        }

        let marker_end = start + 2 + name_len + 1;
        let marker = &rest[start..marker_end];
        if slashes > 0 {
            out.extend(std::iter::repeat('\\').take(slashes - 1));
        }
        if slashes % 2 == 1 {
            out.push_str(marker);
        } else {
            match lookup(name, ctx) {
                Ok(text) => out.push_str(&text),
                Err(err) => {
                    unresolved.push(err.to_string());
                    out.push_str(marker);
                }
            }
        }
        rest = &rest[marker_end..];
    }
    out.push_str(rest);

    if unresolved.is_empty() {
        Ok(out)
    } else {
        Err(ResolveError::Template {
            template: template.to_string(),
            reasons: unresolved.join("; "),
        })
    }
}

fn lookup(name: &str, ctx: &Context) -> Result<String, ResolveError> {
    if let Some(key) = name.strip_prefix("env:") {
        return std::env::var(key).map_err(|_| ResolveError::MissingEnv(key.to_string()));
    }
    if let Some(spec) = name.strip_prefix("svc:") {
        let mut tokens = spec.split(':');
        let image = tokens.next().unwrap_or_default();
        let tokens: Vec<&str> = tokens.collect();
        return ctx.resolve_image_env(image, &tokens);
    }
    let value = ctx
        .var(name)
        .ok_or_else(|| ResolveError::UnknownVariable(name.to_string()))?;
    Ok(resolve(value, ctx)?.to_text())
}
