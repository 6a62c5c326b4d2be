//! Deferred values. Every constructor returns a [`Value`] so resolvables nest
//! freely inside object and array literals, request bodies and rows.

use super::context::Context;
use super::error::ResolveError;
use super::expect::{Expectation, Verdict};
use super::jsonpath::{self, Step};
use super::resolve::{render_template, resolve, QueryRequest, Resolvable};
use crate::domain::Value;
use std::fmt;
use std::sync::Arc;

// ─── Lookups ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Var(String);

impl Resolvable for Var {
    fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError> {
        ctx.var(&self.0)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownVariable(self.0.clone()))
    }
}

/// Named variable.
pub fn var(name: impl Into<String>) -> Value {
    Value::deferred(Var(name.into()))
}

#[derive(Debug)]
struct Env(String);

impl Resolvable for Env {
    fn resolve(&self, _: &Context) -> Result<Value, ResolveError> {
        std::env::var(&self.0)
            .map(Value::String)
            .map_err(|_| ResolveError::MissingEnv(self.0.clone()))
    }
}

/// Process environment variable.
pub fn env(key: impl Into<String>) -> Value {
    Value::deferred(Env(key.into()))
}

#[derive(Debug)]
struct StatusCode;

impl Resolvable for StatusCode {
    fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError> {
        ctx.status().map(Value::from).ok_or(ResolveError::NoResponse)
    }
}

/// Status code of the current response.
pub fn status_code() -> Value {
    Value::deferred(StatusCode)
}

#[derive(Debug)]
struct Header(String);

impl Resolvable for Header {
    fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError> {
        if ctx.response().is_none() {
            return Err(ResolveError::NoResponse);
        }
        Ok(ctx.header(&self.0).map(Value::String).unwrap_or(Value::Null))
    }
}

/// First value of a response header; `Null` when absent.
pub fn header(name: impl Into<String>) -> Value {
    Value::deferred(Header(name.into()))
}

#[derive(Debug)]
struct ResponseCookie(String);

impl Resolvable for ResponseCookie {
    fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError> {
        if ctx.response().is_none() {
            return Err(ResolveError::NoResponse);
        }
        Ok(ctx
            .response_cookie(&self.0)
            .map(|cookie| cookie.to_value())
            .unwrap_or(Value::Null))
    }
}

/// Cookie set by the current response, as a map of its attributes.
pub fn response_cookie(name: impl Into<String>) -> Value {
    Value::deferred(ResponseCookie(name.into()))
}

#[derive(Debug)]
struct Body;

impl Resolvable for Body {
    fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError> {
        if ctx.response().is_none() {
            return Err(ResolveError::NoResponse);
        }
        Ok(ctx.body().clone())
    }
}

/// Decoded body of the current response.
pub fn body() -> Value {
    Value::deferred(Body)
}

/// JSON path into the current response body.
pub fn body_path(path: impl Into<String>) -> Value {
    json_path(body(), path)
}

#[derive(Debug)]
struct JsonPath {
    value: Value,
    path: String,
}

impl Resolvable for JsonPath {
    fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError> {
        jsonpath::json_path(&resolve(&self.value, ctx)?, &self.path)
    }

    fn operands(&self) -> Vec<&Value> {
        vec![&self.value]
    }
}

/// JSON path into any value.
pub fn json_path(value: impl Into<Value>, path: impl Into<String>) -> Value {
    Value::deferred(JsonPath {
        value: value.into(),
        path: path.into(),
    })
}

#[derive(Debug)]
struct Traverse {
    value: Value,
    steps: Vec<Step>,
}

impl Resolvable for Traverse {
    fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError> {
        jsonpath::traverse(&resolve(&self.value, ctx)?, &self.steps)
    }

    fn operands(&self) -> Vec<&Value> {
        vec![&self.value]
    }
}

/// Stepwise traversal: each string step is a full path, integers index.
pub fn traverse<S: Into<Step>>(value: impl Into<Value>, steps: impl IntoIterator<Item = S>) -> Value {
    Value::deferred(Traverse {
        value: value.into(),
        steps: steps.into_iter().map(Into::into).collect(),
    })
}

// ─── Databases ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryShape {
    First,
    All,
}

#[derive(Debug)]
struct DbQuery {
    database: String,
    query: String,
    args: Vec<Value>,
    shape: QueryShape,
}

impl Resolvable for DbQuery {
    fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError> {
        let rows = ctx.db_query(&self.database, &self.query, &self.args)?;
        match self.shape {
            QueryShape::All => Ok(Value::Array(rows.into_iter().map(Value::Object).collect())),
            QueryShape::First => {
                let row = rows.into_iter().next().ok_or_else(|| ResolveError::Database {
                    database: self.database.clone(),
                    reason: format!("query returned no rows: {}", self.query),
                })?;
                if row.len() == 1 {
                    Ok(row.into_iter().next().map(|(_, cell)| cell).unwrap_or(Value::Null))
                } else {
                    Ok(Value::Object(row))
                }
            }
        }
    }

    fn query(&self) -> Option<QueryRequest<'_>> {
        Some(QueryRequest {
            database: &self.database,
            sql: &self.query,
            args: &self.args,
        })
    }
}

/// First row of a query: the cell itself for one column, a map otherwise.
/// An empty result is an error.
pub fn db_query<A: Into<Value>>(
    database: impl Into<String>,
    query: impl Into<String>,
    args: impl IntoIterator<Item = A>,
) -> Value {
    Value::deferred(DbQuery {
        database: database.into(),
        query: query.into(),
        args: args.into_iter().map(Into::into).collect(),
        shape: QueryShape::First,
    })
}

/// Every row of a query as an array of maps.
pub fn db_rows<A: Into<Value>>(
    database: impl Into<String>,
    query: impl Into<String>,
    args: impl IntoIterator<Item = A>,
) -> Value {
    Value::deferred(DbQuery {
        database: database.into(),
        query: query.into(),
        args: args.into_iter().map(Into::into).collect(),
        shape: QueryShape::All,
    })
}

#[derive(Debug)]
struct RawQuery(String);

impl Resolvable for RawQuery {
    fn resolve(&self, _: &Context) -> Result<Value, ResolveError> {
        Ok(Value::String(self.0.clone()))
    }

    fn raw_sql(&self) -> Option<&str> {
        Some(&self.0)
    }
}

/// SQL spliced verbatim into an insert instead of being bound.
pub fn raw_query(sql: impl Into<String>) -> Value {
    Value::deferred(RawQuery(sql.into()))
}

// ─── Templates and listeners ─────────────────────────────────────────────────

#[derive(Debug)]
struct Template(String);

impl Resolvable for Template {
    fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError> {
        render_template(&self.0, ctx).map(Value::String)
    }
}

/// String with `{$name}` substitutions.
pub fn template(text: impl Into<String>) -> Value {
    Value::deferred(Template(text.into()))
}

#[derive(Debug)]
struct ImageEnv {
    image: String,
    tokens: Vec<String>,
}

impl Resolvable for ImageEnv {
    fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError> {
        let tokens: Vec<&str> = self.tokens.iter().map(String::as_str).collect();
        ctx.resolve_image_env(&self.image, &tokens).map(Value::String)
    }
}

/// Capability token of a registered image, e.g. `image_env("db", ["port"])`.
pub fn image_env<T: Into<String>>(image: impl Into<String>, tokens: impl IntoIterator<Item = T>) -> Value {
    Value::deferred(ImageEnv {
        image: image.into(),
        tokens: tokens.into_iter().map(Into::into).collect(),
    })
}

#[derive(Debug)]
struct ListenerEvents {
    name: String,
    count_only: bool,
}

impl Resolvable for ListenerEvents {
    fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError> {
        let listener = ctx
            .listener(&self.name)
            .ok_or_else(|| ResolveError::UnknownListener(self.name.clone()))?;
        if self.count_only {
            Ok(Value::from(listener.events_count()))
        } else {
            Ok(Value::Array(listener.events()))
        }
    }
}

/// Snapshot of a listener's events.
pub fn listener_events(name: impl Into<String>) -> Value {
    Value::deferred(ListenerEvents {
        name: name.into(),
        count_only: false,
    })
}

/// Number of events a listener holds.
pub fn listener_count(name: impl Into<String>) -> Value {
    Value::deferred(ListenerEvents {
        name: name.into(),
        count_only: true,
    })
}

// ─── Composition ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct AllOf(Vec<Value>);

impl Resolvable for AllOf {
    fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError> {
        for item in &self.0 {
            if !resolve(item, ctx)?.is_truthy() {
                return Ok(Value::Bool(false));
            }
        }
        Ok(Value::Bool(true))
    }

    fn operands(&self) -> Vec<&Value> {
        self.0.iter().collect()
    }
}

/// `true` when every item is truthy. Stops at the first falsy item.
pub fn all_of<V: Into<Value>>(items: impl IntoIterator<Item = V>) -> Value {
    Value::deferred(AllOf(items.into_iter().map(Into::into).collect()))
}

#[derive(Debug)]
struct AnyOf(Vec<Value>);

impl Resolvable for AnyOf {
    fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError> {
        for item in &self.0 {
            if resolve(item, ctx)?.is_truthy() {
                return Ok(Value::Bool(true));
            }
        }
        Ok(Value::Bool(false))
    }

    fn operands(&self) -> Vec<&Value> {
        self.0.iter().collect()
    }
}

/// `true` when some item is truthy. Stops at the first truthy item.
pub fn any_of<V: Into<Value>>(items: impl IntoIterator<Item = V>) -> Value {
    Value::deferred(AnyOf(items.into_iter().map(Into::into).collect()))
}

#[derive(Debug)]
struct Satisfied(Expectation);

impl Resolvable for Satisfied {
    fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError> {
        Ok(Value::Bool(matches!(self.0.check(ctx)?, Verdict::Met)))
    }

    fn operands(&self) -> Vec<&Value> {
        self.0.operands()
    }
}

/// Whether an expectation holds, as a boolean.
pub fn satisfied(expectation: Expectation) -> Value {
    Value::deferred(Satisfied(expectation))
}

#[derive(Debug, Clone, Copy)]
enum Pick {
    Len,
    First,
    Last,
    Nth(i64),
}

#[derive(Debug)]
struct Picked {
    value: Value,
    pick: Pick,
}

impl Resolvable for Picked {
    fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError> {
        let resolved = resolve(&self.value, ctx)?;
        let index = match self.pick {
            Pick::Len => {
                return resolved.len().map(Value::from).ok_or_else(|| ResolveError::Conversion {
                    value: resolved.to_string(),
                    target: "length",
                })
            }
            Pick::First => 0,
            Pick::Last => -1,
            Pick::Nth(index) => index,
        };
        let items = resolved.as_array().ok_or_else(|| ResolveError::Conversion {
            value: resolved.to_string(),
            target: "array",
        })?;
        jsonpath::nth(items, index, &format!("{:?}", self.pick))
    }

    fn operands(&self) -> Vec<&Value> {
        vec![&self.value]
    }
}

/// Length of a string (in characters), array or object.
pub fn len(value: impl Into<Value>) -> Value {
    Value::deferred(Picked {
        value: value.into(),
        pick: Pick::Len,
    })
}

pub fn first(value: impl Into<Value>) -> Value {
    Value::deferred(Picked {
        value: value.into(),
        pick: Pick::First,
    })
}

pub fn last(value: impl Into<Value>) -> Value {
    Value::deferred(Picked {
        value: value.into(),
        pick: Pick::Last,
    })
}

/// Element at `index`; negative indices count from the end.
pub fn nth(value: impl Into<Value>, index: i64) -> Value {
    Value::deferred(Picked {
        value: value.into(),
        pick: Pick::Nth(index),
    })
}

#[derive(Debug)]
struct Just(Value);

impl Resolvable for Just {
    fn resolve(&self, _: &Context) -> Result<Value, ResolveError> {
        Ok(self.0.clone())
    }

    fn operands(&self) -> Vec<&Value> {
        vec![&self.0]
    }
}

/// Identity wrapper: resolves to `value` itself.
pub fn just(value: impl Into<Value>) -> Value {
    Value::deferred(Just(value.into()))
}

// ─── Callbacks ───────────────────────────────────────────────────────────────

type BodyReader = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;
type Computation = Arc<dyn Fn(&Context) -> Result<Value, String> + Send + Sync>;

struct BodyFn(BodyReader);

impl fmt::Debug for BodyFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "body_fn(..)")
    }
}

impl Resolvable for BodyFn {
    fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError> {
        if ctx.response().is_none() {
            return Err(ResolveError::NoResponse);
        }
        (self.0)(ctx.body()).map_err(ResolveError::Callback)
    }
}

/// Call `reader` with the decoded body of the current response.
pub fn body_fn<F>(reader: F) -> Value
where
    F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
{
    Value::deferred(BodyFn(Arc::new(reader)))
}

struct Computed(Computation);

impl fmt::Debug for Computed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "computed(..)")
    }
}

impl Resolvable for Computed {
    fn resolve(&self, ctx: &Context) -> Result<Value, ResolveError> {
        (self.0)(ctx).map_err(ResolveError::Callback)
    }
}

/// Arbitrary computation over the context.
pub fn computed<F>(compute: F) -> Value
where
    F: Fn(&Context) -> Result<Value, String> + Send + Sync + 'static,
{
    Value::deferred(Computed(Arc::new(compute)))
}
