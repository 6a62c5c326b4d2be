use crate::domain::{Map, Value};
use crate::engine::context::Context;
use crate::engine::error::ResolveError;
use crate::engine::resolve::resolve;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// One result row, columns in select order.
pub type Row = IndexMap<String, Value>;

/// Placeholder style of a database driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArgMarkers {
    /// `?`
    #[default]
    Positional,
    /// `$1`, `$2`, ...
    Numbered,
}

impl ArgMarkers {
    /// Marker for the 1-based bound argument `position`.
    pub fn marker(self, position: usize) -> String {
        match self {
            ArgMarkers::Positional => "?".to_string(),
            ArgMarkers::Numbered => format!("${position}"),
        }
    }
}

pub type DatabaseFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send + 'a>>;

/// Abstract SQL database used by database captures and query resolvables.
///
/// Arguments are always fully resolved.
pub trait SqlDatabase: Send + Sync {
    /// Execute a statement, returning the number of affected rows.
    fn exec(&self, query: String, args: Vec<Value>) -> DatabaseFuture<'_, u64>;

    /// Run a query and return every row.
    fn query(&self, query: String, args: Vec<Value>) -> DatabaseFuture<'_, Vec<Row>>;
}

#[derive(Clone)]
pub struct NamedDatabase {
    pub handle: Arc<dyn SqlDatabase>,
    pub markers: ArgMarkers,
}

impl NamedDatabase {
    pub fn new(handle: Arc<dyn SqlDatabase>, markers: ArgMarkers) -> Self {
        Self { handle, markers }
    }
}

/// Databases by name. The empty name aliases the first registration.
#[derive(Clone, Default)]
pub struct DatabaseRegistry {
    entries: IndexMap<String, NamedDatabase>,
}

impl DatabaseRegistry {
    pub fn register(&mut self, name: impl Into<String>, database: NamedDatabase) {
        self.entries.insert(name.into(), database);
    }

    pub fn get(&self, name: &str) -> Option<&NamedDatabase> {
        if name.is_empty() {
            return self
                .entries
                .get("")
                .or_else(|| self.entries.first().map(|(_, database)| database));
        }
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Build an `INSERT` for `row`.
///
/// Raw-query values are spliced into the statement, arrays and objects are
/// bound as JSON text, everything else is resolved and bound.
pub fn build_insert(
    table: &str,
    row: &Map,
    markers: ArgMarkers,
    ctx: &Context,
) -> Result<(String, Vec<Value>), ResolveError> {
    let mut columns = Vec::with_capacity(row.len());
    let mut placeholders = Vec::with_capacity(row.len());
    let mut args = Vec::new();

    for (column, value) in row {
        columns.push(column.as_str());
        if let Value::Deferred(inner) = value {
            if let Some(sql) = inner.raw_sql() {
                placeholders.push(sql.to_string());
                continue;
            }
        }

        let resolved = resolve(value, ctx)?;
        let bound = match resolved {
            Value::Array(_) | Value::Object(_) => Value::String(resolved.to_json().to_string()),
            other => other,
        };
        args.push(bound);
        placeholders.push(markers.marker(args.len()));
    }

    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        columns.join(","),
        placeholders.join(", ")
    );
    Ok((sql, args))
}
