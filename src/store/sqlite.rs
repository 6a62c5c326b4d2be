use crate::abstractions::database::{ArgMarkers, DatabaseFuture, NamedDatabase, Row, SqlDatabase};
use crate::domain::Value;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use std::path::Path;
use std::sync::Arc;

/// SQLite-backed database for local suites. Uses `?` markers; statements
/// run on the blocking pool.
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, String> {
        let conn = Connection::open(path.as_ref())
            .map_err(|err| format!("Failed to open SQLite: {err}"))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to set SQLite journal mode: {err}"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory()
            .map_err(|err| format!("Failed to open SQLite: {err}"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a batch of statements, typically a schema.
    pub fn execute_batch(&self, sql: &str) -> Result<(), String> {
        self.conn
            .lock()
            .execute_batch(sql)
            .map_err(|err| format!("Failed to execute SQLite batch: {err}"))
    }

    /// Wrap for registration in a suite.
    pub fn into_named(self) -> NamedDatabase {
        NamedDatabase::new(Arc::new(self), ArgMarkers::Positional)
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(value) => SqlValue::Integer(i64::from(*value)),
        Value::Int(value) => SqlValue::Integer(*value),
        Value::Float(value) => SqlValue::Real(*value),
        Value::Decimal(value) => SqlValue::Text(value.to_string()),
        Value::String(value) => SqlValue::Text(value.clone()),
        Value::Bytes(value) => SqlValue::Blob(value.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_json().to_string()),
        Value::Deferred(_) => SqlValue::Text(value.to_text()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(value) => Value::Int(value),
        ValueRef::Real(value) => Value::Float(value),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => Value::Bytes(blob.to_vec()),
    }
}

fn exec_blocking(conn: &Connection, query: &str, args: &[Value]) -> Result<u64, String> {
    let affected = conn
        .execute(query, params_from_iter(args.iter().map(to_sql)))
        .map_err(|err| format!("Failed to execute statement: {err}"))?;
    Ok(affected as u64)
}

fn query_blocking(conn: &Connection, query: &str, args: &[Value]) -> Result<Vec<Row>, String> {
    let mut stmt = conn
        .prepare(query)
        .map_err(|err| format!("Failed to prepare query: {err}"))?;
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();

    let mut rows = stmt
        .query(params_from_iter(args.iter().map(to_sql)))
        .map_err(|err| format!("Failed to run query: {err}"))?;
    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .map_err(|err| format!("Failed to read row: {err}"))?
    {
        let mut record = Row::new();
        for (index, column) in columns.iter().enumerate() {
            let value = row
                .get_ref(index)
                .map_err(|err| format!("Failed to read column `{column}`: {err}"))?;
            record.insert(column.clone(), from_sql(value));
        }
        out.push(record);
    }
    Ok(out)
}

impl SqlDatabase for SqliteDatabase {
    fn exec(&self, query: String, args: Vec<Value>) -> DatabaseFuture<'_, u64> {
        let conn = self.conn.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || exec_blocking(&conn.lock(), &query, &args))
                .await
                .map_err(|err| format!("SQLite task failed: {err}"))?
        })
    }

    fn query(&self, query: String, args: Vec<Value>) -> DatabaseFuture<'_, Vec<Row>> {
        let conn = self.conn.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || query_blocking(&conn.lock(), &query, &args))
                .await
                .map_err(|err| format!("SQLite task failed: {err}"))?
        })
    }
}
