use super::context::Context;
use super::error::{CaptureError, Operand, ResolveError};
use super::resolve::{preload, resolve};
use crate::abstractions::listener::ListenerFactory;
use crate::domain::{Cookie, Frame, Map, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub type CaptureFuture<'a> = Pin<Box<dyn Future<Output = Result<(), CaptureError>> + Send + 'a>>;

/// A side-effecting operation run before a request, after it, or as an
/// endpoint hook.
pub trait Capture: Send + Sync {
    fn name(&self) -> &str;

    fn frame(&self) -> Frame;

    fn run<'a>(&'a self, ctx: &'a mut Context) -> CaptureFuture<'a>;
}

type Callback = Arc<dyn Fn(&mut Context) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
enum Op {
    SetVar { name: String, value: Value },
    ClearVars(Vec<String>),
    ClearAllVars,
    DbInsert { database: String, table: String, row: Value },
    DbExec { database: String, query: String, args: Vec<Value> },
    DbClearTable { database: String, table: String },
    StoreCookie(String),
    SetCookie { name: String, value: Value },
    Wait(Duration),
    Call(Callback),
    MockSetup { mock: String, definition: Value },
    MockClear(String),
    Listen { name: String, factory: ListenerFactory },
    ClearListener(String),
}

impl Op {
    fn operands(&self) -> Vec<&Value> {
        match self {
            Op::SetVar { value, .. } | Op::SetCookie { value, .. } => vec![value],
            Op::DbInsert { row, .. } => vec![row],
            Op::DbExec { args, .. } => args.iter().collect(),
            Op::MockSetup { definition, .. } => vec![definition],
            _ => Vec::new(),
        }
    }
}

/// Built-in capture. Constructed through the free functions below.
#[derive(Clone)]
pub struct Action {
    name: String,
    frame: Frame,
    op: Op,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("frame", &self.frame)
            .finish()
    }
}

impl Action {
    #[track_caller]
    fn new(name: impl Into<String>, op: Op) -> Self {
        Self {
            name: name.into(),
            frame: Frame::caller(),
            op,
        }
    }

    /// Replace the display name used in reports.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn failed(&self, message: impl Into<String>) -> CaptureError {
        CaptureError::new(self.name.clone(), self.frame, message)
    }

    fn resolving(&self, cause: ResolveError) -> CaptureError {
        CaptureError::resolving(self.name.clone(), self.frame, cause)
    }

    async fn apply(&self, ctx: &mut Context) -> Result<(), CaptureError> {
        preload(&self.op.operands(), ctx)
            .await
            .map_err(|cause| self.resolving(cause))?;
        match &self.op {
            Op::SetVar { name, value } => {
                let resolved = resolve(value, ctx).map_err(|cause| {
                    self.resolving(cause).with_operand(Operand::declared(value))
                })?;
                tracing::debug!(variable = %name, value = %resolved, "set variable");
                ctx.set_var(name.clone(), resolved);
            }
            Op::ClearVars(names) => {
                for name in names {
                    ctx.clear_var(name);
                }
            }
            Op::ClearAllVars => ctx.clear_vars(),
            Op::DbInsert {
                database,
                table,
                row,
            } => {
                let resolved;
                let row: &Map = match row {
                    Value::Object(map) => map,
                    other => {
                        resolved = resolve(other, ctx).map_err(|cause| self.resolving(cause))?;
                        resolved.as_object().ok_or_else(|| {
                            self.failed(format!("row must be an object, got {}", resolved.kind()))
                        })?
                    }
                };
                ctx.db_insert(database, table, row)
                    .await
                    .map_err(|cause| self.resolving(cause))?;
            }
            Op::DbExec {
                database,
                query,
                args,
            } => {
                ctx.db_exec(database, query, args)
                    .await
                    .map_err(|cause| self.resolving(cause))?;
            }
            Op::DbClearTable { database, table } => {
                ctx.db_exec(database, &format!("DELETE FROM {table}"), &[])
                    .await
                    .map_err(|cause| self.resolving(cause))?;
            }
            Op::StoreCookie(name) => {
                ctx.store_cookie(name).map_err(|cause| self.resolving(cause))?;
            }
            Op::SetCookie { name, value } => {
                let resolved = resolve(value, ctx).map_err(|cause| {
                    self.resolving(cause).with_operand(Operand::declared(value))
                })?;
                ctx.set_cookie(Cookie::new(name.clone(), resolved.to_text()));
            }
            Op::Wait(duration) => {
                let cancel = ctx.cancel_token();
                tokio::select! {
                    _ = tokio::time::sleep(*duration) => {}
                    _ = cancel.cancelled() => return Err(self.failed("wait cancelled")),
                }
            }
            Op::Call(callback) => callback(ctx).map_err(|message| self.failed(message))?,
            Op::MockSetup { mock, definition } => {
                let service = ctx.mock(mock).map_err(|cause| self.resolving(cause))?;
                let resolved = resolve(definition, ctx).map_err(|cause| {
                    self.resolving(cause).with_operand(Operand::declared(definition))
                })?;
                service
                    .setup(resolved)
                    .await
                    .map_err(|message| self.failed(format!("mock `{mock}` setup failed: {message}")))?;
            }
            Op::MockClear(mock) => {
                let service = ctx.mock(mock).map_err(|cause| self.resolving(cause))?;
                service
                    .clear()
                    .await
                    .map_err(|message| self.failed(format!("mock `{mock}` clear failed: {message}")))?;
            }
            Op::Listen { name, factory } => {
                ctx.register_listener(name, factory)
                    .map_err(|cause| self.resolving(cause))?;
            }
            Op::ClearListener(name) => match ctx.listener(name) {
                Some(listener) => listener.clear(),
                None => return Err(self.resolving(ResolveError::UnknownListener(name.clone()))),
            },
        }
        Ok(())
    }
}

impl Capture for Action {
    fn name(&self) -> &str {
        &self.name
    }

    fn frame(&self) -> Frame {
        self.frame
    }

    fn run<'a>(&'a self, ctx: &'a mut Context) -> CaptureFuture<'a> {
        Box::pin(self.apply(ctx))
    }
}

/// Deep-resolve `value` and bind it to `name`.
#[track_caller]
pub fn set_var(name: impl Into<String>, value: impl Into<Value>) -> Action {
    let name = name.into();
    Action::new(
        format!("set var {name}"),
        Op::SetVar {
            name,
            value: value.into(),
        },
    )
}

#[track_caller]
pub fn clear_vars<N: Into<String>>(names: impl IntoIterator<Item = N>) -> Action {
    Action::new(
        "clear vars",
        Op::ClearVars(names.into_iter().map(Into::into).collect()),
    )
}

#[track_caller]
pub fn clear_all_vars() -> Action {
    Action::new("clear all vars", Op::ClearAllVars)
}

/// Insert one row. `row` must be (or resolve to) an object; raw-query
/// entries are spliced into the statement, containers are bound as JSON text.
#[track_caller]
pub fn db_insert(database: impl Into<String>, table: impl Into<String>, row: impl Into<Value>) -> Action {
    let table = table.into();
    Action::new(
        format!("db insert {table}"),
        Op::DbInsert {
            database: database.into(),
            table,
            row: row.into(),
        },
    )
}

#[track_caller]
pub fn db_exec<A: Into<Value>>(
    database: impl Into<String>,
    query: impl Into<String>,
    args: impl IntoIterator<Item = A>,
) -> Action {
    Action::new(
        "db exec",
        Op::DbExec {
            database: database.into(),
            query: query.into(),
            args: args.into_iter().map(Into::into).collect(),
        },
    )
}

#[track_caller]
pub fn db_clear_table(database: impl Into<String>, table: impl Into<String>) -> Action {
    let table = table.into();
    Action::new(
        format!("db clear {table}"),
        Op::DbClearTable {
            database: database.into(),
            table,
        },
    )
}

/// Copy a cookie set by the current response into the jar.
#[track_caller]
pub fn store_cookie(name: impl Into<String>) -> Action {
    let name = name.into();
    Action::new(format!("store cookie {name}"), Op::StoreCookie(name))
}

#[track_caller]
pub fn set_cookie(name: impl Into<String>, value: impl Into<Value>) -> Action {
    let name = name.into();
    Action::new(
        format!("set cookie {name}"),
        Op::SetCookie {
            name,
            value: value.into(),
        },
    )
}

/// Sleep without contributing to request timings. Cancelling the run
/// interrupts the wait and fails the capture.
#[track_caller]
pub fn wait(duration: Duration) -> Action {
    Action::new(format!("wait {duration:?}"), Op::Wait(duration))
}

#[track_caller]
pub fn call<F>(name: impl Into<String>, callback: F) -> Action
where
    F: Fn(&mut Context) -> Result<(), String> + Send + Sync + 'static,
{
    Action::new(name, Op::Call(Arc::new(callback)))
}

#[track_caller]
pub fn mock_setup(mock: impl Into<String>, definition: impl Into<Value>) -> Action {
    let mock = mock.into();
    Action::new(
        format!("mock setup {mock}"),
        Op::MockSetup {
            mock,
            definition: definition.into(),
        },
    )
}

#[track_caller]
pub fn mock_clear(mock: impl Into<String>) -> Action {
    let mock = mock.into();
    Action::new(format!("mock clear {mock}"), Op::MockClear(mock))
}

/// Register a listener under `name`; a second registration clears it.
#[track_caller]
pub fn listen(name: impl Into<String>, factory: ListenerFactory) -> Action {
    let name = name.into();
    Action::new(format!("listen {name}"), Op::Listen { name, factory })
}

#[track_caller]
pub fn clear_listener(name: impl Into<String>) -> Action {
    let name = name.into();
    Action::new(format!("clear listener {name}"), Op::ClearListener(name))
}

/// Runs `inner` only when the condition resolves truthy.
pub struct When {
    name: String,
    frame: Frame,
    condition: Value,
    inner: Box<dyn Capture>,
}

#[track_caller]
pub fn when(condition: impl Into<Value>, inner: impl Capture + 'static) -> When {
    When {
        name: format!("when {}", inner.name()),
        frame: Frame::caller(),
        condition: condition.into(),
        inner: Box::new(inner),
    }
}

impl Capture for When {
    fn name(&self) -> &str {
        &self.name
    }

    fn frame(&self) -> Frame {
        self.frame
    }

    fn run<'a>(&'a self, ctx: &'a mut Context) -> CaptureFuture<'a> {
        Box::pin(async move {
            preload(&[&self.condition], ctx).await.map_err(|cause| {
                CaptureError::resolving(self.name.clone(), self.frame, cause)
            })?;
            let condition = resolve(&self.condition, ctx).map_err(|cause| {
                CaptureError::resolving(self.name.clone(), self.frame, cause)
                    .with_operand(Operand::declared(&self.condition))
            })?;
            if !condition.is_truthy() {
                tracing::debug!(capture = %self.name, "condition false, skipping");
                return Ok(());
            }
            self.inner.run(ctx).await
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Before,
    After,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Before => write!(f, "before"),
            Phase::After => write!(f, "after"),
        }
    }
}

/// Endpoint hook: a capture tagged with the phase it runs in.
pub struct Staged {
    phase: Phase,
    name: String,
    inner: Box<dyn Capture>,
}

impl Staged {
    pub fn new(phase: Phase, inner: impl Capture + 'static) -> Self {
        Self {
            phase,
            name: format!("{phase}: {}", inner.name()),
            inner: Box::new(inner),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }
}

impl Capture for Staged {
    fn name(&self) -> &str {
        &self.name
    }

    fn frame(&self) -> Frame {
        self.inner.frame()
    }

    fn run<'a>(&'a self, ctx: &'a mut Context) -> CaptureFuture<'a> {
        self.inner.run(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstractions::listener::ChannelListener;
    use crate::abstractions::mock::{MockFuture, MockService};
    use crate::domain::object;
    use crate::engine::expect::expect_equal;
    use crate::engine::resolvables::{db_query, raw_query, satisfied, var};
    use crate::store::sqlite::SqliteDatabase;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingMock {
        installed: Mutex<Vec<Value>>,
    }

    impl MockService for RecordingMock {
        fn setup(&self, definition: Value) -> MockFuture<'_> {
            Box::pin(async move {
                if definition.as_object().is_none() {
                    return Err("definition must be an object".to_string());
                }
                self.installed.lock().push(definition);
                Ok(())
            })
        }

        fn clear(&self) -> MockFuture<'_> {
            Box::pin(async move {
                self.installed.lock().clear();
                Ok(())
            })
        }
    }

    fn sqlite_ctx() -> Context {
        let db = SqliteDatabase::open_in_memory().expect("sqlite");
        db.execute_batch(
            "CREATE TABLE cats (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE pets (id TEXT, cat_id INTEGER, tags TEXT);
             INSERT INTO cats (id, name) VALUES (7, 'tom');",
        )
        .expect("schema");
        let mut ctx = Context::detached();
        ctx.register_database("main", db.into_named());
        ctx
    }

    async fn select(ctx: &mut Context, sql: &str) -> Vec<crate::abstractions::database::Row> {
        ctx.load_rows("main", sql, Vec::new()).await.expect("load");
        ctx.db_query("main", sql, &[]).expect("query")
    }

    #[tokio::test]
    async fn set_var_resolves_before_binding() {
        let mut ctx = Context::detached();
        ctx.set_var("base", 41);
        set_var("copy", var("base")).run(&mut ctx).await.expect("run");
        ctx.set_var("base", 0);
        assert_eq!(ctx.var("copy"), Some(&Value::Int(41)));

        let err = set_var("broken", var("nope")).run(&mut ctx).await.unwrap_err();
        assert_eq!(err.cause, Some(ResolveError::UnknownVariable("nope".into())));
        assert_eq!(err.operands.len(), 1);
        assert_eq!(err.frame.file, file!());
    }

    #[tokio::test]
    async fn clear_vars_by_name_and_all() {
        let mut ctx = Context::detached();
        ctx.set_var("a", 1);
        ctx.set_var("b", 2);
        clear_vars(["a"]).run(&mut ctx).await.expect("clear");
        assert!(ctx.var("a").is_none());
        assert!(ctx.var("b").is_some());
        clear_all_vars().run(&mut ctx).await.expect("clear all");
        assert!(ctx.var("b").is_none());
    }

    #[tokio::test]
    async fn database_captures() {
        let mut ctx = sqlite_ctx();
        let row = object([
            ("id", Value::from("x")),
            ("cat_id", raw_query("(SELECT id FROM cats LIMIT 1)")),
            ("tags", Value::from(vec!["a", "b"])),
        ]);
        db_insert("", "pets", row).run(&mut ctx).await.expect("insert");

        let rows = select(&mut ctx, "SELECT id, cat_id, tags FROM pets").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["cat_id"], Value::Int(7));
        assert_eq!(rows[0]["tags"], Value::from(r#"["a","b"]"#));

        db_exec("main", "UPDATE pets SET id = ?", ["y"])
            .run(&mut ctx)
            .await
            .expect("exec");
        db_clear_table("main", "pets").run(&mut ctx).await.expect("clear");
        assert!(select(&mut ctx, "SELECT id FROM pets").await.is_empty());

        set_var("cat", db_query("main", "SELECT name FROM cats WHERE id = ?", [var("cat_id")]))
            .run(&mut ctx)
            .await
            .expect_err("cat_id is not set yet");
        ctx.set_var("cat_id", 7);
        set_var("cat", db_query("main", "SELECT name FROM cats WHERE id = ?", [var("cat_id")]))
            .run(&mut ctx)
            .await
            .expect("query through a capture");
        assert_eq!(ctx.var("cat"), Some(&Value::from("tom")));

        let err = db_exec("main", "SELECT * FROM missing", Vec::<Value>::new())
            .run(&mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err.cause, Some(ResolveError::Database { .. })));
        let err = db_clear_table("other", "pets").run(&mut ctx).await.unwrap_err();
        assert_eq!(err.cause, Some(ResolveError::UnknownDatabase("other".into())));
    }

    #[tokio::test]
    async fn cookie_captures() {
        let mut ctx = Context::detached();
        ctx.set_var("token", "abc");
        set_cookie("session", var("token")).run(&mut ctx).await.expect("set");
        assert_eq!(ctx.cookie("session").map(|c| c.value.as_str()), Some("abc"));

        let err = store_cookie("session").run(&mut ctx).await.unwrap_err();
        assert_eq!(err.cause, Some(ResolveError::NoResponse));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_and_honours_cancellation() {
        let mut ctx = Context::detached();
        let started = tokio::time::Instant::now();
        wait(Duration::from_secs(5)).run(&mut ctx).await.expect("wait");
        assert!(started.elapsed() >= Duration::from_secs(5));

        let cancel = ctx.cancel_token();
        cancel.cancel();
        let err = wait(Duration::from_secs(60)).run(&mut ctx).await.unwrap_err();
        assert_eq!(err.message, "wait cancelled");
    }

    #[tokio::test]
    async fn call_and_when() {
        let mut ctx = Context::detached();
        let bump = || {
            call("bump", |ctx: &mut Context| {
                let next = ctx.var("n").and_then(Value::as_i64).unwrap_or(0) + 1;
                ctx.set_var("n", next);
                Ok(())
            })
        };
        bump().run(&mut ctx).await.expect("call");
        when(satisfied(expect_equal(var("n"), 1)), bump())
            .run(&mut ctx)
            .await
            .expect("when");
        when(false, bump()).run(&mut ctx).await.expect("skipped");
        assert_eq!(ctx.var("n"), Some(&Value::Int(2)));

        let err = call("explode", |_| Err("nope".into())).run(&mut ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "explode: nope");
    }

    #[tokio::test]
    async fn mock_captures() {
        let mock = Arc::new(RecordingMock::default());
        let mut ctx = Context::detached();
        ctx.register_mock("payments", mock.clone());
        ctx.set_var("amount", 10);

        mock_setup("payments", object([("amount", var("amount"))]))
            .run(&mut ctx)
            .await
            .expect("setup");
        assert_eq!(mock.installed.lock()[0], object([("amount", 10)]));

        let err = mock_setup("payments", "bad").run(&mut ctx).await.unwrap_err();
        assert!(err.message.contains("definition must be an object"));

        mock_clear("payments").run(&mut ctx).await.expect("clear");
        assert!(mock.installed.lock().is_empty());
        let err = mock_clear("ledger").run(&mut ctx).await.unwrap_err();
        assert_eq!(err.cause, Some(ResolveError::UnknownMock("ledger".into())));
    }

    #[tokio::test]
    async fn listen_registers_once_and_clears() {
        let (sender, receiver) = mpsc::channel(8);
        let mut ctx = Context::detached();
        let capture = listen("events", ChannelListener::factory(receiver));
        capture.run(&mut ctx).await.expect("listen");

        sender.send(Value::from("one")).await.expect("send");
        for _ in 0..50 {
            if ctx.listener("events").map(|l| l.events_count()) == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(ctx.listener("events").map(|l| l.events_count()), Some(1));

        capture.run(&mut ctx).await.expect("re-listen clears");
        assert_eq!(ctx.listener("events").map(|l| l.events_count()), Some(0));

        clear_listener("events").run(&mut ctx).await.expect("clear");
        let err = clear_listener("other").run(&mut ctx).await.unwrap_err();
        assert_eq!(err.cause, Some(ResolveError::UnknownListener("other".into())));
        ctx.stop_listeners();
    }

    #[test]
    fn staged_names_carry_the_phase() {
        let staged = Staged::new(Phase::After, clear_all_vars());
        assert_eq!(staged.phase(), Phase::After);
        assert_eq!(staged.name(), "after: clear all vars");
        assert_eq!(staged.frame().file, file!());
    }
}
