use super::bridge::TestBridge;
use super::cancel::CancelToken;
use super::error::{HarnessError, ResolveError, UnmetError};
use super::http::{NoTransport, Transport};
use super::resolve::{resolve, MAX_RESOLVE_DEPTH};
use crate::abstractions::database::{build_insert, DatabaseRegistry, NamedDatabase, Row};
use crate::abstractions::image::Image;
use crate::abstractions::listener::{Listener, ListenerFactory, ListenerRegistry};
use crate::abstractions::mock::MockService;
use crate::coverage::{Collector, NullCollector, Site};
use crate::domain::{
    response_cookies, Cookie, EndpointRef, Frame, Map, MethodRef, RequestRecord, Value,
};
use crate::report::{Outcome, ReportEntry, RunReport};
use bytes::Bytes;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Held while a deferred value is being evaluated.
pub struct ResolutionGuard<'a> {
    depth: &'a AtomicUsize,
}

impl Drop for ResolutionGuard<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mutable state of one run (or one repeat of a run).
///
/// Only the walker mutates it; listeners write into their own buffers and
/// never into the context.
pub struct Context {
    vars: HashMap<String, Value>,
    cookies: IndexMap<String, Cookie>,
    databases: DatabaseRegistry,
    loaded: HashMap<String, Vec<Row>>,
    images: IndexMap<String, Arc<dyn Image>>,
    mocks: IndexMap<String, Arc<dyn MockService>>,
    listeners: ListenerRegistry,

    endpoint: Option<EndpointRef>,
    method: Option<MethodRef>,
    request: Option<RequestRecord>,
    response: Option<http::Response<Bytes>>,
    body: Value,

    collector: Arc<dyn Collector>,
    transport: Arc<dyn Transport>,
    host: String,
    bridge: Option<Arc<dyn TestBridge>>,
    cancel: CancelToken,

    fail_fast: bool,
    listener_buffer: usize,
    repeat: u32,
    depth: AtomicUsize,
    report: RunReport,
}

impl Context {
    pub fn new(
        host: impl Into<String>,
        transport: Arc<dyn Transport>,
        collector: Arc<dyn Collector>,
    ) -> Self {
        Self {
            vars: HashMap::new(),
            cookies: IndexMap::new(),
            databases: DatabaseRegistry::default(),
            loaded: HashMap::new(),
            images: IndexMap::new(),
            mocks: IndexMap::new(),
            listeners: ListenerRegistry::default(),
            endpoint: None,
            method: None,
            request: None,
            response: None,
            body: Value::Null,
            collector,
            transport,
            host: host.into(),
            bridge: None,
            cancel: CancelToken::new(),
            fail_fast: false,
            listener_buffer: 1024,
            repeat: 1,
            depth: AtomicUsize::new(0),
            report: RunReport::default(),
        }
    }

    /// Context with no transport and a null collector, for evaluating
    /// values outside a suite.
    pub fn detached() -> Self {
        Self::new("", Arc::new(NoTransport), Arc::new(NullCollector::default()))
    }

    pub(crate) fn with_bridge(mut self, bridge: Option<Arc<dyn TestBridge>>) -> Self {
        self.bridge = bridge;
        self
    }

    pub(crate) fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) fn with_settings(mut self, fail_fast: bool, listener_buffer: usize, repeat: u32) -> Self {
        self.fail_fast = fail_fast;
        self.listener_buffer = listener_buffer;
        self.repeat = repeat;
        self
    }

    // ─── Run settings ────────────────────────────────────────────────────────

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    pub fn listener_buffer(&self) -> usize {
        self.listener_buffer
    }

    pub fn repeat(&self) -> u32 {
        self.repeat
    }

    pub fn bridge(&self) -> Option<Arc<dyn TestBridge>> {
        self.bridge.clone()
    }

    /// Track one nested deferred evaluation; fails past the depth bound.
    pub fn enter_resolution(&self) -> Result<ResolutionGuard<'_>, ResolveError> {
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if depth > MAX_RESOLVE_DEPTH {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(ResolveError::ResolutionLoop(MAX_RESOLVE_DEPTH));
        }
        Ok(ResolutionGuard { depth: &self.depth })
    }

    // ─── Variables ───────────────────────────────────────────────────────────

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn clear_var(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    pub fn clear_vars(&mut self) {
        self.vars.clear();
    }

    // ─── Cookies ─────────────────────────────────────────────────────────────

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.get(name)
    }

    pub fn set_cookie(&mut self, cookie: Cookie) {
        self.cookies.insert(cookie.name.clone(), cookie);
    }

    /// Cookie set by the current response, if any.
    pub fn response_cookie(&self, name: &str) -> Option<Cookie> {
        self.response
            .as_ref()
            .and_then(|response| response_cookies(response).into_iter().find(|c| c.name == name))
    }

    /// Copy a cookie from the current response into the jar.
    pub fn store_cookie(&mut self, name: &str) -> Result<(), ResolveError> {
        if self.response.is_none() {
            return Err(ResolveError::NoResponse);
        }
        let cookie = self
            .response_cookie(name)
            .ok_or_else(|| ResolveError::CookieNotFound(name.to_string()))?;
        self.set_cookie(cookie);
        Ok(())
    }

    // ─── Current exchange ────────────────────────────────────────────────────

    pub fn set_endpoint(&mut self, endpoint: Option<EndpointRef>) {
        self.endpoint = endpoint;
    }

    pub fn current_endpoint(&self) -> Option<&EndpointRef> {
        self.endpoint.as_ref()
    }

    /// Selecting a method resets the exchange of the previous one.
    pub fn set_method(&mut self, method: Option<MethodRef>) {
        self.method = method;
        self.request = None;
        self.response = None;
        self.body = Value::Null;
    }

    pub fn current_method(&self) -> Option<&MethodRef> {
        self.method.as_ref()
    }

    pub(crate) fn set_request(&mut self, request: RequestRecord) {
        self.request = Some(request);
    }

    pub fn request(&self) -> Option<&RequestRecord> {
        self.request.as_ref()
    }

    pub(crate) fn set_response(&mut self, response: http::Response<Bytes>, body: Value) {
        self.response = Some(response);
        self.body = body;
    }

    pub fn response(&self) -> Option<&http::Response<Bytes>> {
        self.response.as_ref()
    }

    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().map(|response| response.status().as_u16())
    }

    /// First value of a response header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<String> {
        self.response
            .as_ref()?
            .headers()
            .get(name)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    // ─── Databases ───────────────────────────────────────────────────────────

    pub fn register_database(&mut self, name: impl Into<String>, database: NamedDatabase) {
        self.databases.register(name, database);
    }

    pub fn database(&self, name: &str) -> Result<&NamedDatabase, ResolveError> {
        self.databases.get(name).ok_or_else(|| {
            ResolveError::UnknownDatabase(if name.is_empty() {
                "<default>".to_string()
            } else {
                name.to_string()
            })
        })
    }

    fn database_error(name: &str, reason: String) -> ResolveError {
        ResolveError::Database {
            database: name.to_string(),
            reason,
        }
    }

    fn named_database(&self, name: &str) -> Result<NamedDatabase, ResolveError> {
        self.database(name).cloned()
    }

    pub async fn db_insert(&mut self, database: &str, table: &str, row: &Map) -> Result<u64, ResolveError> {
        let named = self.named_database(database)?;
        let (sql, args) = build_insert(table, row, named.markers, self)?;
        tracing::debug!(database, %sql, args = args.len(), "database insert");
        named
            .handle
            .exec(sql, args)
            .await
            .map_err(|reason| Self::database_error(database, reason))
    }

    pub async fn db_exec(&mut self, database: &str, query: &str, args: &[Value]) -> Result<u64, ResolveError> {
        let named = self.named_database(database)?;
        let args = self.resolve_all(args)?;
        tracing::debug!(database, %query, args = args.len(), "database exec");
        named
            .handle
            .exec(query.to_string(), args)
            .await
            .map_err(|reason| Self::database_error(database, reason))
    }

    /// Run a query and keep its rows for [`Context::db_query`].
    pub async fn load_rows(&mut self, database: &str, query: &str, args: Vec<Value>) -> Result<(), ResolveError> {
        let named = self.named_database(database)?;
        let key = query_key(database, query, &args);
        if self.loaded.contains_key(&key) {
            return Ok(());
        }
        tracing::debug!(database, %query, args = args.len(), "database query");
        let rows = named
            .handle
            .query(query.to_string(), args)
            .await
            .map_err(|reason| Self::database_error(database, reason))?;
        self.loaded.insert(key, rows);
        Ok(())
    }

    pub(crate) fn clear_loaded_rows(&mut self) {
        self.loaded.clear();
    }

    /// Rows of a query loaded by [`preload`](super::resolve::preload).
    pub fn db_query(&self, database: &str, query: &str, args: &[Value]) -> Result<Vec<Row>, ResolveError> {
        self.database(database)?;
        let args = self.resolve_all(args)?;
        self.loaded
            .get(&query_key(database, query, &args))
            .cloned()
            .ok_or_else(|| {
                Self::database_error(database, format!("query was not loaded before evaluation: {query}"))
            })
    }

    fn resolve_all(&self, values: &[Value]) -> Result<Vec<Value>, ResolveError> {
        values.iter().map(|value| resolve(value, self)).collect()
    }

    // ─── Images and mocks ────────────────────────────────────────────────────

    pub fn register_image(&mut self, image: Arc<dyn Image>) {
        self.images.insert(image.name().to_string(), image);
    }

    pub fn image(&self, name: &str) -> Option<&Arc<dyn Image>> {
        self.images.get(name)
    }

    /// Answer a `{$svc:image:tokens…}` marker.
    pub fn resolve_image_env(&self, image: &str, tokens: &[&str]) -> Result<String, ResolveError> {
        let found = self
            .image(image)
            .ok_or_else(|| ResolveError::UnknownImage(image.to_string()))?;
        let token_error = |reason: String| ResolveError::ImageToken {
            image: image.to_string(),
            token: tokens.join(":"),
            reason,
        };
        match found.resolve_env(tokens) {
            Some(result) => result.map_err(token_error),
            None => Err(token_error("image has no environment capability".into())),
        }
    }

    pub fn register_mock(&mut self, name: impl Into<String>, mock: Arc<dyn MockService>) {
        self.mocks.insert(name.into(), mock);
    }

    pub fn mock(&self, name: &str) -> Result<Arc<dyn MockService>, ResolveError> {
        self.mocks
            .get(name)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownMock(name.to_string()))
    }

    // ─── Listeners ───────────────────────────────────────────────────────────

    pub fn listener(&self, name: &str) -> Option<&Arc<dyn Listener>> {
        self.listeners.get(name)
    }

    /// Register a listener built by `factory`. A name that is already
    /// registered is cleared instead; returns whether a listener was created.
    pub fn register_listener(&mut self, name: &str, factory: &ListenerFactory) -> Result<bool, ResolveError> {
        if let Some(existing) = self.listeners.get(name) {
            existing.clear();
            return Ok(false);
        }
        let listener = factory(self)?;
        self.listeners.insert(name, listener);
        tracing::debug!(listener = name, "listener registered");
        Ok(true)
    }

    /// Stop every listener, last registered first.
    pub fn stop_listeners(&mut self) {
        let stopped = self.listeners.stop_all();
        if !stopped.is_empty() {
            tracing::debug!(listeners = ?stopped, "listeners stopped");
        }
    }

    // ─── Reporting ───────────────────────────────────────────────────────────

    fn site(&self) -> Site<'_> {
        Site {
            endpoint: self.endpoint.as_ref().map(|e| e.url.as_str()).unwrap_or_default(),
            method: self.method.as_ref().map(|m| m.verb.as_str()).unwrap_or_default(),
            request: self.request.as_ref(),
        }
    }

    fn entry(&self, outcome: Outcome, name: &str, frame: Frame, message: String, detail: Option<String>) -> ReportEntry {
        let site = self.site();
        ReportEntry {
            repeat: self.repeat,
            endpoint: site.endpoint.to_string(),
            method: site.method.to_string(),
            outcome,
            name: name.to_string(),
            frame,
            message,
            detail,
        }
    }

    pub fn report_met(&mut self, name: &str) {
        self.collector.report_met(self.site(), name);
        tracing::debug!(expectation = name, "met");
        self.report.record_met();
    }

    /// `fatal` marks a terminating unmet.
    pub fn report_unmet(&mut self, unmet: &UnmetError, fatal: bool) {
        self.collector.report_unmet(self.site(), unmet);
        let detail = unmet.test_format();
        tracing::warn!(
            expectation = %unmet.name,
            frame = %unmet.frame,
            fatal,
            "{}",
            unmet.message
        );
        let entry = self.entry(
            Outcome::Unmet,
            &unmet.name,
            unmet.frame,
            unmet.message.clone(),
            Some(detail.clone()),
        );
        self.report.record(entry);
        self.notify_bridge(&detail, fatal);
    }

    pub fn report_skipped(&mut self, name: &str, frame: Frame) {
        self.collector.report_skipped(self.site(), name);
        tracing::debug!(expectation = name, "skipped");
        let entry = self.entry(Outcome::Skipped, name, frame, String::new(), None);
        self.report.record(entry);
    }

    pub fn report_failure(&mut self, name: &str, frame: Frame, error: &HarnessError, fatal: bool) {
        self.collector.report_failure(self.site(), error);
        tracing::warn!(operation = name, frame = %frame, fatal, error = %error, "failure");
        let detail = match error {
            HarnessError::Capture(_) | HarnessError::Unmet(_) => Some(error.test_format()),
            _ => None,
        };
        let entry = self.entry(Outcome::Failure, name, frame, error.to_string(), detail);
        self.report.record(entry);
        self.notify_bridge(&format!("{name} (declared at {frame}): {error}"), fatal);
    }

    pub fn report_timing(&mut self, elapsed: Duration) {
        self.collector.report_timing(self.site(), elapsed);
    }

    fn notify_bridge(&self, message: &str, fatal: bool) {
        if let Some(bridge) = &self.bridge {
            if fatal {
                bridge.fail_now(message);
            } else {
                bridge.fail(message);
            }
        }
    }

    pub fn has_failures(&self) -> bool {
        self.collector.has_failures()
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    pub(crate) fn take_report(&mut self) -> RunReport {
        std::mem::take(&mut self.report)
    }
}

fn query_key(database: &str, query: &str, args: &[Value]) -> String {
    let args: Vec<serde_json::Value> = args.iter().map(Value::to_json).collect();
    format!("{database}\u{0}{query}\u{0}{}", serde_json::Value::Array(args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstractions::image::StaticImage;
    use crate::abstractions::listener::ChannelListener;
    use crate::engine::bridge::RecordingBridge;
    use crate::engine::resolvables::var;
    use tokio::sync::mpsc;

    fn response_with_cookie() -> http::Response<Bytes> {
        http::Response::builder()
            .status(200)
            .header("set-cookie", "session=abc; Path=/")
            .header("X-Trace", "t-1")
            .body(Bytes::new())
            .expect("response")
    }

    #[test]
    fn variables_overwrite_and_clear() {
        let mut ctx = Context::detached();
        ctx.set_var("a", 1);
        ctx.set_var("a", 2);
        assert_eq!(ctx.var("a"), Some(&Value::Int(2)));
        ctx.clear_vars();
        assert!(ctx.var("a").is_none());
    }

    #[test]
    fn store_cookie_requires_a_matching_response_cookie() {
        let mut ctx = Context::detached();
        assert_eq!(ctx.store_cookie("session"), Err(ResolveError::NoResponse));

        ctx.set_response(response_with_cookie(), Value::Null);
        ctx.store_cookie("session").expect("store");
        assert_eq!(ctx.cookie("session").map(|c| c.value.as_str()), Some("abc"));
        assert_eq!(
            ctx.store_cookie("missing"),
            Err(ResolveError::CookieNotFound("missing".into()))
        );
        assert_eq!(ctx.header("x-trace").as_deref(), Some("t-1"));
    }

    #[test]
    fn selecting_a_method_resets_the_exchange() {
        let mut ctx = Context::detached();
        ctx.set_response(response_with_cookie(), Value::from("body"));
        ctx.set_method(None);
        assert!(ctx.response().is_none());
        assert!(ctx.body().is_null());
    }

    #[test]
    fn image_tokens_resolve_through_registered_images() {
        let mut ctx = Context::detached();
        ctx.register_image(Arc::new(StaticImage::new("db", "10.0.0.5", 5432)));
        assert_eq!(ctx.resolve_image_env("db", &["port"]).as_deref(), Ok("5432"));
        assert!(matches!(
            ctx.resolve_image_env("cache", &["host"]),
            Err(ResolveError::UnknownImage(_))
        ));
    }

    #[test]
    fn resolution_guard_releases_depth() {
        let mut ctx = Context::detached();
        ctx.set_var("x", 1);
        for _ in 0..(MAX_RESOLVE_DEPTH * 2) {
            assert_eq!(resolve(&var("x"), &ctx), Ok(Value::Int(1)));
        }
    }

    #[tokio::test]
    async fn re_registering_a_listener_clears_it() {
        let mut ctx = Context::detached();
        let (sender, receiver) = mpsc::channel(4);
        let factory = ChannelListener::factory(receiver);

        assert_eq!(ctx.register_listener("events", &factory), Ok(true));
        sender.send(Value::from("e1")).await.expect("send");
        for _ in 0..100 {
            if ctx.listener("events").map(|l| l.events_count()) == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(ctx.listener("events").map(|l| l.events_count()), Some(1));

        assert_eq!(ctx.register_listener("events", &factory), Ok(false));
        assert_eq!(ctx.listener("events").map(|l| l.events_count()), Some(0));
        ctx.stop_listeners();
        assert!(ctx.listener("events").is_none());
    }

    #[test]
    fn fatal_reports_reach_the_bridge_as_fail_now() {
        let bridge = Arc::new(RecordingBridge::new());
        let mut ctx = Context::detached().with_bridge(Some(bridge.clone()));
        bridge.begin_step("GET /pets");
        ctx.report_unmet(&UnmetError::new("status", Frame::unknown(), "expected 200"), true);
        ctx.report_failure(
            "set var",
            Frame::unknown(),
            &HarnessError::Request("bad".into()),
            false,
        );

        let steps = bridge.steps();
        assert_eq!(steps[0].fatal.len(), 1);
        assert_eq!(steps[0].failures.len(), 1);
        assert_eq!((ctx.report().unmet, ctx.report().failures), (1, 1));
        assert!(ctx.has_failures());
    }
}
