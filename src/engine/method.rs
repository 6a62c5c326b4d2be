use super::capture::Capture;
use super::context::Context;
use super::error::HarnessError;
use super::expect::{Expectation, Verdict};
use super::http::{build_headers, decode_body};
use super::resolve::{preload, resolve};
use crate::domain::{Cookie, Frame, MethodRef, RequestRecord, Value};
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Unreserved characters stay literal in path segments and query values.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub type Marshaller = Arc<dyn Fn(&Value) -> Result<Vec<u8>, String> + Send + Sync>;
pub type Unmarshaller = Arc<dyn Fn(&[u8]) -> Result<Value, String> + Send + Sync>;

/// One entry of the post-request list; expectations and captures share a
/// single list so declaration order is kept across both kinds.
pub enum PostOp {
    Expect(Expectation),
    Capture(Box<dyn Capture>),
}

/// An HTTP verb bound to an endpoint, with everything needed to build the
/// request and check the response.
pub struct Method {
    verb: http::Method,
    description: String,
    frame: Frame,
    path_params: Vec<Value>,
    query: BTreeMap<String, Vec<Value>>,
    headers: Vec<(String, Value)>,
    body: Value,
    cookies: Vec<String>,
    pre: Vec<Box<dyn Capture>>,
    post: Vec<PostOp>,
    marshaller: Option<Marshaller>,
    unmarshaller: Option<Unmarshaller>,
    fail_fast: bool,
}

macro_rules! verb_constructors {
    ($($name:ident => $verb:ident),* $(,)?) => {
        $(
            #[track_caller]
            pub fn $name(description: impl Into<String>) -> Self {
                Self::new(http::Method::$verb, description)
            }
        )*
    };
}

impl Method {
    #[track_caller]
    pub fn new(verb: http::Method, description: impl Into<String>) -> Self {
        Self {
            verb,
            description: description.into(),
            frame: Frame::caller(),
            path_params: Vec::new(),
            query: BTreeMap::new(),
            headers: Vec::new(),
            body: Value::Null,
            cookies: Vec::new(),
            pre: Vec::new(),
            post: Vec::new(),
            marshaller: None,
            unmarshaller: None,
            fail_fast: false,
        }
    }

    verb_constructors! {
        get => GET,
        post => POST,
        put => PUT,
        patch => PATCH,
        delete => DELETE,
        head => HEAD,
        options => OPTIONS,
    }

    pub fn verb(&self) -> &http::Method {
        &self.verb
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// Positional value for the next `{placeholder}` of the endpoint URL.
    pub fn path_param(mut self, value: impl Into<Value>) -> Self {
        self.path_params.push(value.into());
        self
    }

    /// Adds a value to the query multimap; repeated keys keep their order.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.entry(key.into()).or_default().push(value.into());
        self
    }

    /// Bare `key` with no value.
    pub fn query_flag(self, key: impl Into<String>) -> Self {
        self.query(key, Value::Null)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Value>) -> Self {
        self.body = body.into();
        self
    }

    /// Send the named cookie from the jar with the request.
    pub fn use_cookie(mut self, name: impl Into<String>) -> Self {
        self.cookies.push(name.into());
        self
    }

    pub fn pre(mut self, capture: impl Capture + 'static) -> Self {
        self.pre.push(Box::new(capture));
        self
    }

    pub fn assert(mut self, expectation: Expectation) -> Self {
        self.post.push(PostOp::Expect(expectation));
        self
    }

    /// Like `assert`, but an unmet outcome terminates the method.
    pub fn require(mut self, expectation: Expectation) -> Self {
        self.post.push(PostOp::Expect(expectation.required()));
        self
    }

    pub fn capture(mut self, capture: impl Capture + 'static) -> Self {
        self.post.push(PostOp::Capture(Box::new(capture)));
        self
    }

    pub fn marshal_with<F>(mut self, marshaller: F) -> Self
    where
        F: Fn(&Value) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        self.marshaller = Some(Arc::new(marshaller));
        self
    }

    pub fn unmarshal_with<F>(mut self, unmarshaller: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.unmarshaller = Some(Arc::new(unmarshaller));
        self
    }

    /// Treat every asserted expectation of this method as required.
    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    pub fn post_ops(&self) -> &[PostOp] {
        &self.post
    }

    /// Execute against `url` (the endpoint template). Returns whether the
    /// walker should continue with sibling methods.
    pub(crate) async fn run(&self, ctx: &mut Context, url: &str) -> bool {
        let step = format!("{} {url}", self.verb);
        let bridge = ctx.bridge();
        if let Some(bridge) = &bridge {
            bridge.begin_step(&step);
        }

        ctx.set_method(Some(MethodRef {
            verb: self.verb.to_string(),
            description: self.description.clone(),
            frame: self.frame,
        }));
        self.execute(ctx, url).await;

        let proceed = bridge.map_or(true, |bridge| bridge.end_step(&step));
        proceed && !ctx.cancel_token().is_cancelled()
    }

    async fn execute(&self, ctx: &mut Context, url: &str) {
        for capture in &self.pre {
            if let Err(err) = capture.run(ctx).await {
                ctx.report_failure(capture.name(), capture.frame(), &err.into(), true);
                return;
            }
        }

        let request = match preload(&self.request_operands(), ctx).await {
            Ok(()) => self.build_request(ctx, url),
            Err(err) => Err(err.into()),
        };
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                ctx.report_failure("build request", self.frame, &err, true);
                return;
            }
        };
        ctx.set_request(RequestRecord::from_request(&request));
        tracing::debug!(method = %self.verb, url = %request.uri(), "sending request");

        let transport = ctx.transport();
        let started = Instant::now();
        let result = transport.send(request, ctx.cancel_token()).await;
        let elapsed = started.elapsed();
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                ctx.report_failure("send request", self.frame, &err.into(), true);
                return;
            }
        };
        ctx.report_timing(elapsed);
        tracing::debug!(
            method = %self.verb,
            status = response.status().as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "response received"
        );

        let decoded = match &self.unmarshaller {
            Some(unmarshal) => unmarshal(response.body()),
            None => Ok(decode_body(response.body())),
        };
        match decoded {
            Ok(body) => ctx.set_response(response, body),
            Err(reason) => {
                ctx.set_response(response, Value::Null);
                ctx.report_failure("decode response", self.frame, &HarnessError::Decode(reason), false);
            }
        }

        self.run_post_ops(ctx).await;
    }

    async fn run_post_ops(&self, ctx: &mut Context) {
        for (index, op) in self.post.iter().enumerate() {
            match op {
                PostOp::Expect(expectation) => {
                    let terminating = expectation.is_required() || self.fail_fast || ctx.fail_fast();
                    let verdict = match preload(&expectation.operands(), ctx).await {
                        Ok(()) => expectation.check(ctx),
                        Err(err) => Err(err),
                    };
                    let stop = match verdict {
                        Ok(Verdict::Met) => {
                            ctx.report_met(expectation.name());
                            false
                        }
                        Ok(Verdict::Unmet(unmet)) => {
                            ctx.report_unmet(&unmet, terminating);
                            terminating
                        }
                        Err(err) => {
                            ctx.report_failure(
                                expectation.name(),
                                expectation.frame(),
                                &err.into(),
                                terminating,
                            );
                            terminating
                        }
                    };
                    if stop {
                        self.skip_remaining(ctx, index + 1);
                        return;
                    }
                }
                PostOp::Capture(capture) => {
                    if let Err(err) = capture.run(ctx).await {
                        ctx.report_failure(capture.name(), capture.frame(), &err.into(), true);
                        return;
                    }
                }
            }
        }
    }

    fn skip_remaining(&self, ctx: &mut Context, from: usize) {
        for op in &self.post[from..] {
            if let PostOp::Expect(expectation) = op {
                ctx.report_skipped(expectation.name(), expectation.frame());
            }
        }
    }

    fn request_operands(&self) -> Vec<&Value> {
        let mut operands: Vec<&Value> = self.path_params.iter().collect();
        operands.extend(self.query.values().flatten());
        operands.extend(self.headers.iter().map(|(_, value)| value));
        operands.push(&self.body);
        operands
    }

    fn build_request(&self, ctx: &Context, url: &str) -> Result<http::Request<Bytes>, HarnessError> {
        let mut target = join_url(ctx.host(), &self.fill_path(url, ctx)?);
        let query = self.render_query(ctx)?;
        if !query.is_empty() {
            target.push(if target.contains('?') { '&' } else { '?' });
            target.push_str(&query);
        }

        let mut headers = Vec::with_capacity(self.headers.len() + 2);
        for (name, value) in &self.headers {
            headers.push((name.clone(), resolve(value, ctx)?.to_text()));
        }
        if !headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }

        let mut pairs = Vec::with_capacity(self.cookies.len());
        for name in &self.cookies {
            match ctx.cookie(name) {
                Some(cookie) => pairs.push(Cookie::pair(cookie)),
                None => tracing::debug!(cookie = %name, "cookie not in jar, not sent"),
            }
        }
        if !pairs.is_empty() {
            headers.push(("Cookie".to_string(), pairs.join("; ")));
        }

        let body = self.encode_body(ctx)?;
        let mut request = http::Request::builder()
            .method(self.verb.clone())
            .uri(&target)
            .body(body)
            .map_err(|err| HarnessError::Request(format!("invalid request to `{target}`: {err}")))?;
        *request.headers_mut() = build_headers(&headers)?;
        Ok(request)
    }

    /// Fill `{placeholder}` segments with the positional path parameters.
    fn fill_path(&self, template: &str, ctx: &Context) -> Result<String, HarnessError> {
        let mut out = String::with_capacity(template.len());
        let mut params = self.path_params.iter();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}').map(|offset| open + offset) else {
                break;
            };
            out.push_str(&rest[..open]);
            let placeholder = &rest[open..=close];
            let param = params.next().ok_or_else(|| {
                HarnessError::Request(format!(
                    "no path parameter for {placeholder} in `{template}`"
                ))
            })?;
            let value = resolve(param, ctx)?.to_text();
            out.extend(utf8_percent_encode(&value, COMPONENT));
            rest = &rest[close + 1..];
        }
        out.push_str(rest);

        if params.next().is_some() {
            return Err(HarnessError::Request(format!(
                "{} path parameters declared for `{template}`",
                self.path_params.len()
            )));
        }
        Ok(out)
    }

    /// Keys ascending; a null value renders as a bare key.
    fn render_query(&self, ctx: &Context) -> Result<String, HarnessError> {
        let mut parts = Vec::new();
        for (key, values) in &self.query {
            let key = utf8_percent_encode(key, COMPONENT).to_string();
            for value in values {
                let resolved = resolve(value, ctx)?;
                if resolved.is_null() {
                    parts.push(key.clone());
                } else {
                    let text = resolved.to_text();
                    parts.push(format!("{key}={}", utf8_percent_encode(&text, COMPONENT)));
                }
            }
        }
        Ok(parts.join("&"))
    }

    fn encode_body(&self, ctx: &Context) -> Result<Bytes, HarnessError> {
        let resolved = resolve(&self.body, ctx)?;
        let payload = match (&self.marshaller, resolved) {
            (_, Value::Null) => return Ok(Bytes::new()),
            (Some(marshal), value) => marshal(&value)
                .map_err(|reason| HarnessError::Request(format!("failed to marshal body: {reason}")))?,
            (None, Value::Bytes(raw)) => raw,
            (None, value) => serde_json::to_vec(&value.to_json())
                .map_err(|err| HarnessError::Request(format!("failed to encode body: {err}")))?,
        };
        Ok(Bytes::from(payload))
    }
}

/// Join the suite host and a path. Absolute URLs are used as they are.
pub(crate) fn join_url(host: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let host = host.trim_end_matches('/');
    if path.is_empty() {
        host.to_string()
    } else if path.starts_with('/') {
        format!("{host}{path}")
    } else {
        format!("{host}/{path}")
    }
}
