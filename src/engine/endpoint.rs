use super::capture::{Capture, Phase, Staged};
use super::context::Context;
use super::method::Method;
use crate::domain::{EndpointRef, Frame};
use std::future::Future;
use std::pin::Pin;

pub type WalkFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A node of the test tree at a URL fragment. Children are walked with
/// their fragment appended to this one.
pub struct Endpoint {
    url: String,
    description: String,
    frame: Frame,
    hooks: Vec<Staged>,
    methods: Vec<Method>,
    children: Vec<Endpoint>,
}

#[track_caller]
pub fn endpoint(url: impl Into<String>, description: impl Into<String>) -> Endpoint {
    Endpoint {
        url: url.into(),
        description: description.into(),
        frame: Frame::caller(),
        hooks: Vec::new(),
        methods: Vec::new(),
        children: Vec::new(),
    }
}

impl Endpoint {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn frame(&self) -> Frame {
        self.frame
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn children(&self) -> &[Endpoint] {
        &self.children
    }

    pub fn before(mut self, capture: impl Capture + 'static) -> Self {
        self.hooks.push(Staged::new(Phase::Before, capture));
        self
    }

    pub fn after(mut self, capture: impl Capture + 'static) -> Self {
        self.hooks.push(Staged::new(Phase::After, capture));
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    pub fn child(mut self, endpoint: Endpoint) -> Self {
        self.children.push(endpoint);
        self
    }

    /// Before hooks, methods in order, after hooks, then children.
    ///
    /// A failing before hook skips this endpoint's methods and children;
    /// the after hooks still run so that setup can be undone.
    pub(crate) fn walk<'a>(&'a self, ctx: &'a mut Context, prefix: &'a str) -> WalkFuture<'a> {
        Box::pin(async move {
            let url = format!("{prefix}{}", self.url);
            ctx.set_endpoint(Some(EndpointRef {
                url: url.clone(),
                description: self.description.clone(),
                frame: self.frame,
            }));
            ctx.set_method(None);
            tracing::debug!(endpoint = %url, methods = self.methods.len(), "walking endpoint");

            let ready = self.run_hooks(ctx, Phase::Before).await;
            if ready {
                for method in &self.methods {
                    if ctx.cancel_token().is_cancelled() || !method.run(ctx, &url).await {
                        break;
                    }
                }
            } else {
                tracing::warn!(endpoint = %url, "before hook failed, skipping methods and children");
            }

            ctx.set_method(None);
            self.run_hooks(ctx, Phase::After).await;

            if !ready {
                return;
            }
            for child in &self.children {
                if ctx.cancel_token().is_cancelled() {
                    break;
                }
                child.walk(ctx, &url).await;
            }
        })
    }

    /// Returns `false` once a hook of the phase fails.
    async fn run_hooks(&self, ctx: &mut Context, phase: Phase) -> bool {
        for hook in self.hooks.iter().filter(|hook| hook.phase() == phase) {
            if let Err(err) = hook.run(ctx).await {
                ctx.report_failure(hook.name(), hook.frame(), &err.into(), true);
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Value;
    use crate::engine::capture::{call, Action};

    fn log(entry: &'static str) -> Action {
        call(entry, move |ctx: &mut Context| {
            let mut items = ctx
                .var("log")
                .and_then(Value::as_array)
                .map(<[Value]>::to_vec)
                .unwrap_or_default();
            items.push(Value::from(entry));
            ctx.set_var("log", Value::Array(items));
            Ok(())
        })
    }

    fn logged(ctx: &Context) -> Vec<String> {
        ctx.var("log")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(Value::to_text).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn hooks_methods_and_children_run_in_order() {
        let tree = endpoint("/api", "root")
            .after(log("root after"))
            .before(log("root before"))
            .method(Method::get("list").pre(log("root get")))
            .child(
                endpoint("/pets", "pets")
                    .before(log("pets before"))
                    .method(Method::get("list").pre(log("pets get"))),
            );

        let mut ctx = Context::detached();
        tree.walk(&mut ctx, "").await;

        assert_eq!(
            logged(&ctx),
            vec!["root before", "root get", "root after", "pets before", "pets get"]
        );
        assert_eq!(ctx.current_endpoint().map(|e| e.url.as_str()), Some("/api/pets"));
        assert!(ctx.current_method().is_none());
    }

    #[tokio::test]
    async fn failing_before_hook_skips_methods_and_children() {
        let tree = endpoint("/api", "root")
            .before(call("broken", |_| Err("no fixture".into())))
            .method(Method::get("list").pre(log("get")))
            .after(log("after"))
            .child(endpoint("/pets", "pets").before(log("child")));

        let mut ctx = Context::detached();
        tree.walk(&mut ctx, "").await;

        assert_eq!(logged(&ctx), vec!["after"]);
        let failure = &ctx.report().entries[0];
        assert_eq!(failure.name, "before: broken");
        assert_eq!(failure.endpoint, "/api");
    }

    #[tokio::test]
    async fn cancellation_stops_the_walk() {
        let tree = endpoint("/api", "root")
            .method(Method::get("first").pre(log("first")).pre(call("cancel", |ctx| {
                ctx.cancel_token().cancel();
                Ok(())
            })))
            .method(Method::get("second").pre(log("second")))
            .child(endpoint("/pets", "pets").before(log("child")));

        let mut ctx = Context::detached();
        tree.walk(&mut ctx, "").await;
        assert_eq!(logged(&ctx), vec!["first"]);
    }
}
