use super::bridge::TestBridge;
use super::cancel::CancelToken;
use super::context::Context;
use super::endpoint::Endpoint;
use super::error::{HarnessError, Result};
use super::http::{ReqwestTransport, Transport};
use crate::abstractions::database::NamedDatabase;
use crate::abstractions::image::{Component, Handles, Image};
use crate::abstractions::mock::MockService;
use crate::coverage::{Collector, CoverageCollector, NullCollector, OpenApi};
use crate::domain::{HarnessConfig, Value};
use crate::report::RunReport;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;

/// A runnable tree of endpoints plus everything the run context is seeded
/// with. Builder calls override the loaded configuration.
pub struct Suite {
    name: String,
    endpoints: Vec<Endpoint>,
    config: HarnessConfig,
    vars: Vec<(String, Value)>,
    databases: Vec<(String, NamedDatabase)>,
    images: Vec<Arc<dyn Image>>,
    mocks: Vec<(String, Arc<dyn MockService>)>,
    components: Vec<Arc<dyn Component>>,
    transport: Option<Arc<dyn Transport>>,
    collector: Option<Arc<dyn Collector>>,
    coverage: Option<Arc<CoverageCollector>>,
    bridge: Option<Arc<dyn TestBridge>>,
    openapi: Option<OpenApi>,
    cancel: CancelToken,
}

impl Suite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoints: Vec::new(),
            config: HarnessConfig::default(),
            vars: Vec::new(),
            databases: Vec::new(),
            images: Vec::new(),
            mocks: Vec::new(),
            components: Vec::new(),
            transport: None,
            collector: None,
            coverage: None,
            bridge: None,
            openapi: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Replace the configuration. Call before the other `with_*` options,
    /// which override its values.
    pub fn with_config(mut self, config: HarnessConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.push((name.into(), value.into()));
        self
    }

    pub fn with_database(mut self, name: impl Into<String>, database: NamedDatabase) -> Self {
        self.databases.push((name.into(), database));
        self
    }

    pub fn with_image(mut self, image: Arc<dyn Image>) -> Self {
        self.images.push(image);
        self
    }

    pub fn with_mock(mut self, name: impl Into<String>, mock: Arc<dyn MockService>) -> Self {
        self.mocks.push((name.into(), mock));
        self
    }

    /// Supporting component started before the run and shut down after it,
    /// in reverse registration order.
    pub fn with_component(mut self, component: Arc<dyn Component>) -> Self {
        self.components.push(component);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Custom outcome sink. Takes precedence over the coverage collector.
    pub fn with_collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Share a coverage collector so it can be inspected after the run.
    pub fn with_coverage(mut self, coverage: Arc<CoverageCollector>) -> Self {
        self.config.coverage = true;
        self.coverage = Some(coverage);
        self
    }

    pub fn with_bridge(mut self, bridge: Arc<dyn TestBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_openapi(mut self, spec: OpenApi) -> Self {
        self.openapi = Some(spec);
        self
    }

    pub fn repeat(mut self, times: u32) -> Self {
        self.config.repeat = times;
        self
    }

    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.config.fail_fast = enabled;
        self
    }

    /// Token that stops the run; in-flight requests and waits are
    /// interrupted, the walk ends and components are still shut down.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Walk every endpoint once per repeat. Returns the report when every
    /// expectation was met, `RunFailed` with the same report otherwise.
    pub async fn run(&self) -> Result<RunReport> {
        self.config.validate()?;
        let started = Instant::now();

        let transport: Arc<dyn Transport> = match &self.transport {
            Some(transport) => transport.clone(),
            None => Arc::new(ReqwestTransport::from_config(&self.config)?),
        };

        let loaded;
        let openapi = match (&self.openapi, &self.config.openapi_path) {
            (Some(spec), _) => Some(spec),
            (None, Some(path)) => {
                loaded = OpenApi::from_path(path)?;
                Some(&loaded)
            }
            (None, None) => None,
        };

        let coverage = match &self.coverage {
            Some(coverage) => Some(coverage.clone()),
            None if self.config.coverage => {
                Some(Arc::new(CoverageCollector::new(self.config.sample_stddev)))
            }
            None => None,
        };
        let collector: Arc<dyn Collector> = match (&self.collector, &coverage) {
            (Some(collector), _) => collector.clone(),
            (None, Some(coverage)) => coverage.clone(),
            (None, None) => Arc::new(NullCollector::default()),
        };

        tracing::info!(
            suite = %self.name,
            endpoints = self.endpoints.len(),
            repeat = self.config.repeat,
            host = %self.config.host,
            "starting suite"
        );

        let handles = self.start_components().await?;

        let mut report = RunReport::new(self.name.clone());
        for round in 1..=self.config.repeat {
            if self.cancel.is_cancelled() {
                tracing::warn!(suite = %self.name, repeat = round, "run cancelled");
                break;
            }
            let mut ctx = self.context(round, transport.clone(), collector.clone(), &handles);
            for endpoint in &self.endpoints {
                if ctx.cancel_token().is_cancelled() {
                    break;
                }
                endpoint.walk(&mut ctx, "").await;
            }
            ctx.stop_listeners();

            let round_report = ctx.take_report();
            tracing::info!(suite = %self.name, repeat = round, "{}", round_report.summary());
            report.merge(round_report);
            report.repeats = round;
        }

        self.shutdown_components(&self.components).await;

        report.duration_ms = started.elapsed().as_millis();
        if let (Some(coverage), Some(spec)) = (&coverage, openapi) {
            report.coverage = Some(coverage.spec_coverage(spec));
        }

        if report.is_success() && !collector.has_failures() {
            tracing::info!("{}", report.summary());
            Ok(report)
        } else {
            tracing::warn!("{}", report.summary());
            Err(HarnessError::RunFailed(Box::new(report)))
        }
    }

    /// Fresh context for one repeat: configuration variables first, then
    /// suite variables; suite-level handles before component handles.
    fn context(
        &self,
        round: u32,
        transport: Arc<dyn Transport>,
        collector: Arc<dyn Collector>,
        handles: &[Handles],
    ) -> Context {
        let mut ctx = Context::new(self.config.host.clone(), transport, collector)
            .with_bridge(self.bridge.clone())
            .with_cancel(self.cancel.clone())
            .with_settings(self.config.fail_fast, self.config.listener_buffer, round);

        for (name, value) in &self.config.variables {
            ctx.set_var(name.clone(), Value::from_json(value.clone()));
        }
        for (name, value) in &self.vars {
            ctx.set_var(name.clone(), value.clone());
        }

        for (name, database) in &self.databases {
            ctx.register_database(name.clone(), database.clone());
        }
        for image in &self.images {
            ctx.register_image(image.clone());
        }
        for (name, mock) in &self.mocks {
            ctx.register_mock(name.clone(), mock.clone());
        }
        for published in handles {
            for (name, database) in &published.databases {
                ctx.register_database(name.clone(), database.clone());
            }
            for image in &published.images {
                ctx.register_image(image.clone());
            }
            for (name, mock) in &published.mocks {
                ctx.register_mock(name.clone(), mock.clone());
            }
        }
        ctx
    }

    /// Start every component concurrently. If one fails, the ones that did
    /// start are shut down again before the error is returned.
    async fn start_components(&self) -> Result<Vec<Handles>> {
        if self.components.is_empty() {
            return Ok(Vec::new());
        }

        let results = join_all(
            self.components
                .iter()
                .map(|component| component.start(self.cancel.clone())),
        )
        .await;

        let mut started = Vec::with_capacity(results.len());
        let mut handles = Vec::with_capacity(results.len());
        let mut failure = None;
        for (component, result) in self.components.iter().zip(results) {
            match result {
                Ok(published) => {
                    tracing::debug!(component = component.name(), "component ready");
                    started.push(component.clone());
                    handles.push(published);
                }
                Err(reason) => {
                    tracing::warn!(component = component.name(), %reason, "component failed to start");
                    failure.get_or_insert(HarnessError::Component {
                        name: component.name().to_string(),
                        reason,
                    });
                }
            }
        }

        match failure {
            Some(err) => {
                self.shutdown_components(&started).await;
                Err(err)
            }
            None => Ok(handles),
        }
    }

    async fn shutdown_components(&self, components: &[Arc<dyn Component>]) {
        for component in components.iter().rev() {
            match component.shutdown().await {
                Ok(()) => tracing::debug!(component = component.name(), "component shut down"),
                Err(reason) => {
                    tracing::warn!(component = component.name(), %reason, "component shutdown failed")
                }
            }
        }
    }
}
