pub mod openapi;

use crate::domain::RequestRecord;
use crate::engine::error::{HarnessError, UnmetError};
use crate::engine::timing::{self, TimingStats};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub use openapi::{MethodSummary, OpenApi, PathCoverage, PathStatus, SpecCoverage};

/// Where an observation happened. `request` is the body-less record of the
/// request in flight, if one was built.
#[derive(Debug, Clone, Copy)]
pub struct Site<'a> {
    pub endpoint: &'a str,
    pub method: &'a str,
    pub request: Option<&'a RequestRecord>,
}

/// Sink for every outcome observed during a run.
pub trait Collector: Send + Sync {
    fn report_met(&self, site: Site<'_>, expectation: &str);
    fn report_unmet(&self, site: Site<'_>, unmet: &UnmetError);
    fn report_skipped(&self, site: Site<'_>, expectation: &str);
    fn report_failure(&self, site: Site<'_>, error: &HarnessError);
    fn report_timing(&self, site: Site<'_>, elapsed: Duration);
    /// Any failure or unmet expectation so far.
    fn has_failures(&self) -> bool;
}

/// Keeps only the aggregate failure flag.
#[derive(Debug, Default)]
pub struct NullCollector {
    failed: AtomicBool,
}

impl Collector for NullCollector {
    fn report_met(&self, _: Site<'_>, _: &str) {}

    fn report_unmet(&self, _: Site<'_>, _: &UnmetError) {
        self.failed.store(true, Ordering::SeqCst);
    }

    fn report_skipped(&self, _: Site<'_>, _: &str) {}

    fn report_failure(&self, _: Site<'_>, _: &HarnessError) {
        self.failed.store(true, Ordering::SeqCst);
    }

    fn report_timing(&self, _: Site<'_>, _: Duration) {}

    fn has_failures(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Outcome counters and timings of one (endpoint, method) bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodCoverage {
    pub met: u64,
    pub unmet: u64,
    pub failures: u64,
    pub skipped: u64,
    #[serde(skip)]
    pub timings: Vec<Duration>,
    /// Most recent request issued for the bucket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_request: Option<RequestRecord>,
}

impl MethodCoverage {
    pub fn stats(&self, sample: bool) -> Option<TimingStats> {
        timing::stats(&self.timings, sample)
    }

    pub fn is_exercised(&self) -> bool {
        self.met + self.unmet + self.failures + self.skipped > 0 || !self.timings.is_empty()
    }

    pub(crate) fn absorb(&mut self, other: &MethodCoverage) {
        self.met += other.met;
        self.unmet += other.unmet;
        self.failures += other.failures;
        self.skipped += other.skipped;
        self.timings.extend_from_slice(&other.timings);
        if other.last_request.is_some() {
            self.last_request = other.last_request.clone();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointCoverage {
    pub path: String,
    pub normalized: String,
    pub methods: BTreeMap<String, MethodCoverage>,
}

#[derive(Default)]
struct CoverageState {
    endpoints: BTreeMap<String, EndpointCoverage>,
    normalized: BTreeMap<String, BTreeSet<String>>,
    failed: bool,
}

impl CoverageState {
    fn bucket(&mut self, site: Site<'_>) -> &mut MethodCoverage {
        let normalized = normalize_path(site.endpoint);
        self.normalized
            .entry(normalized.clone())
            .or_default()
            .insert(site.endpoint.to_string());
        let bucket = self
            .endpoints
            .entry(site.endpoint.to_string())
            .or_insert_with(|| EndpointCoverage {
                path: site.endpoint.to_string(),
                normalized,
                methods: BTreeMap::new(),
            })
            .methods
            .entry(site.method.to_ascii_uppercase())
            .or_default();
        if let Some(request) = site.request {
            bucket.last_request = Some(request.clone());
        }
        bucket
    }
}

/// Accumulating collector keyed by literal endpoint URL and method, with a
/// side index from normalised paths to the literal paths seen.
#[derive(Default)]
pub struct CoverageCollector {
    state: RwLock<CoverageState>,
    sample_stddev: bool,
}

impl CoverageCollector {
    pub fn new(sample_stddev: bool) -> Self {
        Self {
            state: RwLock::new(CoverageState::default()),
            sample_stddev,
        }
    }

    pub fn sample_stddev(&self) -> bool {
        self.sample_stddev
    }

    pub fn endpoints(&self) -> Vec<EndpointCoverage> {
        self.state.read().endpoints.values().cloned().collect()
    }

    pub fn method(&self, endpoint: &str, method: &str) -> Option<MethodCoverage> {
        self.state
            .read()
            .endpoints
            .get(endpoint)
            .and_then(|entry| entry.methods.get(&method.to_ascii_uppercase()))
            .cloned()
    }

    /// Literal paths recorded under a normalised path.
    pub fn literal_paths(&self, normalized: &str) -> Vec<String> {
        self.state
            .read()
            .normalized
            .get(normalized)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn spec_coverage(&self, spec: &OpenApi) -> SpecCoverage {
        let state = self.state.read();
        openapi::cross_reference(spec, &state.endpoints, &state.normalized, self.sample_stddev)
    }
}

impl Collector for CoverageCollector {
    fn report_met(&self, site: Site<'_>, _: &str) {
        self.state.write().bucket(site).met += 1;
    }

    fn report_unmet(&self, site: Site<'_>, _: &UnmetError) {
        let mut state = self.state.write();
        state.bucket(site).unmet += 1;
        state.failed = true;
    }

    fn report_skipped(&self, site: Site<'_>, _: &str) {
        self.state.write().bucket(site).skipped += 1;
    }

    fn report_failure(&self, site: Site<'_>, _: &HarnessError) {
        let mut state = self.state.write();
        state.bucket(site).failures += 1;
        state.failed = true;
    }

    fn report_timing(&self, site: Site<'_>, elapsed: Duration) {
        self.state.write().bucket(site).timings.push(elapsed);
    }

    fn has_failures(&self) -> bool {
        self.state.read().failed
    }
}

/// Collapse every `{name}` segment to `{}` and drop empty segments.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if segment.starts_with('{') && segment.ends_with('}') {
                "{}"
            } else {
                segment
            }
        })
        .collect();
    format!("/{}", segments.join("/"))
}
