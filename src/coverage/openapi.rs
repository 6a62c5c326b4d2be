use super::{normalize_path, EndpointCoverage, MethodCoverage};
use crate::engine::error::HarnessError;
use crate::engine::timing::TimingStats;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::Path;

const OPERATIONS: [&str; 8] = ["get", "put", "post", "delete", "options", "head", "patch", "trace"];

/// Paths and operations of a loaded OpenAPI (or Swagger 2) document.
#[derive(Debug, Clone, Default)]
pub struct OpenApi {
    paths: Vec<(String, Vec<String>)>,
}

impl OpenApi {
    /// Decode JSON when the first non-whitespace byte is `{`, YAML otherwise.
    pub fn from_reader(mut reader: impl Read) -> Result<Self, HarnessError> {
        let mut raw = String::new();
        reader
            .read_to_string(&mut raw)
            .map_err(|err| HarnessError::OpenApi(format!("failed to read definition: {err}")))?;

        let document: serde_json::Value = if raw.trim_start().starts_with('{') {
            serde_json::from_str(&raw)
                .map_err(|err| HarnessError::OpenApi(format!("invalid JSON definition: {err}")))?
        } else {
            serde_yaml::from_str(&raw)
                .map_err(|err| HarnessError::OpenApi(format!("invalid YAML definition: {err}")))?
        };
        Self::from_document(&document)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, HarnessError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|err| {
            HarnessError::OpenApi(format!("failed to open {}: {err}", path.display()))
        })?;
        Self::from_reader(file)
    }

    pub fn from_document(document: &serde_json::Value) -> Result<Self, HarnessError> {
        let paths = document
            .get("paths")
            .and_then(serde_json::Value::as_object)
            .ok_or_else(|| HarnessError::OpenApi("definition has no `paths` object".into()))?;
        let base = document
            .get("basePath")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
            .trim_end_matches('/');

        let paths = paths
            .iter()
            .filter_map(|(path, item)| {
                let item = item.as_object()?;
                let methods: Vec<String> = OPERATIONS
                    .iter()
                    .filter(|operation| item.contains_key(**operation))
                    .map(|operation| operation.to_ascii_uppercase())
                    .collect();
                if methods.is_empty() {
                    return None;
                }
                Some((format!("{base}{path}"), methods))
            })
            .collect();
        Ok(Self { paths })
    }

    /// Paths with their upper-case methods, in document order.
    pub fn paths(&self) -> &[(String, Vec<String>)] {
        &self.paths
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PathStatus {
    Covered,
    NonCovered,
    /// Recorded by the suite but absent from the definition.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodSummary {
    pub met: u64,
    pub unmet: u64,
    pub failures: u64,
    pub skipped: u64,
    pub covered: bool,
    pub timing: Option<TimingStats>,
}

impl MethodSummary {
    fn from_bucket(bucket: &MethodCoverage, sample: bool) -> Self {
        Self {
            met: bucket.met,
            unmet: bucket.unmet,
            failures: bucket.failures,
            skipped: bucket.skipped,
            covered: bucket.is_exercised(),
            timing: bucket.stats(sample),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathCoverage {
    pub path: String,
    pub normalized: String,
    pub status: PathStatus,
    /// Literal suite paths rolled into this entry.
    pub recorded: Vec<String>,
    pub methods: BTreeMap<String, MethodSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecCoverage {
    pub paths: Vec<PathCoverage>,
    pub total_paths: usize,
    pub covered_paths: usize,
    pub total_methods: usize,
    pub covered_methods: usize,
    pub path_percent: f64,
    pub method_percent: f64,
}

impl SpecCoverage {
    pub fn path(&self, path: &str) -> Option<&PathCoverage> {
        self.paths.iter().find(|entry| entry.path == path)
    }
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

fn roll_up(
    literals: &BTreeSet<String>,
    endpoints: &BTreeMap<String, EndpointCoverage>,
) -> BTreeMap<String, MethodCoverage> {
    let mut methods: BTreeMap<String, MethodCoverage> = BTreeMap::new();
    for literal in literals {
        if let Some(endpoint) = endpoints.get(literal) {
            for (method, bucket) in &endpoint.methods {
                methods.entry(method.clone()).or_default().absorb(bucket);
            }
        }
    }
    methods
}

pub(crate) fn cross_reference(
    spec: &OpenApi,
    endpoints: &BTreeMap<String, EndpointCoverage>,
    normalized: &BTreeMap<String, BTreeSet<String>>,
    sample: bool,
) -> SpecCoverage {
    let empty = BTreeSet::new();
    let mut coverage = SpecCoverage::default();
    let mut matched = BTreeSet::new();

    for (path, spec_methods) in spec.paths() {
        let key = normalize_path(path);
        let literals = normalized.get(&key).unwrap_or(&empty);
        let recorded = roll_up(literals, endpoints);
        let status = if literals.is_empty() {
            PathStatus::NonCovered
        } else {
            matched.insert(key.clone());
            coverage.covered_paths += 1;
            PathStatus::Covered
        };

        let mut methods = BTreeMap::new();
        for method in spec_methods {
            let summary = MethodSummary::from_bucket(
                recorded.get(method).unwrap_or(&MethodCoverage::default()),
                sample,
            );
            coverage.total_methods += 1;
            if summary.covered {
                coverage.covered_methods += 1;
            }
            methods.insert(method.clone(), summary);
        }

        coverage.total_paths += 1;
        coverage.paths.push(PathCoverage {
            path: path.clone(),
            normalized: key,
            status,
            recorded: literals.iter().cloned().collect(),
            methods,
        });
    }

    for (key, literals) in normalized {
        if matched.contains(key) {
            continue;
        }
        let methods = roll_up(literals, endpoints)
            .iter()
            .map(|(method, bucket)| (method.clone(), MethodSummary::from_bucket(bucket, sample)))
            .collect();
        coverage.paths.push(PathCoverage {
            path: literals.iter().next().cloned().unwrap_or_else(|| key.clone()),
            normalized: key.clone(),
            status: PathStatus::Unknown,
            recorded: literals.iter().cloned().collect(),
            methods,
        });
    }

    coverage.path_percent = percent(coverage.covered_paths, coverage.total_paths);
    coverage.method_percent = percent(coverage.covered_methods, coverage.total_methods);
    coverage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::{Collector, CoverageCollector, Site};
    use std::time::Duration;

    const PETSTORE_YAML: &str = r#"
openapi: 3.0.0
info:
  title: pets
  version: "1"
paths:
  /api/pets:
    get: {}
    post: {}
  /api/pets/{petId}:
    parameters: []
    get: {}
    delete: {}
"#;

    fn site<'a>(endpoint: &'a str, method: &'a str) -> Site<'a> {
        Site {
            endpoint,
            method,
            request: None,
        }
    }

    #[test]
    fn loads_yaml_and_json_definitions() {
        let yaml = OpenApi::from_reader(PETSTORE_YAML.as_bytes()).expect("yaml");
        assert_eq!(yaml.paths().len(), 2);
        assert_eq!(yaml.paths()[1].1, vec!["GET".to_string(), "DELETE".to_string()]);

        let json = OpenApi::from_reader(
            r#"  {"swagger":"2.0","basePath":"/v1/","paths":{"/cats":{"put":{}}}}"#.as_bytes(),
        )
        .expect("json");
        assert_eq!(json.paths(), &[("/v1/cats".to_string(), vec!["PUT".to_string()])]);

        assert!(OpenApi::from_reader("{not json".as_bytes()).is_err());
        assert!(OpenApi::from_reader("info: {}".as_bytes()).is_err());
    }

    #[test]
    fn recorded_paths_match_irrespective_of_parameter_names() {
        let spec = OpenApi::from_reader(PETSTORE_YAML.as_bytes()).expect("spec");
        let collector = CoverageCollector::new(true);
        collector.report_met(site("/api/pets/{id}", "GET"), "status");
        collector.report_met(site("/api/pets/{pet}", "GET"), "status");
        collector.report_timing(site("/api/pets/{id}", "GET"), Duration::from_millis(10));
        collector.report_met(site("/api/owners", "GET"), "status");

        let coverage = collector.spec_coverage(&spec);
        let pet = coverage.path("/api/pets/{petId}").expect("pet path");
        assert_eq!(pet.status, PathStatus::Covered);
        assert_eq!(pet.methods["GET"].met, 2);
        assert!(pet.methods["GET"].timing.is_some());
        assert!(!pet.methods["DELETE"].covered);

        let list = coverage.path("/api/pets").expect("list path");
        assert_eq!(list.status, PathStatus::NonCovered);

        let unknown = coverage.path("/api/owners").expect("unknown path");
        assert_eq!(unknown.status, PathStatus::Unknown);

        assert_eq!((coverage.covered_paths, coverage.total_paths), (1, 2));
        assert_eq!((coverage.covered_methods, coverage.total_methods), (1, 4));
        assert!((coverage.path_percent - 50.0).abs() < f64::EPSILON);
        assert!((coverage.method_percent - 25.0).abs() < f64::EPSILON);
    }
}
