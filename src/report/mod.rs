//! Standalone runner output: every unmet, skipped and failed observation of
//! a run, with the declaration frame, rendered as text or JSON.

use crate::coverage::SpecCoverage;
use crate::domain::Frame;
use serde::Serialize;
use std::fmt::Write as _;

/// Output format for run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Unmet,
    Skipped,
    Failure,
}

impl Outcome {
    fn label(self) -> &'static str {
        match self {
            Outcome::Unmet => "UNMET",
            Outcome::Skipped => "SKIPPED",
            Outcome::Failure => "FAILURE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportEntry {
    pub repeat: u32,
    pub endpoint: String,
    pub method: String,
    pub outcome: Outcome,
    pub name: String,
    pub frame: Frame,
    pub message: String,
    /// Long form with operand envelopes, when there is one.
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub suite: String,
    pub repeats: u32,
    pub met: u64,
    pub unmet: u64,
    pub skipped: u64,
    pub failures: u64,
    pub duration_ms: u128,
    pub entries: Vec<ReportEntry>,
    pub coverage: Option<SpecCoverage>,
}

impl RunReport {
    pub fn new(suite: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            ..Self::default()
        }
    }

    pub fn record_met(&mut self) {
        self.met += 1;
    }

    pub fn record(&mut self, entry: ReportEntry) {
        match entry.outcome {
            Outcome::Unmet => self.unmet += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Failure => self.failures += 1,
        }
        self.entries.push(entry);
    }

    /// Fold a per-repeat report into the run total.
    pub fn merge(&mut self, other: RunReport) {
        self.met += other.met;
        self.unmet += other.unmet;
        self.skipped += other.skipped;
        self.failures += other.failures;
        self.entries.extend(other.entries);
    }

    pub fn is_success(&self) -> bool {
        self.unmet == 0 && self.failures == 0
    }

    pub fn entries_with(&self, outcome: Outcome) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(move |entry| entry.outcome == outcome)
    }

    pub fn summary(&self) -> String {
        format!(
            "suite `{}`: {} met, {} unmet, {} skipped, {} failures in {}ms",
            self.suite, self.met, self.unmet, self.skipped, self.failures, self.duration_ms
        )
    }

    pub fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Json => serde_json::to_string_pretty(self)
                .unwrap_or_else(|err| format!("{{\"error\":\"failed to serialize report: {err}\"}}")),
            OutputFormat::Text => self.render_text(),
        }
    }

    fn render_text(&self) -> String {
        let mut out = self.summary();
        if self.repeats > 1 {
            let _ = write!(out, " over {} repeats", self.repeats);
        }
        for entry in &self.entries {
            let _ = write!(
                out,
                "\n[{}] {} {} #{}: {} ({})",
                entry.outcome.label(),
                entry.method,
                entry.endpoint,
                entry.repeat,
                entry.name,
                entry.frame
            );
            match &entry.detail {
                Some(detail) => {
                    for line in detail.lines().skip(1) {
                        let _ = write!(out, "\n  {line}");
                    }
                }
                None if !entry.message.is_empty() => {
                    let _ = write!(out, "\n    {}", entry.message);
                }
                None => {}
            }
        }
        if let Some(coverage) = &self.coverage {
            let _ = write!(
                out,
                "\ncoverage: {}/{} paths ({:.1}%), {}/{} methods ({:.1}%)",
                coverage.covered_paths,
                coverage.total_paths,
                coverage.path_percent,
                coverage.covered_methods,
                coverage.total_methods,
                coverage.method_percent
            );
        }
        out
    }
}
