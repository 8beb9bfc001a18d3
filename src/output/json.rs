//! JSON run summary

use crate::output::{ReductionReport, ResultSink};
use crate::reduce::Accumulator;
use crate::Result;
use anyhow::Context;
use serde::Serialize;
use std::fs::File;
use std::path::PathBuf;

/// Serialized form of a run
#[derive(Debug, Serialize)]
pub struct JsonSummary<'a> {
    pub tool: &'static str,
    pub version: &'static str,
    pub timestamp: String,
    pub label: &'a str,
    pub world_size: usize,
    pub node_count: usize,
    pub dataset: &'a str,
    pub skipped_records: u64,
    pub totals: Accumulator,
    pub average: f64,
    /// `null` when nothing was counted
    pub mean: Option<f64>,
    pub elapsed_secs: f64,
}

impl<'a> JsonSummary<'a> {
    pub fn from_report(report: &'a ReductionReport, label: &'a str) -> Self {
        Self {
            tool: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            timestamp: chrono::Local::now().to_rfc3339(),
            label,
            world_size: report.world_size,
            node_count: report.node_count,
            dataset: &report.dataset,
            skipped_records: report.skipped_records,
            totals: report.totals,
            average: report.average,
            mean: report.mean(),
            elapsed_secs: report.elapsed.as_secs_f64(),
        }
    }
}

/// Writes the summary to a file, replacing earlier contents
pub struct JsonReport {
    path: PathBuf,
    label: String,
    pretty: bool,
}

impl JsonReport {
    pub fn new(path: impl Into<PathBuf>, label: impl Into<String>, pretty: bool) -> Self {
        Self {
            path: path.into(),
            label: label.into(),
            pretty,
        }
    }
}

impl ResultSink for JsonReport {
    fn name(&self) -> &str {
        "json"
    }

    fn consume(&mut self, report: &ReductionReport) -> Result<()> {
        let summary = JsonSummary::from_report(report, &self.label);
        let file = File::create(&self.path)
            .with_context(|| format!("Failed to create JSON summary {}", self.path.display()))?;

        if self.pretty {
            serde_json::to_writer_pretty(file, &summary)?;
        } else {
            serde_json::to_writer(file, &summary)?;
        }

        tracing::debug!(path = %self.path.display(), "Wrote JSON summary");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_summary_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("summary.json");
        let report = ReductionReport::new(4, 2, Accumulator::new(100.0, 4), "data.csv column #17".to_string(), 1);

        JsonReport::new(&path, "PM10 Concentration", true).consume(&report).unwrap();

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["average"], 25.0);
        assert_eq!(value["mean"], 25.0);
        assert_eq!(value["totals"]["count"], 4);
        assert_eq!(value["world_size"], 4);
        assert_eq!(value["skipped_records"], 1);
        assert_eq!(value["label"], "PM10 Concentration");
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_empty_run_has_null_mean() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("summary.json");
        let report = ReductionReport::new(1, 1, Accumulator::ZERO, "empty".to_string(), 0);

        JsonReport::new(&path, "PM10", false).consume(&report).unwrap();

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["average"], 0.0);
        assert!(value["mean"].is_null());
    }
}
