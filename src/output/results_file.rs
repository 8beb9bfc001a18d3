//! Results file
//!
//! Appends one line per run, `Global Average <label>: <value>`, so successive
//! runs accumulate in the same file.

use crate::output::{format_value, ReductionReport, ResultSink};
use crate::Result;
use anyhow::Context;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

/// Default results file, relative to the working directory
pub const DEFAULT_RESULTS_FILE: &str = "pm10_analysis_results.txt";

pub struct ResultsFile {
    path: PathBuf,
    label: String,
}

impl ResultsFile {
    pub fn new(path: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            label: label.into(),
        }
    }

    /// Line appended for an average
    pub fn line(&self, average: f64) -> String {
        format!("Global Average {}: {}", self.label, format_value(average))
    }
}

impl ResultSink for ResultsFile {
    fn name(&self) -> &str {
        "results-file"
    }

    fn consume(&mut self, report: &ReductionReport) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Error opening results file: {}", self.path.display()))?;

        writeln!(file, "{}", self.line(report.average))
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;

        tracing::debug!(path = %self.path.display(), "Appended global average");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduce::Accumulator;
    use tempfile::TempDir;

    fn report(sum: f64, count: u64) -> ReductionReport {
        ReductionReport::new(1, 1, Accumulator::new(sum, count), "test".to_string(), 0)
    }

    #[test]
    fn test_appends_one_line_per_run() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DEFAULT_RESULTS_FILE);
        let mut sink = ResultsFile::new(&path, "PM10 Concentration");

        sink.consume(&report(100.0, 4)).unwrap();
        sink.consume(&report(0.0, 0)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "Global Average PM10 Concentration: 25\nGlobal Average PM10 Concentration: 0\n"
        );
    }

    #[test]
    fn test_unwritable_location_fails() {
        let dir = TempDir::new().unwrap();
        let mut sink = ResultsFile::new(dir.path().join("missing/results.txt"), "PM10");
        assert!(sink.consume(&report(1.0, 1)).is_err());
    }
}
