//! Human-readable console report

use crate::output::{format_value, ReductionReport, ResultSink};
use crate::Result;

/// Prints the run summary to stdout
pub struct ConsoleReport {
    label: String,
}

impl ConsoleReport {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

impl ResultSink for ConsoleReport {
    fn name(&self) -> &str {
        "console"
    }

    fn consume(&mut self, report: &ReductionReport) -> Result<()> {
        for line in render(report, &self.label) {
            println!("{}", line);
        }
        Ok(())
    }
}

/// Lines of the console summary
pub fn render(report: &ReductionReport, label: &str) -> Vec<String> {
    let mut lines = vec![
        "═══════════════════════════════════════════════════════════".to_string(),
        "                    REDUCTION RESULTS".to_string(),
        "═══════════════════════════════════════════════════════════".to_string(),
        String::new(),
        format!("Dataset:      {}", report.dataset),
        format!("Participants: {} on {} node(s)", report.world_size, report.node_count),
        format!("Values:       {}", format_number(report.totals.count)),
    ];

    if report.skipped_records > 0 {
        lines.push(format!("Skipped:      {} malformed record(s)", format_number(report.skipped_records)));
    }

    lines.push(format!("Sum:          {}", format_value(report.totals.sum)));
    lines.push(String::new());

    match report.mean() {
        Some(mean) => lines.push(format!("Global Average {}: {}", label, format_value(mean))),
        None => lines.push(format!("Global Average {}: no data", label)),
    }

    lines.push(String::new());
    lines.push(format!("Elapsed Time: {:.3}s", report.elapsed.as_secs_f64()));
    lines
}

/// Format a count with thousands separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}
