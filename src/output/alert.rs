//! Threshold alert

use crate::output::{format_value, ReductionReport, ResultSink};
use crate::Result;

/// Default alert threshold for the global average
pub const DEFAULT_THRESHOLD: f64 = 30.0;

/// Prints an alert when the global average is strictly above a threshold
pub struct ThresholdAlert {
    threshold: f64,
    label: String,
}

impl ThresholdAlert {
    pub fn new(threshold: f64, label: impl Into<String>) -> Self {
        Self {
            threshold,
            label: label.into(),
        }
    }

    /// Alert text for `average`, if it is above the threshold
    pub fn check(&self, average: f64) -> Option<String> {
        (average > self.threshold)
            .then(|| format!("Alert: High {} detected: {}", self.label, format_value(average)))
    }
}

impl ResultSink for ThresholdAlert {
    fn name(&self) -> &str {
        "alert"
    }

    fn consume(&mut self, report: &ReductionReport) -> Result<()> {
        if let Some(alert) = self.check(report.average) {
            println!("{}", alert);
            tracing::warn!(average = report.average, threshold = self.threshold, "Threshold exceeded");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_only_above_threshold() {
        let alert = ThresholdAlert::new(DEFAULT_THRESHOLD, "PM10 Concentration");
        assert_eq!(
            alert.check(30.5).as_deref(),
            Some("Alert: High PM10 Concentration detected: 30.5")
        );
        assert_eq!(alert.check(30.0), None);
        assert_eq!(alert.check(29.99), None);
    }

    #[test]
    fn test_custom_threshold() {
        let alert = ThresholdAlert::new(-1.0, "X");
        assert!(alert.check(0.0).is_some());
        assert!(alert.check(-1.0).is_none());
    }
}
