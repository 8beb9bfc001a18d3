//! Result sinks
//!
//! The coordinator hands the finished [`ReductionReport`] to a chain of sinks:
//!
//! - `text`: console summary
//! - `results_file`: appends the global average to a results file
//! - `alert`: warns when the average exceeds a threshold
//! - `json`: optional machine-readable run summary

pub mod alert;
pub mod json;
pub mod results_file;
pub mod text;

use crate::reduce::Accumulator;
use crate::Result;
use serde::Serialize;
use std::time::Duration;

/// Outcome of one reduction run, available on the coordinator only
#[derive(Debug, Clone, Serialize)]
pub struct ReductionReport {
    pub world_size: usize,
    pub node_count: usize,
    /// (globalSum, globalCount)
    pub totals: Accumulator,
    /// globalSum / globalCount, 0.0 when the count is zero
    pub average: f64,
    /// Where the dataset came from
    pub dataset: String,
    /// Records the loader skipped as malformed
    pub skipped_records: u64,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl ReductionReport {
    pub fn new(world_size: usize, node_count: usize, totals: Accumulator, dataset: String, skipped_records: u64) -> Self {
        Self {
            world_size,
            node_count,
            totals,
            average: totals.average(),
            dataset,
            skipped_records,
            elapsed: Duration::ZERO,
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    /// Average, or `None` when nothing was counted
    pub fn mean(&self) -> Option<f64> {
        self.totals.mean()
    }
}

/// Consumer of the final report
pub trait ResultSink {
    /// Short name used in error messages
    fn name(&self) -> &str;

    fn consume(&mut self, report: &ReductionReport) -> Result<()>;
}

/// Runs several sinks in order
///
/// A failing sink does not stop the ones after it; the first failure is
/// returned once all have run.
#[derive(Default)]
pub struct SinkChain {
    sinks: Vec<Box<dyn ResultSink>>,
}

impl SinkChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl ResultSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ResultSink for SinkChain {
    fn name(&self) -> &str {
        "chain"
    }

    fn consume(&mut self, report: &ReductionReport) -> Result<()> {
        let mut first_error = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.consume(report) {
                let e = e.context(format!("{} sink failed", sink.name()));
                tracing::error!("{:#}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Format a value with six significant digits, trailing zeros dropped
///
/// Large and tiny magnitudes switch to exponent notation (`1.5e+07`), matching
/// the results files written by earlier versions of the analysis.
pub fn format_value(value: f64) -> String {
    const DIGITS: i32 = 6;

    if value == 0.0 || !value.is_finite() {
        return format!("{}", if value == 0.0 { 0.0 } else { value });
    }

    // Round to the significant digits first so the exponent reflects carries
    let sci = format!("{:.*e}", (DIGITS - 1) as usize, value);
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= DIGITS {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_fraction(mantissa), sign, exponent.abs())
    } else {
        let decimals = (DIGITS - 1 - exponent) as usize;
        trim_fraction(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recording {
        name: &'static str,
        seen: Rc<RefCell<Vec<&'static str>>>,
        fail: bool,
    }

    impl ResultSink for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn consume(&mut self, _report: &ReductionReport) -> Result<()> {
            self.seen.borrow_mut().push(self.name);
            if self.fail {
                anyhow::bail!("disk full");
            }
            Ok(())
        }
    }

    fn report() -> ReductionReport {
        ReductionReport::new(2, 1, Accumulator::new(100.0, 4), "test".to_string(), 0)
    }

    #[test]
    fn test_report_average() {
        assert_eq!(report().average, 25.0);
        let empty = ReductionReport::new(1, 1, Accumulator::ZERO, "empty".to_string(), 0);
        assert_eq!(empty.average, 0.0);
        assert_eq!(empty.mean(), None);
    }

    #[test]
    fn test_chain_runs_every_sink_and_reports_first_failure() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = |name, fail| Recording {
            name,
            seen: Rc::clone(&seen),
            fail,
        };

        let mut chain = SinkChain::new()
            .with(sink("a", false))
            .with(sink("b", true))
            .with(sink("c", false));
        assert_eq!(chain.len(), 3);

        let err = chain.consume(&report()).unwrap_err();
        assert_eq!(*seen.borrow(), vec!["a", "b", "c"]);
        assert!(format!("{:#}", err).contains("b sink failed: disk full"));
    }

    #[test]
    fn test_format_value_six_significant_digits() {
        assert_eq!(format_value(25.0), "25");
        assert_eq!(format_value(0.0), "0");
        assert_eq!(format_value(-0.0), "0");
        assert_eq!(format_value(30.5), "30.5");
        assert_eq!(format_value(25.123456789), "25.1235");
        assert_eq!(format_value(1.0 / 3.0), "0.333333");
        assert_eq!(format_value(123456.7), "123457");
        assert_eq!(format_value(999999.7), "1e+06");
        assert_eq!(format_value(15_000_000.0), "1.5e+07");
        assert_eq!(format_value(0.0001234), "0.0001234");
        assert_eq!(format_value(0.00001234), "1.234e-05");
        assert_eq!(format_value(-42.0), "-42");
    }
}
