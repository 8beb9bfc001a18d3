//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.
//! Values are layered: built-in defaults, then the `--config` file, then the
//! command line.

pub mod cli;
pub mod toml;
pub mod validator;

use crate::dataset::{ColumnSelector, CsvColumnSource};
use crate::output::alert::{ThresholdAlert, DEFAULT_THRESHOLD};
use crate::output::json::JsonReport;
use crate::output::results_file::{ResultsFile, DEFAULT_RESULTS_FILE};
use crate::output::text::ConsoleReport;
use crate::output::SinkChain;
use crate::pipeline::PipelineOptions;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default rendezvous hub address for multi-process runs
pub const DEFAULT_HUB_ADDR: &str = "127.0.0.1:7411";

/// Complete run configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub reduction: ReductionConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Where the coordinator reads the values from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// CSV file
    pub path: Option<PathBuf>,
    /// Column index or header name
    #[serde(default)]
    pub column: ColumnSelector,
    /// First row is a header
    #[serde(default = "default_true")]
    pub has_header: bool,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: None,
            column: ColumnSelector::default(),
            has_header: true,
            delimiter: default_delimiter(),
        }
    }
}

/// Local reduction settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReductionConfig {
    /// Threads per participant (0 = cores divided by participants on the node)
    #[serde(default)]
    pub threads: usize,
    /// Directory for shared segments (default: /dev/shm)
    pub shm_dir: Option<PathBuf>,
}

/// Participants and how they meet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Number of participants
    #[serde(default = "default_one")]
    pub world_size: usize,
    /// Simulated nodes (local mode only)
    #[serde(default = "default_one")]
    pub nodes: usize,
    /// This participant's world rank (participant mode only)
    pub rank: Option<usize>,
    /// Rendezvous hub address, hosted by rank 0
    #[serde(default = "default_hub_addr")]
    pub hub_addr: String,
    /// Node identity override (default: hostname)
    pub node_id: Option<String>,
    /// How long a participant keeps retrying to reach the hub
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            world_size: 1,
            nodes: 1,
            rank: None,
            hub_addr: default_hub_addr(),
            node_id: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl TopologyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Result sinks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// File the global average is appended to
    #[serde(default = "default_results_file")]
    pub results_file: PathBuf,
    /// Name of the quantity in reports
    #[serde(default = "default_label")]
    pub label: String,
    /// Alert when the global average is above this value
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Optional JSON run summary
    pub json_output: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub json_pretty: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            results_file: default_results_file(),
            label: default_label(),
            threshold: default_threshold(),
            json_output: None,
            json_pretty: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

fn default_delimiter() -> char {
    ','
}

fn default_hub_addr() -> String {
    DEFAULT_HUB_ADDR.to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_results_file() -> PathBuf {
    PathBuf::from(DEFAULT_RESULTS_FILE)
}

fn default_label() -> String {
    "PM10 Concentration".to_string()
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

impl Config {
    /// Dataset source for the coordinator
    pub fn dataset_source(&self) -> Result<CsvColumnSource> {
        let path = self
            .dataset
            .path
            .clone()
            .ok_or_else(|| anyhow::anyhow!("No dataset given (pass a CSV path or set [dataset] path)"))?;
        Ok(CsvColumnSource::new(path, self.dataset.column.clone())
            .with_header(self.dataset.has_header)
            .with_delimiter(self.dataset.delimiter))
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            threads: self.reduction.threads,
            shm_dir: self
                .reduction
                .shm_dir
                .clone()
                .unwrap_or_else(crate::shm::default_shm_dir),
        }
    }

    /// Console report, results file, alert and (when configured) JSON summary
    pub fn sinks(&self) -> SinkChain {
        let output = &self.output;
        let mut chain = SinkChain::new()
            .with(ConsoleReport::new(output.label.clone()))
            .with(ResultsFile::new(output.results_file.clone(), output.label.clone()))
            .with(ThresholdAlert::new(output.threshold, output.label.clone()));
        if let Some(ref path) = output.json_output {
            chain = chain.with(JsonReport::new(path.clone(), output.label.clone(), output.json_pretty));
        }
        chain
    }
}
