//! CLI argument parsing using clap

use crate::dataset::ColumnSelector;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutionMode {
    /// Local mode (default) - all participants as threads of this process
    Local,
    /// Participant mode - one rank of a multi-process run
    Participant,
    /// Launch mode - spawn world-size participant processes on this host
    Launch,
    /// Generate mode - write a synthetic dataset to PATH
    Generate,
}

/// shmreduce - distributed shared-memory average of a CSV column
#[derive(Parser, Debug)]
#[command(name = "shmreduce")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Execution mode: local, participant, launch, or generate
    #[arg(long, value_enum, default_value = "local")]
    pub mode: ExecutionMode,

    /// Dataset CSV (output file in generate mode)
    #[arg(value_name = "PATH")]
    pub dataset: Option<PathBuf>,

    /// TOML configuration file (command-line options take precedence)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    // === Dataset Options ===
    /// Column holding the values: zero-based index or header name [default: 17]
    #[arg(long)]
    pub column: Option<ColumnSelector>,

    /// Treat the first row as data instead of a header
    #[arg(long)]
    pub no_header: bool,

    /// Field delimiter [default: ,]
    #[arg(long)]
    pub delimiter: Option<char>,

    // === Topology Options ===
    /// Number of participants
    #[arg(short = 'n', long, env = "SHMREDUCE_WORLD_SIZE")]
    pub world_size: Option<usize>,

    /// Number of simulated nodes (local mode)
    #[arg(long)]
    pub nodes: Option<usize>,

    /// World rank of this participant (participant mode)
    #[arg(long, env = "SHMREDUCE_RANK")]
    pub rank: Option<usize>,

    /// Rendezvous hub address, hosted by rank 0 [default: 127.0.0.1:7411]
    #[arg(long, env = "SHMREDUCE_HUB")]
    pub hub: Option<String>,

    /// Node identity override (default: hostname)
    #[arg(long, env = "SHMREDUCE_NODE_ID")]
    pub node_id: Option<String>,

    /// Seconds to keep retrying the hub connection [default: 30]
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    // === Reduction Options ===
    /// Reduction threads per participant (0 = cores / participants per node)
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// Directory for shared segments [default: /dev/shm]
    #[arg(long)]
    pub shm_dir: Option<PathBuf>,

    // === Output Options ===
    /// File the global average is appended to [default: pm10_analysis_results.txt]
    #[arg(long)]
    pub results_file: Option<PathBuf>,

    /// Name of the averaged quantity in reports [default: PM10 Concentration]
    #[arg(long)]
    pub label: Option<String>,

    /// Alert when the global average exceeds this value [default: 30.0]
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Write a JSON run summary to this file
    #[arg(long)]
    pub json_output: Option<PathBuf>,

    // === Generate Options ===
    /// Rows to generate
    #[arg(long, default_value = "10000")]
    pub rows: usize,

    /// Mean of generated values
    #[arg(long, default_value = "25.0")]
    pub mean: f64,

    /// Standard deviation of generated values
    #[arg(long, default_value = "10.0")]
    pub std_dev: f64,

    /// Random seed for generated values
    #[arg(long, default_value = "42")]
    pub seed: u64,

    // === Misc ===
    /// Validate configuration and exit
    #[arg(long)]
    pub dry_run: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mode == ExecutionMode::Generate {
            if self.dataset.is_none() {
                anyhow::bail!("generate mode needs an output PATH");
            }
            if !(self.std_dev.is_finite() && self.std_dev >= 0.0) {
                anyhow::bail!("std_dev must be a non-negative number");
            }
            if !self.mean.is_finite() {
                anyhow::bail!("mean must be a finite number");
            }
            return Ok(());
        }

        if self.mode == ExecutionMode::Launch && self.rank.is_some() {
            anyhow::bail!("--rank cannot be used in launch mode (ranks are assigned per process)");
        }

        if self.mode != ExecutionMode::Local && self.nodes.is_some() {
            anyhow::bail!("--nodes only applies to local mode");
        }

        if let Some(threshold) = self.threshold {
            if !threshold.is_finite() {
                anyhow::bail!("threshold must be a finite number");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("shmreduce").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["data.csv"]);
        assert_eq!(cli.mode, ExecutionMode::Local);
        assert_eq!(cli.dataset, Some(PathBuf::from("data.csv")));
        assert!(cli.column.is_none());
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_column_by_index_or_name() {
        let cli = parse(&["--column", "3", "x.csv"]);
        assert_eq!(cli.column, Some(ColumnSelector::Index(3)));

        let cli = parse(&["--column", "PM10", "x.csv"]);
        assert_eq!(cli.column, Some(ColumnSelector::Name("PM10".to_string())));
    }

    #[test]
    fn test_participant_mode() {
        let cli = parse(&["--mode", "participant", "--rank", "2", "-n", "4", "--hub", "10.0.0.1:7411"]);
        assert_eq!(cli.mode, ExecutionMode::Participant);
        assert_eq!(cli.rank, Some(2));
        assert_eq!(cli.world_size, Some(4));
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_combinations() {
        assert!(parse(&["--mode", "launch", "--rank", "1", "x.csv"]).validate().is_err());
        assert!(parse(&["--mode", "participant", "--nodes", "2"]).validate().is_err());
        assert!(parse(&["--mode", "generate"]).validate().is_err());
        assert!(parse(&["--mode", "generate", "--std-dev=-1", "out.csv"]).validate().is_err());
        assert!(parse(&["--threshold", "inf", "x.csv"]).validate().is_err());
    }

    #[test]
    fn test_generate_mode() {
        let cli = parse(&["--mode", "generate", "--rows", "50", "--seed", "9", "out.csv"]);
        assert_eq!(cli.rows, 50);
        assert_eq!(cli.seed, 9);
        assert!(cli.validate().is_ok());
    }
}
