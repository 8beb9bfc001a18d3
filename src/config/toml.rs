//! TOML configuration file parsing

use super::*;
use crate::config::cli::Cli;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Build the run configuration: defaults, then `--config`, then the command line
pub fn load_config(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => parse_toml_file(path)?,
        None => Config::default(),
    };
    merge_cli_with_config(cli, config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Result<Config> {
    // Dataset
    if let Some(ref path) = cli.dataset {
        config.dataset.path = Some(path.clone());
    }
    if let Some(ref column) = cli.column {
        config.dataset.column = column.clone();
    }
    if cli.no_header {
        config.dataset.has_header = false;
    }
    if let Some(delimiter) = cli.delimiter {
        config.dataset.delimiter = delimiter;
    }

    // Topology
    if let Some(world_size) = cli.world_size {
        config.topology.world_size = world_size;
    }
    if let Some(nodes) = cli.nodes {
        config.topology.nodes = nodes;
    }
    if let Some(rank) = cli.rank {
        config.topology.rank = Some(rank);
    }
    if let Some(ref hub) = cli.hub {
        config.topology.hub_addr = hub.clone();
    }
    if let Some(ref node_id) = cli.node_id {
        config.topology.node_id = Some(node_id.clone());
    }
    if let Some(secs) = cli.connect_timeout {
        config.topology.connect_timeout_secs = secs;
    }

    // Reduction
    if let Some(threads) = cli.threads {
        config.reduction.threads = threads;
    }
    if let Some(ref dir) = cli.shm_dir {
        config.reduction.shm_dir = Some(dir.clone());
    }

    // Output
    if let Some(ref path) = cli.results_file {
        config.output.results_file = path.clone();
    }
    if let Some(ref label) = cli.label {
        config.output.label = label.clone();
    }
    if let Some(threshold) = cli.threshold {
        config.output.threshold = threshold;
    }
    if let Some(ref path) = cli.json_output {
        config.output.json_output = Some(path.clone());
    }

    Ok(config)
}
