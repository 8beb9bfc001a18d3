//! Configuration validation

use super::*;
use anyhow::Result;

/// Validate complete configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_dataset(&config.dataset)?;
    validate_reduction(&config.reduction)?;
    validate_topology(&config.topology)?;
    validate_output(&config.output)?;

    Ok(())
}

/// Validate dataset configuration
pub fn validate_dataset(dataset: &DatasetConfig) -> Result<()> {
    if let ColumnSelector::Name(ref name) = dataset.column {
        if name.is_empty() {
            anyhow::bail!("column name must not be empty");
        }
        if !dataset.has_header {
            anyhow::bail!("column '{}' is selected by name, which requires a header row", name);
        }
    }

    if dataset.delimiter == '\n' || dataset.delimiter == '\r' {
        anyhow::bail!("delimiter must not be a line break");
    }

    Ok(())
}

/// Validate reduction configuration
pub fn validate_reduction(reduction: &ReductionConfig) -> Result<()> {
    let max_threads = num_cpus::get() * 16;
    if reduction.threads > max_threads {
        anyhow::bail!(
            "threads ({}) exceeds {} (16x the {} available cores)",
            reduction.threads,
            max_threads,
            num_cpus::get()
        );
    }

    if let Some(ref dir) = reduction.shm_dir {
        if !dir.is_dir() {
            anyhow::bail!("shm_dir {} is not a directory", dir.display());
        }
    }

    Ok(())
}

/// Validate topology configuration
pub fn validate_topology(topology: &TopologyConfig) -> Result<()> {
    if topology.world_size == 0 {
        anyhow::bail!("world_size must be at least 1");
    }

    if topology.nodes == 0 || topology.nodes > topology.world_size {
        anyhow::bail!(
            "nodes must be between 1 and world_size ({}), got {}",
            topology.world_size,
            topology.nodes
        );
    }

    if let Some(rank) = topology.rank {
        if rank >= topology.world_size {
            anyhow::bail!("rank {} is outside world of size {}", rank, topology.world_size);
        }
    }

    if topology.hub_addr.trim().is_empty() {
        anyhow::bail!("hub_addr must not be empty");
    }

    if let Some(ref node_id) = topology.node_id {
        if node_id.trim().is_empty() {
            anyhow::bail!("node_id must not be empty");
        }
    }

    Ok(())
}

/// Validate output configuration
pub fn validate_output(output: &OutputConfig) -> Result<()> {
    if !output.threshold.is_finite() {
        anyhow::bail!("threshold must be a finite number, got {}", output.threshold);
    }

    if output.label.trim().is_empty() {
        anyhow::bail!("label must not be empty");
    }

    if output.results_file.as_os_str().is_empty() {
        anyhow::bail!("results_file must not be empty");
    }

    Ok(())
}
