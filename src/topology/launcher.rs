//! Launcher environment detection
//!
//! Rank and world size are fixed at launch. When they are not given explicitly
//! they are read from the environment of common process launchers.

use crate::Result;
use anyhow::Context;

/// Rank and world size as reported by a launcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchInfo {
    pub rank: usize,
    pub world_size: usize,
    /// Launcher the values came from
    pub source: &'static str,
}

/// (launcher name, rank variable, size variable), checked in order
const LAUNCHERS: &[(&str, &str, &str)] = &[
    ("shmreduce", "SHMREDUCE_RANK", "SHMREDUCE_WORLD_SIZE"),
    ("open-mpi", "OMPI_COMM_WORLD_RANK", "OMPI_COMM_WORLD_SIZE"),
    ("pmi", "PMI_RANK", "PMI_SIZE"),
    ("slurm", "SLURM_PROCID", "SLURM_NTASKS"),
];

/// Detect rank and world size from the process environment
pub fn detect() -> Result<Option<LaunchInfo>> {
    detect_from(|name| std::env::var(name).ok())
}

/// Detect rank and world size through `lookup`
///
/// The first launcher whose rank and size variables are both set wins. A set
/// but unparseable variable is an error rather than a fall-through.
pub fn detect_from<F>(lookup: F) -> Result<Option<LaunchInfo>>
where
    F: Fn(&str) -> Option<String>,
{
    for &(source, rank_var, size_var) in LAUNCHERS {
        let (Some(rank), Some(size)) = (lookup(rank_var), lookup(size_var)) else {
            continue;
        };

        let rank = rank
            .trim()
            .parse::<usize>()
            .with_context(|| format!("Invalid {}: '{}'", rank_var, rank))?;
        let world_size = size
            .trim()
            .parse::<usize>()
            .with_context(|| format!("Invalid {}: '{}'", size_var, size))?;

        return Ok(Some(LaunchInfo {
            rank,
            world_size,
            source,
        }));
    }
    Ok(None)
}

/// Identity of the node this process runs on (hostname)
pub fn local_node_id() -> String {
    if let Ok(hostname) = hostname::get() {
        if let Ok(hostname_str) = hostname.into_string() {
            return hostname_str;
        }
    }
    "unknown".to_string()
}
