//! shmreduce - Hybrid distributed/shared-memory reduction
//!
//! Averages one numeric column of a dataset across many participants. The
//! dataset is loaded once, placed in one shared memory segment per node,
//! partitioned across participants for parallel summation, and combined into a
//! single global average on the coordinator.
//!
//! # Architecture
//!
//! - **Communicators**: blocking collectives over threads or TCP processes
//! - **Topology**: node-local groups and an explicit per-participant role
//! - **Shared buffers**: one file-backed mapping per node, single writer
//! - **Reduction**: range partitioning, rayon local sums, global reduce
//! - **Sinks**: console, results file, threshold alert, JSON summary

pub mod config;
pub mod dataset;
pub mod distributed;
pub mod output;
pub mod pipeline;
pub mod reduce;
pub mod shm;
pub mod topology;

// Re-export commonly used types
pub use config::Config;
pub use distributed::Communicator;
pub use pipeline::{run_local, run_participant, PipelineOptions};

/// Result type used throughout shmreduce
pub type Result<T> = anyhow::Result<T>;
