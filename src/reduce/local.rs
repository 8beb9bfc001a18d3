//! Local reduction engine
//!
//! Sums one participant's range of the shared buffer on a dedicated rayon pool.
//! Work is split by rayon's work stealing; chunks below `MIN_CHUNK` values are
//! summed serially so tiny ranges do not pay for task overhead.

use crate::reduce::{Accumulator, IndexRange};
use crate::shm::SharedView;
use crate::Result;
use anyhow::Context;
use rayon::prelude::*;

/// Smallest slice handed to a single task
const MIN_CHUNK: usize = 4096;

/// Default pool size for a participant sharing its node with `node_size - 1` others
///
/// The node's cores are split evenly between co-located participants, with at
/// least one thread each.
pub fn default_threads(node_size: usize) -> usize {
    (num_cpus::get() / node_size.max(1)).max(1)
}

/// Thread pool summing ranges of a published buffer
pub struct LocalReducer {
    pool: rayon::ThreadPool,
}

impl LocalReducer {
    /// Build a pool of `threads` workers (`threads` must be at least 1)
    pub fn new(threads: usize, world_rank: usize) -> Result<Self> {
        if threads == 0 {
            anyhow::bail!("Local reduction needs at least one thread");
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("reduce-{}-{}", world_rank, i))
            .build()
            .context("Failed to build local reduction thread pool")?;
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Sum `range` of `view`
    ///
    /// An empty range yields (0.0, 0). The count is always `range.len()`.
    pub fn reduce(&self, view: &SharedView, range: IndexRange) -> Result<Accumulator> {
        let values = view.slice(range.as_range())?;
        Ok(self.reduce_slice(values))
    }

    /// Sum a slice on the pool
    pub fn reduce_slice(&self, values: &[f64]) -> Accumulator {
        if values.is_empty() {
            return Accumulator::ZERO;
        }
        let sum = self
            .pool
            .install(|| values.par_iter().with_min_len(MIN_CHUNK).sum::<f64>());
        Accumulator::new(sum, values.len() as u64)
    }
}
