//! Partitioned summation
//!
//! - `partition`: which slice of the buffer each participant sums
//! - `local`: summing that slice with a thread pool
//! - `global`: combining every participant's totals on the coordinator

pub mod global;
pub mod local;
pub mod partition;

use serde::{Deserialize, Serialize};

pub use global::reduce_global;
pub use local::LocalReducer;
pub use partition::{partition_range, IndexRange};

/// Running (sum, count) pair
///
/// Per participant this is (localSum, localCount); after the global reduction
/// it is (globalSum, globalCount).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Accumulator {
    pub sum: f64,
    pub count: u64,
}

impl Accumulator {
    pub const ZERO: Accumulator = Accumulator { sum: 0.0, count: 0 };

    pub fn new(sum: f64, count: u64) -> Self {
        Self { sum, count }
    }

    /// Field-wise sum
    pub fn combine(self, other: Accumulator) -> Accumulator {
        Accumulator {
            sum: self.sum + other.sum,
            count: self.count + other.count,
        }
    }

    /// `sum / count`, or 0.0 when nothing was counted
    pub fn average(&self) -> f64 {
        self.mean().unwrap_or(0.0)
    }

    /// `sum / count`, or `None` when nothing was counted
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_is_fieldwise() {
        let total = Accumulator::new(30.0, 2).combine(Accumulator::new(70.0, 2));
        assert_eq!(total, Accumulator::new(100.0, 4));
        assert_eq!(total.average(), 25.0);
    }

    #[test]
    fn test_zero_count_averages_to_zero() {
        assert_eq!(Accumulator::ZERO.average(), 0.0);
        assert_eq!(Accumulator::ZERO.mean(), None);
        assert_eq!(Accumulator::default(), Accumulator::ZERO);
    }

    #[test]
    fn test_mean_distinguishes_zero_data_from_no_data() {
        let zeros = Accumulator::new(0.0, 3);
        assert_eq!(zeros.mean(), Some(0.0));
        assert_eq!(zeros.average(), Accumulator::ZERO.average());
    }
}
