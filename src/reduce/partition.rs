//! Range partitioning
//!
//! Rank `r` of `W` owns `[N*r/W, N*(r+1)/W)`. The ranges are contiguous, cover
//! `[0, N)` exactly once, and differ in length by at most one element.

use serde::Serialize;
use std::ops::Range;

/// Half-open index range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexRange {
    pub start: usize,
    pub end: usize,
}

impl IndexRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn as_range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Index range of `rank` over a dataset of `len` values shared by `world_size` ranks
///
/// Pure and total: a rank past the data gets an empty range, and products are
/// computed in 128 bits so large datasets cannot overflow.
pub fn partition_range(len: usize, world_size: usize, rank: usize) -> IndexRange {
    if world_size == 0 {
        return IndexRange { start: 0, end: 0 };
    }
    let bound = |r: usize| -> usize {
        let r = r.min(world_size) as u128;
        ((len as u128 * r) / world_size as u128) as usize
    };
    IndexRange {
        start: bound(rank),
        end: bound(rank.saturating_add(1)),
    }
}
