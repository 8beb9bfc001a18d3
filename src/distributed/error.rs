//! Collective operation errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a collective operation
///
/// Every variant is fatal for the run. `Aborted` is what a participant sees when
/// some other member (or the hub) gave up; every other variant is raised locally
/// and is followed by a coordinated abort so peers do not stay blocked.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommError {
    #[error("run aborted by rank {rank}: {reason}")]
    Aborted { rank: usize, reason: String },

    #[error("mismatched collective in group '{group}' round {seq}: expected {expected}, member {member} called {found}")]
    Mismatch {
        group: String,
        seq: u64,
        member: usize,
        expected: String,
        found: String,
    },

    #[error("member {member} contributed twice to group '{group}' round {seq}")]
    DuplicateContribution { group: String, seq: u64, member: usize },

    #[error("member {member} is outside group '{group}' of size {size}")]
    UnknownMember { group: String, member: usize, size: usize },

    #[error("invalid root {root} for group of size {size}")]
    InvalidRoot { root: usize, size: usize },

    #[error("unexpected delivery for {op}: {detail}")]
    UnexpectedDelivery { op: String, detail: String },

    #[error("payload codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl CommError {
    /// True when this error was received from another participant rather than raised here
    pub fn is_remote_abort(&self) -> bool {
        matches!(self, CommError::Aborted { .. })
    }
}
