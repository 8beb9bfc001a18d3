//! Rendezvous rounds
//!
//! A collective is a rendezvous: every member of a group contributes once and no
//! member proceeds until the last one has arrived. This module holds the
//! transport-independent bookkeeping for those rounds. The in-process cluster and
//! the TCP hub both drive a [`RoundTable`]; they differ only in how a completed
//! round's deliveries reach the waiting members.
//!
//! # Round lifecycle
//!
//! ```text
//! member 0 ──contribute──┐
//! member 1 ──contribute──┼──> Round{group, seq} ──(all arrived)──> Delivery per member
//! member 2 ──contribute──┘
//! ```
//!
//! Rounds are keyed by (group id, sequence number). Each member numbers its own
//! collectives on a group, so a fast member entering round `seq + 1` never
//! collides with slow members still finishing round `seq`.

use crate::distributed::error::CommError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Kind of collective a member is taking part in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Collective {
    /// Pure synchronization
    Barrier,
    /// Root's payload delivered to every member
    Broadcast { root: usize },
    /// Every payload delivered to root only
    Gather { root: usize },
    /// Every payload delivered to every member
    AllGather,
}

impl Collective {
    fn root(&self) -> Option<usize> {
        match self {
            Collective::Broadcast { root } | Collective::Gather { root } => Some(*root),
            Collective::Barrier | Collective::AllGather => None,
        }
    }
}

impl fmt::Display for Collective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collective::Barrier => write!(f, "barrier"),
            Collective::Broadcast { root } => write!(f, "broadcast(root={})", root),
            Collective::Gather { root } => write!(f, "gather(root={})", root),
            Collective::AllGather => write!(f, "all-gather"),
        }
    }
}

/// What a member receives when its round completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Delivery {
    /// Round completed, nothing to receive
    Ack,
    /// A single payload (broadcast)
    Value(Vec<u8>),
    /// One payload per member, ordered by member index
    Gathered(Vec<Vec<u8>>),
}

/// Identity of one round on one group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoundKey {
    pub group: String,
    pub seq: u64,
}

impl RoundKey {
    pub fn new(group: impl Into<String>, seq: u64) -> Self {
        Self { group: group.into(), seq }
    }
}

/// One member's contribution to a round
#[derive(Debug, Clone)]
pub struct Contribution {
    pub member: usize,
    pub group_size: usize,
    pub op: Collective,
    pub payload: Vec<u8>,
}

/// Result of adding a contribution
#[derive(Debug)]
pub enum Progress<T> {
    /// Still waiting for other members
    Pending,
    /// All members arrived; one (token, delivery) per member in member order
    Complete(Vec<(T, Delivery)>),
}

struct Round<T> {
    group_size: usize,
    op: Collective,
    payloads: Vec<Option<Vec<u8>>>,
    tokens: Vec<Option<T>>,
    arrived: usize,
}

impl<T> Round<T> {
    fn new(group_size: usize, op: Collective) -> Self {
        Self {
            group_size,
            op,
            payloads: (0..group_size).map(|_| None).collect(),
            tokens: (0..group_size).map(|_| None).collect(),
            arrived: 0,
        }
    }
}

/// Open rounds of every group
///
/// `T` is a per-member token handed back with that member's delivery: the hub
/// uses the connection's rank, the in-process cluster the member index.
pub struct RoundTable<T> {
    rounds: HashMap<RoundKey, Round<T>>,
}

impl<T> Default for RoundTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RoundTable<T> {
    pub fn new() -> Self {
        Self {
            rounds: HashMap::new(),
        }
    }

    /// Number of rounds waiting for members
    pub fn open_rounds(&self) -> usize {
        self.rounds.len()
    }

    /// Group id and size of every open round
    pub fn open_groups(&self) -> Vec<(&str, usize)> {
        let mut groups: Vec<(&str, usize)> = self
            .rounds
            .iter()
            .map(|(key, round)| (key.group.as_str(), round.group_size))
            .collect();
        groups.sort_unstable();
        groups.dedup();
        groups
    }

    /// Add a member's contribution to a round
    ///
    /// Any error returned here is a participation fault (wrong kind, wrong root,
    /// wrong group size, duplicate) and must abort the whole run.
    pub fn contribute(
        &mut self,
        key: RoundKey,
        contribution: Contribution,
        token: T,
    ) -> Result<Progress<T>, CommError> {
        let Contribution {
            member,
            group_size,
            op,
            payload,
        } = contribution;

        if member >= group_size {
            return Err(CommError::UnknownMember {
                group: key.group,
                member,
                size: group_size,
            });
        }
        if let Some(root) = op.root() {
            if root >= group_size {
                return Err(CommError::InvalidRoot {
                    root,
                    size: group_size,
                });
            }
        }

        let round = self
            .rounds
            .entry(key.clone())
            .or_insert_with(|| Round::new(group_size, op));

        if round.group_size != group_size || round.op != op {
            return Err(CommError::Mismatch {
                group: key.group,
                seq: key.seq,
                member,
                expected: format!("{} over {} members", round.op, round.group_size),
                found: format!("{} over {} members", op, group_size),
            });
        }
        if round.payloads[member].is_some() {
            return Err(CommError::DuplicateContribution {
                group: key.group,
                seq: key.seq,
                member,
            });
        }

        round.payloads[member] = Some(payload);
        round.tokens[member] = Some(token);
        round.arrived += 1;

        if round.arrived < round.group_size {
            return Ok(Progress::Pending);
        }

        let Some(round) = self.rounds.remove(&key) else {
            return Ok(Progress::Pending);
        };

        let payloads: Vec<Vec<u8>> = round.payloads.into_iter().flatten().collect();
        let tokens: Vec<T> = round.tokens.into_iter().flatten().collect();
        let deliveries = resolve(round.op, payloads);

        Ok(Progress::Complete(tokens.into_iter().zip(deliveries).collect()))
    }
}

/// Turn a full set of payloads into one delivery per member
fn resolve(op: Collective, payloads: Vec<Vec<u8>>) -> Vec<Delivery> {
    let size = payloads.len();
    match op {
        Collective::Barrier => (0..size).map(|_| Delivery::Ack).collect(),
        Collective::Broadcast { root } => {
            let value = &payloads[root];
            (0..size).map(|_| Delivery::Value(value.clone())).collect()
        }
        Collective::Gather { root } => {
            let mut gathered = Some(payloads);
            (0..size)
                .map(|member| {
                    if member == root {
                        Delivery::Gathered(gathered.take().unwrap_or_default())
                    } else {
                        Delivery::Ack
                    }
                })
                .collect()
        }
        Collective::AllGather => (0..size).map(|_| Delivery::Gathered(payloads.clone())).collect(),
    }
}
