//! Process groups and collective operations
//!
//! Every cross-participant step of the reduction (size broadcast, segment
//! attach, publication barrier, global reduction) is a blocking collective on a
//! [`Communicator`]. Two transports implement it:
//!
//! - **In-process** (`local`): participants are threads of one process meeting at
//!   a shared round table. Used by `local` mode and by the tests.
//! - **TCP** (`tcp` + `hub`): participants are processes, possibly on different
//!   hosts. World rank 0 hosts a rendezvous hub; everyone, rank 0 included,
//!   talks to it over the length-prefixed protocol in `protocol`.
//!
//! Both drive the same round bookkeeping in `rendezvous`, so collective
//! semantics (ordering, mismatch detection, who receives what) are identical.
//!
//! # Modules
//!
//! - `rendezvous`: round table shared by both transports
//! - `collective`: typed helpers (MessagePack payloads) over the byte-level trait
//! - `local`: in-process cluster of participant threads
//! - `protocol`: message definitions and framing for the TCP transport
//! - `hub`: rendezvous server hosted by world rank 0
//! - `tcp`: participant side of the TCP transport

pub mod collective;
pub mod error;
pub mod hub;
pub mod local;
pub mod protocol;
pub mod rendezvous;
pub mod tcp;

pub use error::CommError;
pub use hub::{spawn_hub, HubHandle};
pub use local::{LocalCluster, LocalCommunicator};
pub use rendezvous::{Collective, Delivery};
pub use tcp::TcpCommunicator;

/// A fixed group of participants that meet at blocking collectives
///
/// Implementors provide one primitive, a rendezvous round (`exchange_round`),
/// plus sequence numbering and subgroup construction. Everything else is
/// derived here so every transport behaves the same way.
///
/// No collective has a timeout. A participant that never arrives stalls the
/// group; the only way out is [`Communicator::abort`] from a member that hit a
/// fatal error, which turns every pending and future collective in the run
/// into [`CommError::Aborted`].
pub trait Communicator: Send + Sync {
    /// Rank of this participant within the group
    fn rank(&self) -> usize;

    /// Number of participants in the group
    fn size(&self) -> usize;

    /// Identifier shared by every member of the group
    fn group_id(&self) -> &str;

    /// Allocate the sequence number of this member's next collective on the group
    fn next_seq(&self) -> u64;

    /// Take part in round `seq` and block until every member has arrived
    fn exchange_round(&self, seq: u64, op: Collective, payload: Vec<u8>) -> Result<Delivery, CommError>;

    /// Communicator for a subgroup every member has already agreed on
    fn subgroup(&self, group_id: String, rank: usize, size: usize) -> Box<dyn Communicator>;

    /// Abort the whole run
    ///
    /// Idempotent. Peers blocked in any collective, on any group, return
    /// `CommError::Aborted` carrying this participant's world rank and `reason`.
    fn abort(&self, reason: &str);

    /// Take part in the next round on this group
    fn exchange(&self, op: Collective, payload: Vec<u8>) -> Result<Delivery, CommError> {
        let seq = self.next_seq();
        self.exchange_round(seq, op, payload)
    }

    /// Block until every member has called `barrier`
    fn barrier(&self) -> Result<(), CommError> {
        match self.exchange(Collective::Barrier, Vec::new())? {
            Delivery::Ack => Ok(()),
            other => Err(unexpected(Collective::Barrier, &other)),
        }
    }

    /// Deliver root's payload to every member
    ///
    /// Non-root members pass `None`. A root passing `None` broadcasts an empty payload.
    fn broadcast_bytes(&self, root: usize, payload: Option<Vec<u8>>) -> Result<Vec<u8>, CommError> {
        let op = Collective::Broadcast { root };
        match self.exchange(op, payload.unwrap_or_default())? {
            Delivery::Value(value) => Ok(value),
            other => Err(unexpected(op, &other)),
        }
    }

    /// Collect every member's payload on root; other members receive `None`
    fn gather_bytes(&self, root: usize, payload: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>, CommError> {
        let op = Collective::Gather { root };
        match self.exchange(op, payload)? {
            Delivery::Gathered(all) if self.rank() == root => Ok(Some(all)),
            Delivery::Ack if self.rank() != root => Ok(None),
            other => Err(unexpected(op, &other)),
        }
    }

    /// Collect every member's payload on every member
    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, CommError> {
        match self.exchange(Collective::AllGather, payload)? {
            Delivery::Gathered(all) => Ok(all),
            other => Err(unexpected(Collective::AllGather, &other)),
        }
    }

    /// Partition the group by `color`
    ///
    /// Members passing the same color form a new group, ordered by `key` and then
    /// by rank in this group. Members passing `None` take part in the collective
    /// but receive `None`.
    fn split(&self, color: Option<u32>, key: usize) -> Result<Option<Box<dyn Communicator>>, CommError> {
        let seq = self.next_seq();
        let entry = collective::encode(&(color, key as u64))?;
        let all = match self.exchange_round(seq, Collective::AllGather, entry)? {
            Delivery::Gathered(all) => all,
            other => return Err(unexpected(Collective::AllGather, &other)),
        };

        let entries = all
            .iter()
            .map(|bytes| collective::decode::<(Option<u32>, u64)>(bytes))
            .collect::<Result<Vec<_>, _>>()?;

        let Some(color) = color else {
            return Ok(None);
        };
        let members = split_members(&entries, color);
        let Some(rank) = members.iter().position(|&member| member == self.rank()) else {
            return Err(CommError::UnknownMember {
                group: self.group_id().to_string(),
                member: self.rank(),
                size: self.size(),
            });
        };

        let group_id = format!("{}/{}.{}", self.group_id(), seq, color);
        Ok(Some(self.subgroup(group_id, rank, members.len())))
    }
}

/// Parent ranks that chose `color`, in subgroup order
fn split_members(entries: &[(Option<u32>, u64)], color: u32) -> Vec<usize> {
    let mut members: Vec<(u64, usize)> = entries
        .iter()
        .enumerate()
        .filter(|(_, (c, _))| *c == Some(color))
        .map(|(rank, (_, key))| (*key, rank))
        .collect();
    members.sort_unstable();
    members.into_iter().map(|(_, rank)| rank).collect()
}

fn unexpected(op: Collective, delivery: &Delivery) -> CommError {
    let detail = match delivery {
        Delivery::Ack => "ack".to_string(),
        Delivery::Value(v) => format!("value of {} bytes", v.len()),
        Delivery::Gathered(all) => format!("{} gathered payloads", all.len()),
    };
    CommError::UnexpectedDelivery {
        op: op.to_string(),
        detail,
    }
}
