//! Node groups and participant roles
//!
//! Participants are grouped by the node they run on. Each participant
//! contributes its node identity to an all-gather on the world group; node
//! indices follow the order in which identities first appear by world rank, so
//! the coordinator's node is always node 0. The world group is then split by
//! node index with the world rank as key, which makes the lowest world rank on
//! each node that node's owner.

pub mod launcher;

use crate::distributed::{collective, CommError, Communicator};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// World rank that loads the dataset and receives the global result
pub const COORDINATOR_RANK: usize = 0;

/// What a participant is responsible for
///
/// Computed once when the node groups are resolved and passed to every stage
/// that behaves differently per participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    /// World rank 0: loads the dataset, owns node 0's buffer, receives the result
    Coordinator,
    /// Node-local rank 0 on any other node: populates its node's buffer
    NodeOwner,
    /// Attaches to its node's buffer read-only
    Worker,
}

impl Role {
    pub fn from_ranks(world_rank: usize, node_rank: usize) -> Self {
        if world_rank == COORDINATOR_RANK {
            Role::Coordinator
        } else if node_rank == 0 {
            Role::NodeOwner
        } else {
            Role::Worker
        }
    }

    pub fn is_coordinator(self) -> bool {
        self == Role::Coordinator
    }

    /// True for the single member of a node group that allocates and writes its buffer
    pub fn owns_node_buffer(self) -> bool {
        matches!(self, Role::Coordinator | Role::NodeOwner)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Coordinator => write!(f, "coordinator"),
            Role::NodeOwner => write!(f, "node-owner"),
            Role::Worker => write!(f, "worker"),
        }
    }
}

/// A participant's place in the world and on its node
pub struct Topology {
    pub world_rank: usize,
    pub world_size: usize,
    pub node_id: String,
    pub node_index: usize,
    pub node_count: usize,
    pub role: Role,
    /// Communicator of this participant's node group
    pub node: Box<dyn Communicator>,
}

impl Topology {
    pub fn node_rank(&self) -> usize {
        self.node.rank()
    }

    pub fn node_size(&self) -> usize {
        self.node.size()
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("world_rank", &self.world_rank)
            .field("world_size", &self.world_size)
            .field("node_id", &self.node_id)
            .field("node_index", &self.node_index)
            .field("node_count", &self.node_count)
            .field("node_rank", &self.node_rank())
            .field("node_size", &self.node_size())
            .field("role", &self.role)
            .finish()
    }
}

/// Form node-local groups and compute this participant's role
///
/// Collective over `world`.
pub fn resolve_node_groups(world: &dyn Communicator, node_id: &str) -> Result<Topology, CommError> {
    let node_ids: Vec<String> = collective::all_gather(world, &node_id.to_string())?;
    let (indices, node_count) = assign_node_indices(&node_ids);
    let node_index = indices[world.rank()];

    let node = world
        .split(Some(node_index as u32), world.rank())?
        .ok_or_else(|| CommError::Transport("node split returned no group".to_string()))?;

    let role = Role::from_ranks(world.rank(), node.rank());

    tracing::debug!(
        node_id,
        node_index,
        node_count,
        node_rank = node.rank(),
        node_size = node.size(),
        %role,
        "Resolved node group"
    );

    Ok(Topology {
        world_rank: world.rank(),
        world_size: world.size(),
        node_id: node_id.to_string(),
        node_index,
        node_count,
        role,
        node,
    })
}

/// Group of all node owners (the coordinator is its rank 0)
///
/// Collective over `world`. Workers take part and receive `None`.
pub fn split_owners(world: &dyn Communicator, role: Role) -> Result<Option<Box<dyn Communicator>>, CommError> {
    let color = role.owns_node_buffer().then_some(0);
    world.split(color, world.rank())
}

/// Node index of every world rank, numbered by first appearance
fn assign_node_indices(node_ids: &[String]) -> (Vec<usize>, usize) {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    let indices = node_ids
        .iter()
        .map(|id| {
            let next = seen.len();
            *seen.entry(id.as_str()).or_insert(next)
        })
        .collect();
    (indices, seen.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalCluster;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_node_indices_follow_first_appearance() {
        let (indices, count) = assign_node_indices(&ids(&["b", "a", "b", "c", "a"]));
        assert_eq!(indices, vec![0, 1, 0, 2, 1]);
        assert_eq!(count, 3);

        let (indices, count) = assign_node_indices(&ids(&["solo"]));
        assert_eq!(indices, vec![0]);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_role_from_ranks() {
        assert_eq!(Role::from_ranks(0, 0), Role::Coordinator);
        assert_eq!(Role::from_ranks(3, 0), Role::NodeOwner);
        assert_eq!(Role::from_ranks(4, 1), Role::Worker);
        assert!(Role::Coordinator.owns_node_buffer());
        assert!(Role::NodeOwner.owns_node_buffer());
        assert!(!Role::Worker.owns_node_buffer());
    }

    #[test]
    fn test_resolve_contiguous_nodes() {
        let cluster = LocalCluster::new(6, 2).unwrap();

        let results = cluster
            .run(|comm, node_id| {
                let topo = resolve_node_groups(&comm, &node_id)?;
                Ok((topo.node_index, topo.node_count, topo.node_rank(), topo.node_size(), topo.role))
            })
            .unwrap();

        assert_eq!(results[0], (0, 2, 0, 3, Role::Coordinator));
        assert_eq!(results[2], (0, 2, 2, 3, Role::Worker));
        assert_eq!(results[3], (1, 2, 0, 3, Role::NodeOwner));
        assert_eq!(results[5], (1, 2, 2, 3, Role::Worker));
    }

    #[test]
    fn test_resolve_interleaved_nodes() {
        let cluster = LocalCluster::new(4, 1).unwrap();

        // Ranks alternate between two hosts
        let results = cluster
            .run(|comm, _| {
                let host = if comm.rank() % 2 == 0 { "even" } else { "odd" };
                let topo = resolve_node_groups(&comm, host)?;
                Ok((topo.node_index, topo.node_rank(), topo.role))
            })
            .unwrap();

        assert_eq!(
            results,
            vec![
                (0, 0, Role::Coordinator),
                (1, 0, Role::NodeOwner),
                (0, 1, Role::Worker),
                (1, 1, Role::Worker),
            ]
        );
    }

    #[test]
    fn test_owner_group() {
        let cluster = LocalCluster::new(6, 3).unwrap();

        let results = cluster
            .run(|comm, node_id| {
                let topo = resolve_node_groups(&comm, &node_id)?;
                let owners = split_owners(&comm, topo.role)?;
                Ok(owners.map(|o| (o.rank(), o.size())))
            })
            .unwrap();

        assert_eq!(
            results,
            vec![Some((0, 3)), None, Some((1, 3)), None, Some((2, 3)), None]
        );
    }
}
