//! Global reduction engine

use crate::distributed::{collective, CommError, Communicator};
use crate::reduce::Accumulator;
use crate::topology::{Role, COORDINATOR_RANK};

/// Combine every participant's local totals on the coordinator
///
/// Collective over `world`. Returns `Some(global)` on the coordinator and
/// `None` everywhere else.
pub fn reduce_global(
    world: &dyn Communicator,
    role: Role,
    local: Accumulator,
) -> Result<Option<Accumulator>, CommError> {
    let global = collective::reduce(world, COORDINATOR_RANK, local, Accumulator::combine)?;

    if role.is_coordinator() != global.is_some() {
        return Err(CommError::UnexpectedDelivery {
            op: "global reduction".to_string(),
            detail: format!("role {} on world rank {}", role, world.rank()),
        });
    }
    Ok(global)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalCluster;

    #[test]
    fn test_only_coordinator_receives_totals() {
        let cluster = LocalCluster::new(3, 1).unwrap();

        let results = cluster
            .run(|comm, _| {
                let role = Role::from_ranks(comm.rank(), comm.rank());
                let local = match comm.rank() {
                    0 => Accumulator::new(5.0, 1),
                    _ => Accumulator::ZERO,
                };
                Ok(reduce_global(&comm, role, local)?)
            })
            .unwrap();

        assert_eq!(results, vec![Some(Accumulator::new(5.0, 1)), None, None]);
    }
}
