//! Reduction pipeline
//!
//! One participant's run, start to finish:
//!
//! 1. Resolve node groups and this participant's role
//! 2. Coordinator loads the dataset
//! 3. Broadcast the dataset length to the world
//! 4. Coordinator hands the values to the other node owners
//! 5. Allocate (owner) or attach to (worker) the node buffer
//! 6. Owner populates the buffer
//! 7. Publication barrier on the node group
//! 8. Sum this participant's partition locally
//! 9. Reduce every participant's totals on the coordinator
//!
//! A failure at any step aborts the whole run so no peer stays blocked in a
//! later collective.

use crate::dataset::{Dataset, DatasetSource};
use crate::distributed::local::is_remote_abort;
use crate::distributed::{collective, Communicator, LocalCluster};
use crate::output::{format_value, ReductionReport};
use crate::reduce::{local::default_threads, partition_range, reduce_global, Accumulator, IndexRange, LocalReducer};
use crate::shm::{allocate_shared, NodeBuffer};
use crate::topology::{resolve_node_groups, split_owners, Role, COORDINATOR_RANK};
use crate::Result;
use anyhow::Context;
use std::path::PathBuf;
use std::time::Instant;

/// Per-run settings shared by every participant
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Local reduction threads; 0 splits the node's cores between its participants
    pub threads: usize,
    /// Directory holding the shared segments
    pub shm_dir: PathBuf,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            threads: 0,
            shm_dir: crate::shm::default_shm_dir(),
        }
    }
}

/// What one participant ends the run with
#[derive(Debug, Clone)]
pub struct ParticipantOutcome {
    pub world_rank: usize,
    pub role: Role,
    pub node_index: usize,
    pub range: IndexRange,
    pub local: Accumulator,
    /// Present on the coordinator only
    pub report: Option<ReductionReport>,
}

/// Run the pipeline as one participant of `world`
///
/// `source` is only read on the coordinator; other participants may pass `None`.
pub fn run_participant(
    world: &dyn Communicator,
    node_id: &str,
    source: Option<&dyn DatasetSource>,
    options: &PipelineOptions,
) -> Result<ParticipantOutcome> {
    match run_stages(world, node_id, source, options) {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            if !is_remote_abort(&e) {
                tracing::error!("Participant {} failed: {:#}", world.rank(), e);
                world.abort(&format!("{:#}", e));
            }
            Err(e)
        }
    }
}

fn run_stages(
    world: &dyn Communicator,
    node_id: &str,
    source: Option<&dyn DatasetSource>,
    options: &PipelineOptions,
) -> Result<ParticipantOutcome> {
    let start = Instant::now();
    let world_rank = world.rank();

    let topo = resolve_node_groups(world, node_id).context("Failed to resolve node groups")?;
    let role = topo.role;

    let dataset = if role.is_coordinator() {
        let source = source.context("Coordinator has no dataset source")?;
        Some(source.load().context("Failed to load dataset")?)
    } else {
        None
    };

    let len = broadcast_len(world, dataset.as_ref())?;
    if role.is_coordinator() {
        tracing::info!("Total data size: {}", len);
    }

    let values = distribute_to_owners(world, role, dataset.as_ref(), len)?;

    let mut buffer = allocate_shared(topo.node.as_ref(), role, len, &options.shm_dir)
        .context("Failed to allocate shared buffer")?;
    if let NodeBuffer::Owner(ref mut owner) = buffer {
        let values = values.context("Node owner received no dataset values")?;
        owner.populate(&values)?;
    }
    let view = buffer
        .publish(topo.node.as_ref())
        .context("Failed to publish shared buffer")?;

    let range = partition_range(len, world.size(), world_rank);
    let threads = match options.threads {
        0 => default_threads(topo.node_size()),
        n => n,
    };
    let reducer = LocalReducer::new(threads, world_rank)?;
    let local = reducer.reduce(&view, range)?;

    tracing::info!(
        start = range.start,
        end = range.end,
        threads,
        "Process {} Local Average: {}",
        world_rank,
        format_value(local.average())
    );

    let global = reduce_global(world, role, local).context("Global reduction failed")?;
    drop(view);

    let report = match (global, dataset) {
        (Some(totals), Some(dataset)) => Some(
            ReductionReport::new(world.size(), topo.node_count, totals, dataset.description, dataset.skipped)
                .with_elapsed(start.elapsed()),
        ),
        _ => None,
    };

    Ok(ParticipantOutcome {
        world_rank,
        role,
        node_index: topo.node_index,
        range,
        local,
        report,
    })
}

/// Dataset length from the coordinator to every participant
fn broadcast_len(world: &dyn Communicator, dataset: Option<&Dataset>) -> Result<usize> {
    let len = dataset.map(|d| d.len() as u64);
    let len: u64 = collective::broadcast(world, COORDINATOR_RANK, len.as_ref()).context("Failed to broadcast dataset length")?;
    usize::try_from(len).with_context(|| format!("Dataset of {} values does not fit this platform", len))
}

/// Give every node owner a copy of the values for its node buffer
///
/// Workers get `None`. With a single node the coordinator is the only owner
/// and nothing crosses the wire.
fn distribute_to_owners(
    world: &dyn Communicator,
    role: Role,
    dataset: Option<&Dataset>,
    len: usize,
) -> Result<Option<Vec<f64>>> {
    let Some(owners) = split_owners(world, role)? else {
        return Ok(None);
    };

    if let Some(dataset) = dataset {
        if owners.size() > 1 {
            owners
                .broadcast_bytes(0, Some(collective::encode(&dataset.values)?))
                .context("Failed to send dataset to node owners")?;
        }
        return Ok(Some(dataset.values.clone()));
    }

    let bytes = owners
        .broadcast_bytes(0, None)
        .context("Failed to receive dataset from coordinator")?;
    let values: Vec<f64> = collective::decode(&bytes)?;
    if values.len() != len {
        anyhow::bail!("Received {} dataset values, expected {}", values.len(), len);
    }
    Ok(Some(values))
}

/// Run the whole pipeline on an in-process cluster and return the coordinator's report
pub fn run_local(
    cluster: &LocalCluster,
    source: &dyn DatasetSource,
    options: &PipelineOptions,
) -> Result<(ReductionReport, Vec<ParticipantOutcome>)> {
    let outcomes = cluster.run(|comm, node_id| {
        let source = (comm.rank() == COORDINATOR_RANK).then_some(source);
        run_participant(&comm, &node_id, source, options)
    })?;

    let report = outcomes
        .iter()
        .find_map(|o| o.report.clone())
        .context("Coordinator produced no report")?;
    Ok((report, outcomes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{ColumnSelector, CsvColumnSource, InMemorySource};
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> PipelineOptions {
        PipelineOptions {
            threads: 2,
            shm_dir: dir.path().to_path_buf(),
        }
    }

    fn run(values: Vec<f64>, world_size: usize, nodes: usize) -> (ReductionReport, Vec<ParticipantOutcome>) {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(world_size, nodes).unwrap();
        let result = run_local(&cluster, &InMemorySource::new(values), &options(&dir)).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0, "segments left behind");
        result
    }

    #[test]
    fn test_four_values_two_participants() {
        let (report, outcomes) = run(vec![10.0, 20.0, 30.0, 40.0], 2, 1);

        assert_eq!(outcomes[0].range, IndexRange { start: 0, end: 2 });
        assert_eq!(outcomes[1].range, IndexRange { start: 2, end: 4 });
        assert_eq!(outcomes[0].local, Accumulator::new(30.0, 2));
        assert_eq!(outcomes[1].local, Accumulator::new(70.0, 2));
        assert_eq!(report.totals, Accumulator::new(100.0, 4));
        assert_eq!(report.average, 25.0);
    }

    #[test]
    fn test_more_participants_than_values() {
        let (report, outcomes) = run(vec![5.0], 3, 1);

        let locals: Vec<Accumulator> = outcomes.iter().map(|o| o.local).collect();
        assert_eq!(
            locals,
            vec![Accumulator::new(5.0, 1), Accumulator::ZERO, Accumulator::ZERO]
        );
        assert_eq!(report.average, 5.0);
    }

    #[test]
    fn test_empty_dataset_averages_to_zero() {
        let (report, outcomes) = run(Vec::new(), 3, 2);

        assert_eq!(report.totals.count, 0);
        assert_eq!(report.average, 0.0);
        assert_eq!(report.mean(), None);
        assert!(outcomes.iter().all(|o| o.range.is_empty()));
    }

    #[test]
    fn test_average_independent_of_participant_count() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(2024);
        let values: Vec<f64> = (0..10_007).map(|_| rng.gen_range(0.0..80.0)).collect();

        let (single, _) = run(values.clone(), 1, 1);
        let (four, _) = run(values, 4, 2);

        let relative = ((single.average - four.average) / single.average).abs();
        assert!(relative < 1e-9, "W=1 {} vs W=4 {}", single.average, four.average);
        assert_eq!(single.totals.count, four.totals.count);
    }

    #[test]
    fn test_every_node_reads_the_full_dataset() {
        let (report, outcomes) = run(vec![1.0, 2.0, 3.0], 15, 5);

        assert_eq!(report.node_count, 5);
        assert_eq!(report.average, 2.0);

        // The last value is summed on node 4, so that node's buffer was populated
        let last = &outcomes[14];
        assert_eq!(last.node_index, 4);
        assert_eq!(last.range, IndexRange { start: 2, end: 3 });
        assert_eq!(last.local, Accumulator::new(3.0, 1));

        let roles: Vec<Role> = outcomes.iter().map(|o| o.role).collect();
        assert_eq!(roles.iter().filter(|r| **r == Role::Coordinator).count(), 1);
        assert_eq!(roles.iter().filter(|r| **r == Role::NodeOwner).count(), 4);
        assert_eq!(roles[3], Role::NodeOwner);
    }

    #[test]
    fn test_only_coordinator_has_report() {
        let (_, outcomes) = run(vec![1.0, 2.0], 3, 1);
        assert!(outcomes[0].report.is_some());
        assert!(outcomes[1..].iter().all(|o| o.report.is_none()));
    }

    #[test]
    fn test_unreadable_dataset_aborts_everyone() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(4, 2).unwrap();
        let source = CsvColumnSource::new(dir.path().join("missing.csv"), ColumnSelector::default());

        let err = run_local(&cluster, &source, &options(&dir)).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("Failed to load dataset"), "{}", message);
        assert!(message.contains("participant 0"), "{}", message);
    }

    #[test]
    fn test_allocation_failure_aborts_every_node() {
        let cluster = LocalCluster::new(4, 2).unwrap();
        let options = PipelineOptions {
            threads: 1,
            shm_dir: std::path::PathBuf::from("/nonexistent/shm"),
        };

        // Returning at all means the members attached to either node were released
        let err = run_local(&cluster, &InMemorySource::new(vec![1.0, 2.0, 3.0, 4.0]), &options).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("Failed to allocate shared buffer"), "{}", message);
        assert!(message.contains("participant 0"), "{}", message);
    }

    #[test]
    fn test_csv_end_to_end() {
        let dir = TempDir::new().unwrap();
        let csv = dir.path().join("pm10.csv");
        std::fs::write(&csv, "station,pm10\nA,10\nB,bad\nC,20\nD,30\nE,40\n").unwrap();

        let shm = TempDir::new().unwrap();
        let cluster = LocalCluster::new(2, 1).unwrap();
        let source = CsvColumnSource::new(&csv, ColumnSelector::Index(1));
        let (report, _) = run_local(&cluster, &source, &options(&shm)).unwrap();

        assert_eq!(report.average, 25.0);
        assert_eq!(report.skipped_records, 1);
    }
}
