//! In-process cluster
//!
//! Runs a fixed number of participants as threads of the current process. All
//! groups of the cluster (the world and every subgroup split from it) share one
//! round table behind a single mutex, so an abort raised on any group wakes
//! every waiter on every group.
//!
//! Node co-location is simulated: participants are assigned to `nodes` node
//! identities in contiguous blocks, which lets one machine exercise several
//! node-local groups and shared segments.

use crate::distributed::rendezvous::{Collective, Contribution, Delivery, Progress, RoundKey, RoundTable};
use crate::distributed::{CommError, Communicator};
use crate::Result;
use anyhow::Context;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Group id of the world communicator
pub const WORLD_GROUP: &str = "world";

struct ClusterInner {
    table: RoundTable<usize>,
    /// Completed deliveries not yet picked up, keyed by (round, member)
    mailboxes: HashMap<(RoundKey, usize), Delivery>,
    aborted: Option<CommError>,
}

struct ClusterState {
    inner: Mutex<ClusterInner>,
    ready: Condvar,
}

impl ClusterState {
    fn lock(&self) -> std::result::Result<MutexGuard<'_, ClusterInner>, CommError> {
        self.inner
            .lock()
            .map_err(|_| CommError::Transport("cluster state poisoned".to_string()))
    }

    fn abort(&self, rank: usize, reason: &str) {
        // Poisoning only happens if a participant panicked while holding the
        // lock; the abort flag must still be raised.
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.aborted.is_none() {
            inner.aborted = Some(CommError::Aborted {
                rank,
                reason: reason.to_string(),
            });
        }
        self.ready.notify_all();
    }
}

/// One participant's view of a group in an in-process cluster
pub struct LocalCommunicator {
    state: Arc<ClusterState>,
    world_rank: usize,
    group: String,
    rank: usize,
    size: usize,
    seq: AtomicU64,
}

impl LocalCommunicator {
    /// World rank of this participant (identical across all its groups)
    pub fn world_rank(&self) -> usize {
        self.world_rank
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn group_id(&self) -> &str {
        &self.group
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn exchange_round(&self, seq: u64, op: Collective, payload: Vec<u8>) -> std::result::Result<Delivery, CommError> {
        let key = RoundKey::new(self.group.clone(), seq);
        let mut inner = self.state.lock()?;

        if let Some(err) = &inner.aborted {
            return Err(err.clone());
        }

        let contribution = Contribution {
            member: self.rank,
            group_size: self.size,
            op,
            payload,
        };
        match inner.table.contribute(key.clone(), contribution, self.rank) {
            Ok(Progress::Pending) => {}
            Ok(Progress::Complete(deliveries)) => {
                for (member, delivery) in deliveries {
                    inner.mailboxes.insert((key.clone(), member), delivery);
                }
                self.state.ready.notify_all();
            }
            Err(err) => {
                tracing::error!(rank = self.world_rank, group = %self.group, "{}", err);
                inner.aborted = Some(CommError::Aborted {
                    rank: self.world_rank,
                    reason: err.to_string(),
                });
                self.state.ready.notify_all();
                return Err(err);
            }
        }

        let mailbox = (key, self.rank);
        loop {
            if let Some(delivery) = inner.mailboxes.remove(&mailbox) {
                return Ok(delivery);
            }
            if let Some(err) = &inner.aborted {
                return Err(err.clone());
            }
            inner = self
                .state
                .ready
                .wait(inner)
                .map_err(|_| CommError::Transport("cluster state poisoned".to_string()))?;
        }
    }

    fn subgroup(&self, group_id: String, rank: usize, size: usize) -> Box<dyn Communicator> {
        Box::new(LocalCommunicator {
            state: Arc::clone(&self.state),
            world_rank: self.world_rank,
            group: group_id,
            rank,
            size,
            seq: AtomicU64::new(0),
        })
    }

    fn abort(&self, reason: &str) {
        self.state.abort(self.world_rank, reason);
    }
}

/// A set of participant threads forming one world group
#[derive(Debug, Clone, Copy)]
pub struct LocalCluster {
    world_size: usize,
    nodes: usize,
}

impl LocalCluster {
    /// Create a cluster of `world_size` participants spread over `nodes` simulated nodes
    pub fn new(world_size: usize, nodes: usize) -> Result<Self> {
        if world_size == 0 {
            anyhow::bail!("world size must be at least 1");
        }
        if nodes == 0 || nodes > world_size {
            anyhow::bail!(
                "node count must be between 1 and the world size ({}), got {}",
                world_size,
                nodes
            );
        }
        Ok(Self { world_size, nodes })
    }

    /// Simulated node identity of a participant
    ///
    /// Ranks are assigned to nodes in contiguous blocks (`rank * nodes / world_size`).
    pub fn node_id_for(&self, rank: usize) -> String {
        format!("local-node-{}", rank * self.nodes / self.world_size)
    }

    /// World communicators for every participant, in rank order
    pub fn communicators(&self) -> Vec<LocalCommunicator> {
        let state = Arc::new(ClusterState {
            inner: Mutex::new(ClusterInner {
                table: RoundTable::new(),
                mailboxes: HashMap::new(),
                aborted: None,
            }),
            ready: Condvar::new(),
        });

        (0..self.world_size)
            .map(|rank| LocalCommunicator {
                state: Arc::clone(&state),
                world_rank: rank,
                group: WORLD_GROUP.to_string(),
                rank,
                size: self.world_size,
                seq: AtomicU64::new(0),
            })
            .collect()
    }

    /// Run `participant` on every rank, each on its own thread
    ///
    /// Returns the per-rank results in rank order. If any participant fails or
    /// panics the cluster is aborted (so nobody stays blocked in a collective)
    /// and the first failure that did not merely report someone else's abort is
    /// returned.
    pub fn run<T, F>(&self, participant: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(LocalCommunicator, String) -> Result<T> + Send + Sync,
    {
        let (tx, rx) = crossbeam::channel::unbounded();
        let participant = &participant;

        let spawned = crossbeam::thread::scope(|scope| -> Result<()> {
            for comm in self.communicators() {
                let tx = tx.clone();
                let rank = comm.world_rank();
                let node_id = self.node_id_for(rank);
                let state = Arc::clone(&comm.state);

                scope
                    .builder()
                    .name(format!("participant-{}", rank))
                    .spawn(move |_| {
                        let span = tracing::info_span!("participant", rank);
                        let _entered = span.enter();

                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| participant(comm, node_id)))
                            .unwrap_or_else(|_| Err(anyhow::anyhow!("participant {} panicked", rank)));
                        if let Err(ref e) = outcome {
                            state.abort(rank, &format!("{:#}", e));
                        }
                        let _ = tx.send((rank, outcome));
                    })
                    .with_context(|| format!("Failed to spawn participant thread {}", rank))?;
            }
            Ok(())
        });

        match spawned {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("participant thread panicked outside the participant body"),
        }
        drop(tx);

        let mut outcomes: Vec<(usize, Result<T>)> = rx.iter().collect();
        outcomes.sort_by_key(|(rank, _)| *rank);

        let mut values = Vec::with_capacity(outcomes.len());
        let mut first_abort: Option<anyhow::Error> = None;
        let mut root_cause: Option<anyhow::Error> = None;

        for (rank, outcome) in outcomes {
            match outcome {
                Ok(value) => values.push(value),
                Err(e) => {
                    let e = e.context(format!("participant {} failed", rank));
                    if is_remote_abort(&e) {
                        first_abort.get_or_insert(e);
                    } else {
                        root_cause.get_or_insert(e);
                    }
                }
            }
        }

        if let Some(e) = root_cause.or(first_abort) {
            return Err(e);
        }
        if values.len() != self.world_size {
            anyhow::bail!(
                "only {} of {} participants reported a result",
                values.len(),
                self.world_size
            );
        }
        Ok(values)
    }
}

/// True when the error only reports another participant's abort
pub fn is_remote_abort(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<CommError>().map_or(false, CommError::is_remote_abort))
}
