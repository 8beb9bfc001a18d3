//! TCP participant
//!
//! One connection per participant process to the rendezvous hub. Collectives are
//! blocking: each call sends CONTRIBUTE and waits on the socket for the matching
//! DELIVERY (or an ABORT). The connection is owned by a small current-thread
//! tokio runtime, so callers stay fully synchronous.
//!
//! Subgroups created by `split` share the world connection and only differ in
//! their group id, rank and size.
//!
//! No timeout applies to a collective. The only bounded wait is the initial
//! connect, which retries until the hub (started by rank 0) is reachable.

use crate::distributed::local::WORLD_GROUP;
use crate::distributed::protocol::*;
use crate::distributed::rendezvous::{Collective, Delivery};
use crate::distributed::{CommError, Communicator};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// Delay between connection attempts while the hub is starting
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// The connection shared by a participant's communicators
struct Link {
    // Declared before the runtime so the socket is dropped while the reactor is alive
    stream: TcpStream,
    runtime: tokio::runtime::Runtime,
    world_rank: usize,
    failed: Option<CommError>,
}

impl Link {
    fn send(&mut self, msg: &Message) -> Result<(), CommError> {
        let Link { stream, runtime, .. } = self;
        runtime
            .block_on(write_message(stream, msg))
            .map_err(|e| CommError::Transport(format!("{:#}", e)))
    }

    fn receive(&mut self) -> Result<Message, CommError> {
        let Link { stream, runtime, .. } = self;
        runtime
            .block_on(read_message(stream))
            .map_err(|e| CommError::Transport(format!("{:#}", e)))
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        // Without GOODBYE the hub treats the closed socket as a lost participant
        if std::thread::panicking() {
            return;
        }
        let goodbye = Message::Goodbye { rank: self.world_rank };
        if let Err(e) = self.send(&goodbye) {
            tracing::debug!("Failed to send GOODBYE: {}", e);
        }
    }
}

/// Participant communicator over TCP
pub struct TcpCommunicator {
    link: Arc<Mutex<Link>>,
    group: String,
    rank: usize,
    size: usize,
    seq: AtomicU64,
}

impl TcpCommunicator {
    /// Connect to the hub and join the world group
    ///
    /// Retries the connection for up to `connect_timeout` so participants may
    /// start before rank 0 has its hub listening.
    pub fn connect(
        hub_addr: &str,
        rank: usize,
        world_size: usize,
        node_id: &str,
        connect_timeout: Duration,
    ) -> Result<Self, CommError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CommError::Transport(format!("Failed to create tokio runtime: {}", e)))?;

        let stream = runtime.block_on(connect_with_retry(hub_addr, connect_timeout))?;
        stream.set_nodelay(true).ok();

        let mut link = Link {
            stream,
            runtime,
            world_rank: rank,
            failed: None,
        };

        link.send(&Message::Hello(HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            rank,
            world_size,
            node_id: node_id.to_string(),
        }))?;

        match link.receive()? {
            Message::Welcome(welcome) if welcome.world_size == world_size => {}
            Message::Welcome(welcome) => {
                return Err(CommError::Transport(format!(
                    "Hub runs a world of {} participants, expected {}",
                    welcome.world_size, world_size
                )))
            }
            Message::Error(err) => {
                return Err(CommError::Transport(format!("Hub rejected participant: {}", err.error)))
            }
            other => {
                return Err(CommError::Transport(format!("Expected WELCOME, got {:?}", other)))
            }
        }

        tracing::debug!(rank, world_size, hub = hub_addr, "Joined rendezvous hub");

        Ok(Self {
            link: Arc::new(Mutex::new(link)),
            group: WORLD_GROUP.to_string(),
            rank,
            size: world_size,
            seq: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Link>, CommError> {
        self.link
            .lock()
            .map_err(|_| CommError::Transport("participant link poisoned".to_string()))
    }
}

async fn connect_with_retry(addr: &str, timeout: Duration) -> Result<TcpStream, CommError> {
    let start = Instant::now();
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if start.elapsed() < timeout => {
                tracing::trace!("Hub at {} not reachable yet: {}", addr, e);
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
            Err(e) => {
                return Err(CommError::Transport(format!(
                    "Failed to connect to hub at {} within {:?}: {}",
                    addr, timeout, e
                )))
            }
        }
    }
}

impl Communicator for TcpCommunicator {
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

    fn exchange_round(&self, seq: u64, op: Collective, payload: Vec<u8>) -> Result<Delivery, CommError> {
        let mut link = self.lock()?;
        if let Some(err) = &link.failed {
            return Err(err.clone());
        }

        let outcome = (|| {
            link.send(&Message::Contribute(ContributeMessage {
                group: self.group.clone(),
                seq,
                member: self.rank,
                group_size: self.size,
                op,
                payload,
            }))?;

            // Only one collective is in flight per participant, so the next
            // DELIVERY must be ours
            match link.receive()? {
                Message::Delivery(d) if d.group == self.group && d.seq == seq => Ok(d.delivery),
                Message::Delivery(d) => Err(CommError::Transport(format!(
                    "Delivery for group '{}' round {} while waiting on '{}' round {}",
                    d.group, d.seq, self.group, seq
                ))),
                Message::Abort(abort) => Err(CommError::Aborted {
                    rank: abort.rank,
                    reason: abort.reason,
                }),
                other => Err(CommError::Transport(format!("Unexpected message {:?}", other))),
            }
        })();

        if let Err(ref err) = outcome {
            link.failed = Some(err.clone());
        }
        outcome
    }

    fn subgroup(&self, group_id: String, rank: usize, size: usize) -> Box<dyn Communicator> {
        Box::new(TcpCommunicator {
            link: Arc::clone(&self.link),
            group: group_id,
            rank,
            size,
            seq: AtomicU64::new(0),
        })
    }

    fn abort(&self, reason: &str) {
        let Ok(mut link) = self.lock() else {
            return;
        };
        if link.failed.is_some() {
            return;
        }

        let abort = AbortMessage {
            rank: link.world_rank,
            reason: reason.to_string(),
        };
        if let Err(e) = link.send(&Message::Abort(abort.clone())) {
            tracing::warn!("Failed to send ABORT to hub: {}", e);
        }
        link.failed = Some(CommError::Aborted {
            rank: abort.rank,
            reason: abort.reason,
        });
    }
}
