//! Rendezvous hub
//!
//! Hosted by world rank 0 in multi-process runs. The hub:
//! - Accepts exactly one connection per world rank
//! - Validates the handshake (protocol version, world size, unique rank)
//! - Collects contributions into rendezvous rounds
//! - Sends each member its delivery once a round is complete
//! - Relays aborts to every participant
//! - Aborts the run when a participant disconnects without saying goodbye
//! - Aborts the run when a participant leaves a group that still has rounds to finish
//!
//! The hub holds no data of its own; rank 0 talks to it over loopback like any
//! other participant, so there is a single code path for all ranks.

use crate::distributed::protocol::*;
use crate::distributed::rendezvous::{Contribution, Progress, RoundKey, RoundTable};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// How long a fresh connection may take to send HELLO
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to a hub running on its own thread
pub struct HubHandle {
    local_addr: SocketAddr,
    thread: std::thread::JoinHandle<Result<()>>,
}

impl HubHandle {
    /// Address the hub is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for every session to end
    pub fn join(self) -> Result<()> {
        self.thread
            .join()
            .map_err(|_| anyhow::anyhow!("Rendezvous hub thread panicked"))?
    }
}

/// Start a hub for `world_size` participants
///
/// Binds synchronously so address errors surface to the caller before any
/// participant tries to connect.
pub fn spawn_hub(bind_addr: &str, world_size: usize) -> Result<HubHandle> {
    if world_size == 0 {
        anyhow::bail!("Hub needs a world size of at least 1");
    }

    let listener = std::net::TcpListener::bind(bind_addr)
        .with_context(|| format!("Failed to bind rendezvous hub on {}", bind_addr))?;
    listener
        .set_nonblocking(true)
        .context("Failed to make hub listener non-blocking")?;
    let local_addr = listener
        .local_addr()
        .context("Failed to read hub listen address")?;

    let thread = std::thread::Builder::new()
        .name("rendezvous-hub".to_string())
        .spawn(move || -> Result<()> {
            let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
            runtime.block_on(async move {
                let listener = TcpListener::from_std(listener).context("Failed to register hub listener")?;
                serve(listener, world_size).await
            })
        })
        .context("Failed to spawn rendezvous hub thread")?;

    tracing::info!(%local_addr, world_size, "Rendezvous hub listening");

    Ok(HubHandle { local_addr, thread })
}

/// Hub-wide state shared by all sessions
struct HubState {
    world_size: usize,
    table: RoundTable<usize>,
    outboxes: HashMap<usize, mpsc::UnboundedSender<Message>>,
    aborted: Option<AbortMessage>,
    /// Ranks that said GOODBYE
    departed: HashSet<usize>,
    /// World ranks seen contributing to each group
    members: HashMap<String, HashSet<usize>>,
}

impl HubState {
    fn send(&self, rank: usize, msg: Message) {
        if let Some(outbox) = self.outboxes.get(&rank) {
            // A closed outbox means the session already ended
            let _ = outbox.send(msg);
        }
    }

    /// Record the first abort and relay it to every connected participant
    fn abort_all(&mut self, abort: AbortMessage) {
        if self.aborted.is_some() {
            return;
        }
        tracing::error!(rank = abort.rank, reason = %abort.reason, "Run aborted");
        for outbox in self.outboxes.values() {
            let _ = outbox.send(Message::Abort(abort.clone()));
        }
        self.aborted = Some(abort);
    }

    /// A departed rank that belongs to `group`, which can then never complete a round
    ///
    /// A group as large as the world contains every rank; smaller groups are
    /// known by the ranks that have contributed to them.
    fn departed_member(&self, group: &str, group_size: usize) -> Option<usize> {
        if group_size == self.world_size {
            return self.departed.iter().min().copied();
        }
        let members = self.members.get(group)?;
        self.departed.iter().filter(|rank| members.contains(*rank)).min().copied()
    }

    /// Abort if any open round waits on a rank that has left
    fn check_stranded_rounds(&mut self) {
        let stranded = self
            .table
            .open_groups()
            .into_iter()
            .find_map(|(group, size)| self.departed_member(group, size).map(|rank| (rank, group.to_string())));
        if let Some((rank, group)) = stranded {
            self.abort_all(AbortMessage {
                rank,
                reason: format!("rank {} left with collectives pending on group {}", rank, group),
            });
        }
    }
}

async fn serve(listener: TcpListener, world_size: usize) -> Result<()> {
    let state = Arc::new(Mutex::new(HubState {
        world_size,
        table: RoundTable::new(),
        outboxes: HashMap::new(),
        aborted: None,
        departed: HashSet::new(),
        members: HashMap::new(),
    }));
    let mut sessions = JoinSet::new();
    let mut joined = vec![false; world_size];
    let mut remaining = world_size;

    while remaining > 0 {
        let (stream, peer) = listener.accept().await.context("Failed to accept connection")?;
        stream.set_nodelay(true).ok();

        let (rank, read_half, write_half) = match handshake(stream, world_size, &joined).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(%peer, "Rejected connection: {:#}", e);
                continue;
            }
        };

        tracing::debug!(%peer, rank, "Participant joined");
        joined[rank] = true;
        remaining -= 1;

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut hub = lock(&state)?;
            if let Some(abort) = hub.aborted.clone() {
                let _ = tx.send(Message::Abort(abort));
            }
            hub.outboxes.insert(rank, tx);
        }

        sessions.spawn(write_loop(write_half, rx));
        sessions.spawn(read_loop(rank, read_half, Arc::clone(&state)));
    }

    tracing::info!(world_size, "All participants joined");

    while let Some(joined) = sessions.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Hub session ended with error: {:#}", e),
            Err(e) => tracing::warn!("Hub session task failed: {}", e),
        }
    }

    let hub = lock(&state)?;
    tracing::info!(open_rounds = hub.table.open_rounds(), "Rendezvous hub finished");
    if let Some(ref abort) = hub.aborted {
        anyhow::bail!("Run aborted by rank {}: {}", abort.rank, abort.reason);
    }
    Ok(())
}

fn lock(state: &Mutex<HubState>) -> Result<std::sync::MutexGuard<'_, HubState>> {
    state
        .lock()
        .map_err(|_| anyhow::anyhow!("Hub state poisoned"))
}

/// Validate HELLO and answer WELCOME or ERROR
async fn handshake(
    stream: TcpStream,
    world_size: usize,
    joined: &[bool],
) -> Result<(usize, OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf)> {
    let (mut read_half, mut write_half) = stream.into_split();

    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_message(&mut read_half))
        .await
        .context("Timed out waiting for HELLO")??;

    let hello = match first {
        Message::Hello(hello) => hello,
        other => anyhow::bail!("Expected HELLO, got {:?}", other),
    };

    let rejection = if hello.protocol_version != PROTOCOL_VERSION {
        Some(format!(
            "Protocol version mismatch: hub={}, participant={}",
            PROTOCOL_VERSION, hello.protocol_version
        ))
    } else if hello.world_size != world_size {
        Some(format!(
            "World size mismatch: hub={}, participant={}",
            world_size, hello.world_size
        ))
    } else if hello.rank >= world_size {
        Some(format!("Rank {} outside world of size {}", hello.rank, world_size))
    } else if joined[hello.rank] {
        Some(format!("Rank {} already joined", hello.rank))
    } else {
        None
    };

    if let Some(error) = rejection {
        write_message(&mut write_half, &Message::Error(ErrorMessage { error: error.clone() })).await?;
        anyhow::bail!(error);
    }

    write_message(
        &mut write_half,
        &Message::Welcome(WelcomeMessage {
            protocol_version: PROTOCOL_VERSION,
            world_size,
        }),
    )
    .await?;

    tracing::debug!(rank = hello.rank, node_id = %hello.node_id, "Handshake complete");
    Ok((hello.rank, read_half, write_half))
}

/// Drain a session's outbox onto its socket
async fn write_loop(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Message>,
) -> Result<()> {
    while let Some(msg) = rx.recv().await {
        write_message(&mut write_half, &msg).await?;
    }
    Ok(())
}

/// Handle everything a participant sends after the handshake
async fn read_loop(rank: usize, mut read_half: OwnedReadHalf, state: Arc<Mutex<HubState>>) -> Result<()> {
    let outcome = loop {
        let msg = match read_message(&mut read_half).await {
            Ok(msg) => msg,
            Err(e) => break Err(e),
        };

        let mut hub = lock(&state)?;
        match msg {
            Message::Contribute(c) => {
                if let Some(abort) = hub.aborted.clone() {
                    hub.send(rank, Message::Abort(abort));
                    continue;
                }

                hub.members.entry(c.group.clone()).or_default().insert(rank);
                let key = RoundKey::new(c.group.clone(), c.seq);
                let contribution = Contribution {
                    member: c.member,
                    group_size: c.group_size,
                    op: c.op,
                    payload: c.payload,
                };
                match hub.table.contribute(key, contribution, rank) {
                    Ok(Progress::Pending) => hub.check_stranded_rounds(),
                    Ok(Progress::Complete(deliveries)) => {
                        for (member_rank, delivery) in deliveries {
                            hub.send(
                                member_rank,
                                Message::Delivery(DeliveryMessage {
                                    group: c.group.clone(),
                                    seq: c.seq,
                                    delivery,
                                }),
                            );
                        }
                    }
                    Err(e) => hub.abort_all(AbortMessage {
                        rank,
                        reason: e.to_string(),
                    }),
                }
            }
            Message::Abort(abort) => hub.abort_all(abort),
            Message::Goodbye { .. } => break Ok(()),
            other => hub.abort_all(AbortMessage {
                rank,
                reason: format!("protocol violation: unexpected {:?}", other),
            }),
        }
    };

    let mut hub = lock(&state)?;
    match outcome {
        Ok(()) => {
            hub.departed.insert(rank);
            hub.check_stranded_rounds();
        }
        Err(ref e) => hub.abort_all(AbortMessage {
            rank,
            reason: format!("connection lost: {:#}", e),
        }),
    }
    // Dropping the outbox ends the write loop once it has flushed
    hub.outboxes.remove(&rank);
    tracing::debug!(rank, "Participant left");

    outcome
}
