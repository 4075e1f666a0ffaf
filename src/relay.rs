//! # Turn Relay
//!
//! TCP relaying for peers that cannot accept connections directly.
//!
//! ## Server side (runs on reachable nodes)
//! - [`TurnServer`]: public handle (cheap to clone, sends commands to the actor)
//! - `TurnServerActor`: owns the relay session table, processes commands sequentially
//! - `TurnCommand`: commands sent from handles to the actor
//!
//! A relay session owns two TCP listeners, the *server* edge and the *client*
//! edge. The peer being relayed for keeps one idle connection ("pipe") open to
//! its server edge; whoever wants to reach it connects to the client edge. Pipes
//! are paired first-come first-served across the two edges and then bytes are
//! copied verbatim both ways. The relay never looks inside the tunnel.
//!
//! ## Client side
//! - [`TurnClient`]: asks relays for sessions, addresses and hole punch help,
//!   and keeps one pending pipe open on its relay's server edge.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use lru::LruCache;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::error::PeerError;
use crate::hole_punch::{self, HolePunchRegistration, HolePunchServer};
use crate::identity::{Address, PublicKey};
use crate::messages::{NatRequest, NatResponse};
use crate::protocols::{KeyRing, NatHandler, NatRpc};

// ============================================================================
// Constants
// ============================================================================

/// Maximum relay sessions one server keeps; the least recently allocated is
/// closed to make room.
pub const MAX_RELAY_SESSIONS: usize = 1_000;

/// Unpaired pipes kept per edge. The oldest is closed beyond this.
pub const MAX_PENDING_PIPES: usize = 8;

/// Wait before replacing a pending pipe that closed without being paired.
pub const PIPE_REPLACEMENT_DELAY: Duration = Duration::from_secs(5);

/// Consecutive failed pending pipes before the client gives up on a relay.
pub const PIPE_RETRY_BUDGET: u32 = 5;

const PIPE_BUFFER: usize = 16 * 1024;

fn advertised(host: Option<&str>, addr: SocketAddr) -> Address {
    match host {
        Some(host) => Address::new(host, addr.port()),
        None => Address::from_socket_addr(addr),
    }
}

// ============================================================================
// Pipe pairing
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    Server,
    Client,
}

/// Result of offering a pipe to a [`PipeQueue`].
#[derive(Debug, PartialEq, Eq)]
pub enum Admission<P> {
    /// The pipe was matched with the oldest one waiting on the other edge.
    Paired { server: P, client: P },
    /// No partner yet. `evicted` is set when the edge was already full.
    Pending { evicted: Option<P> },
}

/// First-come first-served pairing of pipes across the two edges of a
/// relay session. Arrival order is kept within each edge.
#[derive(Debug)]
pub struct PipeQueue<P> {
    server: VecDeque<P>,
    client: VecDeque<P>,
    capacity: usize,
}

impl<P> PipeQueue<P> {
    pub fn new(capacity: usize) -> Self {
        Self {
            server: VecDeque::new(),
            client: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn admit(&mut self, edge: Edge, pipe: P) -> Admission<P> {
        let (own, other) = match edge {
            Edge::Server => (&mut self.server, &mut self.client),
            Edge::Client => (&mut self.client, &mut self.server),
        };
        if let Some(waiting) = other.pop_front() {
            return match edge {
                Edge::Server => Admission::Paired {
                    server: pipe,
                    client: waiting,
                },
                Edge::Client => Admission::Paired {
                    server: waiting,
                    client: pipe,
                },
            };
        }
        own.push_back(pipe);
        let evicted = if own.len() > self.capacity {
            own.pop_front()
        } else {
            None
        };
        Admission::Pending { evicted }
    }

    /// Drop waiting pipes on `edge` that fail `keep`.
    pub fn retain(&mut self, edge: Edge, keep: impl FnMut(&P) -> bool) {
        match edge {
            Edge::Server => self.server.retain(keep),
            Edge::Client => self.client.retain(keep),
        }
    }

    pub fn pending(&self, edge: Edge) -> usize {
        match edge {
            Edge::Server => self.server.len(),
            Edge::Client => self.client.len(),
        }
    }
}

// ============================================================================
// Relay sessions
// ============================================================================

/// Edge addresses of one relay session, as advertised to peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelaySessionInfo {
    pub server_address: Address,
    pub client_address: Address,
}

struct RelaySession {
    info: RelaySessionInfo,
    /// Unpaired pipes on the server edge.
    pending: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A waiting server-edge pipe never sends before it is paired, so anything
/// readable means it hung up (or misbehaved).
fn waiting_pipe_open(pipe: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match pipe.try_read(&mut probe) {
        Ok(_) => false,
        Err(e) => e.kind() == io::ErrorKind::WouldBlock,
    }
}

async fn run_relay_session(
    server_edge: TcpListener,
    client_edge: TcpListener,
    owner: String,
    pending: Arc<AtomicUsize>,
) {
    let mut queue: PipeQueue<TcpStream> = PipeQueue::new(MAX_PENDING_PIPES);
    let mut pipes = JoinSet::new();

    loop {
        let (edge, accepted) = tokio::select! {
            accepted = server_edge.accept() => (Edge::Server, accepted),
            accepted = client_edge.accept() => (Edge::Client, accepted),
            Some(_) = pipes.join_next(), if !pipes.is_empty() => continue,
        };
        let (stream, from) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(owner = %owner, edge = ?edge, error = %e, "relay edge accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        trace!(owner = %owner, edge = ?edge, from = %from, "pipe arrived");

        let before = queue.pending(Edge::Server);
        queue.retain(Edge::Server, waiting_pipe_open);
        if queue.pending(Edge::Server) < before {
            trace!(owner = %owner, dropped = before - queue.pending(Edge::Server), "pruned closed pipes");
        }

        match queue.admit(edge, stream) {
            Admission::Paired {
                mut server,
                mut client,
            } => {
                let pipe_owner = owner.clone();
                pipes.spawn(async move {
                    match tokio::io::copy_bidirectional(&mut server, &mut client).await {
                        Ok((up, down)) => {
                            trace!(owner = %pipe_owner, up, down, "relayed pipe closed")
                        }
                        Err(e) => debug!(owner = %pipe_owner, error = %e, "relayed pipe failed"),
                    }
                });
                debug!(owner = %owner, "pipes paired");
            }
            Admission::Pending { evicted } => {
                if evicted.is_some() {
                    debug!(owner = %owner, edge = ?edge, "closed oldest pending pipe");
                }
            }
        }
        pending.store(queue.pending(Edge::Server), Ordering::Relaxed);
    }
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum TurnCommand {
    Allocate {
        owner: PublicKey,
        reply: oneshot::Sender<Result<RelaySessionInfo>>,
    },
    ClientAddress {
        owner: PublicKey,
        reply: oneshot::Sender<Option<Address>>,
    },
    Release {
        owner: PublicKey,
        reply: oneshot::Sender<bool>,
    },
    SessionCount {
        reply: oneshot::Sender<usize>,
    },
    PendingPipes {
        owner: PublicKey,
        reply: oneshot::Sender<usize>,
    },
    Quit,
}

// ============================================================================
// TurnServer Handle (public API - cheap to clone)
// ============================================================================

/// Handle to the relay actor. Also answers NAT traversal requests.
#[derive(Clone)]
pub struct TurnServer {
    cmd_tx: mpsc::Sender<TurnCommand>,
    hole_punch: Option<HolePunchServer>,
    advertise_host: Option<Arc<str>>,
}

impl std::fmt::Debug for TurnServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnServer")
            .field("hole_punch", &self.hole_punch)
            .field("advertise_host", &self.advertise_host)
            .finish()
    }
}

impl TurnServer {
    /// Spawn the relay actor. Edge listeners bind on `bind_ip`; addresses
    /// handed to peers use `advertise_host` when set.
    pub fn new(
        bind_ip: IpAddr,
        advertise_host: Option<String>,
        hole_punch: Option<HolePunchServer>,
        max_sessions: usize,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let advertise_host: Option<Arc<str>> = advertise_host.map(Into::into);
        let capacity = NonZeroUsize::new(max_sessions)
            .unwrap_or(NonZeroUsize::new(MAX_RELAY_SESSIONS).expect("MAX_RELAY_SESSIONS must be non-zero"));
        let actor = TurnServerActor {
            bind_ip,
            advertise_host: advertise_host.clone(),
            sessions: LruCache::new(capacity),
        };
        tokio::spawn(actor.run(cmd_rx));
        info!(bind_ip = %bind_ip, "turn server started");
        Self {
            cmd_tx,
            hole_punch,
            advertise_host,
        }
    }

    /// Relay session for `owner`, allocating one if it has none.
    pub async fn allocate(&self, owner: &PublicKey) -> Result<RelaySessionInfo> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(TurnCommand::Allocate {
                owner: owner.clone(),
                reply,
            })
            .await
            .map_err(|_| anyhow!("turn server closed"))?;
        rx.await.map_err(|_| anyhow!("turn server closed"))?
    }

    /// Client edge of `owner`'s session, if it has one.
    pub async fn client_address(&self, owner: &PublicKey) -> Option<Address> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(TurnCommand::ClientAddress {
                owner: owner.clone(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Close `owner`'s session and every pipe in it.
    pub async fn release(&self, owner: &PublicKey) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(TurnCommand::Release {
                owner: owner.clone(),
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn session_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(TurnCommand::SessionCount { reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Pipes `owner` keeps waiting on its server edge.
    pub async fn pending_pipes(&self, owner: &PublicKey) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(TurnCommand::PendingPipes {
                owner: owner.clone(),
                reply,
            })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(TurnCommand::Quit).await;
    }
}

#[async_trait]
impl NatHandler for TurnServer {
    async fn handle_nat_request(&self, from: &PublicKey, request: NatRequest) -> Result<NatResponse> {
        match request {
            NatRequest::RelayConnection => {
                let session = self.allocate(from).await?;
                Ok(NatResponse::RelayConnection {
                    server_address: session.server_address,
                    client_address: session.client_address,
                })
            }
            NatRequest::PeerConnection { target } => Ok(NatResponse::PeerConnection {
                address: self.client_address(&target).await,
            }),
            NatRequest::UdpAddress => Ok(NatResponse::UdpAddress {
                address: self
                    .hole_punch
                    .as_ref()
                    .map(|hp| advertised(self.advertise_host.as_deref(), hp.local_addr())),
            }),
            NatRequest::PeerUdpAddress { target } => {
                let address = match &self.hole_punch {
                    Some(hp) => hp
                        .observed_address(&target)
                        .await
                        .map(Address::from_socket_addr),
                    None => None,
                };
                Ok(NatResponse::PeerUdpAddress { address })
            }
        }
    }
}

// ============================================================================
// TurnServer Actor (owns all state, processes commands sequentially)
// ============================================================================

struct TurnServerActor {
    bind_ip: IpAddr,
    advertise_host: Option<Arc<str>>,
    sessions: LruCache<PublicKey, RelaySession>,
}

impl TurnServerActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<TurnCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                TurnCommand::Allocate { owner, reply } => {
                    let result = self.allocate(owner).await;
                    let _ = reply.send(result);
                }
                TurnCommand::ClientAddress { owner, reply } => {
                    let address = self
                        .sessions
                        .peek(&owner)
                        .map(|s| s.info.client_address.clone());
                    let _ = reply.send(address);
                }
                TurnCommand::Release { owner, reply } => {
                    let _ = reply.send(self.sessions.pop(&owner).is_some());
                }
                TurnCommand::SessionCount { reply } => {
                    let _ = reply.send(self.sessions.len());
                }
                TurnCommand::PendingPipes { owner, reply } => {
                    let pending = self
                        .sessions
                        .peek(&owner)
                        .map_or(0, |s| s.pending.load(Ordering::Relaxed));
                    let _ = reply.send(pending);
                }
                TurnCommand::Quit => break,
            }
        }
        debug!(sessions = self.sessions.len(), "turn server actor shutting down");
    }

    async fn allocate(&mut self, owner: PublicKey) -> Result<RelaySessionInfo> {
        if let Some(existing) = self.sessions.get(&owner) {
            return Ok(existing.info.clone());
        }

        let bind = SocketAddr::new(self.bind_ip, 0);
        let server_edge = TcpListener::bind(bind)
            .await
            .context("failed to bind relay server edge")?;
        let client_edge = TcpListener::bind(bind)
            .await
            .context("failed to bind relay client edge")?;
        let host = self.advertise_host.as_deref();
        let info = RelaySessionInfo {
            server_address: advertised(host, server_edge.local_addr()?),
            client_address: advertised(host, client_edge.local_addr()?),
        };

        debug!(
            owner = %owner.short(),
            server = %info.server_address,
            client = %info.client_address,
            "relay session allocated"
        );
        let pending = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(run_relay_session(
            server_edge,
            client_edge,
            owner.short(),
            pending.clone(),
        ));
        let session = RelaySession {
            info: info.clone(),
            pending,
            task,
        };
        if let Some((evicted, _)) = self.sessions.push(owner, session) {
            debug!(owner = %evicted.short(), "relay session evicted");
        }
        Ok(info)
    }
}

// ============================================================================
// TurnClient
// ============================================================================

/// Client half of the relay protocol. Cheap to clone.
#[derive(Clone)]
pub struct TurnClient {
    inner: Arc<TurnClientInner>,
}

struct TurnClientInner {
    keyring: Arc<dyn KeyRing>,
    nat_rpc: Arc<dyn NatRpc>,
    hole_punch: HolePunchServer,
    peer_server: SocketAddr,
    relay_public_key: RwLock<Option<PublicKey>>,
    terminating: watch::Sender<bool>,
    registration: Mutex<Option<HolePunchRegistration>>,
    /// Pipe maintenance for the current relay.
    pipes: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TurnClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnClient")
            .field("relay_public_key", &self.relay_public_key())
            .field("peer_server", &self.inner.peer_server)
            .finish_non_exhaustive()
    }
}

impl TurnClient {
    /// `peer_server` is where relayed pipes are delivered locally.
    pub fn new(
        keyring: Arc<dyn KeyRing>,
        nat_rpc: Arc<dyn NatRpc>,
        hole_punch: HolePunchServer,
        peer_server: SocketAddr,
    ) -> Self {
        let (terminating, _) = watch::channel(false);
        Self {
            inner: Arc::new(TurnClientInner {
                keyring,
                nat_rpc,
                hole_punch,
                peer_server,
                relay_public_key: RwLock::new(None),
                terminating,
                registration: Mutex::new(None),
                pipes: Mutex::new(None),
            }),
        }
    }

    /// The relay this node asked to relay for it, if any.
    pub fn relay_public_key(&self) -> Option<PublicKey> {
        self.inner
            .relay_public_key
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_terminating(&self) -> bool {
        *self.inner.terminating.borrow()
    }

    /// Ask `relay` where `target` can be reached through it.
    pub async fn request_peer_connection(&self, target: &PublicKey, relay: &PublicKey) -> Result<Address> {
        let response = self
            .inner
            .nat_rpc
            .send_nat_request(relay, NatRequest::PeerConnection { target: target.clone() })
            .await?;
        match response {
            NatResponse::PeerConnection { address } => Ok(address.ok_or(PeerError::NoPeerAddress)?),
            other => bail!("unexpected reply to peer connection request: {:?}", other),
        }
    }

    /// Ask `relay` to relay for us and keep a pending pipe on its server
    /// edge. Returns the client edge address peers should use.
    pub async fn request_relay_connection(&self, relay: &PublicKey) -> Result<Address> {
        if self.is_terminating() {
            bail!("turn client is terminating");
        }
        let response = self
            .inner
            .nat_rpc
            .send_nat_request(relay, NatRequest::RelayConnection)
            .await?;
        let (server_address, client_address) = match response {
            NatResponse::RelayConnection {
                server_address,
                client_address,
            } => (server_address, client_address),
            other => bail!("unexpected reply to relay connection request: {:?}", other),
        };

        let server_edge = server_address.resolve().await?;
        *self
            .inner
            .relay_public_key
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(relay.clone());
        info!(relay = %relay.short(), client_edge = %client_address, "relay connection established");

        let mut pipes = self.inner.pipes.lock().await;
        if let Some(previous) = pipes.take() {
            previous.abort();
            let _ = previous.await;
            trace!(relay = %relay.short(), "replaced pipe maintenance");
        }
        *pipes = Some(tokio::spawn(maintain_pipes(
            server_edge,
            self.inner.peer_server,
            self.inner.terminating.subscribe(),
            relay.short(),
        )));
        Ok(client_address)
    }

    /// Register with `relay`'s hole punch server so peers can be told our
    /// external UDP address. Returns a local TCP address tunnelled to the
    /// relay over UDP.
    pub async fn request_local_hole_punch_address(&self, relay: &PublicKey) -> Result<Address> {
        let response = self
            .inner
            .nat_rpc
            .send_nat_request(relay, NatRequest::UdpAddress)
            .await?;
        let address = match response {
            NatResponse::UdpAddress { address } => address,
            other => bail!("unexpected reply to UDP address request: {:?}", other),
        };
        let relay_udp = address.ok_or(PeerError::NoPeerAddress)?.resolve().await?;

        let endpoint = self.inner.hole_punch.endpoint();
        let registration =
            hole_punch::register(endpoint, self.inner.keyring.as_ref(), relay_udp).await?;
        debug!(relay = %relay.short(), observed = %registration.observed(), "hole punch address learned");
        if let Some(previous) = self.inner.registration.lock().await.replace(registration) {
            previous.close().await;
        }

        let local = hole_punch::bridge_listener(endpoint.clone(), relay_udp).await?;
        Ok(Address::from_socket_addr(local))
    }

    /// Ask `relay` for `peer`'s external UDP address and bridge a local TCP
    /// port to it.
    pub async fn request_hole_punch_connection(&self, relay: &PublicKey, peer: &PublicKey) -> Result<Address> {
        let response = self
            .inner
            .nat_rpc
            .send_nat_request(relay, NatRequest::PeerUdpAddress { target: peer.clone() })
            .await?;
        let address = match response {
            NatResponse::PeerUdpAddress { address } => address,
            other => bail!("unexpected reply to peer UDP address request: {:?}", other),
        };
        let target = address.ok_or(PeerError::NoPeerAddress)?.resolve().await?;
        trace!(peer = %peer.short(), target = %target, "punching towards peer");
        let local =
            hole_punch::bridge_listener(self.inner.hole_punch.endpoint().clone(), target).await?;
        Ok(Address::from_socket_addr(local))
    }

    /// Stop replacing pipes, close the active ones and drop the hole punch
    /// registration.
    pub async fn terminate(&self) {
        self.inner.terminating.send_replace(true);
        if let Some(pipes) = self.inner.pipes.lock().await.take() {
            pipes.abort();
        }
        if let Some(registration) = self.inner.registration.lock().await.take() {
            registration.close().await;
        }
        debug!("turn client terminated");
    }
}

/// Keep one pending pipe open on a relay's server edge. A pipe that gets
/// paired is handed off and replaced at once; one that closes unpaired is
/// replaced after [`PIPE_REPLACEMENT_DELAY`].
async fn maintain_pipes(
    server_edge: SocketAddr,
    peer_server: SocketAddr,
    mut terminating: watch::Receiver<bool>,
    relay: String,
) {
    let mut budget = PIPE_RETRY_BUDGET;
    while !*terminating.borrow() {
        let opened = tokio::select! {
            opened = open_pending_pipe(server_edge) => opened,
            _ = terminating.changed() => break,
        };
        match opened {
            Ok((pipe, first)) => {
                budget = PIPE_RETRY_BUDGET;
                tokio::spawn(run_active_pipe(pipe, first, peer_server, terminating.clone()));
            }
            Err(e) => {
                budget -= 1;
                if budget == 0 {
                    warn!(relay = %relay, error = %e, "giving up on relay pipes");
                    break;
                }
                debug!(relay = %relay, error = %e, remaining = budget, "pending pipe lost");
                tokio::select! {
                    _ = tokio::time::sleep(PIPE_REPLACEMENT_DELAY) => {}
                    _ = terminating.changed() => break,
                }
            }
        }
    }
    trace!(relay = %relay, "pipe maintenance stopped");
}

/// Connect to the server edge and wait until the relay pairs the pipe,
/// which shows up as the first bytes from the other side.
async fn open_pending_pipe(server_edge: SocketAddr) -> Result<(TcpStream, Vec<u8>)> {
    let mut pipe = TcpStream::connect(server_edge)
        .await
        .with_context(|| format!("failed to reach relay edge {}", server_edge))?;
    let mut first = vec![0u8; PIPE_BUFFER];
    let n = pipe.read(&mut first).await.context("pending pipe failed")?;
    if n == 0 {
        bail!("relay closed the pending pipe");
    }
    first.truncate(n);
    Ok((pipe, first))
}

async fn run_active_pipe(
    mut pipe: TcpStream,
    first: Vec<u8>,
    peer_server: SocketAddr,
    mut terminating: watch::Receiver<bool>,
) {
    let relay_pipe = async {
        let mut local = TcpStream::connect(peer_server)
            .await
            .context("peer server unreachable for relayed pipe")?;
        local.write_all(&first).await?;
        tokio::io::copy_bidirectional(&mut pipe, &mut local).await?;
        Ok::<_, anyhow::Error>(())
    };
    tokio::select! {
        result = relay_pipe => {
            if let Err(e) = result {
                debug!(error = %e, "relayed pipe ended with error");
            }
        }
        _ = terminating.changed() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKeyRing;
    use crate::identity::Keypair;

    fn loopback_ip() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    #[test]
    fn first_pipes_on_each_edge_pair_up() {
        let mut queue = PipeQueue::new(MAX_PENDING_PIPES);
        assert_eq!(queue.admit(Edge::Server, "s1"), Admission::Pending { evicted: None });
        assert_eq!(
            queue.admit(Edge::Client, "c1"),
            Admission::Paired {
                server: "s1",
                client: "c1"
            }
        );
        assert_eq!(queue.pending(Edge::Server), 0);
        assert_eq!(queue.pending(Edge::Client), 0);
    }

    #[test]
    fn extra_pipe_waits_instead_of_being_dropped() {
        let mut queue = PipeQueue::new(MAX_PENDING_PIPES);
        queue.admit(Edge::Client, "c1");
        assert_eq!(queue.admit(Edge::Client, "c2"), Admission::Pending { evicted: None });
        assert_eq!(
            queue.admit(Edge::Server, "s1"),
            Admission::Paired {
                server: "s1",
                client: "c1"
            }
        );
        assert_eq!(queue.pending(Edge::Client), 1);
        assert_eq!(
            queue.admit(Edge::Server, "s2"),
            Admission::Paired {
                server: "s2",
                client: "c2"
            }
        );
    }

    #[test]
    fn pending_pipes_are_capped_per_edge() {
        let mut queue = PipeQueue::new(2);
        queue.admit(Edge::Server, 1);
        queue.admit(Edge::Server, 2);
        assert_eq!(queue.admit(Edge::Server, 3), Admission::Pending { evicted: Some(1) });
        assert_eq!(queue.pending(Edge::Server), 2);
        assert_eq!(
            queue.admit(Edge::Client, 10),
            Admission::Paired {
                server: 2,
                client: 10
            }
        );
    }

    #[tokio::test]
    async fn allocation_is_reused_per_owner() {
        let turn = TurnServer::new(loopback_ip(), None, None, 4);
        let owner = Keypair::generate().public_key();

        let first = turn.allocate(&owner).await.unwrap();
        let second = turn.allocate(&owner).await.unwrap();
        assert_eq!(first, second);
        assert_ne!(first.server_address, first.client_address);
        assert_eq!(turn.session_count().await, 1);
        assert_eq!(turn.client_address(&owner).await, Some(first.client_address));

        assert!(turn.release(&owner).await);
        assert_eq!(turn.client_address(&owner).await, None);
    }

    #[tokio::test]
    async fn oldest_session_is_evicted_when_full() {
        let turn = TurnServer::new(loopback_ip(), None, None, 1);
        let a = Keypair::generate().public_key();
        let b = Keypair::generate().public_key();
        turn.allocate(&a).await.unwrap();
        turn.allocate(&b).await.unwrap();
        assert_eq!(turn.session_count().await, 1);
        assert_eq!(turn.client_address(&a).await, None);
        assert!(turn.client_address(&b).await.is_some());
    }

    #[tokio::test]
    async fn paired_pipes_forward_bytes_both_ways() {
        let turn = TurnServer::new(loopback_ip(), None, None, 4);
        let owner = Keypair::generate().public_key();
        let session = turn.allocate(&owner).await.unwrap();

        let mut server_pipe = TcpStream::connect(session.server_address.resolve().await.unwrap())
            .await
            .unwrap();
        let mut client_pipe = TcpStream::connect(session.client_address.resolve().await.unwrap())
            .await
            .unwrap();

        client_pipe.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server_pipe.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server_pipe.write_all(b"world").await.unwrap();
        client_pipe.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    /// Delivers NAT requests straight to an in-process relay.
    struct LoopbackNat {
        turn: TurnServer,
        from: PublicKey,
    }

    #[async_trait]
    impl NatRpc for LoopbackNat {
        async fn send_nat_request(&self, _relay: &PublicKey, request: NatRequest) -> Result<NatResponse> {
            self.turn.handle_nat_request(&self.from, request).await
        }
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind(SocketAddr::new(loopback_ip(), 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut tcp, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = tcp.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn client_for(turn: &TurnServer, peer_server: SocketAddr) -> (TurnClient, PublicKey) {
        let keyring = Arc::new(LocalKeyRing::new(Keypair::generate()));
        let public_key = keyring.public_key().clone();
        let nat = Arc::new(LoopbackNat {
            turn: turn.clone(),
            from: public_key.clone(),
        });
        let hole_punch = HolePunchServer::bind(SocketAddr::new(loopback_ip(), 0), peer_server)
            .await
            .unwrap();
        (TurnClient::new(keyring, nat, hole_punch, peer_server), public_key)
    }

    async fn round_trip(address: &Address, payload: &[u8]) -> Vec<u8> {
        let mut tcp = TcpStream::connect(address.resolve().await.unwrap()).await.unwrap();
        tcp.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        tokio::time::timeout(Duration::from_secs(5), tcp.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn relayed_peer_stays_reachable_across_connections() {
        let relay_key = Keypair::generate().public_key();
        let relay_udp = HolePunchServer::bind(SocketAddr::new(loopback_ip(), 0), echo_server().await)
            .await
            .unwrap();
        let turn = TurnServer::new(loopback_ip(), None, Some(relay_udp), 4);
        let (behind_nat, key) = client_for(&turn, echo_server().await).await;

        let client_edge = behind_nat.request_relay_connection(&relay_key).await.unwrap();
        assert_eq!(behind_nat.relay_public_key(), Some(relay_key.clone()));

        let (seeker, _) = client_for(&turn, echo_server().await).await;
        let found = seeker.request_peer_connection(&key, &relay_key).await.unwrap();
        assert_eq!(found, client_edge);

        assert_eq!(round_trip(&found, b"first").await, b"first");
        assert_eq!(round_trip(&found, b"second").await, b"second");
        behind_nat.terminate().await;
    }

    #[tokio::test]
    async fn repeated_relay_request_keeps_one_pending_pipe() {
        let relay_key = Keypair::generate().public_key();
        let turn = TurnServer::new(loopback_ip(), None, None, 4);
        let (behind_nat, key) = client_for(&turn, echo_server().await).await;

        let wait_for_pending = |expected: usize| {
            let turn = turn.clone();
            let key = key.clone();
            async move {
                let settled = tokio::time::timeout(Duration::from_secs(5), async {
                    while turn.pending_pipes(&key).await != expected {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                })
                .await;
                assert!(settled.is_ok(), "expected {} pending pipe(s)", expected);
            }
        };

        let first = behind_nat.request_relay_connection(&relay_key).await.unwrap();
        wait_for_pending(1).await;
        let second = behind_nat.request_relay_connection(&relay_key).await.unwrap();
        assert_eq!(first, second);

        // The replaced pipe is pruned rather than paired with the next caller.
        assert_eq!(round_trip(&second, b"still one").await, b"still one");
        wait_for_pending(1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(turn.pending_pipes(&key).await, 1);
        behind_nat.terminate().await;
    }

    #[test]
    fn retain_drops_waiting_pipes() {
        let mut queue = PipeQueue::new(MAX_PENDING_PIPES);
        for pipe in 1..=4 {
            queue.admit(Edge::Server, pipe);
        }
        queue.retain(Edge::Server, |pipe| pipe % 2 == 0);
        assert_eq!(queue.pending(Edge::Server), 2);
        assert_eq!(
            queue.admit(Edge::Client, 10),
            Admission::Paired {
                server: 2,
                client: 10
            }
        );
    }

    #[tokio::test]
    async fn unknown_peer_has_no_relayed_address() {
        let turn = TurnServer::new(loopback_ip(), None, None, 4);
        let (seeker, _) = client_for(&turn, echo_server().await).await;
        let stranger = Keypair::generate().public_key();
        let err = seeker
            .request_peer_connection(&stranger, &stranger)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<PeerError>(), Some(PeerError::NoPeerAddress)));
    }

    #[tokio::test]
    async fn hole_punch_connection_reaches_registered_peer() {
        let relay_key = Keypair::generate().public_key();
        let relay_udp = HolePunchServer::bind(SocketAddr::new(loopback_ip(), 0), echo_server().await)
            .await
            .unwrap();
        let turn = TurnServer::new(loopback_ip(), None, Some(relay_udp), 4);
        let (target, target_key) = client_for(&turn, echo_server().await).await;
        let (seeker, _) = client_for(&turn, echo_server().await).await;

        let via_relay = target.request_local_hole_punch_address(&relay_key).await.unwrap();
        assert_eq!(round_trip(&via_relay, b"to the relay").await, b"to the relay");

        let punched = seeker
            .request_hole_punch_connection(&relay_key, &target_key)
            .await
            .unwrap();
        assert_eq!(round_trip(&punched, b"to the target").await, b"to the target");
    }
}
