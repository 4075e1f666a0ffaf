//! # Reliable Datagram Transport (RDT)
//!
//! A uTP-style protocol giving ordered, reliable, flow-controlled byte streams
//! over plain UDP datagrams. It carries hole-punched peer traffic, where no
//! TCP path exists between the two sides.
//!
//! ## Architecture
//!
//! - [`Packet`]: the 20-byte header codec
//! - `Window`: fixed ring of `BUFFER_SIZE` slots indexed by `seq % BUFFER_SIZE`
//! - `Connection`: sans-IO state machine (handshake, acks, retransmit, FIN/RESET)
//! - [`RdtEndpoint`]: handle to the actor that owns one UDP socket and
//!   demultiplexes datagrams onto connections keyed by `(remote, connection id)`
//! - [`RdtStream`]: duplex byte stream handed to callers
//!
//! ## Wire format
//!
//! ```text
//! 0       1       2               4               8
//! +-------+-------+---------------+---------------+
//! |typ|ver| ext=0 | connection id |   timestamp   |
//! +-------+-------+---------------+---------------+
//! |   timediff    |    window     |  seq  |  ack  |
//! +---------------+---------------+-------+-------+
//! | payload (0..=MTU bytes)                       |
//! ```
//!
//! All integers are big-endian; `seq` and `ack` use modulo-2^16 arithmetic.
//!
//! ## Connection ids
//!
//! The initiator picks `recv_id` and sends SYN with `connection = recv_id`;
//! it then sends with `send_id = recv_id + 1`. The responder mirrors this:
//! `recv_id = syn.connection + 1`, `send_id = syn.connection`. Incoming
//! datagrams are routed by `(source address, connection)`, with SYNs mapped
//! to `connection + 1` so a repeated SYN finds the session it created.
//!
//! ## Flow control
//!
//! At most `BUFFER_SIZE - 1` packets may be unacknowledged. Acks are
//! cumulative. Every 500ms the oldest unacked packet is checked; if it is
//! older than 500ms, every unacked packet of that age is retransmitted.
//!
//! The receiver only advances `ack` past a DATA packet while the reader has
//! room for it (`RECV_QUEUE` chunks). A stalled reader therefore stalls the
//! sender once its window fills, and buffered data never exceeds one window
//! plus the reader queue.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

// ============================================================================
// Constants
// ============================================================================

/// Protocol version carried in the low nibble of byte 0.
pub const VERSION: u8 = 1;

/// Fixed header length. Shorter datagrams are dropped.
pub const HEADER_LEN: usize = 20;

/// Largest payload carried by one DATA packet.
pub const MTU: usize = 1400;

/// Slots in each direction's window.
pub const BUFFER_SIZE: usize = 512;

/// Writes stall once this many packets are unacknowledged.
const MAX_INFLIGHT: u16 = (BUFFER_SIZE - 1) as u16;

/// Advertised receive window in bytes.
const DEFAULT_WINDOW: u32 = (BUFFER_SIZE * MTU) as u32;

pub const RESEND_INTERVAL: Duration = Duration::from_millis(500);

/// Age after which an unacked packet is sent again.
pub const RESEND_TIMEOUT: Duration = Duration::from_millis(500);

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// How long a client-owned socket lingers after its last connection closes.
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Handshakes that have not completed by then are abandoned.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// In-order chunks queued for a reader that has not consumed them yet.
const RECV_QUEUE: usize = 64;

/// Accepted connections waiting for `accept()`.
const ACCEPT_BACKLOG: usize = 64;

const MAX_DATAGRAM: usize = 64 * 1024;

// ============================================================================
// Packet codec
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
    Data,
    Fin,
    State,
    Reset,
    Syn,
}

impl PacketType {
    fn to_nibble(self) -> u8 {
        match self {
            PacketType::Data => 0,
            PacketType::Fin => 1,
            PacketType::State => 2,
            PacketType::Reset => 3,
            PacketType::Syn => 4,
        }
    }

    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(PacketType::Data),
            1 => Some(PacketType::Fin),
            2 => Some(PacketType::State),
            3 => Some(PacketType::Reset),
            4 => Some(PacketType::Syn),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub connection: u16,
    pub timestamp: u32,
    pub timediff: u32,
    pub window: u32,
    pub seq: u16,
    pub ack: u16,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.data.len());
        buf.push((self.kind.to_nibble() << 4) | VERSION);
        buf.push(0);
        buf.extend_from_slice(&self.connection.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.timediff.to_be_bytes());
        buf.extend_from_slice(&self.window.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.ack.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// `None` for anything that is not a well-formed packet of our version.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN || buf[0] & 0x0F != VERSION {
            return None;
        }
        let kind = PacketType::from_nibble(buf[0] >> 4)?;
        let u16_at = |i: usize| u16::from_be_bytes([buf[i], buf[i + 1]]);
        let u32_at = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Some(Packet {
            kind,
            connection: u16_at(2),
            timestamp: u32_at(4),
            timediff: u32_at(8),
            window: u32_at(12),
            seq: u16_at(16),
            ack: u16_at(18),
            data: buf[HEADER_LEN..].to_vec(),
        })
    }
}

fn timestamp_micros() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u32
}

// ============================================================================
// Window ring buffer
// ============================================================================

/// Fixed-capacity ring indexed by `seq % BUFFER_SIZE`. Each slot remembers the
/// sequence number it was filled for, so an empty slot and a slot holding a
/// packet from a previous lap are both reported as absent.
struct Window<T> {
    slots: Box<[Option<(u16, T)>]>,
}

impl<T> Window<T> {
    fn new() -> Self {
        Self {
            slots: (0..BUFFER_SIZE).map(|_| None).collect(),
        }
    }

    #[inline]
    fn index(seq: u16) -> usize {
        seq as usize % BUFFER_SIZE
    }

    fn put(&mut self, seq: u16, value: T) {
        self.slots[Self::index(seq)] = Some((seq, value));
    }

    fn get(&self, seq: u16) -> Option<&T> {
        match &self.slots[Self::index(seq)] {
            Some((s, value)) if *s == seq => Some(value),
            _ => None,
        }
    }

    fn get_mut(&mut self, seq: u16) -> Option<&mut T> {
        match &mut self.slots[Self::index(seq)] {
            Some((s, value)) if *s == seq => Some(value),
            _ => None,
        }
    }

    fn take(&mut self, seq: u16) -> Option<T> {
        let slot = &mut self.slots[Self::index(seq)];
        match slot {
            Some((s, _)) if *s == seq => slot.take().map(|(_, value)| value),
            _ => None,
        }
    }
}

// ============================================================================
// Connection state machine
// ============================================================================

struct Outgoing {
    packet: Packet,
    sent_at: Instant,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ConnEvent {
    /// Handshake finished on the initiating side.
    Connected,
    /// In-order payload bytes.
    Data(Vec<u8>),
    /// The write with this id is entirely inside the send window.
    Written(u64),
    /// Every sent packet has been acknowledged.
    Flushed,
    /// No more data will arrive.
    End,
    /// Both directions are finished, or the connection was reset.
    Closed,
}

/// One RDT connection, without any I/O. Callers feed it packets and timer
/// ticks and drain the packets it wants sent and the events it produced.
pub(crate) struct Connection {
    recv_id: u16,
    send_id: u16,
    seq: u16,
    ack: u16,
    inflight: u16,
    outgoing: Window<Outgoing>,
    incoming: Window<Packet>,
    connecting: bool,
    closed: bool,
    alive: bool,
    synack: Option<Packet>,
    send_queue: VecDeque<(u64, Vec<u8>)>,
    next_write_id: u64,
    ending: bool,
    fin_sent: bool,
    readable_ended: bool,
    /// DATA packets the reader can still take.
    read_credit: usize,
    outbox: Vec<Packet>,
    events: VecDeque<ConnEvent>,
}

impl Connection {
    fn blank(recv_id: u16, send_id: u16, seq: u16, ack: u16) -> Self {
        Self {
            recv_id,
            send_id,
            seq,
            ack,
            inflight: 0,
            outgoing: Window::new(),
            incoming: Window::new(),
            connecting: false,
            closed: false,
            alive: false,
            synack: None,
            send_queue: VecDeque::new(),
            next_write_id: 0,
            ending: false,
            fin_sent: false,
            readable_ended: false,
            read_credit: RECV_QUEUE,
            outbox: Vec::new(),
            events: VecDeque::new(),
        }
    }

    /// Initiating side. Queues the SYN immediately.
    pub(crate) fn client(recv_id: u16, now: Instant) -> Self {
        let mut conn = Self::blank(recv_id, recv_id.wrapping_add(1), rand::random(), 0);
        conn.connecting = true;
        conn.send_outgoing(PacketType::Syn, Vec::new(), now);
        conn
    }

    /// Responding side, created from the SYN that opened it.
    pub(crate) fn server(syn: &Packet) -> Self {
        let mut conn = Self::blank(
            syn.connection.wrapping_add(1),
            syn.connection,
            rand::random(),
            syn.seq,
        );
        let synack = conn.make_packet(PacketType::State, Vec::new());
        conn.synack = Some(synack.clone());
        conn.transmit(synack);
        conn
    }

    pub(crate) fn is_connecting(&self) -> bool {
        self.connecting
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn poll_event(&mut self) -> Option<ConnEvent> {
        self.events.pop_front()
    }

    fn make_packet(&self, kind: PacketType, data: Vec<u8>) -> Packet {
        Packet {
            kind,
            connection: if kind == PacketType::Syn { self.recv_id } else { self.send_id },
            timestamp: timestamp_micros(),
            timediff: 0,
            window: self.advertised_window(),
            seq: self.seq,
            ack: self.ack,
            data,
        }
    }

    fn advertised_window(&self) -> u32 {
        DEFAULT_WINDOW.min((self.read_credit.min(BUFFER_SIZE) * MTU) as u32)
    }

    fn transmit(&mut self, packet: Packet) {
        self.alive = true;
        self.outbox.push(packet);
    }

    /// Sequence-numbered send: stored in the window until acked.
    fn send_outgoing(&mut self, kind: PacketType, data: Vec<u8>, now: Instant) {
        let packet = self.make_packet(kind, data);
        self.outgoing.put(
            self.seq,
            Outgoing {
                packet: packet.clone(),
                sent_at: now,
            },
        );
        self.seq = self.seq.wrapping_add(1);
        self.inflight += 1;
        self.transmit(packet);
    }

    fn send_ack(&mut self) {
        let packet = self.make_packet(PacketType::State, Vec::new());
        self.transmit(packet);
    }

    /// Queue `data`; returns the id reported by [`ConnEvent::Written`].
    pub(crate) fn write(&mut self, data: Vec<u8>, now: Instant) -> u64 {
        let id = self.next_write_id;
        self.next_write_id += 1;
        if data.is_empty() {
            self.events.push_back(ConnEvent::Written(id));
        } else {
            self.send_queue.push_back((id, data));
            self.pump(now);
        }
        id
    }

    /// Finish the writable side; FIN follows once everything is acked.
    pub(crate) fn end(&mut self, now: Instant) {
        if self.ending {
            return;
        }
        self.ending = true;
        self.pump(now);
    }

    /// Abort: tell the remote with RESET and close immediately.
    pub(crate) fn destroy(&mut self) {
        if self.closed {
            return;
        }
        let reset = self.make_packet(PacketType::Reset, Vec::new());
        self.transmit(reset);
        self.end_readable();
        self.close();
    }

    fn pump(&mut self, now: Instant) {
        if self.connecting || self.closed {
            return;
        }
        while self.inflight < MAX_INFLIGHT {
            let (id, chunk, done) = match self.send_queue.front_mut() {
                Some((id, data)) => {
                    let take = data.len().min(MTU);
                    let chunk: Vec<u8> = data.drain(..take).collect();
                    (*id, chunk, data.is_empty())
                }
                None => break,
            };
            if done {
                self.send_queue.pop_front();
            }
            self.send_outgoing(PacketType::Data, chunk, now);
            if done {
                self.events.push_back(ConnEvent::Written(id));
            }
        }
        if self.ending && !self.fin_sent && self.send_queue.is_empty() && self.inflight == 0 {
            self.fin_sent = true;
            self.send_outgoing(PacketType::Fin, Vec::new(), now);
        }
        self.check_closed();
    }

    fn end_readable(&mut self) {
        if !self.readable_ended {
            self.readable_ended = true;
            self.events.push_back(ConnEvent::End);
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.events.push_back(ConnEvent::Closed);
        }
    }

    fn check_closed(&mut self) {
        if self.readable_ended && self.fin_sent && self.inflight == 0 {
            self.close();
        }
    }

    pub(crate) fn handle_packet(&mut self, packet: Packet, now: Instant) {
        if self.closed {
            return;
        }

        if packet.kind == PacketType::Syn {
            if let Some(synack) = self.synack.clone() {
                trace!(seq = packet.seq, "duplicate SYN, resending SYN-ACK");
                self.transmit(synack);
            }
            return;
        }

        if packet.kind == PacketType::Reset {
            self.end_readable();
            self.close();
            return;
        }

        let packet = if self.connecting {
            if packet.kind != PacketType::State {
                self.incoming.put(packet.seq, packet);
                return;
            }
            self.ack = packet.seq.wrapping_sub(1);
            self.recv_ack(packet.ack);
            self.connecting = false;
            self.events.push_back(ConnEvent::Connected);
            self.pump(now);
            match self.incoming.take(packet.seq) {
                Some(buffered) => buffered,
                None => return,
            }
        } else {
            packet
        };

        let distance = packet.seq.wrapping_sub(self.ack) as usize;
        if distance == 0 || distance >= BUFFER_SIZE {
            trace!(seq = packet.seq, ack = self.ack, "packet outside window, bare ack");
            self.send_ack();
            return;
        }

        self.recv_ack(packet.ack);

        if packet.kind == PacketType::State {
            self.pump(now);
            return;
        }

        self.incoming.put(packet.seq, packet);
        self.deliver_in_order();
        self.send_ack();
        self.pump(now);
    }

    /// Move buffered packets past `ack` while the reader has room. Returns
    /// whether `ack` advanced.
    fn deliver_in_order(&mut self) -> bool {
        let mut advanced = false;
        loop {
            let next = self.ack.wrapping_add(1);
            let carries_data = match self.incoming.get(next) {
                Some(packet) => packet.kind == PacketType::Data && !packet.data.is_empty(),
                None => break,
            };
            if carries_data && self.read_credit == 0 {
                trace!(seq = next, "reader full, holding ack");
                break;
            }
            let Some(packet) = self.incoming.take(next) else {
                break;
            };
            self.ack = next;
            advanced = true;
            match packet.kind {
                PacketType::Data if carries_data => {
                    self.read_credit -= 1;
                    self.events.push_back(ConnEvent::Data(packet.data));
                }
                PacketType::Fin => self.end_readable(),
                _ => {}
            }
        }
        advanced
    }

    /// The reader has room for `credit` more chunks. Returns whether held
    /// packets were released.
    pub(crate) fn grant_read_credit(&mut self, credit: usize, now: Instant) -> bool {
        let starved = self.read_credit == 0;
        self.read_credit = credit;
        if !starved || credit == 0 || self.connecting || self.closed {
            return false;
        }
        if !self.deliver_in_order() {
            return false;
        }
        self.send_ack();
        self.pump(now);
        true
    }

    fn recv_ack(&mut self, ack: u16) {
        let offset = self.seq.wrapping_sub(self.inflight);
        let acked = ack.wrapping_sub(offset) as usize + 1;
        if acked >= BUFFER_SIZE || acked > self.inflight as usize {
            return;
        }
        for i in 0..acked {
            self.outgoing.take(offset.wrapping_add(i as u16));
        }
        self.inflight -= acked as u16;
        if self.inflight == 0 {
            self.events.push_back(ConnEvent::Flushed);
        }
    }

    pub(crate) fn on_resend_tick(&mut self, now: Instant) {
        if self.closed || self.inflight == 0 {
            return;
        }
        let offset = self.seq.wrapping_sub(self.inflight);
        match self.outgoing.get(offset) {
            Some(first) if now.duration_since(first.sent_at) >= RESEND_TIMEOUT => {}
            _ => return,
        }

        let ack = self.ack;
        let timestamp = timestamp_micros();
        let mut resend = Vec::new();
        for i in 0..self.inflight {
            if let Some(entry) = self.outgoing.get_mut(offset.wrapping_add(i))
                && now.duration_since(entry.sent_at) >= RESEND_TIMEOUT
            {
                entry.sent_at = now;
                entry.packet.ack = ack;
                entry.packet.timestamp = timestamp;
                resend.push(entry.packet.clone());
            }
        }
        trace!(count = resend.len(), "retransmitting unacked packets");
        for packet in resend {
            self.transmit(packet);
        }
    }

    pub(crate) fn on_keep_alive_tick(&mut self) {
        if self.closed || self.connecting {
            return;
        }
        if self.alive {
            self.alive = false;
            return;
        }
        self.send_ack();
    }
}

// ============================================================================
// Endpoint actor
// ============================================================================

type ConnKey = (SocketAddr, u16);

enum EndpointCommand {
    Connect {
        remote: SocketAddr,
        reply: oneshot::Sender<Result<RdtStream>>,
    },
    Write {
        key: ConnKey,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    End {
        key: ConnKey,
    },
    Destroy {
        key: ConnKey,
    },
    ConnectionCount {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

struct Slot {
    conn: Connection,
    remote: SocketAddr,
    data_tx: Option<mpsc::Sender<Vec<u8>>>,
    connect: Option<PendingConnect>,
    write_waiters: HashMap<u64, oneshot::Sender<Result<()>>>,
}

impl Slot {
    /// Room left in the reader's queue. A dropped reader takes anything.
    fn read_room(&self) -> usize {
        match &self.data_tx {
            Some(tx) if !tx.is_closed() => tx.capacity(),
            _ => RECV_QUEUE,
        }
    }
}

struct PendingConnect {
    reply: oneshot::Sender<Result<RdtStream>>,
    stream: RdtStream,
    deadline: Instant,
}

/// Handle to one UDP socket speaking the RDT. Cheap to clone.
///
/// The same endpoint can both initiate and accept connections, which is what
/// hole punching needs: the address a relay observed for our outbound
/// connection is the one peers must reach us on.
#[derive(Clone)]
pub struct RdtEndpoint {
    cmd_tx: mpsc::Sender<EndpointCommand>,
    local_addr: SocketAddr,
    incoming: Option<Arc<Mutex<mpsc::Receiver<RdtStream>>>>,
}

impl std::fmt::Debug for RdtEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdtEndpoint")
            .field("local_addr", &self.local_addr)
            .field("accepts", &self.incoming.is_some())
            .finish()
    }
}

impl RdtEndpoint {
    /// Bind a shared endpoint that accepts connections and can initiate them.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Self::spawn(addr, true, false).await
    }

    async fn spawn(addr: SocketAddr, accept: bool, owned: bool) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind RDT socket on {}", addr))?;
        let local_addr = socket.local_addr().context("failed to read RDT local address")?;
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let drained = Arc::new(Notify::new());

        let (accept_tx, incoming) = if accept {
            let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
            (Some(tx), Some(Arc::new(Mutex::new(rx))))
        } else {
            (None, None)
        };

        let actor = EndpointActor {
            socket: Arc::new(socket),
            local_addr,
            cmd_tx: cmd_tx.downgrade(),
            accept_tx,
            slots: HashMap::new(),
            owned,
            used: false,
            close_deadline: None,
            drained,
        };
        tokio::spawn(actor.run(cmd_rx));
        debug!(addr = %local_addr, owned, "RDT endpoint started");

        Ok(Self {
            cmd_tx,
            local_addr,
            incoming,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Open a connection from this endpoint's socket.
    pub async fn connect(&self, remote: SocketAddr) -> Result<RdtStream> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(EndpointCommand::Connect { remote, reply })
            .await
            .map_err(|_| anyhow!("RDT endpoint closed"))?;
        rx.await.map_err(|_| anyhow!("RDT endpoint closed"))?
    }

    /// Next connection opened by a remote SYN. `None` once the endpoint is
    /// gone or was created without accepting.
    pub async fn accept(&self) -> Option<RdtStream> {
        let incoming = self.incoming.as_ref()?;
        incoming.lock().await.recv().await
    }

    pub async fn connection_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(EndpointCommand::ConnectionCount { reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Reset every connection and close the socket.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(EndpointCommand::Shutdown).await;
    }
}

/// Connect from a fresh ephemeral socket owned by the returned stream. The
/// socket is released `CLOSE_GRACE` after the connection closes.
pub async fn connect(remote: SocketAddr) -> Result<RdtStream> {
    let bind: SocketAddr = if remote.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let endpoint = RdtEndpoint::spawn(bind, false, true).await?;
    endpoint.connect(remote).await
}

/// Listening side of the RDT.
#[derive(Clone, Debug)]
pub struct RdtServer {
    endpoint: RdtEndpoint,
}

impl RdtServer {
    pub async fn listen(addr: SocketAddr) -> Result<Self> {
        Ok(Self {
            endpoint: RdtEndpoint::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub async fn accept(&self) -> Option<RdtStream> {
        self.endpoint.accept().await
    }

    pub fn endpoint(&self) -> &RdtEndpoint {
        &self.endpoint
    }
}

struct EndpointActor {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    cmd_tx: mpsc::WeakSender<EndpointCommand>,
    accept_tx: Option<mpsc::Sender<RdtStream>>,
    slots: HashMap<ConnKey, Slot>,
    /// Socket belongs to a single outbound connection.
    owned: bool,
    used: bool,
    close_deadline: Option<tokio::time::Instant>,
    /// Signalled by readers as they consume chunks.
    drained: Arc<Notify>,
}

impl EndpointActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<EndpointCommand>) {
        let socket = self.socket.clone();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut resend = tokio::time::interval(RESEND_INTERVAL);
        resend.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        keep_alive.tick().await; // Skip initial tick
        let mut handles_gone = false;
        let drained = self.drained.clone();

        loop {
            let deadline = self.close_deadline;
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.on_datagram(&buf[..len], from),
                        Err(e) => trace!(error = %e, "RDT recv_from failed"),
                    }
                }
                cmd = cmd_rx.recv(), if !handles_gone => {
                    match cmd {
                        Some(EndpointCommand::Shutdown) => break,
                        Some(cmd) => self.on_command(cmd),
                        None => handles_gone = true,
                    }
                }
                _ = resend.tick() => self.on_resend_tick(),
                _ = drained.notified() => {}
                _ = keep_alive.tick() => {
                    for slot in self.slots.values_mut() {
                        slot.conn.on_keep_alive_tick();
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)), if deadline.is_some() => {
                    debug!(addr = %self.local_addr, "RDT socket grace period over");
                    break;
                }
            }

            self.flush().await;

            if handles_gone && self.slots.is_empty() && !self.owned {
                break;
            }
        }

        for slot in self.slots.values_mut() {
            slot.conn.destroy();
        }
        self.flush().await;
        debug!(addr = %self.local_addr, "RDT endpoint stopped");
    }

    fn on_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        let Some(packet) = Packet::decode(bytes) else {
            trace!(len = bytes.len(), from = %from, "dropping malformed datagram");
            return;
        };
        let now = Instant::now();

        if packet.kind == PacketType::Syn {
            let key = (from, packet.connection.wrapping_add(1));
            if let Some(slot) = self.slots.get_mut(&key) {
                slot.conn.handle_packet(packet, now);
                return;
            }
            self.accept_syn(key, &packet);
            return;
        }

        match self.slots.get_mut(&(from, packet.connection)) {
            Some(slot) => slot.conn.handle_packet(packet, now),
            None => trace!(from = %from, connection = packet.connection, "packet for unknown connection"),
        }
    }

    fn accept_syn(&mut self, key: ConnKey, syn: &Packet) {
        let Some(accept_tx) = self.accept_tx.clone() else {
            trace!(from = %key.0, "SYN on connect-only endpoint");
            return;
        };
        let Some((stream, data_tx)) = self.new_stream(key) else {
            return;
        };
        if let Err(e) = accept_tx.try_send(stream) {
            warn!(from = %key.0, error = %e, "dropping inbound RDT connection");
            return;
        }
        debug!(from = %key.0, connection = key.1, "accepted RDT connection");
        self.used = true;
        self.slots.insert(
            key,
            Slot {
                conn: Connection::server(syn),
                remote: key.0,
                data_tx: Some(data_tx),
                connect: None,
                write_waiters: HashMap::new(),
            },
        );
    }

    fn new_stream(&self, key: ConnKey) -> Option<(RdtStream, mpsc::Sender<Vec<u8>>)> {
        let cmd_tx = self.cmd_tx.upgrade()?;
        let (data_tx, data_rx) = mpsc::channel(RECV_QUEUE);
        let stream = RdtStream {
            remote: key.0,
            local: self.local_addr,
            writer: RdtWriteHalf {
                inner: Arc::new(WriterInner { key, cmd_tx }),
            },
            reader: RdtReader {
                rx: data_rx,
                drained: self.drained.clone(),
                pending: Vec::new(),
                pos: 0,
            },
        };
        Some((stream, data_tx))
    }

    fn pick_recv_id(&self, remote: SocketAddr) -> u16 {
        if self.owned && !self.slots.contains_key(&(remote, self.local_addr.port())) {
            return self.local_addr.port();
        }
        loop {
            let id: u16 = rand::random();
            if !self.slots.contains_key(&(remote, id)) {
                return id;
            }
        }
    }

    fn on_command(&mut self, cmd: EndpointCommand) {
        let now = Instant::now();
        match cmd {
            EndpointCommand::Connect { remote, reply } => {
                let recv_id = self.pick_recv_id(remote);
                let key = (remote, recv_id);
                let Some((stream, data_tx)) = self.new_stream(key) else {
                    let _ = reply.send(Err(anyhow!("RDT endpoint closing")));
                    return;
                };
                debug!(remote = %remote, recv_id, "opening RDT connection");
                self.used = true;
                self.close_deadline = None;
                self.slots.insert(
                    key,
                    Slot {
                        conn: Connection::client(recv_id, now),
                        remote,
                        data_tx: Some(data_tx),
                        connect: Some(PendingConnect {
                            reply,
                            stream,
                            deadline: now + CONNECT_TIMEOUT,
                        }),
                        write_waiters: HashMap::new(),
                    },
                );
            }
            EndpointCommand::Write { key, data, reply } => match self.slots.get_mut(&key) {
                Some(slot) if !slot.conn.is_closed() => {
                    let id = slot.conn.write(data, now);
                    slot.write_waiters.insert(id, reply);
                }
                _ => {
                    let _ = reply.send(Err(anyhow!("RDT connection closed")));
                }
            },
            EndpointCommand::End { key } => {
                if let Some(slot) = self.slots.get_mut(&key) {
                    slot.conn.end(now);
                }
            }
            EndpointCommand::Destroy { key } => {
                if let Some(slot) = self.slots.get_mut(&key) {
                    slot.conn.destroy();
                }
            }
            EndpointCommand::ConnectionCount { reply } => {
                let _ = reply.send(self.slots.len());
            }
            EndpointCommand::Shutdown => {}
        }
    }

    fn on_resend_tick(&mut self) {
        let now = Instant::now();
        for slot in self.slots.values_mut() {
            let expired = slot
                .connect
                .as_ref()
                .is_some_and(|pending| slot.conn.is_connecting() && now >= pending.deadline);
            if expired {
                debug!(remote = %slot.remote, "RDT handshake timed out");
                slot.conn.destroy();
                continue;
            }
            slot.conn.on_resend_tick(now);
        }
    }

    /// Send queued packets, deliver connection events and hand readers'
    /// freed room back to their connections.
    async fn flush(&mut self) {
        let now = Instant::now();
        let mut closed = Vec::new();
        for (key, slot) in self.slots.iter_mut() {
            loop {
                for packet in slot.conn.take_outbox() {
                    if let Err(e) = self.socket.send_to(&packet.encode(), slot.remote).await {
                        trace!(remote = %slot.remote, error = %e, "RDT send failed");
                    }
                }
                while let Some(event) = slot.conn.poll_event() {
                    match event {
                        ConnEvent::Connected => {
                            if let Some(pending) = slot.connect.take() {
                                debug!(remote = %slot.remote, "RDT connection established");
                                let _ = pending.reply.send(Ok(pending.stream));
                            }
                        }
                        ConnEvent::Data(bytes) => {
                            if let Some(tx) = &slot.data_tx
                                && let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(bytes)
                            {
                                warn!(remote = %slot.remote, "RDT reader queue overrun");
                            }
                        }
                        ConnEvent::Written(id) => {
                            if let Some(waiter) = slot.write_waiters.remove(&id) {
                                let _ = waiter.send(Ok(()));
                            }
                        }
                        ConnEvent::Flushed => {}
                        ConnEvent::End => slot.data_tx = None,
                        ConnEvent::Closed => closed.push(*key),
                    }
                }
                let room = slot.read_room();
                if !slot.conn.grant_read_credit(room, now) {
                    break;
                }
            }
        }

        for key in closed {
            if let Some(slot) = self.slots.remove(&key) {
                trace!(remote = %slot.remote, "RDT connection closed");
                if let Some(pending) = slot.connect {
                    let _ = pending
                        .reply
                        .send(Err(anyhow!("RDT connection to {} failed", slot.remote)));
                }
            }
        }

        if self.owned && self.used && self.slots.is_empty() && self.close_deadline.is_none() {
            self.close_deadline = Some(tokio::time::Instant::now() + CLOSE_GRACE);
        }
    }
}

// ============================================================================
// Streams
// ============================================================================

struct RdtReader {
    rx: mpsc::Receiver<Vec<u8>>,
    drained: Arc<Notify>,
    pending: Vec<u8>,
    pos: usize,
}

impl RdtReader {
    async fn read_chunk(&mut self) -> Option<Vec<u8>> {
        if self.pos < self.pending.len() {
            let rest = self.pending.split_off(self.pos);
            self.pending.clear();
            self.pos = 0;
            return Some(rest);
        }
        let chunk = self.rx.recv().await;
        self.drained.notify_one();
        chunk
    }
}

impl AsyncRead for RdtReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.pending.len() {
                let n = (this.pending.len() - this.pos).min(buf.remaining());
                buf.put_slice(&this.pending[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.drained.notify_one();
                    this.pending = chunk;
                    this.pos = 0;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

struct WriterInner {
    key: ConnKey,
    cmd_tx: mpsc::Sender<EndpointCommand>,
}

/// Ends the writable side once the last write handle is gone, so a dropped
/// stream releases its slot on both endpoints.
impl Drop for WriterInner {
    fn drop(&mut self) {
        let cmd = EndpointCommand::End { key: self.key };
        match self.cmd_tx.try_send(cmd) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let cmd_tx = self.cmd_tx.clone();
                    runtime.spawn(async move {
                        let _ = cmd_tx.send(cmd).await;
                    });
                }
            }
        }
    }
}

/// Sending half of an RDT connection. Cheap to clone; the writable side
/// ends when the last clone is dropped.
#[derive(Clone)]
pub struct RdtWriteHalf {
    inner: Arc<WriterInner>,
}

impl RdtWriteHalf {
    /// Resolves once every byte is inside the send window.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(EndpointCommand::Write {
                key: self.inner.key,
                data: data.to_vec(),
                reply,
            })
            .await
            .map_err(|_| anyhow!("RDT endpoint closed"))?;
        rx.await.map_err(|_| anyhow!("RDT connection closed"))?
    }

    /// Finish the writable side. The remote sees end-of-stream after the
    /// last written byte.
    pub async fn end(&self) -> Result<()> {
        self.inner
            .cmd_tx
            .send(EndpointCommand::End { key: self.inner.key })
            .await
            .map_err(|_| anyhow!("RDT endpoint closed"))
    }

    pub async fn destroy(&self) {
        let _ = self
            .inner
            .cmd_tx
            .send(EndpointCommand::Destroy { key: self.inner.key })
            .await;
    }
}

/// Receiving half of an RDT connection.
pub struct RdtReadHalf {
    reader: RdtReader,
}

impl RdtReadHalf {
    /// Next chunk of in-order data, `None` at end of stream.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.reader.read_chunk().await
    }
}

impl AsyncRead for RdtReadHalf {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

/// A duplex byte stream over the RDT.
pub struct RdtStream {
    remote: SocketAddr,
    local: SocketAddr,
    writer: RdtWriteHalf,
    reader: RdtReader,
}

impl std::fmt::Debug for RdtStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdtStream")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("connection", &self.writer.inner.key.1)
            .finish()
    }
}

impl RdtStream {
    pub fn peer_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.writer.write(data).await
    }

    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.reader.read_chunk().await
    }

    pub async fn end(&self) -> Result<()> {
        self.writer.end().await
    }

    pub async fn destroy(&self) {
        self.writer.destroy().await
    }

    pub fn into_split(self) -> (RdtReadHalf, RdtWriteHalf) {
        (RdtReadHalf { reader: self.reader }, self.writer)
    }
}

impl AsyncRead for RdtStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

/// Pump bytes both ways between a TCP socket and an RDT connection until
/// both directions have ended.
pub async fn bridge_tcp(tcp: TcpStream, rdt: RdtStream) -> Result<()> {
    let remote = rdt.peer_addr();
    let (mut tcp_read, mut tcp_write) = tcp.into_split();
    let (mut rdt_read, rdt_write) = rdt.into_split();

    let upstream = async {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = tcp_read.read(&mut buf).await.context("TCP read failed")?;
            if n == 0 {
                break;
            }
            rdt_write.write(&buf[..n]).await?;
        }
        rdt_write.end().await
    };
    let downstream = async {
        tokio::io::copy(&mut rdt_read, &mut tcp_write)
            .await
            .context("RDT to TCP copy failed")?;
        let _ = tcp_write.shutdown().await;
        Ok::<_, anyhow::Error>(())
    };

    let (up, down) = tokio::join!(upstream, downstream);
    if up.is_err() || down.is_err() {
        rdt_write.destroy().await;
    }
    trace!(remote = %remote, "TCP/RDT bridge finished");
    up.and(down)
}
