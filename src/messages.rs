//! # Wire Protocol Messages
//!
//! Every type that crosses a socket lives here. Messages are serialized with
//! bincode and deserialized under a size limit.
//!
//! ## Protocol Types
//!
//! | Channel | Outer frame | Body |
//! |---------|-------------|------|
//! | Peer RPC (TCP / RDT / relay tunnel) | [`PeerEnvelope`] → [`RpcReply`] | [`PeerRequest`] / [`PeerResponse`] |
//! | UDP hole punch registration (RDT) | [`HolePunchMessage`] | - |
//! | Multicast discovery (UDP) | [`MulticastBeacon`] | [`PeerInfo`] |
//!
//! ## Framing
//!
//! Stream transports carry one message per frame: a `u32` big-endian length
//! followed by that many bytes. Frames above [`MAX_MESSAGE_SIZE`] are refused
//! before any allocation.
//!
//! ## Tagged bodies
//!
//! The envelope carries a cleartext [`MessageKind`] so the server can route
//! without decrypting first. After decryption the body variant must agree
//! with that tag, otherwise the message is rejected.

use anyhow::{Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::identity::{Address, NodeId, PublicKey};
use crate::node_graph::NodeRecord;
use crate::peer_store::PeerInfo;

/// Largest single frame. Git pack payloads are the big ones.
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Maximum buffer size for deserialization, with headroom for envelope fields.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_MESSAGE_SIZE as u64) + 4096;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

// ============================================================================
// Framing
// ============================================================================

pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_MESSAGE_SIZE {
        anyhow::bail!("frame of {} bytes exceeds limit", payload.len());
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await.context("failed to write frame")?;
    writer.flush().await.context("failed to flush frame")?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("failed to read frame length"),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        anyhow::bail!("frame of {} bytes exceeds limit", len);
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .context("failed to read frame body")?;
    Ok(Some(payload))
}

// ============================================================================
// Peer RPC
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    PingPeer,
    Git,
    NatTraversal,
    NodeGraph,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::PingPeer => "PING_PEER",
            MessageKind::Git => "GIT",
            MessageKind::NatTraversal => "NAT_TRAVERSAL",
            MessageKind::NodeGraph => "NODE_GRAPH",
        }
    }

    pub(crate) fn tag_byte(&self) -> u8 {
        match self {
            MessageKind::PingPeer => 0,
            MessageKind::Git => 1,
            MessageKind::NatTraversal => 2,
            MessageKind::NodeGraph => 3,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bodies that carry their own [`MessageKind`].
pub trait Tagged {
    fn kind(&self) -> MessageKind;
}

/// Encrypted-for-recipient, signed-by-sender message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerEnvelope {
    /// Claimed sender; the signature is checked against this key.
    pub public_key: PublicKey,
    pub kind: MessageKind,
    pub sealed: Vec<u8>,
    pub signature: Vec<u8>,
}

/// What the peer server writes back for every envelope it reads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcReply {
    Ok(PeerEnvelope),
    Err(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRequest {
    PingPeer { challenge: String },
    Git(GitRequest),
    NatTraversal(NatRequest),
    NodeGraph(NodeGraphRequest),
}

impl Tagged for PeerRequest {
    fn kind(&self) -> MessageKind {
        match self {
            PeerRequest::PingPeer { .. } => MessageKind::PingPeer,
            PeerRequest::Git(_) => MessageKind::Git,
            PeerRequest::NatTraversal(_) => MessageKind::NatTraversal,
            PeerRequest::NodeGraph(_) => MessageKind::NodeGraph,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerResponse {
    PingPeer { challenge: String },
    Git(GitResponse),
    NatTraversal(NatResponse),
    NodeGraph(NodeGraphResponse),
}

impl Tagged for PeerResponse {
    fn kind(&self) -> MessageKind {
        match self {
            PeerResponse::PingPeer { .. } => MessageKind::PingPeer,
            PeerResponse::Git(_) => MessageKind::Git,
            PeerResponse::NatTraversal(_) => MessageKind::NatTraversal,
            PeerResponse::NodeGraph(_) => MessageKind::NodeGraph,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GitRequest {
    /// Names of the vaults the requesting peer may pull.
    VaultNames,
    /// Opaque git-protocol bytes for one vault.
    Pack { vault_name: String, payload: Vec<u8> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GitResponse {
    VaultNames(Vec<String>),
    Pack(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatRequest {
    /// Allocate a server/client edge pair on the relay for the sender.
    RelayConnection,
    /// Client-edge address of the target's relay session, if it has one.
    PeerConnection { target: PublicKey },
    /// The relay's own externally visible UDP address.
    UdpAddress,
    /// The address the relay observed when `target` registered over UDP.
    PeerUdpAddress { target: PublicKey },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatResponse {
    RelayConnection {
        server_address: Address,
        client_address: Address,
    },
    PeerConnection { address: Option<Address> },
    UdpAddress { address: Option<Address> },
    PeerUdpAddress { address: Option<Address> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeGraphRequest {
    ClosestNodes { target: NodeId },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeGraphResponse {
    ClosestNodes(Vec<NodeRecord>),
}

// ============================================================================
// Hole punch registration
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HolePunchMessage {
    Register {
        public_key: PublicKey,
        timestamp_ms: u64,
        signature: Vec<u8>,
    },
    RegisterResponse {
        /// Address the server saw the registration arrive from.
        observed: Address,
    },
    /// Everything after this frame is peer traffic for the receiver's peer server.
    Tunnel,
}

impl HolePunchMessage {
    /// Bytes covered by the registration signature.
    pub fn register_payload(public_key: &PublicKey, timestamp_ms: u64) -> Vec<u8> {
        let mut payload = Vec::with_capacity(public_key.as_str().len() + 8);
        payload.extend_from_slice(public_key.as_str().as_bytes());
        payload.extend_from_slice(&timestamp_ms.to_be_bytes());
        payload
    }
}

// ============================================================================
// Multicast discovery
// ============================================================================

/// Signed announcement of a node's current [`PeerInfo`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MulticastBeacon {
    pub kind: MessageKind,
    pub public_key: PublicKey,
    /// Serialized [`PeerInfo`].
    pub sub_message: Vec<u8>,
    pub signature: Vec<u8>,
}

impl MulticastBeacon {
    pub fn peer_info(&self) -> Result<PeerInfo, bincode::Error> {
        deserialize_bounded(&self.sub_message)
    }
}
