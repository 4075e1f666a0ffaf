//! # polykey-net - Peer Connectivity for Polykey Nodes
//!
//! Everything a Polykey node needs to reach other nodes, including ones
//! behind NATs:
//!
//! - **Transport**: a uTP-like reliable datagram transport (RDT) over UDP
//! - **Sessions**: peer connections racing direct, hole punch and relay paths
//! - **Envelopes**: every peer message encrypted for the recipient, then signed
//! - **NAT Traversal**: relay sessions with paired TCP pipes, UDP hole punching
//! - **Discovery**: signed multicast beacons, social handle lookup
//! - **Routing**: Kademlia-style XOR routing with bounded parallel lookups
//!
//! ## Architecture
//!
//! Stateful components follow the actor pattern:
//! - a cheap-to-clone handle sends commands over an mpsc channel
//! - a private actor task owns the state and replies through oneshot channels
//! - dropping the last handle closes the channel and ends the actor
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | [`Node`] facade wiring all components |
//! | `config` | [`NodeConfig`] defaults and `PK_*` environment overrides |
//! | `identity` | addresses, normalized public keys, node ids, keypairs |
//! | `crypto` | domain-separated signatures, sealed boxes, peer envelopes |
//! | `protocols` | collaborator traits (key ring, git backend, NAT handler, ...) |
//! | `messages` | wire types, bounded bincode, length-delimited framing |
//! | `transport` | the RDT and its TCP bridge |
//! | `peer_store` | durable directory of known peers |
//! | `peer_connection` | outbound sessions and envelope RPC |
//! | `peer_server` | inbound dispatcher |
//! | `relay` | Turn server and client |
//! | `hole_punch` | UDP hole punch server and client |
//! | `discovery` | multicast and social discovery |
//! | `node_graph` | XOR routing table and iterative lookup |
//! | `connection_queue` | bounded signal/direct lookup queues |
//! | `vaults` | per-peer vault access control |

pub mod config;
pub mod connection_queue;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod hole_punch;
pub mod identity;
pub mod messages;
pub mod node;
pub mod node_graph;
pub mod peer_connection;
pub mod peer_server;
pub mod peer_store;
pub mod protocols;
pub mod relay;
pub mod transport;
pub mod vaults;

pub use config::NodeConfig;
pub use crypto::LocalKeyRing;
pub use error::PeerError;
pub use identity::{Address, Keypair, NodeId, PublicKey};
pub use messages::{PeerRequest, PeerResponse};
pub use node::{Node, RelayAddresses};
pub use node_graph::NodeRecord;
pub use peer_store::{PeerInfo, PeerStore};
pub use protocols::{GitBackend, KeyRing, SocialProvider, VaultFileSystem, VaultProvider};
pub use transport::{RdtEndpoint, RdtStream};
