//! Capability traits at the seams of the peer layer.
//!
//! Collaborators outside this crate (key management, the git backend, vault
//! storage, identity lookup services) and the transport-facing halves of the
//! peer layer are reached only through these traits.
//!
//! ## Protocol Traits
//!
//! | Seam | Trait | Purpose |
//! |------|-------|---------|
//! | Keys | [`KeyRing`] | sign / verify / encrypt / decrypt |
//! | Git | [`GitBackend`] | answer git-protocol bytes for a vault |
//! | Vaults | [`VaultProvider`] | vault names and file-system handles |
//! | NAT | [`NatHandler`] / [`NatRpc`] | serve / send NAT traversal requests |
//! | Discovery | [`SocialProvider`] | resolve a social handle to a public key |
//! | Routing | [`NodeGraphRpc`] | closest-node queries against remote nodes |
//! | Sessions | [`PeerChannel`] / [`ChannelOpener`] | carry envelopes over one strategy |

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::crypto::SignatureError;
use crate::identity::{NodeId, PublicKey};
use crate::messages::{NatRequest, NatResponse, PeerEnvelope};
use crate::node_graph::NodeRecord;
use crate::peer_connection::Strategy;
use crate::peer_store::PeerInfo;

/// Opaque key capability. The node never touches raw key material
/// except through this.
pub trait KeyRing: Send + Sync + 'static {
    fn public_key(&self) -> &PublicKey;

    fn sign(&self, data: &[u8]) -> Vec<u8>;

    fn verify(
        &self,
        data: &[u8],
        signature: &[u8],
        signer: &PublicKey,
    ) -> std::result::Result<(), SignatureError>;

    fn encrypt(&self, data: &[u8], recipient: &PublicKey) -> Result<Vec<u8>>;

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Handle to one vault's encrypted file system, owned by the vault layer.
pub trait VaultFileSystem: Send + Sync {
    fn vault_name(&self) -> &str;
}

pub trait VaultProvider: Send + Sync + 'static {
    fn vault_names(&self) -> Vec<String>;

    fn file_system(&self, vault_name: &str) -> Result<Arc<dyn VaultFileSystem>>;
}

/// External git pack/unpack implementation.
#[async_trait]
pub trait GitBackend: Send + Sync + 'static {
    async fn handle_request(
        &self,
        file_system: Arc<dyn VaultFileSystem>,
        request: Vec<u8>,
    ) -> Result<Vec<u8>>;
}

/// Serves NAT traversal requests arriving at the peer server.
#[async_trait]
pub trait NatHandler: Send + Sync + 'static {
    async fn handle_nat_request(&self, from: &PublicKey, request: NatRequest) -> Result<NatResponse>;
}

/// Sends NAT traversal requests to a relay peer.
#[async_trait]
pub trait NatRpc: Send + Sync + 'static {
    async fn send_nat_request(&self, relay: &PublicKey, request: NatRequest) -> Result<NatResponse>;
}

#[async_trait]
pub trait SocialProvider: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn find_user(&self, handle: &str, service: &str) -> Result<PublicKey>;
}

#[async_trait]
pub trait NodeGraphRpc: Send + Sync + 'static {
    async fn closest_nodes(&self, to: &NodeRecord, target: NodeId) -> Result<Vec<NodeRecord>>;

    async fn ping(&self, to: &NodeRecord) -> Result<()>;
}

/// One established path to a peer.
#[async_trait]
pub trait PeerChannel: Send + Sync + 'static {
    async fn exchange(&self, envelope: PeerEnvelope) -> Result<PeerEnvelope>;
}

/// Builds a [`PeerChannel`] for one connection strategy.
#[async_trait]
pub trait ChannelOpener: Send + Sync + 'static {
    async fn open(&self, strategy: Strategy, peer: &PeerInfo) -> Result<Arc<dyn PeerChannel>>;
}
