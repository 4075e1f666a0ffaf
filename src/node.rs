//! # High-Level Node API
//!
//! A [`Node`] binds every networking component of one Polykey node and wires
//! them together:
//!
//! | Component | Role |
//! |-----------|------|
//! | [`PeerServer`] | inbound TCP peer requests, dispatched by message type |
//! | [`HolePunchServer`] | the node's UDP port: outbound RDT, hole punch registrar, inbound tunnels |
//! | [`TurnServer`] | relay sessions this node hosts for others |
//! | [`TurnClient`] | relay and hole punch paths this node asks others for |
//! | [`PeerConnections`] | outbound sessions, racing direct / hole punch / relay |
//! | [`NodeGraph`] | XOR routing table and iterative lookups |
//! | [`MulticastDiscovery`] / [`SocialDiscovery`] | finding peers on the LAN or by social handle |
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind(NodeConfig::from_env(), Keypair::generate()).await?;
//! node.add_peer(PeerInfo::new(friend).with_address("10.0.0.7:1314".parse()?)).await?;
//! node.ping_peer(&friend).await?;
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::crypto::LocalKeyRing;
use crate::discovery::{MulticastDiscovery, SocialDiscovery};
use crate::error::PeerError;
use crate::hole_punch::HolePunchServer;
use crate::identity::{Address, Keypair, NodeId, PublicKey};
use crate::messages::{PeerRequest, PeerResponse};
use crate::node_graph::{NodeGraph, NodeRecord};
use crate::peer_connection::{DirectNatRpc, NetworkOpener, PeerConnections};
use crate::peer_server::{Dispatcher, PeerServer};
use crate::peer_store::{PeerInfo, PeerStore};
use crate::protocols::{GitBackend, KeyRing, SocialProvider, VaultProvider};
use crate::relay::{TurnClient, TurnServer};
use crate::vaults::VaultAccess;

/// Bound on an iterative node lookup.
pub const FIND_NODE_TIMEOUT: Duration = Duration::from_secs(30);

/// Addresses this node hands out after asking a relay for help.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayAddresses {
    /// Client edge of our relay session; peers connect here.
    pub relay_address: Address,
    /// Local TCP port bridged to the relay's hole punch server, when
    /// registration succeeded.
    pub hole_punch_address: Option<Address>,
}

pub struct Node {
    keyring: Arc<dyn KeyRing>,
    config: NodeConfig,
    peer_store: PeerStore,
    peer_server: PeerServer,
    hole_punch: HolePunchServer,
    turn_server: TurnServer,
    turn_client: TurnClient,
    connections: PeerConnections,
    node_graph: NodeGraph,
    multicast: MulticastDiscovery,
    social: tokio::sync::RwLock<SocialDiscovery>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("public_key", &self.keyring.public_key().short())
            .field("peer_server", &self.peer_server.local_addr())
            .field("udp", &self.hole_punch.local_addr())
            .finish()
    }
}

/// Where local components reach a listener bound on `addr`.
fn loopback_for(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
    } else {
        addr
    }
}

impl Node {
    /// Start a node with a local Ed25519 key ring.
    pub async fn bind(config: NodeConfig, keypair: Keypair) -> Result<Self> {
        Self::with_keyring(config, Arc::new(LocalKeyRing::new(keypair))).await
    }

    /// Start a node around an externally managed key ring.
    pub async fn with_keyring(config: NodeConfig, keyring: Arc<dyn KeyRing>) -> Result<Self> {
        if let Some(host) = &config.advertise_host {
            Address::with_host(host, config.peer_bind.port()).context("invalid advertise host")?;
        }
        let peer_store = match &config.peer_store_path {
            Some(path) => PeerStore::load(path).await?,
            None => PeerStore::new(),
        };

        let dispatcher = Arc::new(Dispatcher::new(
            keyring.clone(),
            peer_store.clone(),
            VaultAccess::new(),
        ));
        let peer_server = PeerServer::bind(config.peer_bind, dispatcher.clone())
            .await
            .context("failed to start peer server")?;
        let local_peer_server = loopback_for(peer_server.local_addr());

        let hole_punch = HolePunchServer::bind(config.udp_bind, local_peer_server)
            .await
            .context("failed to start hole punch server")?;

        let turn_server = TurnServer::new(
            config.peer_bind.ip(),
            config.advertise_host.clone(),
            Some(hole_punch.clone()),
            config.max_relay_sessions,
        );
        dispatcher.set_nat_handler(Arc::new(turn_server.clone()));

        let nat_rpc = Arc::new(DirectNatRpc::new(keyring.clone(), peer_store.clone()));
        let turn_client = TurnClient::new(keyring.clone(), nat_rpc, hole_punch.clone(), local_peer_server);
        let connections = PeerConnections::new(
            keyring.clone(),
            peer_store.clone(),
            Arc::new(NetworkOpener::new(Some(turn_client.clone()))),
            config.ping_timeout,
        );

        let public_key = keyring.public_key().clone();
        let peer_address = match &config.advertise_host {
            Some(host) => Address::new(host.clone(), peer_server.local_addr().port()),
            None => Address::from_socket_addr(peer_server.local_addr()),
        };
        let node_graph = NodeGraph::new(
            NodeRecord::new(public_key.clone(), Some(peer_address.clone())),
            Arc::new(connections.clone()),
            config.k,
            config.alpha,
        );
        dispatcher.set_node_graph(node_graph.clone());

        let multicast = MulticastDiscovery::new(config.multicast_config(), peer_store.clone());
        multicast.unlock(keyring.clone());
        multicast.set_local_info(PeerInfo::new(public_key.clone()).with_address(peer_address.clone()));
        if config.stealth {
            multicast.set_stealth(true).await?;
        }
        let social = SocialDiscovery::new(multicast.clone(), peer_store.clone())?;

        let node = Self {
            keyring,
            config,
            peer_store,
            peer_server,
            hole_punch,
            turn_server,
            turn_client,
            connections,
            node_graph,
            multicast,
            social: tokio::sync::RwLock::new(social),
        };

        for peer in node.peer_store.list_peers() {
            if peer.peer_address.is_some() {
                node.node_graph.add_node(NodeRecord::from_peer_info(&peer)).await;
            }
        }

        if node.config.multicast {
            // Another responder may own the discovery port; the node still works without it.
            if let Err(e) = node.multicast.start_listening().await {
                warn!(error = %e, "multicast discovery unavailable");
            }
            node.multicast.start_broadcasting().await?;
        }

        info!(
            peer = %node.public_key().short(),
            peer_server = %node.peer_server.local_addr(),
            udp = %node.hole_punch.local_addr(),
            "node started"
        );
        Ok(node)
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keyring.public_key()
    }

    pub fn node_id(&self) -> NodeId {
        self.public_key().node_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn peer_server_addr(&self) -> SocketAddr {
        self.peer_server.local_addr()
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.hole_punch.local_addr()
    }

    /// The address other peers should dial.
    pub fn peer_address(&self) -> Address {
        self.node_graph
            .self_record()
            .address
            .clone()
            .unwrap_or_else(|| Address::from_socket_addr(self.peer_server_addr()))
    }

    /// This node as a peer record, as announced on the LAN.
    pub fn peer_info(&self) -> PeerInfo {
        let info = PeerInfo::new(self.public_key().clone()).with_address(self.peer_address());
        match self.turn_client.relay_public_key() {
            Some(relay) => info.with_relay(relay),
            None => info,
        }
    }

    pub fn peer_store(&self) -> &PeerStore {
        &self.peer_store
    }

    pub fn node_graph(&self) -> &NodeGraph {
        &self.node_graph
    }

    pub fn multicast(&self) -> &MulticastDiscovery {
        &self.multicast
    }

    pub fn turn_server(&self) -> &TurnServer {
        &self.turn_server
    }

    pub fn vault_access(&self) -> &VaultAccess {
        self.peer_server.dispatcher().vault_access()
    }

    // ========================================================================
    // Peer directory
    // ========================================================================

    pub async fn add_peer(&self, info: PeerInfo) -> Result<()> {
        let record = NodeRecord::from_peer_info(&info);
        self.peer_store.add_peer(info)?;
        if record.address.is_some() {
            self.node_graph.add_node(record).await;
        }
        Ok(())
    }

    /// Replace a known peer's record. Any cached connection is dropped so
    /// the next request uses the new details.
    pub async fn update_peer(&self, info: PeerInfo) -> Result<()> {
        let record = NodeRecord::from_peer_info(&info);
        let key = info.public_key.clone();
        self.peer_store.update_peer(info)?;
        self.connections.disconnect(&key).await;
        if record.address.is_some() {
            self.node_graph.add_node(record).await;
        }
        Ok(())
    }

    pub fn get_peer(&self, public_key: &PublicKey) -> Option<PeerInfo> {
        self.peer_store.get_peer(public_key)
    }

    pub fn list_peers(&self) -> Vec<PeerInfo> {
        self.peer_store.list_peers()
    }

    pub async fn save(&self) -> Result<()> {
        self.peer_store.save().await
    }

    // ========================================================================
    // Peer requests
    // ========================================================================

    /// Liveness check with the configured ping timeout.
    pub async fn ping_peer(&self, peer: &PublicKey) -> Result<()> {
        self.connections.ping_peer(peer, self.config.ping_timeout).await
    }

    pub async fn send_peer_request(&self, peer: &PublicKey, request: PeerRequest) -> Result<PeerResponse> {
        self.connections.send_peer_request(peer, request).await
    }

    pub async fn connected_peers(&self) -> Vec<PublicKey> {
        self.connections.connected_peers().await
    }

    // ========================================================================
    // NAT traversal
    // ========================================================================

    /// Ask `relay` to forward traffic for this node, and register with its
    /// hole punch server so peers can punch through to us. The relay must be
    /// a known peer with an address.
    pub async fn request_relay(&self, relay: &PublicKey) -> Result<RelayAddresses> {
        let relay_info = self.peer_store.get_peer(relay).ok_or(PeerError::PeerNotFound)?;
        if relay_info.peer_address.is_none() {
            return Err(PeerError::NoPeerAddress.into());
        }

        let relay_address = self.turn_client.request_relay_connection(relay).await?;
        let hole_punch_address = match self.turn_client.request_local_hole_punch_address(relay).await {
            Ok(address) => Some(address),
            Err(e) => {
                warn!(relay = %relay.short(), error = %e, "hole punch registration failed, relay only");
                None
            }
        };
        self.multicast.set_local_info(self.peer_info());
        debug!(relay = %relay.short(), client_edge = %relay_address, "relay requested");
        Ok(RelayAddresses {
            relay_address,
            hole_punch_address,
        })
    }

    pub fn relay_public_key(&self) -> Option<PublicKey> {
        self.turn_client.relay_public_key()
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    pub async fn start_listening(&self) -> Result<SocketAddr> {
        self.multicast.start_listening().await
    }

    pub async fn start_broadcasting(&self) -> Result<()> {
        self.multicast.start_broadcasting().await
    }

    pub async fn set_stealth(&self, stealth: bool) -> Result<()> {
        self.multicast.set_stealth(stealth).await
    }

    /// Keys of peers refreshed by multicast beacons.
    pub fn discovered(&self) -> broadcast::Receiver<PublicKey> {
        self.multicast.subscribe()
    }

    /// Wait for a beacon from a known peer. `None` uses the configured
    /// find timeout.
    pub async fn find_public_key(&self, target: &PublicKey, timeout: Option<Duration>) -> Result<bool> {
        let timeout = timeout.unwrap_or(self.config.find_timeout);
        self.multicast.find_public_key(target, timeout).await
    }

    pub async fn add_social_provider(&self, provider: Arc<dyn SocialProvider>) {
        self.social.write().await.add_provider(provider);
    }

    /// Resolve `handle` on `service` and confirm that peer on the LAN.
    pub async fn find_social_user(&self, handle: &str, service: &str, timeout: Option<Duration>) -> Result<PublicKey> {
        let timeout = timeout.unwrap_or(self.config.find_timeout);
        self.social
            .read()
            .await
            .find_social_user(handle, service, timeout)
            .await
    }

    /// Locate `target` through the routing table.
    pub async fn find_node(&self, target: &PublicKey, timeout: Option<Duration>) -> Result<Option<NodeRecord>> {
        self.node_graph
            .iterative_find(target.node_id(), timeout.unwrap_or(FIND_NODE_TIMEOUT))
            .await
    }

    // ========================================================================
    // Vaults
    // ========================================================================

    pub fn set_git_handler(&self, backend: Arc<dyn GitBackend>, vaults: Arc<dyn VaultProvider>) {
        self.peer_server.dispatcher().set_git_handler(backend, vaults);
    }

    pub fn share_vault(&self, vault: &str, peer: &PublicKey) -> bool {
        self.vault_access().share_vault(vault, peer)
    }

    pub fn unshare_vault(&self, vault: &str, peer: &PublicKey) -> bool {
        self.vault_access().unshare_vault(vault, peer)
    }

    pub fn peer_can_access(&self, vault: &str, peer: &PublicKey) -> bool {
        self.vault_access().peer_can_access(vault, peer)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop every component and persist the peer store.
    pub async fn shutdown(&self) -> Result<()> {
        self.multicast.stop_broadcasting();
        self.multicast.stop_listening();
        self.turn_client.terminate().await;
        self.turn_server.quit().await;
        self.node_graph.quit().await;
        self.peer_server.shutdown();
        self.hole_punch.shutdown().await;
        self.peer_store.save().await?;
        info!(peer = %self.public_key().short(), "node stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> NodeConfig {
        NodeConfig {
            peer_bind: "127.0.0.1:0".parse().unwrap(),
            udp_bind: "127.0.0.1:0".parse().unwrap(),
            multicast: false,
            ..NodeConfig::default()
        }
    }

    #[test]
    fn unspecified_binds_are_reached_over_loopback() {
        let any: SocketAddr = "0.0.0.0:1314".parse().unwrap();
        assert_eq!(loopback_for(any), "127.0.0.1:1314".parse::<SocketAddr>().unwrap());
        let fixed: SocketAddr = "10.0.0.2:1314".parse().unwrap();
        assert_eq!(loopback_for(fixed), fixed);
    }

    #[tokio::test]
    async fn node_advertises_its_peer_server() {
        let node = Node::bind(local_config(), Keypair::generate()).await.unwrap();
        let info = node.peer_info();
        assert_eq!(&info.public_key, node.public_key());
        assert_eq!(info.peer_address, Some(Address::new("127.0.0.1", node.peer_server_addr().port())));
        assert!(info.relay_public_key.is_none());
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn advertise_host_replaces_bound_ip() {
        let config = NodeConfig {
            advertise_host: Some("node.example".to_string()),
            ..local_config()
        };
        let node = Node::bind(config, Keypair::generate()).await.unwrap();
        assert_eq!(node.peer_address().host, "node.example");
        node.shutdown().await.unwrap();

        let config = NodeConfig {
            advertise_host: Some("not a host".to_string()),
            ..local_config()
        };
        assert!(Node::bind(config, Keypair::generate()).await.is_err());
    }

    #[tokio::test]
    async fn relay_must_be_known_with_an_address() {
        let node = Node::bind(local_config(), Keypair::generate()).await.unwrap();
        let relay = Keypair::generate().public_key();

        let err = node.request_relay(&relay).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<PeerError>(), Some(PeerError::PeerNotFound)));

        node.add_peer(PeerInfo::new(relay.clone())).await.unwrap();
        let err = node.request_relay(&relay).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<PeerError>(), Some(PeerError::NoPeerAddress)));
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn peers_with_addresses_seed_the_routing_table() {
        let node = Node::bind(local_config(), Keypair::generate()).await.unwrap();
        let reachable = Keypair::generate().public_key();
        let relayed = Keypair::generate().public_key();
        node.add_peer(PeerInfo::new(reachable.clone()).with_address(Address::new("127.0.0.1", 9)))
            .await
            .unwrap();
        node.add_peer(PeerInfo::new(relayed.clone()).with_relay(reachable.clone()))
            .await
            .unwrap();

        assert!(node.node_graph().get_node(&reachable.node_id()).await.is_some());
        assert!(node.node_graph().get_node(&relayed.node_id()).await.is_none());
        assert!(node.add_peer(PeerInfo::new(reachable)).await.is_err());
        node.shutdown().await.unwrap();
    }
}
