//! # Peer Connections
//!
//! A [`PeerConnection`] produces a working RPC channel to one peer by racing
//! every connection strategy the peer's [`PeerInfo`] allows:
//!
//! | Strategy | Requires | Path |
//! |----------|----------|------|
//! | [`Strategy::Direct`] | `peer_address` | TCP straight to the peer server |
//! | [`Strategy::HolePunch`] | `relay_public_key` | local TCP bridge over an RDT punched to the peer's observed UDP address |
//! | [`Strategy::Relay`] | `relay_public_key` | TCP to the relay's client edge, byte-forwarded to the peer |
//!
//! Each strategy opens a channel and then pings through it; the first
//! strategy whose ping round-trips wins. If none do, the connection is
//! `Failed` for good and a new `PeerConnection` is needed to retry.
//!
//! ## Envelope RPC
//!
//! Every request is sealed for the peer and signed by us
//! ([`seal_envelope`]); the reply must come back signed by the exact key we
//! contacted or it is rejected with [`PeerError::ResponseKeyMismatch`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::crypto::{open_envelope, seal_envelope};
use crate::error::PeerError;
use crate::identity::{NodeId, PublicKey};
use crate::messages::{
    NatRequest, NatResponse, NodeGraphRequest, NodeGraphResponse, PeerEnvelope, PeerRequest,
    PeerResponse, RpcReply, Tagged, deserialize_bounded, read_frame, serialize, write_frame,
};
use crate::node_graph::NodeRecord;
use crate::peer_store::{PeerInfo, PeerStore};
use crate::protocols::{ChannelOpener, KeyRing, NatRpc, NodeGraphRpc, PeerChannel};
use crate::relay::TurnClient;

/// TCP connect bound for a single strategy.
pub const CHANNEL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on one request/response exchange.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const CHALLENGE_BYTES: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Strategy {
    Direct,
    HolePunch,
    Relay,
}

/// Strategies worth trying for `peer`, in preference order.
pub fn plan_strategies(peer: &PeerInfo) -> Vec<Strategy> {
    let mut plan = Vec::with_capacity(3);
    if peer.peer_address.is_some() {
        plan.push(Strategy::Direct);
    }
    if peer.relay_public_key.is_some() {
        plan.push(Strategy::HolePunch);
        plan.push(Strategy::Relay);
    }
    plan
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    Failed,
}

// ============================================================================
// Envelope exchange
// ============================================================================

/// Seal `request` for `peer`, send it, and open the reply.
pub async fn exchange_request(
    channel: &dyn PeerChannel,
    keyring: &dyn KeyRing,
    peer: &PublicKey,
    request: &PeerRequest,
) -> Result<PeerResponse> {
    let envelope = seal_envelope(keyring, peer, request)?;
    let reply = channel.exchange(envelope).await?;
    if &reply.public_key != peer {
        return Err(PeerError::ResponseKeyMismatch.into());
    }
    let response: PeerResponse = open_envelope(keyring, &reply)?;
    if response.kind() != request.kind() {
        return Err(PeerError::KindMismatch {
            expected: request.kind().as_str(),
            found: response.kind().as_str(),
        }
        .into());
    }
    Ok(response)
}

fn random_challenge() -> String {
    let mut bytes = [0u8; CHALLENGE_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

/// Liveness check: the peer must echo a fresh challenge within `timeout`.
pub async fn ping_over(
    channel: &dyn PeerChannel,
    keyring: &dyn KeyRing,
    peer: &PublicKey,
    timeout: Duration,
) -> Result<()> {
    let challenge = random_challenge();
    let request = PeerRequest::PingPeer {
        challenge: challenge.clone(),
    };
    let response = tokio::time::timeout(timeout, exchange_request(channel, keyring, peer, &request))
        .await
        .map_err(|_| PeerError::timeout("ping peer", timeout))??;
    match response {
        PeerResponse::PingPeer { challenge: echoed } if echoed == challenge => Ok(()),
        _ => Err(PeerError::ChallengeMismatch.into()),
    }
}

// ============================================================================
// PeerConnection
// ============================================================================

pub struct PeerConnection {
    peer: PeerInfo,
    keyring: Arc<dyn KeyRing>,
    opener: Arc<dyn ChannelOpener>,
    ping_timeout: Duration,
    state: Mutex<ConnectionState>,
    channel: tokio::sync::RwLock<Option<(Strategy, Arc<dyn PeerChannel>)>>,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.peer.public_key.short())
            .field("state", &self.state())
            .finish()
    }
}

impl PeerConnection {
    pub fn new(
        peer: PeerInfo,
        keyring: Arc<dyn KeyRing>,
        opener: Arc<dyn ChannelOpener>,
        ping_timeout: Duration,
    ) -> Self {
        Self {
            peer,
            keyring,
            opener,
            ping_timeout,
            state: Mutex::new(ConnectionState::Unconnected),
            channel: tokio::sync::RwLock::new(None),
        }
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// Move `Unconnected -> Connecting`; anything else is reported back.
    fn begin_connecting(&self) -> ConnectionState {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let previous = *state;
        if previous == ConnectionState::Unconnected {
            *state = ConnectionState::Connecting;
        }
        previous
    }

    /// Strategy that won the race, once connected.
    pub async fn strategy(&self) -> Option<Strategy> {
        self.channel.read().await.as_ref().map(|(s, _)| *s)
    }

    /// Race every applicable strategy; the first live channel wins.
    pub async fn connect(&self) -> Result<()> {
        match self.begin_connecting() {
            ConnectionState::Unconnected => {}
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Connecting => bail!("connection to peer already in progress"),
            ConnectionState::Failed => return Err(PeerError::CouldNotConnect.into()),
        }

        let peer_key = self.peer.public_key.clone();
        let strategies = plan_strategies(&self.peer);
        debug!(peer = %peer_key.short(), strategies = ?strategies, "connecting to peer");

        let mut attempts = JoinSet::new();
        for strategy in strategies {
            let opener = self.opener.clone();
            let keyring = self.keyring.clone();
            let peer = self.peer.clone();
            let ping_timeout = self.ping_timeout;
            attempts.spawn(async move {
                let outcome = async {
                    let channel = opener.open(strategy, &peer).await?;
                    ping_over(channel.as_ref(), keyring.as_ref(), &peer.public_key, ping_timeout).await?;
                    Ok::<_, anyhow::Error>(channel)
                }
                .await;
                (strategy, outcome)
            });
        }

        let mut key_mismatch = false;
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((strategy, Ok(channel))) => {
                    attempts.abort_all();
                    *self.channel.write().await = Some((strategy, channel));
                    self.set_state(ConnectionState::Connected);
                    debug!(peer = %peer_key.short(), strategy = ?strategy, "peer connected");
                    return Ok(());
                }
                Ok((strategy, Err(e))) => {
                    key_mismatch |= matches!(
                        e.downcast_ref::<PeerError>(),
                        Some(PeerError::ResponseKeyMismatch)
                    );
                    debug!(peer = %peer_key.short(), strategy = ?strategy, error = %e, "strategy failed");
                }
                Err(e) => trace!(error = %e, "strategy task aborted"),
            }
        }

        self.set_state(ConnectionState::Failed);
        if key_mismatch {
            return Err(PeerError::ResponseKeyMismatch.into());
        }
        Err(PeerError::CouldNotConnect.into())
    }

    async fn channel(&self) -> Result<Arc<dyn PeerChannel>> {
        if self.state() == ConnectionState::Unconnected {
            self.connect().await?;
        }
        self.channel
            .read()
            .await
            .as_ref()
            .map(|(_, channel)| channel.clone())
            .ok_or_else(|| PeerError::CouldNotConnect.into())
    }

    pub async fn send_peer_request(&self, request: PeerRequest) -> Result<PeerResponse> {
        let channel = self.channel().await?;
        tokio::time::timeout(
            REQUEST_TIMEOUT,
            exchange_request(channel.as_ref(), self.keyring.as_ref(), &self.peer.public_key, &request),
        )
        .await
        .map_err(|_| PeerError::timeout("peer request", REQUEST_TIMEOUT))?
    }

    pub async fn ping_peer(&self, timeout: Duration) -> Result<()> {
        let channel = self.channel().await?;
        ping_over(channel.as_ref(), self.keyring.as_ref(), &self.peer.public_key, timeout).await
    }
}

// ============================================================================
// Stream channel
// ============================================================================

/// Length-delimited envelope exchange over one TCP stream.
pub struct StreamChannel {
    remote: SocketAddr,
    /// Taken for the duration of an exchange; an exchange that is dropped
    /// half way leaves the channel unusable rather than desynchronized.
    stream: tokio::sync::Mutex<Option<TcpStream>>,
}

impl StreamChannel {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = tokio::time::timeout(CHANNEL_CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::timeout("tcp connect", CHANNEL_CONNECT_TIMEOUT))?
            .with_context(|| format!("failed to connect to {}", addr))?;
        let _ = stream.set_nodelay(true);
        Ok(Self {
            remote: addr,
            stream: tokio::sync::Mutex::new(Some(stream)),
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

#[async_trait]
impl PeerChannel for StreamChannel {
    async fn exchange(&self, envelope: PeerEnvelope) -> Result<PeerEnvelope> {
        let mut slot = self.stream.lock().await;
        let mut stream = slot
            .take()
            .ok_or_else(|| anyhow!("channel to {} is broken", self.remote))?;

        let bytes = serialize(&envelope).context("failed to encode envelope")?;
        write_frame(&mut stream, &bytes).await?;
        let frame = read_frame(&mut stream)
            .await?
            .ok_or_else(|| anyhow!("{} closed the channel", self.remote))?;
        let reply: RpcReply = deserialize_bounded(&frame).context("failed to decode reply")?;

        *slot = Some(stream);
        match reply {
            RpcReply::Ok(envelope) => Ok(envelope),
            RpcReply::Err(message) => Err(anyhow!("peer rejected request: {}", message)),
        }
    }
}

// ============================================================================
// Network opener
// ============================================================================

/// Opens real channels, brokering hole punch and relay paths through the
/// Turn client.
pub struct NetworkOpener {
    turn: Option<TurnClient>,
}

impl NetworkOpener {
    pub fn new(turn: Option<TurnClient>) -> Self {
        Self { turn }
    }

    fn turn(&self) -> Result<&TurnClient> {
        self.turn
            .as_ref()
            .ok_or_else(|| PeerError::HandlerMissing("turn client").into())
    }
}

#[async_trait]
impl ChannelOpener for NetworkOpener {
    async fn open(&self, strategy: Strategy, peer: &PeerInfo) -> Result<Arc<dyn PeerChannel>> {
        let address = match strategy {
            Strategy::Direct => peer.peer_address.clone().ok_or(PeerError::NoPeerAddress)?,
            Strategy::HolePunch => {
                let relay = peer.relay_public_key.as_ref().ok_or(PeerError::NoRelayKey)?;
                self.turn()?
                    .request_hole_punch_connection(relay, &peer.public_key)
                    .await?
            }
            Strategy::Relay => {
                let relay = peer.relay_public_key.as_ref().ok_or(PeerError::NoRelayKey)?;
                self.turn()?
                    .request_peer_connection(&peer.public_key, relay)
                    .await?
            }
        };
        trace!(peer = %peer.public_key.short(), strategy = ?strategy, addr = %address, "opening channel");
        let addr = address.resolve().await?;
        Ok(Arc::new(StreamChannel::connect(addr).await?))
    }
}

// ============================================================================
// Connection manager
// ============================================================================

/// Cache of live peer connections, keyed by public key. Cheap to clone.
#[derive(Clone)]
pub struct PeerConnections {
    keyring: Arc<dyn KeyRing>,
    peer_store: PeerStore,
    opener: Arc<dyn ChannelOpener>,
    ping_timeout: Duration,
    connections: Arc<tokio::sync::Mutex<HashMap<PublicKey, Arc<PeerConnection>>>>,
}

impl PeerConnections {
    pub fn new(
        keyring: Arc<dyn KeyRing>,
        peer_store: PeerStore,
        opener: Arc<dyn ChannelOpener>,
        ping_timeout: Duration,
    ) -> Self {
        Self {
            keyring,
            peer_store,
            opener,
            ping_timeout,
            connections: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// A connected session to `peer`, reusing a cached one when possible.
    pub async fn connection_to(&self, peer: &PublicKey) -> Result<Arc<PeerConnection>> {
        if let Some(existing) = self.connections.lock().await.get(peer).cloned()
            && existing.state() == ConnectionState::Connected
        {
            return Ok(existing);
        }

        let info = self.peer_store.get_peer(peer).ok_or(PeerError::PeerNotFound)?;
        let connection = Arc::new(PeerConnection::new(
            info,
            self.keyring.clone(),
            self.opener.clone(),
            self.ping_timeout,
        ));
        connection.connect().await?;
        self.connections
            .lock()
            .await
            .insert(peer.clone(), connection.clone());
        Ok(connection)
    }

    pub async fn send_peer_request(&self, peer: &PublicKey, request: PeerRequest) -> Result<PeerResponse> {
        let connection = self.connection_to(peer).await?;
        let result = connection.send_peer_request(request).await;
        if result.is_err() {
            self.disconnect(peer).await;
        }
        result
    }

    pub async fn ping_peer(&self, peer: &PublicKey, timeout: Duration) -> Result<()> {
        let connection = self.connection_to(peer).await?;
        let result = connection.ping_peer(timeout).await;
        if result.is_err() {
            self.disconnect(peer).await;
        }
        result
    }

    pub async fn disconnect(&self, peer: &PublicKey) {
        self.connections.lock().await.remove(peer);
    }

    pub async fn connected_peers(&self) -> Vec<PublicKey> {
        self.connections
            .lock()
            .await
            .iter()
            .filter(|(_, c)| c.state() == ConnectionState::Connected)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Routing contacts may be strangers; remember the ones that carry an
    /// address so a connection can be attempted.
    fn ensure_known(&self, record: &NodeRecord) -> Result<()> {
        if self.peer_store.has_peer(&record.public_key) {
            return Ok(());
        }
        let address = record.address.clone().ok_or(PeerError::NoPeerAddress)?;
        let info = PeerInfo::new(record.public_key.clone()).with_address(address);
        match self.peer_store.add_peer(info) {
            Ok(()) | Err(PeerError::PeerExists) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl NodeGraphRpc for PeerConnections {
    async fn closest_nodes(&self, to: &NodeRecord, target: NodeId) -> Result<Vec<NodeRecord>> {
        self.ensure_known(to)?;
        let request = PeerRequest::NodeGraph(NodeGraphRequest::ClosestNodes { target });
        match self.send_peer_request(&to.public_key, request).await? {
            PeerResponse::NodeGraph(NodeGraphResponse::ClosestNodes(records)) => Ok(records),
            other => bail!("unexpected closest nodes response: {:?}", other.kind()),
        }
    }

    async fn ping(&self, to: &NodeRecord) -> Result<()> {
        self.ensure_known(to)?;
        self.ping_peer(&to.public_key, self.ping_timeout).await
    }
}

// ============================================================================
// NAT requests to relays
// ============================================================================

/// Sends NAT traversal requests straight to a relay's advertised address.
/// Relays are reachable by definition, so no strategy race is needed.
pub struct DirectNatRpc {
    keyring: Arc<dyn KeyRing>,
    peer_store: PeerStore,
    channels: tokio::sync::Mutex<HashMap<PublicKey, Arc<StreamChannel>>>,
}

impl DirectNatRpc {
    pub fn new(keyring: Arc<dyn KeyRing>, peer_store: PeerStore) -> Self {
        Self {
            keyring,
            peer_store,
            channels: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn channel(&self, relay: &PublicKey) -> Result<Arc<StreamChannel>> {
        if let Some(channel) = self.channels.lock().await.get(relay).cloned() {
            return Ok(channel);
        }
        let info = self.peer_store.get_peer(relay).ok_or(PeerError::PeerNotFound)?;
        let address = info.peer_address.ok_or(PeerError::NoPeerAddress)?;
        let channel = Arc::new(StreamChannel::connect(address.resolve().await?).await?);
        self.channels
            .lock()
            .await
            .insert(relay.clone(), channel.clone());
        Ok(channel)
    }
}

#[async_trait]
impl NatRpc for DirectNatRpc {
    async fn send_nat_request(&self, relay: &PublicKey, request: NatRequest) -> Result<NatResponse> {
        let channel = self.channel(relay).await?;
        let request = PeerRequest::NatTraversal(request);
        let result = tokio::time::timeout(
            REQUEST_TIMEOUT,
            exchange_request(channel.as_ref(), self.keyring.as_ref(), relay, &request),
        )
        .await
        .map_err(|_| anyhow::Error::from(PeerError::timeout("nat request", REQUEST_TIMEOUT)))
        .and_then(|r| r);

        match result {
            Ok(PeerResponse::NatTraversal(response)) => Ok(response),
            Ok(other) => bail!("unexpected NAT response: {:?}", other.kind()),
            Err(e) => {
                self.channels.lock().await.remove(relay);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKeyRing;
    use crate::identity::{Address, Keypair};

    fn keyring() -> Arc<LocalKeyRing> {
        Arc::new(LocalKeyRing::new(Keypair::generate()))
    }

    /// Answers pings as `responder`; `echo` decides what comes back.
    struct EchoChannel {
        responder: Arc<LocalKeyRing>,
        echo: fn(String) -> String,
    }

    #[async_trait]
    impl PeerChannel for EchoChannel {
        async fn exchange(&self, envelope: PeerEnvelope) -> Result<PeerEnvelope> {
            let request: PeerRequest = open_envelope(self.responder.as_ref(), &envelope)?;
            let PeerRequest::PingPeer { challenge } = request else {
                bail!("only pings supported");
            };
            let response = PeerResponse::PingPeer {
                challenge: (self.echo)(challenge),
            };
            seal_envelope(self.responder.as_ref(), &envelope.public_key, &response)
        }
    }

    /// Signs replies with a key other than the one contacted.
    struct ImposterChannel {
        imposter: Arc<LocalKeyRing>,
    }

    #[async_trait]
    impl PeerChannel for ImposterChannel {
        async fn exchange(&self, envelope: PeerEnvelope) -> Result<PeerEnvelope> {
            let response = PeerResponse::PingPeer {
                challenge: "forged".into(),
            };
            seal_envelope(self.imposter.as_ref(), &envelope.public_key, &response)
        }
    }

    #[derive(Default)]
    struct MockOpener {
        remote: Option<Arc<LocalKeyRing>>,
        imposter: Option<Arc<LocalKeyRing>>,
        working: Vec<Strategy>,
        attempted: Mutex<Vec<Strategy>>,
    }

    #[async_trait]
    impl ChannelOpener for MockOpener {
        async fn open(&self, strategy: Strategy, _peer: &PeerInfo) -> Result<Arc<dyn PeerChannel>> {
            self.attempted.lock().unwrap().push(strategy);
            if !self.working.contains(&strategy) {
                bail!("{:?} unavailable", strategy);
            }
            if let Some(imposter) = &self.imposter {
                return Ok(Arc::new(ImposterChannel {
                    imposter: imposter.clone(),
                }));
            }
            let responder = self.remote.clone().ok_or_else(|| anyhow!("no remote"))?;
            Ok(Arc::new(EchoChannel {
                responder,
                echo: |c| c,
            }))
        }
    }

    fn relay_only_peer(remote: &LocalKeyRing) -> PeerInfo {
        PeerInfo::new(remote.public_key().clone()).with_relay(Keypair::generate().public_key())
    }

    #[test]
    fn plans_follow_peer_info() {
        let key = Keypair::generate().public_key();
        let relay = Keypair::generate().public_key();
        let addr = Address::new("127.0.0.1", 1);

        assert!(plan_strategies(&PeerInfo::new(key.clone())).is_empty());
        assert_eq!(
            plan_strategies(&PeerInfo::new(key.clone()).with_address(addr.clone())),
            vec![Strategy::Direct]
        );
        assert_eq!(
            plan_strategies(&PeerInfo::new(key.clone()).with_relay(relay.clone())),
            vec![Strategy::HolePunch, Strategy::Relay]
        );
        assert_eq!(
            plan_strategies(&PeerInfo::new(key).with_address(addr).with_relay(relay)),
            vec![Strategy::Direct, Strategy::HolePunch, Strategy::Relay]
        );
    }

    #[tokio::test]
    async fn relay_only_peer_never_tries_direct() {
        let local = keyring();
        let remote = keyring();
        let opener = Arc::new(MockOpener {
            remote: Some(remote.clone()),
            working: vec![Strategy::Relay],
            ..Default::default()
        });
        let conn = PeerConnection::new(
            relay_only_peer(&remote),
            local,
            opener.clone(),
            Duration::from_secs(2),
        );

        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.strategy().await, Some(Strategy::Relay));
        let attempted = opener.attempted.lock().unwrap().clone();
        assert!(!attempted.contains(&Strategy::Direct));
        assert!(attempted.contains(&Strategy::HolePunch));
    }

    #[tokio::test]
    async fn exhausted_strategies_fail_for_good() {
        let remote = keyring();
        let opener = Arc::new(MockOpener {
            remote: Some(remote.clone()),
            ..Default::default()
        });
        let conn = PeerConnection::new(relay_only_peer(&remote), keyring(), opener.clone(), Duration::from_secs(2));

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<PeerError>(), Some(PeerError::CouldNotConnect)));
        assert_eq!(conn.state(), ConnectionState::Failed);

        let attempts_before = opener.attempted.lock().unwrap().len();
        assert!(conn.connect().await.is_err());
        assert_eq!(opener.attempted.lock().unwrap().len(), attempts_before);
    }

    #[tokio::test]
    async fn reply_from_other_key_is_rejected() {
        let remote = keyring();
        let opener = Arc::new(MockOpener {
            imposter: Some(keyring()),
            working: vec![Strategy::HolePunch, Strategy::Relay],
            ..Default::default()
        });
        let conn = PeerConnection::new(relay_only_peer(&remote), keyring(), opener, Duration::from_secs(2));
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PeerError>(),
            Some(PeerError::ResponseKeyMismatch)
        ));

        let local = keyring();
        let imposter = ImposterChannel { imposter: keyring() };
        let err = exchange_request(
            &imposter,
            local.as_ref(),
            remote.public_key(),
            &PeerRequest::PingPeer { challenge: "c".into() },
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PeerError>(),
            Some(PeerError::ResponseKeyMismatch)
        ));
    }

    #[tokio::test]
    async fn altered_challenge_fails_ping() {
        let local = keyring();
        let remote = keyring();
        let channel = EchoChannel {
            responder: remote.clone(),
            echo: |c| format!("{}x", c),
        };
        let err = ping_over(&channel, local.as_ref(), remote.public_key(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<PeerError>(), Some(PeerError::ChallengeMismatch)));

        let honest = EchoChannel {
            responder: remote.clone(),
            echo: |c| c,
        };
        ping_over(&honest, local.as_ref(), remote.public_key(), Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn manager_requires_known_peer() {
        let store = PeerStore::new();
        let manager = PeerConnections::new(
            keyring(),
            store,
            Arc::new(MockOpener::default()),
            Duration::from_secs(1),
        );
        let err = manager
            .connection_to(&Keypair::generate().public_key())
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<PeerError>(), Some(PeerError::PeerNotFound)));
    }

    #[tokio::test]
    async fn manager_caches_connected_sessions() {
        let remote = keyring();
        let store = PeerStore::new();
        store.add_peer(relay_only_peer(&remote)).unwrap();
        let opener = Arc::new(MockOpener {
            remote: Some(remote.clone()),
            working: vec![Strategy::HolePunch],
            ..Default::default()
        });
        let manager = PeerConnections::new(keyring(), store, opener.clone(), Duration::from_secs(2));

        manager
            .ping_peer(remote.public_key(), Duration::from_secs(2))
            .await
            .unwrap();
        let opened = opener.attempted.lock().unwrap().len();
        manager
            .ping_peer(remote.public_key(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(opener.attempted.lock().unwrap().len(), opened);
        assert_eq!(manager.connected_peers().await, vec![remote.public_key().clone()]);
    }
}
