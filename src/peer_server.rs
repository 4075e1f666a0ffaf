//! # Peer Server
//!
//! Inbound side of the envelope RPC. One TCP listener accepts peer
//! channels; every frame on a channel is a [`PeerEnvelope`] answered by one
//! [`RpcReply`].
//!
//! ## Dispatch
//!
//! | Request | Served by |
//! |---------|-----------|
//! | `PingPeer` | echoed back unchanged |
//! | `Git` | [`GitBackend`] + [`VaultProvider`], gated by [`VaultAccess`] |
//! | `NatTraversal` | the installed [`NatHandler`] |
//! | `NodeGraph` | the installed [`NodeGraph`] |
//!
//! The sender must be a known peer and must have signed the envelope.
//! Failures go back to the caller as `RpcReply::Err` with the error text;
//! nothing is dropped silently.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::crypto::{open_envelope, seal_envelope};
use crate::error::PeerError;
use crate::identity::PublicKey;
use crate::messages::{
    GitRequest, GitResponse, NodeGraphRequest, NodeGraphResponse, PeerEnvelope, PeerRequest,
    PeerResponse, RpcReply, deserialize_bounded, read_frame, serialize, write_frame,
};
use crate::node_graph::NodeGraph;
use crate::peer_store::PeerStore;
use crate::protocols::{GitBackend, KeyRing, NatHandler, VaultProvider};
use crate::vaults::VaultAccess;

/// Upper bound on handling one request, including handler time.
pub const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Default)]
struct Handlers {
    git: Option<(Arc<dyn GitBackend>, Arc<dyn VaultProvider>)>,
    nat: Option<Arc<dyn NatHandler>>,
    node_graph: Option<NodeGraph>,
}

/// Authenticates inbound envelopes and routes them by message type.
pub struct Dispatcher {
    keyring: Arc<dyn KeyRing>,
    peer_store: PeerStore,
    vault_access: VaultAccess,
    handlers: RwLock<Handlers>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers();
        f.debug_struct("Dispatcher")
            .field("public_key", &self.keyring.public_key().short())
            .field("git", &handlers.git.is_some())
            .field("nat", &handlers.nat.is_some())
            .field("node_graph", &handlers.node_graph.is_some())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(keyring: Arc<dyn KeyRing>, peer_store: PeerStore, vault_access: VaultAccess) -> Self {
        Self {
            keyring,
            peer_store,
            vault_access,
            handlers: RwLock::new(Handlers::default()),
        }
    }

    fn handlers(&self) -> Handlers {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn update_handlers(&self, update: impl FnOnce(&mut Handlers)) {
        update(
            &mut self
                .handlers
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
    }

    pub fn set_git_handler(&self, backend: Arc<dyn GitBackend>, vaults: Arc<dyn VaultProvider>) {
        self.update_handlers(|h| h.git = Some((backend, vaults)));
    }

    pub fn set_nat_handler(&self, handler: Arc<dyn NatHandler>) {
        self.update_handlers(|h| h.nat = Some(handler));
    }

    pub fn set_node_graph(&self, graph: NodeGraph) {
        self.update_handlers(|h| h.node_graph = Some(graph));
    }

    pub fn vault_access(&self) -> &VaultAccess {
        &self.vault_access
    }

    /// Authenticate `envelope`, serve it, and seal the response for its sender.
    pub async fn dispatch(&self, envelope: PeerEnvelope) -> Result<PeerEnvelope> {
        let request: PeerRequest = open_envelope(self.keyring.as_ref(), &envelope)?;
        let from = envelope.public_key;
        if !self.peer_store.has_peer(&from) {
            return Err(PeerError::UnknownPublicKey.into());
        }
        trace!(peer = %from.short(), kind = %envelope.kind, "dispatching peer message");
        let response = self.handle(&from, request).await?;
        seal_envelope(self.keyring.as_ref(), &from, &response)
    }

    async fn handle(&self, from: &PublicKey, request: PeerRequest) -> Result<PeerResponse> {
        let handlers = self.handlers();
        match request {
            PeerRequest::PingPeer { challenge } => Ok(PeerResponse::PingPeer { challenge }),
            PeerRequest::Git(request) => {
                let (backend, vaults) = handlers.git.ok_or(PeerError::HandlerMissing("git"))?;
                self.handle_git(from, request, backend.as_ref(), vaults.as_ref())
                    .await
                    .map(PeerResponse::Git)
            }
            PeerRequest::NatTraversal(request) => {
                let nat = handlers.nat.ok_or(PeerError::HandlerMissing("NAT"))?;
                Ok(PeerResponse::NatTraversal(
                    nat.handle_nat_request(from, request).await?,
                ))
            }
            PeerRequest::NodeGraph(NodeGraphRequest::ClosestNodes { target }) => {
                let graph = handlers
                    .node_graph
                    .ok_or(PeerError::HandlerMissing("node graph"))?;
                let closest = graph.handle_closest_nodes_request(from, target).await;
                Ok(PeerResponse::NodeGraph(NodeGraphResponse::ClosestNodes(closest)))
            }
        }
    }

    async fn handle_git(
        &self,
        from: &PublicKey,
        request: GitRequest,
        backend: &dyn GitBackend,
        vaults: &dyn VaultProvider,
    ) -> Result<GitResponse> {
        match request {
            GitRequest::VaultNames => Ok(GitResponse::VaultNames(
                self.vault_access.vault_names_for(vaults, from),
            )),
            GitRequest::Pack {
                vault_name,
                payload,
            } => {
                if !self.vault_access.peer_can_access(&vault_name, from) {
                    warn!(peer = %from.short(), vault = %vault_name, "vault access denied");
                    return Err(PeerError::VaultAccessDenied(vault_name).into());
                }
                let file_system = vaults.file_system(&vault_name)?;
                let _guard = self.vault_access.lock_vault(&vault_name).await;
                let bytes = backend.handle_request(file_system, payload).await?;
                Ok(GitResponse::Pack(bytes))
            }
        }
    }
}

// ============================================================================
// TCP server
// ============================================================================

/// Listening peer server. Dropping it does not stop the accept loop; call
/// [`shutdown`](Self::shutdown).
pub struct PeerServer {
    local_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for PeerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerServer")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl PeerServer {
    pub async fn bind(addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind peer server on {}", addr))?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "peer server listening");
        let task = tokio::spawn(accept_loop(listener, dispatcher.clone()));
        Ok(Self {
            local_addr,
            dispatcher,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, dispatcher: Arc<Dispatcher>) {
    let mut connections = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let dispatcher = dispatcher.clone();
                    connections.spawn(async move {
                        if let Err(e) = serve_connection(stream, remote, dispatcher).await {
                            debug!(remote = %remote, error = ?e, "peer channel error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "peer server accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    dispatcher: Arc<Dispatcher>,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    trace!(remote = %remote, "peer channel opened");
    while let Some(frame) = read_frame(&mut stream).await? {
        let reply = match deserialize_bounded::<PeerEnvelope>(&frame) {
            Ok(envelope) => {
                match tokio::time::timeout(REQUEST_PROCESS_TIMEOUT, dispatcher.dispatch(envelope)).await {
                    Ok(Ok(envelope)) => RpcReply::Ok(envelope),
                    Ok(Err(e)) => {
                        debug!(remote = %remote, error = %e, "peer request failed");
                        RpcReply::Err(e.to_string())
                    }
                    Err(_) => {
                        warn!(remote = %remote, "peer request processing timed out");
                        RpcReply::Err(
                            PeerError::timeout("request processing", REQUEST_PROCESS_TIMEOUT).to_string(),
                        )
                    }
                }
            }
            Err(e) => {
                warn!(remote = %remote, error = %e, "malformed peer envelope");
                RpcReply::Err(format!("malformed envelope: {}", e))
            }
        };
        let bytes = serialize(&reply).context("failed to encode reply")?;
        write_frame(&mut stream, &bytes).await?;
    }
    trace!(remote = %remote, "peer channel closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKeyRing;
    use crate::identity::Keypair;
    use crate::messages::NatRequest;
    use crate::node_graph::NodeRecord;
    use crate::peer_connection::{StreamChannel, exchange_request, ping_over};
    use crate::peer_store::PeerInfo;
    use crate::protocols::{NodeGraphRpc, VaultFileSystem};
    use async_trait::async_trait;

    struct Fixture {
        server: PeerServer,
        server_key: PublicKey,
        client: Arc<LocalKeyRing>,
        channel: StreamChannel,
    }

    async fn fixture(client_known: bool) -> Fixture {
        let server_ring = Arc::new(LocalKeyRing::new(Keypair::generate()));
        let client = Arc::new(LocalKeyRing::new(Keypair::generate()));
        let store = PeerStore::new();
        if client_known {
            store.add_peer(PeerInfo::new(client.public_key().clone())).unwrap();
        }
        let server_key = server_ring.public_key().clone();
        let dispatcher = Arc::new(Dispatcher::new(server_ring, store, VaultAccess::new()));
        let server = PeerServer::bind(SocketAddr::from(([127, 0, 0, 1], 0)), dispatcher)
            .await
            .unwrap();
        let channel = StreamChannel::connect(server.local_addr()).await.unwrap();
        Fixture {
            server,
            server_key,
            client,
            channel,
        }
    }

    impl Fixture {
        async fn request(&self, request: PeerRequest) -> Result<PeerResponse> {
            exchange_request(&self.channel, self.client.as_ref(), &self.server_key, &request).await
        }
    }

    struct Fs(String);

    impl VaultFileSystem for Fs {
        fn vault_name(&self) -> &str {
            &self.0
        }
    }

    struct Vaults;

    impl VaultProvider for Vaults {
        fn vault_names(&self) -> Vec<String> {
            vec!["notes".into(), "photos".into()]
        }

        fn file_system(&self, vault_name: &str) -> Result<Arc<dyn VaultFileSystem>> {
            Ok(Arc::new(Fs(vault_name.to_string())))
        }
    }

    /// Answers with `<vault>:` followed by the request bytes.
    struct TaggingGit;

    #[async_trait]
    impl GitBackend for TaggingGit {
        async fn handle_request(&self, fs: Arc<dyn VaultFileSystem>, request: Vec<u8>) -> Result<Vec<u8>> {
            let mut out = format!("{}:", fs.vault_name()).into_bytes();
            out.extend(request);
            Ok(out)
        }
    }

    struct NoRemotes;

    #[async_trait]
    impl NodeGraphRpc for NoRemotes {
        async fn closest_nodes(&self, _to: &NodeRecord, _target: crate::identity::NodeId) -> Result<Vec<NodeRecord>> {
            Ok(Vec::new())
        }

        async fn ping(&self, _to: &NodeRecord) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn ping_is_echoed_to_known_peers() {
        let f = fixture(true).await;
        ping_over(&f.channel, f.client.as_ref(), &f.server_key, Duration::from_secs(5))
            .await
            .unwrap();
        // The channel stays usable for further requests.
        ping_over(&f.channel, f.client.as_ref(), &f.server_key, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_senders_are_rejected() {
        let f = fixture(false).await;
        let err = f
            .request(PeerRequest::PingPeer {
                challenge: "x".into(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown public key"), "{err}");
    }

    #[tokio::test]
    async fn missing_handlers_are_reported() {
        let f = fixture(true).await;
        let err = f
            .request(PeerRequest::NatTraversal(NatRequest::UdpAddress))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no NAT handler installed"), "{err}");
    }

    #[tokio::test]
    async fn git_requests_respect_vault_access() {
        let f = fixture(true).await;
        let dispatcher = f.server.dispatcher();
        dispatcher.set_git_handler(Arc::new(TaggingGit), Arc::new(Vaults));
        dispatcher
            .vault_access()
            .share_vault("notes", f.client.public_key());

        let names = f.request(PeerRequest::Git(GitRequest::VaultNames)).await.unwrap();
        assert_eq!(names, PeerResponse::Git(GitResponse::VaultNames(vec!["notes".into()])));

        let pack = f
            .request(PeerRequest::Git(GitRequest::Pack {
                vault_name: "notes".into(),
                payload: b"want".to_vec(),
            }))
            .await
            .unwrap();
        assert_eq!(pack, PeerResponse::Git(GitResponse::Pack(b"notes:want".to_vec())));

        let err = f
            .request(PeerRequest::Git(GitRequest::Pack {
                vault_name: "photos".into(),
                payload: Vec::new(),
            }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not allowed to access vault 'photos'"), "{err}");
    }

    #[tokio::test]
    async fn closest_nodes_come_from_the_node_graph() {
        let f = fixture(true).await;
        let own = NodeRecord::new(f.server_key.clone(), None);
        let graph = NodeGraph::new(own, Arc::new(NoRemotes), 20, 3);
        let known = NodeRecord::new(Keypair::generate().public_key(), None);
        graph.add_node(known.clone()).await;
        graph
            .add_node(NodeRecord::new(f.client.public_key().clone(), None))
            .await;
        f.server.dispatcher().set_node_graph(graph);

        let response = f
            .request(PeerRequest::NodeGraph(NodeGraphRequest::ClosestNodes {
                target: known.node_id,
            }))
            .await
            .unwrap();
        assert_eq!(
            response,
            PeerResponse::NodeGraph(NodeGraphResponse::ClosestNodes(vec![known]))
        );
    }
}
