//! # UDP Hole Punching
//!
//! Reflexive address discovery and TCP tunnelling over the RDT.
//!
//! Every node runs one [`HolePunchServer`] on its UDP port. The same
//! endpoint is used in both directions:
//!
//! | Role | What happens on the endpoint |
//! |------|------------------------------|
//! | Relay | peers [`register`] and are told the address their datagrams came from |
//! | Registered peer | the NAT mapping opened by registering lets other peers reach it |
//! | Connecting peer | [`bridge_listener`] exposes a local TCP port that tunnels to a remote endpoint |
//!
//! Every RDT stream opens with one framed [`HolePunchMessage`]:
//! `Register` expects a `RegisterResponse`, `Tunnel` turns the rest of the
//! stream into a raw byte pipe to the receiver's peer server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::crypto::{HOLE_PUNCH_SIGNATURE_DOMAIN, sign_with_domain, verify_with_domain};
use crate::identity::{Address, PublicKey};
use crate::messages::{HolePunchMessage, deserialize_bounded, encode_frame, read_frame, serialize};
use crate::protocols::KeyRing;
use crate::transport::{RdtEndpoint, RdtStream, bridge_tcp};

/// Registrations whose timestamp is further than this from our clock are refused.
pub const MAX_REGISTRATION_SKEW: Duration = Duration::from_secs(300);

/// How long a client waits for the server's answer to `Register`.
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// A bridge listener closes after this long without a new local connection.
pub const BRIDGE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

type Registrations = Arc<RwLock<HashMap<PublicKey, SocketAddr>>>;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn send_message(stream: &RdtStream, message: &HolePunchMessage) -> Result<()> {
    let bytes = serialize(message).context("failed to encode hole punch message")?;
    stream.write(&encode_frame(&bytes)?).await
}

async fn recv_message(stream: &mut RdtStream) -> Result<Option<HolePunchMessage>> {
    match read_frame(stream).await? {
        Some(frame) => Ok(Some(
            deserialize_bounded(&frame).context("malformed hole punch message")?,
        )),
        None => Ok(None),
    }
}

// ============================================================================
// Server
// ============================================================================

/// UDP endpoint that records where registered peers are reachable and
/// forwards tunnels to the local peer server. Cheap to clone.
#[derive(Clone)]
pub struct HolePunchServer {
    endpoint: RdtEndpoint,
    registrations: Registrations,
}

impl std::fmt::Debug for HolePunchServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HolePunchServer")
            .field("addr", &self.endpoint.local_addr())
            .finish_non_exhaustive()
    }
}

impl HolePunchServer {
    /// Bind the UDP endpoint; tunnels are delivered to `peer_server`.
    pub async fn bind(addr: SocketAddr, peer_server: SocketAddr) -> Result<Self> {
        let endpoint = RdtEndpoint::bind(addr)
            .await
            .context("failed to bind hole punch endpoint")?;
        let registrations: Registrations = Arc::new(RwLock::new(HashMap::new()));
        info!(addr = %endpoint.local_addr(), "hole punch server listening");
        tokio::spawn(accept_loop(endpoint.clone(), registrations.clone(), peer_server));
        Ok(Self {
            endpoint,
            registrations,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    /// The endpoint outbound registrations and tunnels must use, so that
    /// replies come back through the same NAT mapping.
    pub fn endpoint(&self) -> &RdtEndpoint {
        &self.endpoint
    }

    /// Where `public_key` was seen registering from, while it stays connected.
    pub async fn observed_address(&self, public_key: &PublicKey) -> Option<SocketAddr> {
        self.registrations.read().await.get(public_key).copied()
    }

    pub async fn registered(&self) -> usize {
        self.registrations.read().await.len()
    }

    pub async fn shutdown(&self) {
        self.endpoint.shutdown().await;
    }
}

async fn accept_loop(endpoint: RdtEndpoint, registrations: Registrations, peer_server: SocketAddr) {
    while let Some(stream) = endpoint.accept().await {
        let registrations = registrations.clone();
        tokio::spawn(async move {
            let remote = stream.peer_addr();
            if let Err(e) = serve_stream(stream, registrations, peer_server).await {
                debug!(addr = %remote, error = %e, "hole punch stream ended");
            }
        });
    }
    debug!(addr = %endpoint.local_addr(), "hole punch accept loop stopped");
}

async fn serve_stream(
    mut stream: RdtStream,
    registrations: Registrations,
    peer_server: SocketAddr,
) -> Result<()> {
    let observed = stream.peer_addr();
    let first = match recv_message(&mut stream).await {
        Ok(Some(message)) => message,
        Ok(None) => return Ok(()),
        Err(e) => {
            stream.destroy().await;
            return Err(e);
        }
    };

    match first {
        HolePunchMessage::Register {
            public_key,
            timestamp_ms,
            signature,
        } => {
            if let Err(e) = check_registration(&public_key, timestamp_ms, &signature) {
                warn!(addr = %observed, error = %e, "rejected hole punch registration");
                stream.destroy().await;
                return Err(e);
            }
            registrations
                .write()
                .await
                .insert(public_key.clone(), observed);
            debug!(peer = %public_key.short(), addr = %observed, "peer registered for hole punching");

            let reply = HolePunchMessage::RegisterResponse {
                observed: Address::from_socket_addr(observed),
            };
            let result = send_message(&stream, &reply).await;

            // The registration lasts as long as the stream does.
            if result.is_ok() {
                while stream.read().await.is_some() {}
            }
            let mut registrations = registrations.write().await;
            if registrations.get(&public_key) == Some(&observed) {
                registrations.remove(&public_key);
            }
            trace!(peer = %public_key.short(), "hole punch registration released");
            result
        }
        HolePunchMessage::Tunnel => {
            let tcp = match TcpStream::connect(peer_server).await {
                Ok(tcp) => tcp,
                Err(e) => {
                    stream.destroy().await;
                    return Err(e).context("peer server unreachable for tunnel");
                }
            };
            trace!(addr = %observed, "tunnel opened to peer server");
            bridge_tcp(tcp, stream).await
        }
        HolePunchMessage::RegisterResponse { .. } => {
            stream.destroy().await;
            bail!("unsolicited register response");
        }
    }
}

fn check_registration(public_key: &PublicKey, timestamp_ms: u64, signature: &[u8]) -> Result<()> {
    let skew = now_ms().abs_diff(timestamp_ms);
    if skew > MAX_REGISTRATION_SKEW.as_millis() as u64 {
        bail!("registration timestamp off by {}ms", skew);
    }
    let payload = HolePunchMessage::register_payload(public_key, timestamp_ms);
    verify_with_domain(public_key, HOLE_PUNCH_SIGNATURE_DOMAIN, &payload, signature)?;
    Ok(())
}

// ============================================================================
// Client
// ============================================================================

/// A live registration with a relay's hole punch server.
///
/// The relay forgets the registration when the stream closes, so hold on to
/// this for as long as peers should be able to find us.
#[derive(Debug)]
pub struct HolePunchRegistration {
    observed: Address,
    stream: RdtStream,
}

impl HolePunchRegistration {
    /// Our address as the relay sees it.
    pub fn observed(&self) -> &Address {
        &self.observed
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.stream.peer_addr()
    }

    pub async fn close(self) {
        let _ = self.stream.end().await;
    }
}

/// Register with the hole punch server at `server` from `endpoint`.
pub async fn register(
    endpoint: &RdtEndpoint,
    keyring: &dyn KeyRing,
    server: SocketAddr,
) -> Result<HolePunchRegistration> {
    let mut stream = endpoint
        .connect(server)
        .await
        .with_context(|| format!("failed to reach hole punch server {}", server))?;

    let public_key = keyring.public_key().clone();
    let timestamp_ms = now_ms();
    let payload = HolePunchMessage::register_payload(&public_key, timestamp_ms);
    let signature = sign_with_domain(keyring, HOLE_PUNCH_SIGNATURE_DOMAIN, &payload);
    send_message(
        &stream,
        &HolePunchMessage::Register {
            public_key,
            timestamp_ms,
            signature,
        },
    )
    .await?;

    let reply = tokio::time::timeout(REGISTER_TIMEOUT, recv_message(&mut stream))
        .await
        .map_err(|_| crate::error::PeerError::timeout("hole punch registration", REGISTER_TIMEOUT))??;
    match reply {
        Some(HolePunchMessage::RegisterResponse { observed }) => {
            debug!(server = %server, observed = %observed, "registered with hole punch server");
            Ok(HolePunchRegistration { observed, stream })
        }
        Some(other) => {
            stream.destroy().await;
            bail!("unexpected hole punch reply: {:?}", other)
        }
        None => bail!("hole punch server closed the registration"),
    }
}

/// Open an RDT stream to `target` that ends at its peer server.
pub async fn open_tunnel(endpoint: &RdtEndpoint, target: SocketAddr) -> Result<RdtStream> {
    let stream = endpoint.connect(target).await?;
    send_message(&stream, &HolePunchMessage::Tunnel).await?;
    Ok(stream)
}

/// Listen on a loopback TCP port and tunnel every accepted connection to
/// `target` over `endpoint`. The listener closes after
/// [`BRIDGE_IDLE_TIMEOUT`] without a new connection.
pub async fn bridge_listener(endpoint: RdtEndpoint, target: SocketAddr) -> Result<SocketAddr> {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .context("failed to bind local bridge")?;
    let local = listener.local_addr()?;
    trace!(local = %local, target = %target, "bridge listener started");

    tokio::spawn(async move {
        loop {
            let accepted = match tokio::time::timeout(BRIDGE_IDLE_TIMEOUT, listener.accept()).await {
                Ok(Ok((tcp, _))) => tcp,
                Ok(Err(e)) => {
                    debug!(local = %local, error = %e, "bridge accept failed");
                    break;
                }
                Err(_) => break,
            };
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                let result = match open_tunnel(&endpoint, target).await {
                    Ok(rdt) => bridge_tcp(accepted, rdt).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    debug!(target = %target, error = %e, "bridged connection failed");
                }
            });
        }
        trace!(local = %local, "bridge listener closed");
    });

    Ok(local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKeyRing;
    use crate::identity::Keypair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind(loopback()).await.unwrap();
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

    #[tokio::test]
    async fn registration_reports_the_observed_address() {
        let server = HolePunchServer::bind(loopback(), echo_server().await)
            .await
            .unwrap();
        let client = RdtEndpoint::bind(loopback()).await.unwrap();
        let keyring = LocalKeyRing::new(Keypair::generate());

        let registration = register(&client, &keyring, server.local_addr()).await.unwrap();
        assert_eq!(registration.observed(), &Address::from_socket_addr(client.local_addr()));
        assert_eq!(
            server.observed_address(keyring.public_key()).await,
            Some(client.local_addr())
        );
    }

    #[tokio::test]
    async fn forged_registration_is_refused() {
        let server = HolePunchServer::bind(loopback(), echo_server().await)
            .await
            .unwrap();
        let client = RdtEndpoint::bind(loopback()).await.unwrap();
        let claimed = Keypair::generate().public_key();
        let imposter = LocalKeyRing::new(Keypair::generate());

        let timestamp_ms = now_ms();
        let payload = HolePunchMessage::register_payload(&claimed, timestamp_ms);
        let signature = sign_with_domain(&imposter, HOLE_PUNCH_SIGNATURE_DOMAIN, &payload);
        let mut stream = client.connect(server.local_addr()).await.unwrap();
        send_message(
            &stream,
            &HolePunchMessage::Register {
                public_key: claimed.clone(),
                timestamp_ms,
                signature,
            },
        )
        .await
        .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), recv_message(&mut stream))
            .await
            .expect("server should close the stream");
        assert!(!matches!(reply, Ok(Some(HolePunchMessage::RegisterResponse { .. }))));
        assert_eq!(server.observed_address(&claimed).await, None);
    }

    #[tokio::test]
    async fn stale_timestamps_are_refused() {
        let keyring = LocalKeyRing::new(Keypair::generate());
        let stale = now_ms() - 2 * MAX_REGISTRATION_SKEW.as_millis() as u64;
        let payload = HolePunchMessage::register_payload(keyring.public_key(), stale);
        let signature = sign_with_domain(&keyring, HOLE_PUNCH_SIGNATURE_DOMAIN, &payload);
        assert!(check_registration(keyring.public_key(), stale, &signature).is_err());

        let fresh = now_ms();
        let payload = HolePunchMessage::register_payload(keyring.public_key(), fresh);
        let signature = sign_with_domain(&keyring, HOLE_PUNCH_SIGNATURE_DOMAIN, &payload);
        assert!(check_registration(keyring.public_key(), fresh, &signature).is_ok());
    }

    #[tokio::test]
    async fn bridge_tunnels_tcp_to_the_remote_peer_server() {
        let server = HolePunchServer::bind(loopback(), echo_server().await)
            .await
            .unwrap();
        let client = RdtEndpoint::bind(loopback()).await.unwrap();
        let bridge = bridge_listener(client, server.local_addr()).await.unwrap();

        let mut tcp = TcpStream::connect(bridge).await.unwrap();
        tcp.write_all(b"through the punched hole").await.unwrap();
        let mut buf = [0u8; 24];
        tokio::time::timeout(Duration::from_secs(5), tcp.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"through the punched hole");
    }
}
