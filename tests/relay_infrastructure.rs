//! Integration tests for the relay infrastructure.
//!
//! A relay node R forwards traffic for a node X that has no address other
//! peers can dial. Another node Y reaches X knowing only X's key and R.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test relay_infrastructure -- --nocapture

use std::sync::Once;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use polykey_net::messages::{NatRequest, NatResponse};
use polykey_net::{Keypair, Node, NodeConfig, PeerError, PeerInfo, PeerRequest, PeerResponse};
use tokio::time::timeout;

/// One-time tracing initialization
static INIT: Once = Once::new();

/// Initialize tracing for tests. Call at start of slow tests.
/// Use RUST_LOG=debug or RUST_LOG=trace for verbose output.
fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("debug")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Progress marker that prints elapsed time
fn progress(start: Instant, msg: &str) {
    eprintln!("[{:>6.2}s] {}", start.elapsed().as_secs_f64(), msg);
}

/// Each node takes port N for TCP and N+1 for UDP.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(2, Ordering::SeqCst)
}

async fn test_node() -> Node {
    let port = next_port();
    let config = NodeConfig {
        peer_bind: format!("127.0.0.1:{}", port).parse().unwrap(),
        udp_bind: format!("127.0.0.1:{}", port + 1).parse().unwrap(),
        multicast: false,
        ping_timeout: Duration::from_secs(3),
        ..NodeConfig::default()
    };
    Node::bind(config, Keypair::generate()).await.expect("bind failed")
}

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// R knows X and Y; X and Y know R by address; each knows the other by key.
/// Y only learns that X is reachable through R.
async fn relay_topology() -> (Node, Node, Node) {
    let relay = test_node().await;
    let x = test_node().await;
    let y = test_node().await;

    relay.add_peer(PeerInfo::new(x.public_key().clone())).await.unwrap();
    relay.add_peer(PeerInfo::new(y.public_key().clone())).await.unwrap();
    x.add_peer(relay.peer_info()).await.unwrap();
    y.add_peer(relay.peer_info()).await.unwrap();
    x.add_peer(PeerInfo::new(y.public_key().clone())).await.unwrap();
    y.add_peer(PeerInfo::new(x.public_key().clone()).with_relay(relay.public_key().clone()))
        .await
        .unwrap();
    (relay, x, y)
}

#[tokio::test]
async fn relayed_peer_answers_ping() {
    init_tracing();
    let start = Instant::now();
    let (relay, x, y) = relay_topology().await;
    progress(start, "nodes bound");

    let addresses = timeout(TEST_TIMEOUT, x.request_relay(relay.public_key()))
        .await
        .expect("relay request timed out")
        .expect("relay request failed");
    progress(start, "relay allocated");
    assert_eq!(x.relay_public_key().as_ref(), Some(relay.public_key()));
    assert!(addresses.hole_punch_address.is_some());
    assert_eq!(
        relay.turn_server().client_address(x.public_key()).await,
        Some(addresses.relay_address.clone())
    );
    assert_eq!(x.peer_info().relay_public_key.as_ref(), Some(relay.public_key()));

    timeout(TEST_TIMEOUT, y.ping_peer(x.public_key()))
        .await
        .expect("ping timed out")
        .expect("ping through relay failed");
    progress(start, "ping round-tripped");

    // The session stays usable for further requests.
    let request = PeerRequest::PingPeer {
        challenge: "still there".to_string(),
    };
    let response = timeout(TEST_TIMEOUT, y.send_peer_request(x.public_key(), request))
        .await
        .expect("request timed out")
        .expect("request failed");
    assert_eq!(
        response,
        PeerResponse::PingPeer {
            challenge: "still there".to_string()
        }
    );
}

#[tokio::test]
async fn relay_reports_session_address_to_other_peers() {
    init_tracing();
    let (relay, x, y) = relay_topology().await;
    let addresses = timeout(TEST_TIMEOUT, x.request_relay(relay.public_key()))
        .await
        .expect("relay request timed out")
        .expect("relay request failed");

    let request = PeerRequest::NatTraversal(NatRequest::PeerConnection {
        target: x.public_key().clone(),
    });
    let response = timeout(TEST_TIMEOUT, y.send_peer_request(relay.public_key(), request))
        .await
        .expect("request timed out")
        .expect("request failed");
    assert_eq!(
        response,
        PeerResponse::NatTraversal(NatResponse::PeerConnection {
            address: Some(addresses.relay_address)
        })
    );

    let request = PeerRequest::NatTraversal(NatRequest::PeerConnection {
        target: y.public_key().clone(),
    });
    let response = timeout(TEST_TIMEOUT, x.send_peer_request(relay.public_key(), request))
        .await
        .expect("request timed out")
        .expect("request failed");
    assert_eq!(
        response,
        PeerResponse::NatTraversal(NatResponse::PeerConnection { address: None })
    );
}

#[tokio::test]
async fn relay_key_without_session_cannot_connect() {
    init_tracing();
    let (relay, x, y) = relay_topology().await;
    // X never asked R to relay for it.

    let err = timeout(TEST_TIMEOUT, y.ping_peer(x.public_key()))
        .await
        .expect("ping timed out")
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<PeerError>(), Some(PeerError::CouldNotConnect)));
    assert_eq!(relay.turn_server().session_count().await, 0);
}

#[tokio::test]
async fn peer_without_address_or_relay_cannot_connect() {
    let a = test_node().await;
    let b = test_node().await;
    a.add_peer(PeerInfo::new(b.public_key().clone())).await.unwrap();

    let err = a.ping_peer(b.public_key()).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<PeerError>(), Some(PeerError::CouldNotConnect)));
}
