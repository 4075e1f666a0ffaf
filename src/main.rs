use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use polykey_net::{Address, Keypair, Node, NodeConfig, PeerInfo, PublicKey};

/// `<PEM file>[@host:port]`
#[derive(Clone, Debug)]
struct PeerArg {
    key_file: PathBuf,
    address: Option<Address>,
}

impl FromStr for PeerArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.rsplit_once('@') {
            Some((file, addr)) => Ok(PeerArg {
                key_file: PathBuf::from(file),
                address: Some(addr.parse().context("invalid peer address")?),
            }),
            None => Ok(PeerArg {
                key_file: PathBuf::from(s),
                address: None,
            }),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "polykey")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP address of the peer server.
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// UDP address for hole punching.
    #[arg(short, long)]
    udp_bind: Option<SocketAddr>,

    /// Durable peer store.
    #[arg(short, long)]
    peer_store: Option<PathBuf>,

    /// Node secret key; generated on first run.
    #[arg(short, long, default_value = "polykey.key")]
    key: PathBuf,

    /// Known peer as `<PEM file>[@host:port]`.
    #[arg(short = 'a', long = "add-peer", value_name = "PEER")]
    add_peer: Vec<PeerArg>,

    /// Public key file of a peer to relay through.
    #[arg(short, long, value_name = "PEM")]
    relay: Option<PathBuf>,

    /// Listen for beacons without announcing ourselves.
    #[arg(short, long)]
    stealth: bool,
}

async fn load_or_create_keypair(path: &Path) -> Result<Keypair> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Keypair::from_pem(&text).with_context(|| format!("invalid key in {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = Keypair::generate();
            tokio::fs::write(path, keypair.to_pem())
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "generated node key");
            Ok(keypair)
        }
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

async fn read_public_key(path: &Path) -> Result<PublicKey> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    PublicKey::parse(&text).with_context(|| format!("no public key in {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = NodeConfig::from_env();
    if let Some(bind) = args.bind {
        config.peer_bind = bind;
    }
    if let Some(udp_bind) = args.udp_bind {
        config.udp_bind = udp_bind;
    }
    if let Some(path) = args.peer_store {
        config.peer_store_path = Some(path);
    }
    config.stealth |= args.stealth;

    let keypair = load_or_create_keypair(&args.key).await?;
    let node = Node::bind(config, keypair).await?;
    info!(address = %node.peer_address(), "node public key:\n{}", node.public_key());

    for peer in &args.add_peer {
        let key = read_public_key(&peer.key_file).await?;
        let mut info = node.get_peer(&key).unwrap_or_else(|| PeerInfo::new(key.clone()));
        if peer.address.is_some() {
            info.peer_address = peer.address.clone();
        }
        let result = if node.get_peer(&key).is_some() {
            node.update_peer(info).await
        } else {
            node.add_peer(info).await
        };
        match result {
            Ok(()) => info!(peer = %key.short(), "peer added"),
            Err(e) => warn!(peer = %key.short(), error = %e, "failed to add peer"),
        }
    }

    if let Some(relay_file) = &args.relay {
        let relay = read_public_key(relay_file).await?;
        match node.request_relay(&relay).await {
            Ok(addresses) => info!(
                relay = %relay.short(),
                relay_address = %addresses.relay_address,
                "relay ready"
            ),
            Err(e) => warn!(relay = %relay.short(), error = %e, "relay request failed"),
        }
    }

    let mut discovered = node.discovered();

    // run until ctrl+c
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            found = discovered.recv() => match found {
                Ok(key) => {
                    let address = node.get_peer(&key).and_then(|p| p.peer_address);
                    info!(peer = %key.short(), address = ?address, "peer discovered");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "discovery events dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    node.shutdown().await
}
