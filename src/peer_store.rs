//! # Peer Store
//!
//! Directory of known peers keyed by normalized [`PublicKey`].
//!
//! Entries are only reachable through method calls: every read hands out a
//! clone, so callers can never alias the stored record. The store is cheap to
//! clone and shared by the peer server, discovery and connection layers.
//!
//! ## Persistence
//!
//! When opened with a path the store is durable. The file is a sequence of
//! records, each a `u32` big-endian length followed by a bincode `PeerInfo`.
//! [`PeerStore::save`] writes a temp file next to the target and renames it
//! over, so a crash mid-write leaves the previous snapshot intact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::PeerError;
use crate::identity::{Address, PublicKey};
use crate::messages::{deserialize_bounded, serialize};

/// What this node knows about one peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub public_key: PublicKey,
    /// Where the peer accepts direct connections, if anywhere.
    pub peer_address: Option<Address>,
    /// A reachable peer that relays for this one.
    pub relay_public_key: Option<PublicKey>,
}

impl PeerInfo {
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            peer_address: None,
            relay_public_key: None,
        }
    }

    pub fn with_address(mut self, address: Address) -> Self {
        self.peer_address = Some(address);
        self
    }

    pub fn with_relay(mut self, relay: PublicKey) -> Self {
        self.relay_public_key = Some(relay);
        self
    }
}

#[derive(Clone, Default)]
pub struct PeerStore {
    peers: Arc<RwLock<HashMap<PublicKey, PeerInfo>>>,
    path: Option<Arc<PathBuf>>,
}

impl std::fmt::Debug for PeerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerStore")
            .field("peers", &self.len())
            .field("path", &self.path)
            .finish()
    }
}

impl PeerStore {
    /// In-memory store; [`save`](Self::save) is a no-op.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a durable store. A missing file yields an empty store.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut peers = HashMap::new();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                for info in decode_records(&bytes)
                    .with_context(|| format!("corrupt peer store {}", path.display()))?
                {
                    peers.insert(info.public_key.clone(), info);
                }
                debug!(path = %path.display(), peers = peers.len(), "loaded peer store");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no peer store on disk, starting empty");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        }
        Ok(Self {
            peers: Arc::new(RwLock::new(peers)),
            path: Some(Arc::new(path)),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref().map(PathBuf::as_path)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<PublicKey, PeerInfo>> {
        self.peers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<PublicKey, PeerInfo>> {
        self.peers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_peer(&self, info: PeerInfo) -> Result<(), PeerError> {
        let mut peers = self.write();
        if peers.contains_key(&info.public_key) {
            return Err(PeerError::PeerExists);
        }
        trace!(peer = %info.public_key.short(), "adding peer");
        peers.insert(info.public_key.clone(), info);
        Ok(())
    }

    /// Replace the record for an already-known peer.
    pub fn update_peer(&self, info: PeerInfo) -> Result<(), PeerError> {
        let mut peers = self.write();
        match peers.get_mut(&info.public_key) {
            Some(existing) => {
                *existing = info;
                Ok(())
            }
            None => Err(PeerError::PeerNotFound),
        }
    }

    pub fn get_peer(&self, public_key: &PublicKey) -> Option<PeerInfo> {
        self.read().get(public_key).cloned()
    }

    pub fn has_peer(&self, public_key: &PublicKey) -> bool {
        self.read().contains_key(public_key)
    }

    pub fn remove_peer(&self, public_key: &PublicKey) -> Option<PeerInfo> {
        self.write().remove(public_key)
    }

    /// Every known peer, ordered by key.
    pub fn list_peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.read().values().cloned().collect();
        peers.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        peers
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Write the current snapshot to disk, if this store has a path.
    pub async fn save(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let bytes = encode_records(&self.list_peers())?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;
        debug!(path = %path.display(), bytes = bytes.len(), "saved peer store");
        Ok(())
    }
}

pub fn encode_records(peers: &[PeerInfo]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for info in peers {
        let record = serialize(info).context("failed to encode peer record")?;
        out.extend_from_slice(&(record.len() as u32).to_be_bytes());
        out.extend_from_slice(&record);
    }
    Ok(out)
}

pub fn decode_records(mut bytes: &[u8]) -> Result<Vec<PeerInfo>> {
    let mut peers = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < 4 {
            bail!("truncated record length");
        }
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        bytes = &bytes[4..];
        if bytes.len() < len {
            bail!("record claims {} bytes, {} remain", len, bytes.len());
        }
        let info: PeerInfo =
            deserialize_bounded(&bytes[..len]).context("failed to decode peer record")?;
        peers.push(info);
        bytes = &bytes[len..];
    }
    Ok(peers)
}
