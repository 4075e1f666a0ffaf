//! # Discovery
//!
//! Two ways of finding peers beyond the ones already in the [`PeerStore`].
//!
//! ## Multicast
//!
//! [`MulticastDiscovery`] announces this node's [`PeerInfo`] on a multicast
//! group every `interval`, signed with the node's key, and listens for the
//! announcements of others. Announcements only refresh peers that are
//! already known: beacons from ourselves, from unknown keys, or with a bad
//! signature are dropped. Every accepted beacon updates the store and is
//! published on a broadcast channel that [`MulticastDiscovery::find_public_key`]
//! waits on.
//!
//! Nothing is broadcast until the key ring is unlocked. Stealth mode stops
//! broadcasting while leaving the listener alone.
//!
//! ## Social
//!
//! [`SocialDiscovery`] races every configured [`SocialProvider`] to turn a
//! social handle into a public key, then waits for that key on multicast.
//! A Keybase provider is always present.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::crypto::{BEACON_SIGNATURE_DOMAIN, sign_with_domain, verify_with_domain};
use crate::error::PeerError;
use crate::identity::PublicKey;
use crate::messages::{MessageKind, MulticastBeacon, deserialize_bounded, encode_frame, serialize};
use crate::peer_store::{PeerInfo, PeerStore};
use crate::protocols::{KeyRing, SocialProvider};

// ============================================================================
// Constants
// ============================================================================

pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

pub const DEFAULT_MULTICAST_PORT: u16 = 5353;

pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(1);

/// How long [`MulticastDiscovery::find_public_key`] waits by default.
pub const DEFAULT_FIND_TIMEOUT: Duration = Duration::from_secs(50);

/// Largest datagram read from the group.
pub const MAX_BEACON_SIZE: usize = 8 * 1024;

const FOUND_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Beacons
// ============================================================================

/// Signed announcement of `info`, framed for one datagram.
pub fn encode_beacon(keyring: &dyn KeyRing, info: &PeerInfo) -> Result<Vec<u8>> {
    let sub_message = serialize(info).context("failed to encode peer info")?;
    let signature = sign_with_domain(keyring, BEACON_SIGNATURE_DOMAIN, &sub_message);
    let beacon = MulticastBeacon {
        kind: MessageKind::PingPeer,
        public_key: keyring.public_key().clone(),
        sub_message,
        signature,
    };
    encode_frame(&serialize(&beacon).context("failed to encode beacon")?)
}

/// Check a received datagram and return the announced [`PeerInfo`].
///
/// `own` is our key while unlocked; our own beacons are refused.
pub fn accept_beacon(datagram: &[u8], own: Option<&PublicKey>, store: &PeerStore) -> Result<PeerInfo> {
    if datagram.len() < 4 {
        bail!("datagram too short");
    }
    let len = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]) as usize;
    let body = &datagram[4..];
    if body.len() != len {
        bail!("beacon length {} does not match datagram ({})", len, body.len());
    }
    let beacon: MulticastBeacon = deserialize_bounded(body).context("malformed beacon")?;
    if beacon.kind != MessageKind::PingPeer {
        bail!("unexpected beacon type {}", beacon.kind);
    }
    if own == Some(&beacon.public_key) {
        bail!("own beacon");
    }
    if !store.has_peer(&beacon.public_key) {
        return Err(PeerError::UnknownPublicKey.into());
    }
    verify_with_domain(
        &beacon.public_key,
        BEACON_SIGNATURE_DOMAIN,
        &beacon.sub_message,
        &beacon.signature,
    )?;
    let info = beacon.peer_info().context("malformed peer info in beacon")?;
    if info.public_key != beacon.public_key {
        bail!("beacon announces a different key than it is signed by");
    }
    Ok(info)
}

// ============================================================================
// Multicast discovery
// ============================================================================

#[derive(Clone, Debug)]
pub struct MulticastConfig {
    /// Destination group. A unicast address sends straight to that host.
    pub group: Ipv4Addr,
    /// Port to listen on and send to. `0` listens on an ephemeral port.
    pub port: u16,
    pub interval: Duration,
    /// Local interface to listen and join on.
    pub bind_ip: Ipv4Addr,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_MULTICAST_GROUP,
            port: DEFAULT_MULTICAST_PORT,
            interval: DEFAULT_BROADCAST_INTERVAL,
            bind_ip: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Multicast announcer and listener. Cheap to clone.
#[derive(Clone)]
pub struct MulticastDiscovery {
    inner: Arc<MulticastInner>,
}

struct MulticastInner {
    config: MulticastConfig,
    peer_store: PeerStore,
    keyring: RwLock<Option<Arc<dyn KeyRing>>>,
    local_info: RwLock<Option<PeerInfo>>,
    found_tx: broadcast::Sender<PublicKey>,
    listener: Mutex<Option<JoinHandle<()>>>,
    broadcaster: Mutex<Option<JoinHandle<()>>>,
    stealth: RwLock<bool>,
}

impl Drop for MulticastInner {
    fn drop(&mut self) {
        for slot in [&self.listener, &self.broadcaster] {
            if let Some(task) = lock(slot).take() {
                task.abort();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl std::fmt::Debug for MulticastDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticastDiscovery")
            .field("config", &self.inner.config)
            .field("unlocked", &self.is_unlocked())
            .field("listening", &self.is_listening())
            .field("broadcasting", &self.is_broadcasting())
            .finish()
    }
}

impl MulticastDiscovery {
    pub fn new(config: MulticastConfig, peer_store: PeerStore) -> Self {
        let (found_tx, _) = broadcast::channel(FOUND_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(MulticastInner {
                config,
                peer_store,
                keyring: RwLock::new(None),
                local_info: RwLock::new(None),
                found_tx,
                listener: Mutex::new(None),
                broadcaster: Mutex::new(None),
                stealth: RwLock::new(false),
            }),
        }
    }

    /// Make the key ring available; broadcasting starts to send from here on.
    pub fn unlock(&self, keyring: Arc<dyn KeyRing>) {
        *self
            .inner
            .keyring
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(keyring);
    }

    pub fn is_unlocked(&self) -> bool {
        self.keyring().is_some()
    }

    fn keyring(&self) -> Option<Arc<dyn KeyRing>> {
        self.inner
            .keyring
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The record announced on every tick.
    pub fn set_local_info(&self, info: PeerInfo) {
        *self
            .inner
            .local_info
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(info);
    }

    fn local_info(&self) -> Option<PeerInfo> {
        self.inner
            .local_info
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Keys of accepted beacons, as they arrive.
    pub fn subscribe(&self) -> broadcast::Receiver<PublicKey> {
        self.inner.found_tx.subscribe()
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.inner.listener).is_some()
    }

    pub fn is_broadcasting(&self) -> bool {
        lock(&self.inner.broadcaster).is_some()
    }

    pub fn is_stealth(&self) -> bool {
        *self
            .inner
            .stealth
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bind the listening socket and start accepting beacons. Returns the
    /// bound address.
    pub async fn start_listening(&self) -> Result<SocketAddr> {
        let config = &self.inner.config;
        let socket = UdpSocket::bind(SocketAddrV4::new(config.bind_ip, config.port))
            .await
            .with_context(|| format!("failed to bind multicast listener on port {}", config.port))?;
        if config.group.is_multicast()
            && let Err(e) = socket.join_multicast_v4(config.group, config.bind_ip)
        {
            warn!(group = %config.group, error = %e, "failed to join multicast group");
        }
        let local = socket.local_addr()?;
        let task = tokio::spawn(listen_loop(socket, Arc::downgrade(&self.inner)));
        if let Some(previous) = lock(&self.inner.listener).replace(task) {
            previous.abort();
        }
        info!(addr = %local, group = %config.group, "multicast discovery listening");
        Ok(local)
    }

    pub fn stop_listening(&self) {
        if let Some(task) = lock(&self.inner.listener).take() {
            task.abort();
            debug!("multicast listener stopped");
        }
    }

    /// Start the periodic announcement. A no-op in stealth mode.
    pub async fn start_broadcasting(&self) -> Result<()> {
        if self.is_stealth() {
            debug!("stealth mode, not broadcasting");
            return Ok(());
        }
        let config = &self.inner.config;
        let socket = UdpSocket::bind(SocketAddrV4::new(config.bind_ip, 0))
            .await
            .context("failed to bind multicast sender")?;
        if config.group.is_multicast() {
            let _ = socket.set_multicast_loop_v4(true);
        }
        let target = SocketAddr::from(SocketAddrV4::new(config.group, config.port));
        let task = tokio::spawn(broadcast_loop(
            socket,
            target,
            config.interval,
            Arc::downgrade(&self.inner),
        ));
        if let Some(previous) = lock(&self.inner.broadcaster).replace(task) {
            previous.abort();
        }
        debug!(target = %target, "multicast broadcasting started");
        Ok(())
    }

    pub fn stop_broadcasting(&self) {
        if let Some(task) = lock(&self.inner.broadcaster).take() {
            task.abort();
            debug!("multicast broadcasting stopped");
        }
    }

    /// Stealth stops broadcasting; leaving stealth starts it again.
    pub async fn set_stealth(&self, stealth: bool) -> Result<()> {
        *self
            .inner
            .stealth
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = stealth;
        if stealth {
            self.stop_broadcasting();
            Ok(())
        } else if !self.is_broadcasting() {
            self.start_broadcasting().await
        } else {
            Ok(())
        }
    }

    /// Send one announcement now. Returns false while locked or before a
    /// local record is set.
    pub async fn announce(&self, socket: &UdpSocket, target: SocketAddr) -> Result<bool> {
        let (Some(keyring), Some(info)) = (self.keyring(), self.local_info()) else {
            return Ok(false);
        };
        let datagram = encode_beacon(keyring.as_ref(), &info)?;
        socket
            .send_to(&datagram, target)
            .await
            .with_context(|| format!("failed to send beacon to {}", target))?;
        Ok(true)
    }

    /// Process one received datagram.
    pub async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let own = self.keyring().map(|k| k.public_key().clone());
        let info = match accept_beacon(datagram, own.as_ref(), &self.inner.peer_store) {
            Ok(info) => info,
            Err(e) => {
                trace!(from = %from, error = %e, "beacon ignored");
                return;
            }
        };
        let public_key = info.public_key.clone();
        if let Err(e) = self.inner.peer_store.update_peer(info) {
            debug!(peer = %public_key.short(), error = %e, "peer vanished before beacon applied");
            return;
        }
        debug!(peer = %public_key.short(), from = %from, "peer found via multicast");
        let _ = self.inner.found_tx.send(public_key);
    }

    /// Wait until a beacon from `target` is accepted.
    pub async fn find_public_key(&self, target: &PublicKey, timeout: Duration) -> Result<bool> {
        let mut found = self.subscribe();
        let wait = async {
            loop {
                match found.recv().await {
                    Ok(key) if &key == target => return Ok(true),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        trace!(skipped, "discovery subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(anyhow!("multicast discovery stopped"));
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| PeerError::timeout("find public key", timeout))?
    }
}

// The loops hold weak references so dropping the last handle ends them.

async fn listen_loop(socket: UdpSocket, inner: Weak<MulticastInner>) {
    let mut buf = vec![0u8; MAX_BEACON_SIZE];
    loop {
        let received = socket.recv_from(&mut buf).await;
        let Some(inner) = inner.upgrade() else { break };
        let discovery = MulticastDiscovery { inner };
        match received {
            Ok((n, from)) => discovery.handle_datagram(&buf[..n], from).await,
            Err(e) => {
                debug!(error = %e, "multicast receive failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn broadcast_loop(
    socket: UdpSocket,
    target: SocketAddr,
    interval: Duration,
    inner: Weak<MulticastInner>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        let discovery = MulticastDiscovery { inner };
        match discovery.announce(&socket, target).await {
            Ok(true) => trace!(target = %target, "beacon sent"),
            Ok(false) => trace!("identity locked, beacon skipped"),
            Err(e) => debug!(error = %e, "beacon send failed"),
        }
    }
}

// ============================================================================
// Social discovery
// ============================================================================

pub const KEYBASE_API: &str = "https://keybase.io/_/api/1.0";

const KEYBASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves Keybase users and linked accounts to the Polykey public key
/// published in their profile bio.
pub struct KeybaseProvider {
    client: reqwest::Client,
    api_base: String,
}

impl KeybaseProvider {
    pub fn new() -> Result<Self> {
        Self::with_api_base(KEYBASE_API)
    }

    pub fn with_api_base(api_base: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(KEYBASE_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            api_base: api_base.into(),
        })
    }
}

/// Pull the public key out of a `user/lookup.json` response body.
pub fn parse_lookup_response(body: &Value) -> Result<PublicKey> {
    let code = body["status"]["code"].as_i64().unwrap_or(-1);
    if code != 0 {
        let name = body["status"]["name"].as_str().unwrap_or("unknown");
        bail!("keybase lookup failed: {} ({})", name, code);
    }
    let user = body["them"]
        .as_array()
        .and_then(|them| them.iter().find(|u| !u.is_null()))
        .ok_or_else(|| anyhow!("keybase has no such user"))?;
    let bio = user["profile"]["bio"]
        .as_str()
        .ok_or_else(|| anyhow!("keybase user has no profile bio"))?;
    PublicKey::parse(bio).context("no public key in keybase profile")
}

#[async_trait]
impl SocialProvider for KeybaseProvider {
    fn name(&self) -> &str {
        "keybase"
    }

    async fn find_user(&self, handle: &str, service: &str) -> Result<PublicKey> {
        let url = format!("{}/user/lookup.json", self.api_base);
        let field = if service == "keybase" { "usernames" } else { service };
        let body: Value = self
            .client
            .get(&url)
            .query(&[(field, handle), ("fields", "profile")])
            .send()
            .await
            .context("keybase request failed")?
            .error_for_status()?
            .json()
            .await
            .context("keybase returned malformed JSON")?;
        parse_lookup_response(&body)
    }
}

/// Social handle resolution followed by multicast confirmation.
pub struct SocialDiscovery {
    providers: Vec<Arc<dyn SocialProvider>>,
    multicast: MulticastDiscovery,
    peer_store: PeerStore,
}

impl SocialDiscovery {
    pub fn new(multicast: MulticastDiscovery, peer_store: PeerStore) -> Result<Self> {
        Ok(Self {
            providers: vec![Arc::new(KeybaseProvider::new()?)],
            multicast,
            peer_store,
        })
    }

    pub fn add_provider(&mut self, provider: Arc<dyn SocialProvider>) {
        self.providers.push(provider);
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// First key any provider resolves `handle` on `service` to.
    pub async fn resolve(&self, handle: &str, service: &str) -> Result<PublicKey> {
        let mut lookups = JoinSet::new();
        for provider in &self.providers {
            let provider = provider.clone();
            let (handle, service) = (handle.to_string(), service.to_string());
            lookups.spawn(async move {
                let result = provider.find_user(&handle, &service).await;
                (provider.name().to_string(), result)
            });
        }
        while let Some(joined) = lookups.join_next().await {
            match joined {
                Ok((_, Ok(key))) => {
                    lookups.abort_all();
                    return Ok(key);
                }
                Ok((name, Err(e))) => debug!(provider = %name, error = %e, "social lookup failed"),
                Err(e) => debug!(error = %e, "social lookup task failed"),
            }
        }
        bail!("no social provider could resolve {}@{}", handle, service)
    }

    /// Resolve `handle` and wait for that key to show up on the local network.
    pub async fn find_social_user(&self, handle: &str, service: &str, timeout: Duration) -> Result<PublicKey> {
        let deadline = Instant::now() + timeout;
        let key = tokio::time::timeout(timeout, self.resolve(handle, service))
            .await
            .map_err(|_| PeerError::timeout("social lookup", timeout))??;
        if !self.peer_store.has_peer(&key) {
            // Beacons only refresh known peers.
            let _ = self.peer_store.add_peer(PeerInfo::new(key.clone()));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.multicast.find_public_key(&key, remaining).await?;
        Ok(key)
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

    fn loopback_config(port: u16) -> MulticastConfig {
        MulticastConfig {
            group: Ipv4Addr::LOCALHOST,
            port,
            interval: Duration::from_millis(50),
            bind_ip: Ipv4Addr::LOCALHOST,
        }
    }

    #[test]
    fn beacons_from_unknown_or_forged_senders_are_refused() {
        let sender = keyring();
        let store = PeerStore::new();
        let info = PeerInfo::new(sender.public_key().clone()).with_address(Address::new("10.0.0.2", 1314));
        let datagram = encode_beacon(sender.as_ref(), &info).unwrap();

        let err = accept_beacon(&datagram, None, &store).unwrap_err();
        assert!(matches!(err.downcast_ref::<PeerError>(), Some(PeerError::UnknownPublicKey)));

        store.add_peer(PeerInfo::new(sender.public_key().clone())).unwrap();
        assert_eq!(accept_beacon(&datagram, None, &store).unwrap(), info);
        assert!(accept_beacon(&datagram, Some(sender.public_key()), &store).is_err());

        let mut tampered = datagram.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xFF;
        assert!(accept_beacon(&tampered, None, &store).is_err());
        assert!(accept_beacon(&datagram[..datagram.len() - 1], None, &store).is_err());
    }

    #[test]
    fn beacon_must_announce_its_signer() {
        let sender = keyring();
        let store = PeerStore::new();
        store.add_peer(PeerInfo::new(sender.public_key().clone())).unwrap();
        let someone_else = PeerInfo::new(Keypair::generate().public_key());
        let datagram = encode_beacon(sender.as_ref(), &someone_else).unwrap();
        assert!(accept_beacon(&datagram, None, &store).is_err());
    }

    #[tokio::test]
    async fn known_peer_is_found_and_refreshed() {
        let a = keyring();
        let b_store = PeerStore::new();
        b_store.add_peer(PeerInfo::new(a.public_key().clone())).unwrap();

        let b = MulticastDiscovery::new(loopback_config(0), b_store.clone());
        let listening = b.start_listening().await.unwrap();

        let a_discovery = MulticastDiscovery::new(loopback_config(listening.port()), PeerStore::new());
        let announced = PeerInfo::new(a.public_key().clone()).with_address(Address::new("192.168.7.7", 4242));
        a_discovery.set_local_info(announced.clone());
        a_discovery.start_broadcasting().await.unwrap();
        assert!(a_discovery.is_broadcasting());

        // Locked: nothing is sent, so nothing is found.
        let early = b.find_public_key(a.public_key(), Duration::from_millis(300)).await;
        assert!(PeerError::is_timeout(&early.unwrap_err()));

        a_discovery.unlock(a.clone());
        assert!(b.find_public_key(a.public_key(), Duration::from_secs(5)).await.unwrap());
        assert_eq!(b_store.get_peer(a.public_key()), Some(announced));
    }

    #[tokio::test]
    async fn stealth_stops_broadcasting_only() {
        let discovery = MulticastDiscovery::new(loopback_config(0), PeerStore::new());
        discovery.start_listening().await.unwrap();
        discovery.start_broadcasting().await.unwrap();

        discovery.set_stealth(true).await.unwrap();
        assert!(!discovery.is_broadcasting());
        assert!(discovery.is_listening());
        discovery.start_broadcasting().await.unwrap();
        assert!(!discovery.is_broadcasting());

        discovery.set_stealth(false).await.unwrap();
        assert!(discovery.is_broadcasting());
        discovery.stop_listening();
        assert!(!discovery.is_listening());
    }

    #[test]
    fn keybase_bio_carries_the_key() {
        let key = Keypair::generate().public_key();
        let body = serde_json::json!({
            "status": { "code": 0, "name": "OK" },
            "them": [{ "profile": { "bio": format!("polykey node\n{}\nbye", key.as_str()) } }],
        });
        assert_eq!(parse_lookup_response(&body).unwrap(), key);

        let missing = serde_json::json!({ "status": { "code": 205, "name": "NOT_FOUND" } });
        assert!(parse_lookup_response(&missing).is_err());

        let no_key = serde_json::json!({
            "status": { "code": 0 },
            "them": [{ "profile": { "bio": "just a bio" } }],
        });
        assert!(parse_lookup_response(&no_key).is_err());
    }

    struct Fixed {
        name: &'static str,
        result: Option<PublicKey>,
        delay: Duration,
    }

    #[async_trait]
    impl SocialProvider for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn find_user(&self, _handle: &str, _service: &str) -> Result<PublicKey> {
            tokio::time::sleep(self.delay).await;
            self.result.clone().ok_or_else(|| anyhow!("{} has no such user", self.name))
        }
    }

    #[tokio::test]
    async fn first_successful_provider_wins() {
        let store = PeerStore::new();
        let multicast = MulticastDiscovery::new(loopback_config(0), store.clone());
        let mut social = SocialDiscovery {
            providers: Vec::new(),
            multicast,
            peer_store: store,
        };
        let fast = Keypair::generate().public_key();
        social.add_provider(Arc::new(Fixed {
            name: "broken",
            result: None,
            delay: Duration::ZERO,
        }));
        social.add_provider(Arc::new(Fixed {
            name: "slow",
            result: Some(Keypair::generate().public_key()),
            delay: Duration::from_secs(5),
        }));
        social.add_provider(Arc::new(Fixed {
            name: "fast",
            result: Some(fast.clone()),
            delay: Duration::from_millis(10),
        }));
        assert_eq!(social.provider_names(), vec!["broken", "slow", "fast"]);
        assert_eq!(social.resolve("alice", "github").await.unwrap(), fast);
    }

    #[tokio::test]
    async fn social_user_must_show_up_on_multicast() {
        let store = PeerStore::new();
        let multicast = MulticastDiscovery::new(loopback_config(0), store.clone());
        let key = Keypair::generate().public_key();
        let social = SocialDiscovery {
            providers: vec![Arc::new(Fixed {
                name: "fixed",
                result: Some(key.clone()),
                delay: Duration::ZERO,
            })],
            multicast,
            peer_store: store.clone(),
        };
        let err = social
            .find_social_user("alice", "github", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(PeerError::is_timeout(&err));
        assert!(store.has_peer(&key));
    }
}
