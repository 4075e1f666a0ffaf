//! # Identity and Addressing Primitives
//!
//! This module defines the identity types every other layer keys on:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`PublicKey`]: a peer's long-form identifier, the normalized PEM armor block
//! - [`NodeId`]: fixed-width 32-byte routing identifier derived from a [`PublicKey`]
//! - [`Address`]: a `host:port` endpoint with a fixed text grammar
//!
//! ## Identity Model
//!
//! Peers are named by their public key text. Two key blobs that differ only in
//! surrounding junk or line endings name the same peer, so every `PublicKey`
//! is stored in normalized form: the `-----BEGIN ...-----` to `-----END ...-----`
//! block, LF line endings, nothing else.
//!
//! Routing needs fixed-width ids, so the node graph works on
//! `NodeId = BLAKE3(normalized key text)`.
//!
//! ## Invariants
//!
//! - `PublicKey::parse(a) == PublicKey::parse(b)` iff the armor blocks match
//! - `Address::from_str(&addr.to_string()) == Ok(addr)` for every parsed address
//! - `a.xor_distance(b) == b.xor_distance(a)` and `a.xor_distance(a) == [0; 32]`

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Address
// ============================================================================

/// `host:port` grammar. The host is a dotted quad, a DNS-safe hostname, or a
/// bracketed IPv6 literal.
static ADDRESS_GRAMMAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^(?:\[(?P<v6>[0-9A-Fa-f:.]+)\]",
        r"|(?P<host>(?:[0-9]{1,3}\.){3}[0-9]{1,3}",
        r"|[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*))",
        r":(?P<port>[0-9]{1,5})$"
    ))
    .expect("address grammar is a valid regex")
});

const LOCALHOST: &str = "localhost";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("'{0}' is not a host:port address")]
    Malformed(String),
    #[error("port {0} is out of range")]
    PortOutOfRange(String),
}

/// Network endpoint of a peer. Travels as its `host:port` text, so anything
/// decoded off the wire has passed the grammar.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    /// Build an address from a host that is already known to be well formed,
    /// folding unspecified hosts (`0.0.0.0`, `::`) into `localhost`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = if is_unspecified(&host) { LOCALHOST.to_string() } else { host };
        Self { host, port }
    }

    /// Build an address from an untrusted host, checking it against the grammar.
    pub fn with_host(host: &str, port: u16) -> Result<Self, AddressError> {
        if host.contains(':') {
            format!("[{}]:{}", host, port).parse()
        } else {
            format!("{}:{}", host, port).parse()
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V6(v6)),
            ip => ip,
        };
        Self::new(ip.to_string(), addr.port())
    }

    /// Resolve to a socket address, preferring IPv4 when the host has both.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("failed to resolve {}", self))?
            .collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .with_context(|| format!("{} resolved to no addresses", self))
    }
}

fn is_unspecified(host: &str) -> bool {
    host.parse::<IpAddr>().map(|ip| ip.is_unspecified()).unwrap_or(false)
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = ADDRESS_GRAMMAR
            .captures(s.trim())
            .ok_or_else(|| AddressError::Malformed(s.to_string()))?;
        let port_text = &caps["port"];
        let port = port_text
            .parse::<u16>()
            .map_err(|_| AddressError::PortOutOfRange(port_text.to_string()))?;
        let host = match (caps.name("v6"), caps.name("host")) {
            (Some(v6), _) => {
                v6.as_str()
                    .parse::<std::net::Ipv6Addr>()
                    .map_err(|_| AddressError::Malformed(s.to_string()))?;
                v6.as_str()
            }
            (None, Some(host)) => host.as_str(),
            (None, None) => return Err(AddressError::Malformed(s.to_string())),
        };
        Ok(Address::new(host, port))
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        text.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

// ============================================================================
// PublicKey
// ============================================================================

/// DER prefix of an Ed25519 SubjectPublicKeyInfo (RFC 8410).
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

const PUBLIC_KEY_TAG: &str = "PUBLIC KEY";
const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyFormatError {
    #[error("no -----BEGIN/-----END armor block found")]
    NoArmor,
    #[error("armor block is not an Ed25519 public key")]
    NotEd25519,
}

/// A peer's public key in normalized armor form.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey(String);

impl PublicKey {
    /// Normalize arbitrary key text down to its armor block.
    pub fn parse(text: &str) -> Result<Self, KeyFormatError> {
        let text = text.replace("\r\n", "\n");
        let start = text.find("-----BEGIN ").ok_or(KeyFormatError::NoArmor)?;
        let end_marker = text[start..]
            .find("-----END ")
            .map(|i| start + i)
            .ok_or(KeyFormatError::NoArmor)?;
        let label_start = end_marker + "-----END ".len();
        let close = text[label_start..]
            .find("-----")
            .map(|i| label_start + i + "-----".len())
            .ok_or(KeyFormatError::NoArmor)?;

        let block: Vec<&str> = text[start..close].lines().map(str::trim).collect();
        Ok(Self(block.join("\n")))
    }

    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let mut der = Vec::with_capacity(ED25519_SPKI_PREFIX.len() + 32);
        der.extend_from_slice(&ED25519_SPKI_PREFIX);
        der.extend_from_slice(key.as_bytes());
        let armored = pem::encode(&pem::Pem::new(PUBLIC_KEY_TAG, der));
        // pem always emits a well-formed block
        Self::parse(&armored).unwrap_or_else(|_| Self(armored))
    }

    /// Decode the Ed25519 key carried by the armor block.
    pub fn verifying_key(&self) -> Result<VerifyingKey, KeyFormatError> {
        let block = pem::parse(&self.0).map_err(|_| KeyFormatError::NotEd25519)?;
        if block.tag() != PUBLIC_KEY_TAG {
            return Err(KeyFormatError::NotEd25519);
        }
        let contents = block.contents();
        let raw = match contents.len() {
            44 if contents[..12] == ED25519_SPKI_PREFIX => &contents[12..],
            32 => contents,
            _ => return Err(KeyFormatError::NotEd25519),
        };
        let bytes: [u8; 32] = raw.try_into().map_err(|_| KeyFormatError::NotEd25519)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyFormatError::NotEd25519)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(self)
    }

    /// Short fingerprint for log lines.
    pub fn short(&self) -> String {
        self.node_id().to_hex()[..16].to_string()
    }
}

impl TryFrom<String> for PublicKey {
    type Error = KeyFormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.0
    }
}

impl FromStr for PublicKey {
    type Err = KeyFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// NodeId
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_public_key(key: &PublicKey) -> Self {
        Self(*blake3::hash(key.as_str().as_bytes()).as_bytes())
    }

    pub fn random() -> Self {
        Self(rand::random::<[u8; 32]>())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// `floor(log2(distance(self, other)))`, or `None` when the ids are equal.
    #[inline]
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        log2_floor(&self.xor_distance(other))
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

/// Position of the highest set bit of a big-endian 256-bit integer.
#[inline]
pub fn log2_floor(distance: &[u8; 32]) -> Option<usize> {
    distance
        .iter()
        .enumerate()
        .find(|(_, byte)| **byte != 0)
        .map(|(idx, byte)| 255 - (idx * 8 + byte.leading_zeros() as usize))
}

/// Compare two XOR distances as big-endian unsigned integers.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.cmp(b)
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ============================================================================
// Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_verifying_key(&self.verifying_key())
    }

    pub fn node_id(&self) -> NodeId {
        self.public_key().node_id()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }

    /// Armor the secret key for storage on disk.
    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new(PRIVATE_KEY_TAG, self.secret_key_bytes().to_vec()))
    }

    pub fn from_pem(text: &str) -> Result<Self> {
        let block = pem::parse(text).context("failed to parse PEM")?;
        if block.tag() != PRIVATE_KEY_TAG {
            anyhow::bail!("expected PRIVATE KEY block, found {}", block.tag());
        }
        let bytes: [u8; 32] = block
            .contents()
            .try_into()
            .map_err(|_| anyhow::anyhow!("private key must be 32 bytes"))?;
        Ok(Self::from_secret_key_bytes(&bytes))
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key().short())
            .finish_non_exhaustive()
    }
}
