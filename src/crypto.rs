//! # Cryptographic Infrastructure
//!
//! This module provides the cryptographic building blocks of the peer layer:
//!
//! - **Signatures**: Domain-separated Ed25519 signing and verification
//! - **Sealed boxes**: encrypt-for-recipient using an ephemeral X25519 key
//!   agreed against the recipient's Ed25519 key, ChaCha20-Poly1305 for the body
//! - **Key ring**: [`LocalKeyRing`], the in-process [`KeyRing`] implementation
//! - **Envelopes**: encrypt-then-sign wrapping of every peer message
//!
//! ## Envelope construction
//!
//! ```text
//! body ──bincode──▶ plaintext ──encrypt(recipient)──▶ sealed
//! signature = sign(PEER_MESSAGE_DOMAIN || kind || sealed)
//! ```
//!
//! The receiver verifies the signature against the claimed sender key first,
//! then decrypts with its own key, then checks the decoded body agrees with
//! the cleartext kind.
//!
//! ## Sealed box layout
//!
//! `ephemeral_x25519_public (32) || nonce (12) || ciphertext+tag`
//!
//! The symmetric key is `BLAKE3-derive_key(SEALED_BOX_CONTEXT, shared || epk || rpk)`.

use anyhow::{Context, Result, anyhow};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::Signature;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::PeerError;
use crate::identity::{Keypair, PublicKey};
use crate::messages::{self, PeerEnvelope, Tagged};
use crate::protocols::KeyRing;

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 key.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================
//
// Each signed data type uses a unique prefix so a signature produced for one
// purpose never verifies for another.

/// Domain separation prefix for peer envelope signatures.
pub const PEER_MESSAGE_DOMAIN: &[u8] = b"polykey-peer-message-v1:";

/// Domain separation prefix for multicast beacon signatures.
pub const BEACON_SIGNATURE_DOMAIN: &[u8] = b"polykey-multicast-beacon-v1:";

/// Domain separation prefix for UDP hole punch registrations.
pub const HOLE_PUNCH_SIGNATURE_DOMAIN: &[u8] = b"polykey-hole-punch-v1:";

/// BLAKE3 key-derivation context for sealed boxes.
const SEALED_BOX_CONTEXT: &str = "polykey 2024 sealed box v1";

const NONCE_LEN: usize = 12;
const SEALED_OVERHEAD: usize = 32 + NONCE_LEN + 16;

fn domain_prefixed(domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    prefixed
}

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

/// Sign `domain || data` with the key ring's key.
pub fn sign_with_domain(keyring: &dyn KeyRing, domain: &[u8], data: &[u8]) -> Vec<u8> {
    keyring.sign(&domain_prefixed(domain, data))
}

/// Verify a signature over `domain || data` against `signer`.
pub fn verify_with_domain(
    signer: &PublicKey,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> std::result::Result<(), SignatureError> {
    verify_raw(signer, &domain_prefixed(domain, data), signature)
}

fn verify_raw(
    signer: &PublicKey,
    data: &[u8],
    signature: &[u8],
) -> std::result::Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let verifying_key = signer
        .verifying_key()
        .map_err(|_| SignatureError::InvalidPublicKey)?;
    verifying_key
        .verify_strict(data, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Sealed boxes
// ============================================================================

fn x25519_public(key: &PublicKey) -> Result<X25519PublicKey> {
    let verifying_key = key.verifying_key().context("recipient key is not Ed25519")?;
    let edwards = CompressedEdwardsY::from_slice(verifying_key.as_bytes())
        .map_err(|_| anyhow!("public key invalid edwards point"))?
        .decompress()
        .ok_or_else(|| anyhow!("public key failed to decompress edwards point"))?;
    Ok(X25519PublicKey::from(edwards.to_montgomery().to_bytes()))
}

fn x25519_secret(keypair: &Keypair) -> StaticSecret {
    StaticSecret::from(keypair.signing_key().to_scalar_bytes())
}

fn derive_box_key(shared: &[u8; 32], ephemeral: &X25519PublicKey, recipient: &X25519PublicKey) -> [u8; 32] {
    let mut material = [0u8; 96];
    material[..32].copy_from_slice(shared);
    material[32..64].copy_from_slice(ephemeral.as_bytes());
    material[64..].copy_from_slice(recipient.as_bytes());
    blake3::derive_key(SEALED_BOX_CONTEXT, &material)
}

/// Encrypt `plaintext` so only the holder of `recipient`'s secret can read it.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let recipient_x = x25519_public(recipient)?;
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient_x);
    let key = derive_box_key(shared.as_bytes(), &ephemeral_public, &recipient_x);

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| anyhow!("encryption failed"))?;

    let mut out = Vec::with_capacity(SEALED_OVERHEAD + plaintext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a [`seal`]ed box addressed to `keypair`.
pub fn open(keypair: &Keypair, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < SEALED_OVERHEAD {
        anyhow::bail!("sealed box too short");
    }
    let (epk, rest) = sealed.split_at(32);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    let epk: [u8; 32] = epk.try_into().map_err(|_| anyhow!("bad ephemeral key"))?;
    let ephemeral_public = X25519PublicKey::from(epk);

    let secret = x25519_secret(keypair);
    let own_public = X25519PublicKey::from(&secret);
    let shared = secret.diffie_hellman(&ephemeral_public);
    let key = derive_box_key(shared.as_bytes(), &ephemeral_public, &own_public);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow!("decryption failed"))
}

// ============================================================================
// LocalKeyRing
// ============================================================================

/// [`KeyRing`] backed by an in-memory Ed25519 keypair.
pub struct LocalKeyRing {
    keypair: Keypair,
    public_key: PublicKey,
}

impl LocalKeyRing {
    pub fn new(keypair: Keypair) -> Self {
        let public_key = keypair.public_key();
        Self { keypair, public_key }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl std::fmt::Debug for LocalKeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeyRing")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl KeyRing for LocalKeyRing {
    fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.keypair.sign(data).to_bytes().to_vec()
    }

    fn verify(
        &self,
        data: &[u8],
        signature: &[u8],
        signer: &PublicKey,
    ) -> std::result::Result<(), SignatureError> {
        verify_raw(signer, data, signature)
    }

    fn encrypt(&self, data: &[u8], recipient: &PublicKey) -> Result<Vec<u8>> {
        seal(recipient, data)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        open(&self.keypair, data)
    }
}

// ============================================================================
// Peer envelopes
// ============================================================================

fn envelope_signed_bytes(kind_tag: u8, sealed: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(PEER_MESSAGE_DOMAIN.len() + 1 + sealed.len());
    bytes.extend_from_slice(PEER_MESSAGE_DOMAIN);
    bytes.push(kind_tag);
    bytes.extend_from_slice(sealed);
    bytes
}

/// Encrypt `body` for `recipient`, then sign the ciphertext as ourselves.
pub fn seal_envelope<T>(keyring: &dyn KeyRing, recipient: &PublicKey, body: &T) -> Result<PeerEnvelope>
where
    T: Tagged + serde::Serialize,
{
    let kind = body.kind();
    let plaintext = messages::serialize(body).context("failed to encode message body")?;
    let sealed = keyring.encrypt(&plaintext, recipient)?;
    let signature = keyring.sign(&envelope_signed_bytes(kind.tag_byte(), &sealed));
    Ok(PeerEnvelope {
        public_key: keyring.public_key().clone(),
        kind,
        sealed,
        signature,
    })
}

/// Verify the envelope against its claimed sender, then decrypt the body.
///
/// The caller decides whether the sender is acceptable; this only proves the
/// claimed key produced the envelope.
pub fn open_envelope<T>(keyring: &dyn KeyRing, envelope: &PeerEnvelope) -> Result<T>
where
    T: Tagged + DeserializeOwned,
{
    keyring
        .verify(
            &envelope_signed_bytes(envelope.kind.tag_byte(), &envelope.sealed),
            &envelope.signature,
            &envelope.public_key,
        )
        .context("envelope signature rejected")?;
    let plaintext = keyring.decrypt(&envelope.sealed)?;
    let body: T = messages::deserialize_bounded(&plaintext).context("malformed message body")?;
    if body.kind() != envelope.kind {
        return Err(PeerError::KindMismatch {
            expected: envelope.kind.as_str(),
            found: body.kind().as_str(),
        }
        .into());
    }
    Ok(body)
}
