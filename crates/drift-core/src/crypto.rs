//! Cryptographic primitives for Drift.
//!
//! Provides two things:
//!   1. X25519 key agreement, with the AES key taken as SHA-256 of the raw
//!      shared secret
//!   2. AES-256-GCM frame sealing under a 96-bit big-endian counter nonce
//!
//! Private keys and derived keys are zeroized when dropped.
//! There is no unsafe code in this module.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of an X25519 public or private key.
pub const KEY_LEN: usize = 32;

/// Length of an AES-GCM nonce.
pub const NONCE_LEN: usize = 12;

/// Length of the AES-GCM authentication tag appended to every frame.
pub const TAG_LEN: usize = 16;

// ── Keypair ───────────────────────────────────────────────────────────────────

/// An X25519 keypair.
///
/// The daemon holds one long-term keypair for the life of the process and
/// advertises its public half in the `pk` TXT record. Every outgoing
/// direction of a secure stream also generates a throwaway one.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    private: Zeroizing<[u8; KEY_LEN]>,
    pub public: [u8; KEY_LEN],
}

impl Keypair {
    /// Generate a new random keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Rebuild a keypair from private key bytes. The public key is derived.
    pub fn from_private(private_bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    /// Derive the symmetric key shared with the holder of `peer_public`.
    pub fn derive_key(&self, peer_public: &[u8; KEY_LEN]) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
        derive_key(&self.private, peer_public)
    }

    /// Lowercase hex of the public key, as carried in the `pk` TXT record.
    pub fn public_hex(&self) -> String {
        hex::encode(self.public)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// Generate a fresh keypair, returning `(private, public)`.
pub fn generate_keypair() -> (Zeroizing<[u8; KEY_LEN]>, [u8; KEY_LEN]) {
    let keypair = Keypair::generate();
    (Zeroizing::new(*keypair.private), keypair.public)
}

/// `SHA-256(X25519(private, peer_public))`.
///
/// Fails when the shared secret is all zeroes, which happens for low-order
/// peer points and would give every such peer the same key.
pub fn derive_key(
    private: &[u8; KEY_LEN],
    peer_public: &[u8; KEY_LEN],
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let secret = StaticSecret::from(*private);
    let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
    if !shared.was_contributory() {
        return Err(CryptoError::WeakSharedSecret);
    }
    let digest: [u8; KEY_LEN] = Sha256::digest(shared.as_bytes()).into();
    Ok(Zeroizing::new(digest))
}

/// Parse a 64-character hex string into a public key.
pub fn parse_public_key(hex_str: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let bytes = hex::decode(hex_str).map_err(|_| CryptoError::InvalidKeyEncoding)?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| CryptoError::InvalidKeyLength(v.len()))
}

// ── Nonces ────────────────────────────────────────────────────────────────────

/// Generate a random 12-byte initial nonce.
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// A 96-bit big-endian counter used as the AES-GCM nonce.
///
/// Incremented exactly once per sealed or opened frame. Wraps modulo 2^96.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceCounter([u8; NONCE_LEN]);

impl NonceCounter {
    pub fn new(initial: [u8; NONCE_LEN]) -> Self {
        Self(initial)
    }

    pub fn current(&self) -> [u8; NONCE_LEN] {
        self.0
    }

    pub fn increment(&mut self) {
        for byte in self.0.iter_mut().rev() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
    }
}

// ── Frame cipher ──────────────────────────────────────────────────────────────

/// One direction of a secure stream: an AES-256-GCM key plus its counter.
///
/// Each `seal`/`open` consumes the current nonce and advances it, so two
/// ciphers built from the same key and initial nonce stay in lockstep as
/// long as frames are processed in order.
pub struct FrameCipher {
    aead: Aes256Gcm,
    nonce: NonceCounter,
}

impl FrameCipher {
    pub fn new(key: &[u8; KEY_LEN], initial_nonce: [u8; NONCE_LEN]) -> Self {
        Self {
            aead: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            nonce: NonceCounter::new(initial_nonce),
        }
    }

    /// Encrypt one frame. Output is `plaintext.len() + TAG_LEN` bytes.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.nonce.current();
        let sealed = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::SealFailed)?;
        self.nonce.increment();
        Ok(sealed)
    }

    /// Decrypt and authenticate one frame.
    ///
    /// The nonce advances only on success; a failed open leaves the cipher
    /// unusable in practice because the stream is closed on any error.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.nonce.current();
        let opened = self
            .aead
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::OpenFailed)?;
        self.nonce.increment();
        Ok(opened)
    }

    pub fn nonce(&self) -> [u8; NONCE_LEN] {
        self.nonce.current()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("shared secret is all zeroes (low-order peer key)")]
    WeakSharedSecret,
    #[error("public key is not valid hex")]
    InvalidKeyEncoding,
    #[error("public key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("frame encryption failed")]
    SealFailed,
    #[error("frame authentication failed")]
    OpenFailed,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
