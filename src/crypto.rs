//! Identity keys and per-connection key derivation.
//!
//! Long-term identities are Ed25519 signing keys (the 32-byte public key
//! carried in `ConnectionMetadata`). For transport encryption each keypair
//! is mapped to X25519: the secret side is the clamped head of
//! SHA-512(seed), the public side is the Edwards→Montgomery map. The ECDH
//! output is memoized per remote identity, and the per-connection key is
//! `SHA3-256(shared_secret ‖ nonce)` — deterministic, so both peers derive
//! the same key from the nonce agreed in the handshake.

use crate::types::{NONCE_SIZE, PUBLIC_KEY_SIZE};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest as _, Sha512};
use sha3::{Digest as _, Sha3_256};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// Key under which a connection's derived key is stored: `public_key ‖ nonce`.
pub type ConnKey = [u8; PUBLIC_KEY_SIZE + NONCE_SIZE];

pub fn conn_key(public_key: &[u8; PUBLIC_KEY_SIZE], nonce: &[u8; NONCE_SIZE]) -> ConnKey {
    let mut key = [0u8; PUBLIC_KEY_SIZE + NONCE_SIZE];
    key[..PUBLIC_KEY_SIZE].copy_from_slice(public_key);
    key[PUBLIC_KEY_SIZE..].copy_from_slice(nonce);
    key
}

/// Long-term node identity.
pub struct Keypair {
    signing: SigningKey,
    /// X25519 secret derived once from the Ed25519 seed.
    exchange: x25519_dalek::StaticSecret,
}

impl Keypair {
    pub fn generate() -> Self {
        Self::from_seed(SigningKey::generate(&mut OsRng).to_bytes())
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        // Standard Ed25519→X25519 secret conversion: head of SHA-512(seed).
        // Clamping happens inside the x25519 scalar multiplication.
        let hash = Sha512::digest(seed);
        let mut exchange_secret = [0u8; 32];
        exchange_secret.copy_from_slice(&hash[..32]);
        let exchange = x25519_dalek::StaticSecret::from(exchange_secret);
        Self { signing, exchange }
    }

    pub fn public(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing.verifying_key().to_bytes()
    }

    /// X25519 ECDH against a remote Ed25519 identity.
    pub fn shared_secret(&self, peer: &[u8; PUBLIC_KEY_SIZE]) -> Result<[u8; 32], CryptoError> {
        let verifying =
            VerifyingKey::from_bytes(peer).map_err(|_| CryptoError::InvalidPublicKey)?;
        let montgomery = verifying.to_montgomery();
        let peer_exchange = x25519_dalek::PublicKey::from(montgomery.to_bytes());
        Ok(*self.exchange.diffie_hellman(&peer_exchange).as_bytes())
    }
}

/// Process-local memoization of ECDH outputs, keyed by remote public key.
/// The scalar multiplication dominates handshake cost; repeated sessions to
/// the same Exit hit the cache.
#[derive(Default)]
pub struct SharedKeyCache {
    secrets: Mutex<HashMap<[u8; PUBLIC_KEY_SIZE], [u8; 32]>>,
}

impl SharedKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared_secret(
        &self,
        keypair: &Keypair,
        peer: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<[u8; 32], CryptoError> {
        if let Some(secret) = self.secrets.lock().unwrap().get(peer) {
            return Ok(*secret);
        }
        let secret = keypair.shared_secret(peer)?;
        self.secrets.lock().unwrap().insert(*peer, secret);
        Ok(secret)
    }
}

/// Per-connection symmetric key: `SHA3-256(shared_secret ‖ nonce)`.
pub fn session_key(shared_secret: &[u8; 32], nonce: &[u8; NONCE_SIZE]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(shared_secret);
    hasher.update(nonce);
    hasher.finalize().into()
}

/// Short hex identity for logs.
pub fn pubkey_fingerprint(pubkey: &[u8; PUBLIC_KEY_SIZE]) -> String {
    hex::encode(&pubkey[..8])
}
