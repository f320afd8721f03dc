//! Symmetric message encryption for the TCP and UDP transports.
//!
//! One [`Codec`] per connection (or per UDP remote), keyed by the derived
//! session key. Every sealed message carries its own freshly generated
//! nonce, so UDP datagrams survive reordering and loss without any codec
//! state — decryption needs only the key and the received bytes.

use crate::types::Cipher;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit as _};
use chacha20poly1305::XChaCha20Poly1305;
use rand::RngCore;
use thiserror::Error;

/// AEAD tag length, identical for both supported ciphers.
pub const TAG_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce length.
const XCHACHA_NONCE_SIZE: usize = 24;

/// AES-256-GCM nonce length.
const GCM_NONCE_SIZE: usize = 12;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("encryption failed")]
    Seal,
    #[error("decryption failed")]
    Open,
    #[error("ciphertext too short: {0} bytes")]
    TooShort(usize),
}

enum Inner {
    Plain,
    XChaCha(Box<XChaCha20Poly1305>),
    Aes(Box<Aes256Gcm>),
}

impl Clone for Inner {
    fn clone(&self) -> Self {
        match self {
            Inner::Plain => Inner::Plain,
            Inner::XChaCha(c) => Inner::XChaCha(c.clone()),
            Inner::Aes(c) => Inner::Aes(c.clone()),
        }
    }
}

/// Whole-message seal/open under one session key.
#[derive(Clone)]
pub struct Codec {
    kind: Cipher,
    inner: Inner,
}

impl Codec {
    pub fn new(kind: Cipher, key: &[u8; 32]) -> Self {
        let inner = match kind {
            Cipher::None => Inner::Plain,
            Cipher::XChaCha20Poly1305 => {
                Inner::XChaCha(Box::new(XChaCha20Poly1305::new(key.into())))
            }
            Cipher::Aes256Gcm => Inner::Aes(Box::new(Aes256Gcm::new(key.into()))),
        };
        Self { kind, inner }
    }

    pub fn kind(&self) -> Cipher {
        self.kind
    }

    /// True when this codec passes bytes through unmodified.
    pub fn is_plaintext(&self) -> bool {
        matches!(self.inner, Inner::Plain)
    }

    /// Worst-case growth of a sealed message over its plaintext.
    pub fn overhead(&self) -> usize {
        match self.inner {
            Inner::Plain => 0,
            Inner::XChaCha(_) => XCHACHA_NONCE_SIZE + TAG_SIZE,
            Inner::Aes(_) => GCM_NONCE_SIZE + TAG_SIZE,
        }
    }

    /// Encrypt one message: `random nonce ‖ ciphertext ‖ tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        match &self.inner {
            Inner::Plain => Ok(plaintext.to_vec()),
            Inner::XChaCha(cipher) => {
                let mut nonce = [0u8; XCHACHA_NONCE_SIZE];
                rand::thread_rng().fill_bytes(&mut nonce);
                let ct = cipher
                    .encrypt(chacha20poly1305::XNonce::from_slice(&nonce), plaintext)
                    .map_err(|_| CodecError::Seal)?;
                let mut out = Vec::with_capacity(XCHACHA_NONCE_SIZE + ct.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&ct);
                Ok(out)
            }
            Inner::Aes(cipher) => {
                let mut nonce = [0u8; GCM_NONCE_SIZE];
                rand::thread_rng().fill_bytes(&mut nonce);
                let ct = cipher
                    .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
                    .map_err(|_| CodecError::Seal)?;
                let mut out = Vec::with_capacity(GCM_NONCE_SIZE + ct.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&ct);
                Ok(out)
            }
        }
    }

    /// Decrypt one sealed message produced by [`seal`](Self::seal).
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CodecError> {
        match &self.inner {
            Inner::Plain => Ok(sealed.to_vec()),
            Inner::XChaCha(cipher) => {
                if sealed.len() < XCHACHA_NONCE_SIZE + TAG_SIZE {
                    return Err(CodecError::TooShort(sealed.len()));
                }
                let (nonce, ct) = sealed.split_at(XCHACHA_NONCE_SIZE);
                cipher
                    .decrypt(chacha20poly1305::XNonce::from_slice(nonce), ct)
                    .map_err(|_| CodecError::Open)
            }
            Inner::Aes(cipher) => {
                if sealed.len() < GCM_NONCE_SIZE + TAG_SIZE {
                    return Err(CodecError::TooShort(sealed.len()));
                }
                let (nonce, ct) = sealed.split_at(GCM_NONCE_SIZE);
                cipher
                    .decrypt(aes_gcm::Nonce::from_slice(nonce), ct)
                    .map_err(|_| CodecError::Open)
            }
        }
    }
}
