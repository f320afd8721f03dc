//! TCP handshake and encrypted session stream.
//!
//! A freshly dialed or accepted connection exchanges one length-prefixed
//! [`ConnectionMetadata`] each way under a 10-second deadline. The listener
//! role picks the 32-byte connection nonce; the dialer reuses it verbatim,
//! which also binds the UDP handshake for the same session. Once both
//! metadata frames are in, each side derives
//! `session_key = SHA3-256(x25519_shared ‖ nonce)` and, unless either side
//! selected [`Cipher::None`], wraps the socket in a [`SecureStream`].
//!
//! Completed keys are published to a [`SessionKeyRegistry`] under
//! `dialer_public_key ‖ nonce` so the UDP mux can wait for the TCP side
//! before installing a datagram codec.

use crate::crypto::{self, ConnKey, CryptoError, Keypair, SharedKeyCache, conn_key, session_key};
use crate::net::codec::{Codec, CodecError, TAG_SIZE};
use crate::types::{
    Cipher, ConnectionMetadata, HANDSHAKE_TIMEOUT, MAX_CONN_METADATA_SIZE, NONCE_SIZE,
    PUBLIC_KEY_SIZE,
};
use rand::RngCore;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tracing::debug;

/// Largest ciphertext frame on an encrypted stream.
const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Plaintext chunk per frame, leaving room for nonce and tag.
const FRAME_PAYLOAD: usize = MAX_FRAME_SIZE - 64;

/// Plaintext read size in pass-through mode.
const PLAIN_READ_SIZE: usize = 32 * 1024;

/// Window length for bandwidth measurement sampling.
const MEASURE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("handshake deadline exceeded")]
    Timeout,

    #[error("metadata too large: {0} > {1}")]
    MetadataTooLarge(usize, usize),

    #[error("metadata decode failed: {0}")]
    Decode(#[from] postcard::Error),

    #[error("public key size mismatch: {0}")]
    PublicKeySize(usize),

    #[error("public key mismatch")]
    PublicKeyMismatch,

    #[error("nonce size mismatch: {0}")]
    NonceSize(usize),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

// =============================================================================
// FRAMING
// =============================================================================
// `u32` little-endian length ‖ postcard bytes. The same framing carries
// ConnectionMetadata on the raw socket, StreamMetadata on mux streams, and
// ServiceMetadata refreshes; only the size cap differs.

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
    max: usize,
) -> Result<(), ProtoError> {
    if bytes.len() > max {
        return Err(ProtoError::MetadataTooLarge(bytes.len(), max));
    }
    writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max: usize,
) -> Result<Vec<u8>, ProtoError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > max {
        return Err(ProtoError::MetadataTooLarge(len, max));
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    Ok(bytes)
}

pub async fn write_metadata<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    value: &T,
    max: usize,
) -> Result<(), ProtoError> {
    let bytes = postcard::to_allocvec(value)?;
    write_frame(writer, &bytes, max).await
}

pub async fn read_metadata<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
    max: usize,
) -> Result<T, ProtoError> {
    let bytes = read_frame(reader, max).await?;
    Ok(postcard::from_bytes(&bytes)?)
}

// =============================================================================
// SESSION KEY REGISTRY
// =============================================================================

/// Completed-handshake keys indexed by `dialer_public_key ‖ nonce`.
///
/// The TCP handshake inserts; the UDP mux waits. This is the ordering
/// guarantee that no datagram is decrypted before the TCP side agreed on
/// the key.
#[derive(Default)]
pub struct SessionKeyRegistry {
    keys: Mutex<HashMap<ConnKey, [u8; 32]>>,
    notify: Notify,
}

impl SessionKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: ConnKey, session_key: [u8; 32]) {
        self.keys.lock().unwrap().insert(key, session_key);
        self.notify.notify_waiters();
    }

    pub fn get(&self, key: &ConnKey) -> Option<[u8; 32]> {
        self.keys.lock().unwrap().get(key).copied()
    }

    pub fn remove(&self, key: &ConnKey) {
        self.keys.lock().unwrap().remove(key);
    }

    /// Block until the key shows up or the timeout passes.
    pub async fn wait(&self, key: &ConnKey, timeout: Duration) -> Option<[u8; 32]> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(k) = self.get(key) {
                return Some(k);
            }
            let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return None;
            }
        }
    }
}

// =============================================================================
// HANDSHAKE
// =============================================================================

/// Which side of the metadata exchange we are. The listener picks the
/// nonce; reverse-mode tunnels swap who dials without touching this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dialer,
    Listener,
}

/// Inputs to one handshake.
pub struct HandshakeOptions {
    pub keypair: Arc<Keypair>,
    pub shared_keys: Arc<SharedKeyCache>,
    pub cipher: Cipher,
    /// Reject the peer unless it presents exactly this identity.
    pub expected_peer: Option<[u8; PUBLIC_KEY_SIZE]>,
    pub is_measurement: bool,
    pub measurement_bytes_downlink: u64,
}

/// A completed handshake: the (possibly pass-through) stream plus the
/// agreed key material.
pub struct Session<S> {
    pub stream: SecureStream<S>,
    pub peer_public: [u8; PUBLIC_KEY_SIZE],
    pub nonce: [u8; NONCE_SIZE],
    pub cipher: Cipher,
    /// Registry key: `dialer_public_key ‖ nonce`.
    pub conn_key: ConnKey,
    /// Peer's metadata as received, for measurement flags.
    pub peer_metadata: ConnectionMetadata,
}

/// Effective cipher for a connection: `None` wins, otherwise the dialer's
/// choice. Both sides compute this locally from the two metadata frames.
pub fn negotiate(dialer: Cipher, listener: Cipher) -> Cipher {
    if dialer == Cipher::None || listener == Cipher::None {
        Cipher::None
    } else {
        dialer
    }
}

/// Run the metadata exchange on a fresh connection.
///
/// Both sides write their frame first, then read the peer's; frames are
/// small enough that socket buffering makes this deadlock-free. The whole
/// exchange sits under [`HANDSHAKE_TIMEOUT`].
pub async fn handshake<S>(
    stream: S,
    role: Role,
    options: &HandshakeOptions,
    registry: &SessionKeyRegistry,
) -> Result<Session<S>, ProtoError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange(stream, role, options)).await {
        Ok(result) => {
            let (session, key) = result?;
            registry.insert(session.conn_key, key);
            Ok(session)
        }
        Err(_) => Err(ProtoError::Timeout),
    }
}

async fn exchange<S>(
    mut stream: S,
    role: Role,
    options: &HandshakeOptions,
) -> Result<(Session<S>, [u8; 32]), ProtoError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut our_nonce = [0u8; NONCE_SIZE];
    let mut metadata = ConnectionMetadata {
        public_key: options.keypair.public().to_vec(),
        nonce: Vec::new(),
        cipher: options.cipher,
        is_measurement: options.is_measurement,
        measurement_bytes_downlink: options.measurement_bytes_downlink,
        is_ping: false,
    };
    if role == Role::Listener {
        rand::thread_rng().fill_bytes(&mut our_nonce);
        metadata.nonce = our_nonce.to_vec();
    }

    write_metadata(&mut stream, &metadata, MAX_CONN_METADATA_SIZE).await?;
    let peer: ConnectionMetadata = read_metadata(&mut stream, MAX_CONN_METADATA_SIZE).await?;

    if peer.public_key.len() != PUBLIC_KEY_SIZE {
        return Err(ProtoError::PublicKeySize(peer.public_key.len()));
    }
    let mut peer_public = [0u8; PUBLIC_KEY_SIZE];
    peer_public.copy_from_slice(&peer.public_key);

    if let Some(expected) = options.expected_peer
        && expected != peer_public
    {
        return Err(ProtoError::PublicKeyMismatch);
    }

    // The listener's nonce is authoritative; the dialer adopts it.
    let nonce = match role {
        Role::Listener => our_nonce,
        Role::Dialer => {
            if peer.nonce.len() != NONCE_SIZE {
                return Err(ProtoError::NonceSize(peer.nonce.len()));
            }
            let mut nonce = [0u8; NONCE_SIZE];
            nonce.copy_from_slice(&peer.nonce);
            nonce
        }
    };

    let cipher = match role {
        Role::Dialer => negotiate(options.cipher, peer.cipher),
        Role::Listener => negotiate(peer.cipher, options.cipher),
    };

    let shared = options.shared_keys.shared_secret(&options.keypair, &peer_public)?;
    let key = session_key(&shared, &nonce);

    let dialer_public = match role {
        Role::Dialer => options.keypair.public(),
        Role::Listener => peer_public,
    };
    let conn_key = conn_key(&dialer_public, &nonce);

    debug!(
        peer = %crypto::pubkey_fingerprint(&peer_public),
        ?cipher,
        "handshake complete"
    );

    let session = Session {
        stream: SecureStream::new(stream, Codec::new(cipher, &key)),
        peer_public,
        nonce,
        cipher,
        conn_key,
        peer_metadata: peer,
    };
    Ok((session, key))
}

// =============================================================================
// SECURE STREAM
// =============================================================================

/// Message-oriented wrapper over a connection.
///
/// In pass-through mode (`Cipher::None`) reads and writes touch the socket
/// directly; otherwise each message travels as
/// `u32 length ‖ nonce ‖ ciphertext ‖ tag`, chunked at [`MAX_FRAME_SIZE`].
pub struct SecureStream<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    codec: Codec,
}

impl<S> SecureStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, codec: Codec) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self { reader, writer, codec }
    }

    pub fn cipher(&self) -> Cipher {
        self.codec.kind()
    }

    pub async fn write_message(&mut self, data: &[u8]) -> Result<(), ProtoError> {
        write_chunks(&mut self.writer, &self.codec, data).await
    }

    /// Read the next message. An empty result means clean EOF.
    pub async fn read_message(&mut self) -> Result<Vec<u8>, ProtoError> {
        read_chunk(&mut self.reader, &self.codec).await
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtoError> {
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Split into independently owned halves. The codec is stateless per
    /// message, so each half keeps its own clone.
    pub fn split(self) -> (SecureReader<S>, SecureWriter<S>) {
        (
            SecureReader { reader: self.reader, codec: self.codec.clone() },
            SecureWriter { writer: self.writer, codec: self.codec },
        )
    }
}

pub struct SecureReader<S> {
    reader: ReadHalf<S>,
    codec: Codec,
}

impl<S: AsyncRead + Unpin> SecureReader<S> {
    pub async fn read_message(&mut self) -> Result<Vec<u8>, ProtoError> {
        read_chunk(&mut self.reader, &self.codec).await
    }
}

pub struct SecureWriter<S> {
    writer: WriteHalf<S>,
    codec: Codec,
}

impl<S: AsyncWrite + Unpin> SecureWriter<S> {
    pub async fn write_message(&mut self, data: &[u8]) -> Result<(), ProtoError> {
        write_chunks(&mut self.writer, &self.codec, data).await
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtoError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

async fn write_chunks<W: AsyncWrite + Unpin>(
    writer: &mut W,
    codec: &Codec,
    data: &[u8],
) -> Result<(), ProtoError> {
    if codec.is_plaintext() {
        writer.write_all(data).await?;
        writer.flush().await?;
        return Ok(());
    }
    for chunk in data.chunks(FRAME_PAYLOAD) {
        let sealed = codec.seal(chunk)?;
        writer.write_all(&(sealed.len() as u32).to_le_bytes()).await?;
        writer.write_all(&sealed).await?;
    }
    writer.flush().await?;
    Ok(())
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    codec: &Codec,
) -> Result<Vec<u8>, ProtoError> {
    if codec.is_plaintext() {
        let mut buf = vec![0u8; PLAIN_READ_SIZE];
        let n = reader.read(&mut buf).await?;
        buf.truncate(n);
        return Ok(buf);
    }
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE || len < TAG_SIZE {
        return Err(ProtoError::MetadataTooLarge(len, MAX_FRAME_SIZE));
    }
    let mut sealed = vec![0u8; len];
    reader.read_exact(&mut sealed).await?;
    Ok(codec.open(&sealed)?)
}

// =============================================================================
// MEASUREMENT MODE
// =============================================================================

/// Listener side of a bandwidth probe: stream exactly `total` random bytes
/// and shut the connection down.
pub async fn send_measurement_payload<S>(
    stream: &mut SecureStream<S>,
    total: u64,
) -> Result<(), ProtoError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut remaining = total;
    let mut chunk = vec![0u8; FRAME_PAYLOAD.min(total as usize).max(1)];
    while remaining > 0 {
        let n = chunk.len().min(remaining as usize);
        rand::thread_rng().fill_bytes(&mut chunk[..n]);
        stream.write_message(&chunk[..n]).await?;
        remaining -= n as u64;
    }
    stream.shutdown().await
}

/// Dialer side of a bandwidth probe: read `total` bytes, sampling
/// throughput per [`MEASURE_WINDOW`]. Returns (min, max) KB/s over the
/// completed windows, falling back to the overall average for short runs.
pub async fn measure_download<S>(
    stream: &mut SecureStream<S>,
    total: u64,
) -> Result<(u64, u64), ProtoError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = tokio::time::Instant::now();
    let mut window_started = started;
    let mut window_bytes: u64 = 0;
    let mut received: u64 = 0;
    let mut min_kbps = u64::MAX;
    let mut max_kbps = 0u64;

    while received < total {
        let chunk = stream.read_message().await?;
        if chunk.is_empty() {
            return Err(ProtoError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "measurement stream closed early",
            )));
        }
        received += chunk.len() as u64;
        window_bytes += chunk.len() as u64;

        let elapsed = window_started.elapsed();
        if elapsed >= MEASURE_WINDOW {
            let kbps = window_bytes * 1000 / (elapsed.as_millis().max(1) as u64) / 1024;
            min_kbps = min_kbps.min(kbps);
            max_kbps = max_kbps.max(kbps);
            window_started = tokio::time::Instant::now();
            window_bytes = 0;
        }
    }

    if max_kbps == 0 {
        // Transfer finished inside one window; one sample is all we have.
        let elapsed = started.elapsed().as_millis().max(1) as u64;
        let kbps = received * 1000 / elapsed / 1024;
        return Ok((kbps, kbps));
    }
    Ok((min_kbps, max_kbps))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    fn options(keypair: Arc<Keypair>, cipher: Cipher) -> HandshakeOptions {
        HandshakeOptions {
            keypair,
            shared_keys: Arc::new(SharedKeyCache::new()),
            cipher,
            expected_peer: None,
            is_measurement: false,
            measurement_bytes_downlink: 0,
        }
    }

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dial = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        (dial.await.unwrap(), accepted)
    }

    #[tokio::test]
    async fn test_handshake_roundtrip() {
        let (client_stream, server_stream) = loopback_pair().await;
        let client_keys = Arc::new(Keypair::generate());
        let server_keys = Arc::new(Keypair::generate());
        let client_registry = Arc::new(SessionKeyRegistry::new());
        let server_registry = Arc::new(SessionKeyRegistry::new());

        let server_opts = options(server_keys.clone(), Cipher::XChaCha20Poly1305);
        let server_reg = server_registry.clone();
        let server = tokio::spawn(async move {
            let mut session =
                handshake(server_stream, Role::Listener, &server_opts, &server_reg)
                    .await
                    .unwrap();
            let msg = session.stream.read_message().await.unwrap();
            assert_eq!(msg, b"hello from entry");
            session.stream.write_message(b"hello from exit").await.unwrap();
            session
        });

        let client_opts = options(client_keys.clone(), Cipher::XChaCha20Poly1305);
        let mut session =
            handshake(client_stream, Role::Dialer, &client_opts, &client_registry)
                .await
                .unwrap();
        assert_eq!(session.cipher, Cipher::XChaCha20Poly1305);
        assert_eq!(session.peer_public, server_keys.public());

        session.stream.write_message(b"hello from entry").await.unwrap();
        let reply = session.stream.read_message().await.unwrap();
        assert_eq!(reply, b"hello from exit");

        let server_session = server.await.unwrap();
        // Same nonce, same registry key, same derived session key.
        assert_eq!(session.nonce, server_session.nonce);
        assert_eq!(session.conn_key, server_session.conn_key);
        assert_eq!(
            client_registry.get(&session.conn_key),
            server_registry.get(&server_session.conn_key)
        );
    }

    #[tokio::test]
    async fn test_public_key_mismatch_aborts() {
        let (client_stream, server_stream) = loopback_pair().await;
        let server_keys = Arc::new(Keypair::generate());
        let registry = SessionKeyRegistry::new();

        let server_opts = options(server_keys, Cipher::None);
        let server = tokio::spawn(async move {
            let registry = SessionKeyRegistry::new();
            let _ = handshake(server_stream, Role::Listener, &server_opts, &registry).await;
        });

        let mut client_opts = options(Arc::new(Keypair::generate()), Cipher::None);
        // Pin a key the server does not hold.
        client_opts.expected_peer = Some(Keypair::generate().public());
        let err = handshake(client_stream, Role::Dialer, &client_opts, &registry)
            .await
            .err()
            .expect("handshake must fail");
        assert!(matches!(err, ProtoError::PublicKeyMismatch));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_none_cipher_passthrough() {
        let (client_stream, server_stream) = loopback_pair().await;
        let registry = Arc::new(SessionKeyRegistry::new());

        let server_opts = options(Arc::new(Keypair::generate()), Cipher::None);
        let reg = registry.clone();
        let server = tokio::spawn(async move {
            let mut session =
                handshake(server_stream, Role::Listener, &server_opts, &reg).await.unwrap();
            // Either side asking for no encryption downgrades the session.
            assert_eq!(session.cipher, Cipher::None);
            let msg = session.stream.read_message().await.unwrap();
            session.stream.write_message(&msg).await.unwrap();
        });

        let client_opts = options(Arc::new(Keypair::generate()), Cipher::Aes256Gcm);
        let mut session =
            handshake(client_stream, Role::Dialer, &client_opts, &registry).await.unwrap();
        assert_eq!(session.cipher, Cipher::None);
        session.stream.write_message(b"plain bytes").await.unwrap();
        assert_eq!(session.stream.read_message().await.unwrap(), b"plain bytes");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_measurement_download() {
        let (client_stream, server_stream) = loopback_pair().await;
        let registry = Arc::new(SessionKeyRegistry::new());
        let total: u64 = 128 * 1024;

        let mut server_opts = options(Arc::new(Keypair::generate()), Cipher::XChaCha20Poly1305);
        server_opts.is_measurement = true;
        let reg = registry.clone();
        let server = tokio::spawn(async move {
            let mut session =
                handshake(server_stream, Role::Listener, &server_opts, &reg).await.unwrap();
            let requested = session.peer_metadata.measurement_bytes_downlink;
            send_measurement_payload(&mut session.stream, requested).await.unwrap();
        });

        let mut client_opts = options(Arc::new(Keypair::generate()), Cipher::XChaCha20Poly1305);
        client_opts.is_measurement = true;
        client_opts.measurement_bytes_downlink = total;
        let mut session =
            handshake(client_stream, Role::Dialer, &client_opts, &registry).await.unwrap();
        let (min_kbps, max_kbps) = measure_download(&mut session.stream, total).await.unwrap();
        assert!(min_kbps > 0);
        assert!(max_kbps >= min_kbps);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_wait() {
        let registry = Arc::new(SessionKeyRegistry::new());
        let key = conn_key(&[1u8; 32], &[2u8; 32]);

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait(&key, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.insert(key, [9u8; 32]);
        assert_eq!(waiter.await.unwrap(), Some([9u8; 32]));

        // Missing key times out rather than hanging.
        let other = conn_key(&[3u8; 32], &[4u8; 32]);
        assert_eq!(registry.wait(&other, Duration::from_millis(50)).await, None);
    }

    #[tokio::test]
    async fn test_oversized_metadata_rejected() {
        let mut buf = Vec::new();
        let oversized = vec![0u8; MAX_CONN_METADATA_SIZE + 1];
        let err = write_frame(&mut buf, &oversized, MAX_CONN_METADATA_SIZE).await.err();
        assert!(matches!(err, Some(ProtoError::MetadataTooLarge(_, _))));

        // A hostile length prefix is rejected before allocation.
        let mut hostile = Vec::new();
        hostile.extend_from_slice(&(u32::MAX).to_le_bytes());
        let err = read_frame(&mut hostile.as_slice(), MAX_CONN_METADATA_SIZE).await.err();
        assert!(matches!(err, Some(ProtoError::MetadataTooLarge(_, _))));
    }
}
