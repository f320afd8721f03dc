//! UDP datagram mux: one socket, many encrypted remotes.
//!
//! Every remote address maps to its own [`Codec`]. Incoming datagrams are
//! demultiplexed by a fixed prefix rule: a datagram whose first
//! [`UDP_PREFIX_LEN`] bytes are all zero is a control datagram carrying
//! [`ConnectionMetadata`]; anything else must decrypt under the codec
//! installed for its source address or it is dropped. User payload framing
//! guarantees a non-zero first byte, so the two can never collide.
//!
//! Codec installation on the listener side is gated on the
//! [`SessionKeyRegistry`]: the TCP handshake for the same
//! `public_key ‖ nonce` must have completed first. A UDP handshake racing
//! ahead of its TCP twin parks on the registry and no datagram is
//! decrypted before the key exists.

use crate::crypto::conn_key;
use crate::net::codec::Codec;
use crate::net::conn::{Role, SessionKeyRegistry, negotiate};
use crate::types::{
    Cipher, ConnectionMetadata, HANDSHAKE_TIMEOUT, MAX_CONN_METADATA_SIZE, MAX_UDP_BUFFER_SIZE,
    NONCE_SIZE, PUBLIC_KEY_SIZE, TrafficCounters, UDP_CHANNEL_DEPTH, UDP_CHANNEL_OFFSET,
    UDP_HANDSHAKE_COPIES, UDP_PREFIX_LEN,
};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A decrypted user datagram and the remote it came from.
pub type Datagram = (Vec<u8>, SocketAddr);

/// Outbound user datagram; `None` targets the last remote that sent to us
/// (the listener replying to its current peer).
type Outbound = (Vec<u8>, Option<SocketAddr>);

struct MuxShared {
    socket: Arc<UdpSocket>,
    role: Role,
    /// Our configured cipher, for negotiating against the metadata of an
    /// incoming UDP handshake.
    cipher: Cipher,
    registry: Arc<SessionKeyRegistry>,
    counters: Arc<TrafficCounters>,
    codecs: RwLock<HashMap<SocketAddr, Codec>>,
    /// Last remote that sent us a decryptable datagram.
    default_remote: Mutex<Option<SocketAddr>>,
    /// Reverse-tunnel accounting: payload byte at [`UDP_CHANNEL_OFFSET`]
    /// selects the sub-channel.
    channel_bytes: Mutex<HashMap<u8, u64>>,
    write_tx: mpsc::Sender<Outbound>,
    close: CancellationToken,
}

/// UDP half of a tunnel session.
pub struct UdpMux {
    shared: Arc<MuxShared>,
    read_rx: tokio::sync::Mutex<mpsc::Receiver<Datagram>>,
}

impl UdpMux {
    pub fn new(
        socket: UdpSocket,
        role: Role,
        cipher: Cipher,
        registry: Arc<SessionKeyRegistry>,
        counters: Arc<TrafficCounters>,
        close: CancellationToken,
    ) -> Self {
        let socket = Arc::new(socket);
        let (read_tx, read_rx) = mpsc::channel(UDP_CHANNEL_DEPTH);
        let (write_tx, write_rx) = mpsc::channel(UDP_CHANNEL_DEPTH);

        let shared = Arc::new(MuxShared {
            socket,
            role,
            cipher,
            registry,
            counters,
            codecs: RwLock::new(HashMap::new()),
            default_remote: Mutex::new(None),
            channel_bytes: Mutex::new(HashMap::new()),
            write_tx,
            close,
        });

        tokio::spawn(read_loop(shared.clone(), read_tx));
        tokio::spawn(write_loop(shared.clone(), write_rx));

        Self { shared, read_rx: tokio::sync::Mutex::new(read_rx) }
    }

    /// Next decrypted user datagram; `None` once the mux is closed.
    pub async fn recv(&self) -> Option<Datagram> {
        self.read_rx.lock().await.recv().await
    }

    /// Queue a user datagram for encryption and send. Payload framing must
    /// keep the first byte non-zero; the all-zero prefix is reserved for
    /// control datagrams.
    pub async fn send(&self, payload: Vec<u8>, to: Option<SocketAddr>) -> io::Result<()> {
        debug_assert!(payload.first().is_some_and(|b| *b != 0));
        self.shared
            .write_tx
            .send((payload, to))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "udp mux closed"))
    }

    /// Install the codec for a remote directly. The dialer side does this
    /// right after its TCP handshake; it already holds the key.
    pub fn install_codec(&self, remote: SocketAddr, codec: Codec) {
        self.shared.codecs.write().unwrap().insert(remote, codec);
    }

    pub fn has_codec(&self, remote: &SocketAddr) -> bool {
        self.shared.codecs.read().unwrap().contains_key(remote)
    }

    /// Send the plaintext UDP handshake: `UDP_PREFIX_LEN` zero bytes then
    /// the conn-metadata, repeated [`UDP_HANDSHAKE_COPIES`] times against
    /// loss.
    pub async fn send_conn_metadata(
        &self,
        metadata: &ConnectionMetadata,
        to: SocketAddr,
    ) -> io::Result<()> {
        let body = postcard::to_allocvec(metadata)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut datagram = vec![0u8; UDP_PREFIX_LEN];
        datagram.extend_from_slice(&body);
        for _ in 0..UDP_HANDSHAKE_COPIES {
            self.shared.socket.send_to(&datagram, to).await?;
        }
        Ok(())
    }

    /// Keep-alive probe: a conn-metadata datagram with `is_ping` set, which
    /// the remote discards after the prefix check.
    pub async fn send_ping(&self, public_key: [u8; PUBLIC_KEY_SIZE], to: SocketAddr) -> io::Result<()> {
        let metadata = ConnectionMetadata {
            public_key: public_key.to_vec(),
            is_ping: true,
            ..Default::default()
        };
        let body = postcard::to_allocvec(&metadata)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut datagram = vec![0u8; UDP_PREFIX_LEN];
        datagram.extend_from_slice(&body);
        self.shared.socket.send_to(&datagram, to).await?;
        Ok(())
    }

    /// Bytes seen per reverse-tunnel sub-channel.
    pub fn channel_bytes(&self) -> HashMap<u8, u64> {
        self.shared.channel_bytes.lock().unwrap().clone()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }

    pub fn close(&self) {
        self.shared.close.cancel();
    }
}

async fn read_loop(shared: Arc<MuxShared>, read_tx: mpsc::Sender<Datagram>) {
    let mut buf = vec![0u8; MAX_UDP_BUFFER_SIZE];
    loop {
        let (n, from) = tokio::select! {
            _ = shared.close.cancelled() => return,
            result = shared.socket.recv_from(&mut buf) => match result {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("udp recv error: {}", e);
                    continue;
                }
            },
        };
        let data = &buf[..n];

        if shared.role == Role::Listener
            && n > UDP_PREFIX_LEN
            && data[..UDP_PREFIX_LEN].iter().all(|b| *b == 0)
        {
            handle_control(&shared, &data[UDP_PREFIX_LEN..], from);
            continue;
        }

        let codec = shared.codecs.read().unwrap().get(&from).cloned();
        let Some(codec) = codec else {
            warn!("dropping datagram from {} with no codec", from);
            continue;
        };
        let payload = match codec.open(data) {
            Ok(p) => p,
            Err(e) => {
                warn!("dropping undecryptable datagram from {}: {}", from, e);
                continue;
            }
        };
        // The channel selector must exist before we index it.
        if payload.len() <= UDP_CHANNEL_OFFSET {
            debug!("dropping short datagram from {} ({} bytes)", from, payload.len());
            continue;
        }

        if shared.role == Role::Listener {
            let channel = payload[UDP_CHANNEL_OFFSET];
            *shared.channel_bytes.lock().unwrap().entry(channel).or_insert(0) +=
                payload.len() as u64;
            shared.counters.add_entry_to_exit(payload.len() as u64);
        } else {
            shared.counters.add_exit_to_entry(payload.len() as u64);
        }
        *shared.default_remote.lock().unwrap() = Some(from);

        // Full user channel: drop the datagram, as UDP would.
        if read_tx.try_send((payload, from)).is_err() {
            debug!("udp read channel full, dropping datagram from {}", from);
        }
    }
}

/// Parse and act on a zero-prefixed control datagram.
fn handle_control(shared: &Arc<MuxShared>, body: &[u8], from: SocketAddr) {
    if body.len() > MAX_CONN_METADATA_SIZE {
        warn!("oversized conn-metadata datagram from {}", from);
        return;
    }
    let metadata: ConnectionMetadata = match postcard::from_bytes(body) {
        Ok(m) => m,
        Err(e) => {
            warn!("bad conn-metadata datagram from {}: {}", from, e);
            return;
        }
    };
    if metadata.is_ping {
        return;
    }
    if shared.codecs.read().unwrap().contains_key(&from) {
        // Duplicate of the 3× handshake burst, or a peer re-running its
        // handshake on an established mapping.
        return;
    }
    if metadata.public_key.len() != PUBLIC_KEY_SIZE || metadata.nonce.len() != NONCE_SIZE {
        warn!("conn-metadata with bad key material from {}", from);
        return;
    }
    let mut public_key = [0u8; PUBLIC_KEY_SIZE];
    public_key.copy_from_slice(&metadata.public_key);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&metadata.nonce);
    let key = conn_key(&public_key, &nonce);
    let cipher = negotiate(metadata.cipher, shared.cipher);

    // Park until the TCP handshake for the same key finishes; only then may
    // this remote's datagrams be decrypted.
    let shared = shared.clone();
    tokio::spawn(async move {
        let session_key = tokio::select! {
            _ = shared.close.cancelled() => return,
            found = shared.registry.wait(&key, HANDSHAKE_TIMEOUT) => found,
        };
        match session_key {
            Some(session_key) => {
                shared
                    .codecs
                    .write()
                    .unwrap()
                    .insert(from, Codec::new(cipher, &session_key));
                debug!("installed udp codec for {}", from);
            }
            None => warn!("udp handshake from {} never matched a tcp session", from),
        }
    });
}

async fn write_loop(shared: Arc<MuxShared>, mut write_rx: mpsc::Receiver<Outbound>) {
    loop {
        let (payload, to) = tokio::select! {
            _ = shared.close.cancelled() => return,
            item = write_rx.recv() => match item {
                Some(item) => item,
                None => return,
            },
        };
        let to = match to.or_else(|| *shared.default_remote.lock().unwrap()) {
            Some(addr) => addr,
            None => {
                warn!("dropping outbound datagram with no destination");
                continue;
            }
        };
        let codec = shared.codecs.read().unwrap().get(&to).cloned();
        let Some(codec) = codec else {
            warn!("dropping outbound datagram to {} with no codec", to);
            continue;
        };
        let sealed = match codec.seal(&payload) {
            Ok(s) => s,
            Err(e) => {
                warn!("udp seal failed for {}: {}", to, e);
                continue;
            }
        };
        if let Err(e) = shared.socket.send_to(&sealed, to).await {
            warn!("udp send to {} failed: {}", to, e);
            continue;
        }
        if shared.role == Role::Dialer {
            shared.counters.add_entry_to_exit(payload.len() as u64);
        } else {
            shared.counters.add_exit_to_entry(payload.len() as u64);
        }
    }
}
