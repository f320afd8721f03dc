//! Tunnel lifecycle: common state, the Entry connect loop, Exit session
//! serving, and close-with-linger.
//!
//! One [`Tunnel`] holds everything both roles share: identity, wallet and
//! chain seams, the single reader/writer lock over connection state, the
//! atomic byte counters, the close token, and the active-session wait
//! group. [`Entry`] and [`Exit`] borrow it through an `Arc`; sessions hold
//! a child cancellation token and a wait-group guard, never an owning
//! handle back, so nothing keeps a session alive past the tunnel's close.

use crate::chain::{ChainClient, ChainError, Wallet};
use crate::config::{Config, ConfigError, ValidatedConfig};
use crate::crypto::{Keypair, SharedKeyCache};
use crate::discovery::{Discovery, DiscoveryError};
use crate::measure::Measurement;
use crate::net::codec::Codec;
use crate::net::conn::{
    HandshakeOptions, ProtoError, Role, Session, SessionKeyRegistry, handshake, read_metadata,
    send_measurement_payload, write_metadata,
};
use crate::net::mux::{MuxStream, StreamMux};
use crate::net::udp::UdpMux;
use crate::payment::{
    ClaimState, PaymentCollector, PaymentError, PaymentPump, PaymentTerms, enforcement_watchdog,
};
use crate::types::{
    ConnectionMetadata, MAX_STREAM_METADATA_SIZE, MetadataError, Node, RECONNECT_BACKOFF,
    ServiceMetadata, StreamMetadata, TrafficCounters,
};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Operation on a closed tunnel. Idempotent close is safe; everything
    /// else gets this.
    #[error("tunnel closed")]
    Closed,

    /// Wallet balance below the configured minimum; surfaced before any
    /// dialing happens.
    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Lifecycle notifications, in the spirit of a network event channel.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    Connected(SocketAddr),
    Disconnected,
    Closed,
}

// =============================================================================
// WAIT GROUP
// =============================================================================

#[derive(Default)]
struct WaitGroupInner {
    count: AtomicUsize,
    notify: Notify,
}

/// Counts active sessions for linger. Guards decrement on drop, so a
/// session that panics still releases its slot.
#[derive(Clone, Default)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(&self) -> WaitGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        WaitGuard { inner: self.inner.clone() }
    }

    pub fn active(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Resolve once the count reaches zero.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct WaitGuard {
    inner: Arc<WaitGroupInner>,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.notify.notify_waiters();
        }
    }
}

/// How long `close` waits for active sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linger {
    /// Close immediately.
    Now,
    /// Wait until every session completes.
    Forever,
    /// Wait up to the duration, then close anyway.
    For(Duration),
}

// =============================================================================
// TUNNEL COMMON
// =============================================================================

/// Connection state behind the tunnel's single reader/writer lock.
#[derive(Debug, Clone, Default)]
pub struct TunnelState {
    pub metadata: Option<ServiceMetadata>,
    pub remote_addr: Option<SocketAddr>,
    pub connected: bool,
}

/// State shared by both tunnel roles.
pub struct Tunnel {
    pub config: Config,
    pub validated: ValidatedConfig,
    pub keypair: Arc<Keypair>,
    pub shared_keys: Arc<SharedKeyCache>,
    pub registry: Arc<SessionKeyRegistry>,
    pub wallet: Arc<dyn Wallet>,
    pub client: Arc<dyn ChainClient>,
    pub counters: Arc<TrafficCounters>,
    pub terms: Arc<RwLock<PaymentTerms>>,
    state: RwLock<TunnelState>,
    close: CancellationToken,
    sessions: WaitGroup,
    events: mpsc::Sender<TunnelEvent>,
}

impl Tunnel {
    /// Build the shared core. Config validation happens here and is fatal.
    pub fn new(
        config: Config,
        keypair: Keypair,
        wallet: Arc<dyn Wallet>,
        client: Arc<dyn ChainClient>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<TunnelEvent>), TunnelError> {
        let validated = config.validate()?;
        let (events, events_rx) = mpsc::channel(16);
        let tunnel = Arc::new(Self {
            config,
            validated,
            keypair: Arc::new(keypair),
            shared_keys: Arc::new(SharedKeyCache::new()),
            registry: Arc::new(SessionKeyRegistry::new()),
            wallet,
            client,
            counters: Arc::new(TrafficCounters::new()),
            terms: Arc::new(RwLock::new(PaymentTerms::default())),
            state: RwLock::new(TunnelState::default()),
            close: CancellationToken::new(),
            sessions: WaitGroup::new(),
            events,
        });
        Ok((tunnel, events_rx))
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    pub fn state(&self) -> TunnelState {
        self.state.read().unwrap().clone()
    }

    pub fn sessions(&self) -> &WaitGroup {
        &self.sessions
    }

    fn set_connected(&self, metadata: ServiceMetadata, remote: SocketAddr) {
        let mut state = self.state.write().unwrap();
        state.metadata = Some(metadata);
        state.remote_addr = Some(remote);
        state.connected = true;
    }

    fn set_disconnected(&self) {
        self.state.write().unwrap().connected = false;
    }

    async fn emit(&self, event: TunnelEvent) {
        let _ = self.events.send(event).await;
    }

    /// Idempotent close with linger semantics: wait for active sessions
    /// per `linger`, then cancel everything.
    pub async fn close(&self, linger: Linger) {
        if self.is_closed() {
            return;
        }
        match linger {
            Linger::Now => {}
            Linger::Forever => self.sessions.wait().await,
            Linger::For(timeout) => {
                let _ = tokio::time::timeout(timeout, self.sessions.wait()).await;
            }
        }
        self.close.cancel();
        self.set_disconnected();
        self.emit(TunnelEvent::Closed).await;
        info!("tunnel closed ({} sessions still active)", self.sessions.active());
    }
}

// =============================================================================
// METERED STREAMS
// =============================================================================

/// Byte-counting wrapper for user streams: reads and writes pass through,
/// counters advance by the bytes moved. Direction follows the role — an
/// Entry's writes are entry→exit traffic, an Exit's writes exit→entry.
pub struct MeteredStream<S> {
    stream: S,
    counters: Arc<TrafficCounters>,
    role: Role,
}

impl<S> MeteredStream<S> {
    pub fn new(stream: S, counters: Arc<TrafficCounters>, role: Role) -> Self {
        Self { stream, counters, role }
    }
}

impl<S: tokio::io::AsyncRead + Unpin> tokio::io::AsyncRead for MeteredStream<S> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = std::pin::Pin::new(&mut self.stream).poll_read(cx, buf);
        if let std::task::Poll::Ready(Ok(())) = &poll {
            let n = (buf.filled().len() - before) as u64;
            match self.role {
                Role::Dialer => self.counters.add_exit_to_entry(n),
                Role::Listener => self.counters.add_entry_to_exit(n),
            }
        }
        poll
    }
}

impl<S: tokio::io::AsyncWrite + Unpin> tokio::io::AsyncWrite for MeteredStream<S> {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        let poll = std::pin::Pin::new(&mut self.stream).poll_write(cx, buf);
        if let std::task::Poll::Ready(Ok(n)) = &poll {
            match self.role {
                Role::Dialer => self.counters.add_entry_to_exit(*n as u64),
                Role::Listener => self.counters.add_exit_to_entry(*n as u64),
            }
        }
        poll
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

// =============================================================================
// ENTRY
// =============================================================================

/// An established Entry→Exit session.
pub struct EntrySession {
    pub node: Node,
    pub tcp: Session<TcpStream>,
    pub udp: Option<Arc<UdpMux>>,
    close: CancellationToken,
    _guard: WaitGuard,
}

impl EntrySession {
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }
}

/// Client side: discovers Exits, connects, pays.
pub struct Entry {
    pub tunnel: Arc<Tunnel>,
    pub discovery: Discovery,
    pub measurement: Measurement,
}

impl Entry {
    /// Establish a session to the best available Exit. Iterates ranked
    /// candidates, falling through to the next on any per-candidate
    /// failure; sleeps and re-runs discovery when the list empties.
    pub async fn connect(&self) -> Result<EntrySession, TunnelError> {
        self.check_balance().await?;

        loop {
            if self.tunnel.is_closed() {
                return Err(TunnelError::Closed);
            }

            let candidates = match self.discovery.candidates().await {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!("discovery failed: {}", e);
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                    continue;
                }
            };
            let ranked = self.measurement.rank(candidates).await;
            if ranked.is_empty() {
                debug!("no candidates after ranking, retrying");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }

            for node in ranked {
                match self.try_connect(node).await {
                    Ok(session) => return Ok(session),
                    Err(e) => warn!("candidate failed: {}", e),
                }
            }
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    /// Tear down a session and establish a fresh one.
    pub async fn reconnect(&self, session: EntrySession) -> Result<EntrySession, TunnelError> {
        session.close();
        drop(session);
        self.tunnel.set_disconnected();
        self.tunnel.emit(TunnelEvent::Disconnected).await;
        self.connect().await
    }

    /// Balance pre-flight: refuse to dial when the wallet cannot cover a
    /// paid session.
    async fn check_balance(&self) -> Result<(), TunnelError> {
        let min_balance = self.tunnel.validated.min_balance;
        if min_balance.is_zero() {
            return Ok(());
        }
        let prices_matter =
            self.tunnel.validated.max_price.is_none_or(|price| !price.is_free());
        if !prices_matter {
            return Ok(());
        }
        let balance = self.tunnel.wallet.balance().await?;
        if balance < min_balance {
            return Err(TunnelError::InsufficientBalance);
        }
        Ok(())
    }

    async fn try_connect(&self, mut node: Node) -> Result<EntrySession, TunnelError> {
        // Refresh the candidate's metadata unless it was pinned upfront.
        let pinned = self
            .discovery
            .whitelist
            .as_ref()
            .is_some_and(|w| w.iter().any(|p| p.address == node.address && p.metadata.is_some()));
        if !pinned {
            let info =
                self.tunnel.client.subscription(self.discovery.topic(), &node.address).await?;
            node.metadata = ServiceMetadata::decode(&info.meta)?;
            node.metadata_raw = info.meta;
        }
        let price = node.metadata.parse_price().map_err(MetadataError::Price)?;

        // Payments go to the advertised beneficiary, else the peer itself.
        let receiver = if node.metadata.beneficiary_addr.is_empty() {
            node.address.clone()
        } else {
            node.metadata.beneficiary_addr.clone()
        };
        *self.tunnel.terms.write().unwrap() = PaymentTerms { price, receiver };

        let tcp_addr = node.metadata.tcp_addr()?;
        let stream = tokio::time::timeout(
            self.tunnel.validated.dial_timeout,
            TcpStream::connect(tcp_addr),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timeout"))??;

        let options = HandshakeOptions {
            keypair: self.tunnel.keypair.clone(),
            shared_keys: self.tunnel.shared_keys.clone(),
            cipher: self.tunnel.validated.cipher,
            expected_peer: node.public_key(),
            is_measurement: false,
            measurement_bytes_downlink: 0,
        };
        let tcp = handshake(stream, Role::Dialer, &options, &self.tunnel.registry).await?;

        let close = self.tunnel.close.child_token();
        let udp = match node.metadata.udp_addr() {
            Some(udp_addr) => {
                Some(Arc::new(self.setup_udp(&tcp, udp_addr, close.clone()).await?))
            }
            None => None,
        };

        self.tunnel.set_connected(node.metadata.clone(), tcp_addr);
        self.tunnel.emit(TunnelEvent::Connected(tcp_addr)).await;
        info!("connected to {} at {}", node.address, tcp_addr);

        Ok(EntrySession {
            node,
            tcp,
            udp,
            close,
            _guard: self.tunnel.sessions.guard(),
        })
    }

    /// Dial the Exit's UDP port: local mux, codec from the completed TCP
    /// handshake, conn-metadata sent 3× to ride out loss.
    async fn setup_udp(
        &self,
        tcp: &Session<TcpStream>,
        udp_addr: SocketAddr,
        close: CancellationToken,
    ) -> Result<UdpMux, TunnelError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let mux = UdpMux::new(
            socket,
            Role::Dialer,
            self.tunnel.validated.cipher,
            self.tunnel.registry.clone(),
            self.tunnel.counters.clone(),
            close,
        );

        let key = self
            .tunnel
            .registry
            .get(&tcp.conn_key)
            .expect("tcp handshake registered its key");
        mux.install_codec(udp_addr, Codec::new(tcp.cipher, &key));

        let metadata = ConnectionMetadata {
            public_key: self.tunnel.keypair.public().to_vec(),
            nonce: tcp.nonce.to_vec(),
            cipher: self.tunnel.validated.cipher,
            ..Default::default()
        };
        mux.send_conn_metadata(&metadata, udp_addr).await?;
        Ok(mux)
    }

    /// Open the payment stream on the session mux and start the pump.
    pub async fn start_payment(
        &self,
        mux: &dyn StreamMux,
    ) -> Result<tokio::task::JoinHandle<Result<(), PaymentError>>, TunnelError> {
        let mut stream = mux.open_stream().await?;
        let metadata = StreamMetadata { is_payment: true, ..Default::default() };
        write_metadata(&mut stream, &metadata, MAX_STREAM_METADATA_SIZE).await?;

        let pump = PaymentPump {
            wallet: self.tunnel.wallet.clone(),
            counters: self.tunnel.counters.clone(),
            terms: self.tunnel.terms.clone(),
            explicit_fee: self.tunnel.validated.nano_pay_fee,
            min_fee: self.tunnel.validated.min_nano_pay_fee,
            fee_percentage: self.tunnel.validated.nano_pay_fee_percentage,
            close: self.tunnel.close.child_token(),
        };
        Ok(tokio::spawn(pump.run(stream)))
    }

    /// Open a user stream targeting `(service_id, port_index)` at the
    /// Exit, metered into the tunnel's byte counters.
    pub async fn open_user_stream(
        &self,
        mux: &dyn StreamMux,
        service_id: u32,
        port_index: u32,
    ) -> Result<MeteredStream<Box<dyn MuxStream>>, TunnelError> {
        if self.tunnel.is_closed() {
            return Err(TunnelError::Closed);
        }
        let mut stream = mux.open_stream().await?;
        let metadata = StreamMetadata { is_payment: false, service_id, port_index };
        write_metadata(&mut stream, &metadata, MAX_STREAM_METADATA_SIZE).await?;
        Ok(MeteredStream::new(stream, self.tunnel.counters.clone(), Role::Dialer))
    }
}

// =============================================================================
// EXIT
// =============================================================================

/// A user stream accepted by the Exit, tagged with its target selector.
pub struct IncomingStream {
    pub metadata: StreamMetadata,
    pub stream: MeteredStream<Box<dyn MuxStream>>,
}

/// Server side: accepts tunnels, claims payments, enforces coverage.
pub struct Exit {
    pub tunnel: Arc<Tunnel>,
}

impl Exit {
    /// Accept loop. Each connection handshakes and is handed to `on_session`
    /// (which adapts the mux seam and calls [`Exit::run_session`]).
    pub async fn serve<F>(&self, listener: TcpListener, mut on_session: F) -> Result<(), TunnelError>
    where
        F: FnMut(Session<TcpStream>, SocketAddr),
    {
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.tunnel.close.cancelled() => return Err(TunnelError::Closed),
                accepted = listener.accept() => accepted?,
            };
            match self.serve_conn(stream).await {
                Ok(Some(session)) => on_session(session, peer),
                Ok(None) => {} // measurement probe, already served
                Err(e) => warn!("handshake with {} failed: {}", peer, e),
            }
        }
    }

    /// Handshake one accepted connection. Measurement probes are served
    /// inline and return `None`; real sessions return the secure stream.
    pub async fn serve_conn(
        &self,
        stream: TcpStream,
    ) -> Result<Option<Session<TcpStream>>, TunnelError> {
        if self.tunnel.is_closed() {
            return Err(TunnelError::Closed);
        }
        let options = HandshakeOptions {
            keypair: self.tunnel.keypair.clone(),
            shared_keys: self.tunnel.shared_keys.clone(),
            cipher: self.tunnel.validated.cipher,
            expected_peer: None,
            is_measurement: false,
            measurement_bytes_downlink: 0,
        };
        let mut session = handshake(stream, Role::Listener, &options, &self.tunnel.registry).await?;

        if session.peer_metadata.is_measurement {
            let requested = session.peer_metadata.measurement_bytes_downlink;
            send_measurement_payload(&mut session.stream, requested).await?;
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Reverse mode: dial outbound to a NATed Entry instead of accepting.
    /// Dial direction and handshake role are independent — this side still
    /// runs the listener role and picks the nonce.
    pub async fn dial_entry(
        &self,
        addr: SocketAddr,
    ) -> Result<Option<Session<TcpStream>>, TunnelError> {
        let stream = tokio::time::timeout(
            self.tunnel.validated.dial_timeout,
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timeout"))??;
        self.serve_conn(stream).await
    }

    /// Run one session's stream dispatch: the first payment-marked stream
    /// feeds the claimer, every other stream is delivered on `streams_tx`.
    /// The enforcement watchdog runs alongside and cancels the session on
    /// a coverage violation.
    pub async fn run_session(
        &self,
        mux: Arc<dyn StreamMux>,
        streams_tx: mpsc::Sender<IncomingStream>,
    ) -> Result<(), TunnelError> {
        let _guard = self.tunnel.sessions.guard();
        let close = self.tunnel.close.child_token();
        let claim_state = Arc::new(ClaimState::default());
        let mut payment_started = false;

        tokio::spawn(enforcement_watchdog(
            self.tunnel.counters.clone(),
            self.tunnel.terms.clone(),
            claim_state.clone(),
            close.clone(),
        ));

        loop {
            let mut stream = tokio::select! {
                _ = close.cancelled() => {
                    self.tunnel.emit(TunnelEvent::Disconnected).await;
                    return Ok(());
                }
                accepted = mux.accept_stream() => match accepted {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!("session mux ended: {}", e);
                        self.tunnel.emit(TunnelEvent::Disconnected).await;
                        return Ok(());
                    }
                },
            };

            let metadata: StreamMetadata =
                match read_metadata(&mut stream, MAX_STREAM_METADATA_SIZE).await {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        warn!("bad stream metadata: {}", e);
                        continue;
                    }
                };

            if metadata.is_payment {
                if payment_started {
                    warn!("duplicate payment stream, dropping");
                    continue;
                }
                payment_started = true;
                let collector = PaymentCollector {
                    claimer: self.tunnel.wallet.new_nano_pay_claimer().await?,
                    counters: self.tunnel.counters.clone(),
                    terms: self.tunnel.terms.clone(),
                    state: claim_state.clone(),
                    close: close.clone(),
                };
                tokio::spawn(collector.run(stream));
                continue;
            }

            let metered =
                MeteredStream::new(stream, self.tunnel.counters.clone(), Role::Listener);
            if streams_tx.send(IncomingStream { metadata, stream: metered }).await.is_err() {
                debug!("stream consumer gone, ending session");
                return Ok(());
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{NanoPayClaimer, NanoPayer, SubscriptionInfo};
    use crate::types::Amount;
    use async_trait::async_trait;

    struct PoorWallet;

    #[async_trait]
    impl Wallet for PoorWallet {
        fn address(&self) -> String {
            "entry.poor".into()
        }

        async fn balance(&self) -> Result<Amount, ChainError> {
            Ok("0.0005".parse().unwrap())
        }

        async fn new_nano_payer(&self, _receiver: &str) -> Result<Box<dyn NanoPayer>, ChainError> {
            Err(ChainError::Rpc("not under test".into()))
        }

        async fn new_nano_pay_claimer(&self) -> Result<Box<dyn NanoPayClaimer>, ChainError> {
            Err(ChainError::Rpc("not under test".into()))
        }
    }

    struct NoChain;

    #[async_trait]
    impl ChainClient for NoChain {
        async fn subscriber_count(
            &self,
            _topic: &str,
            _prefix: Option<&str>,
        ) -> Result<u64, ChainError> {
            panic!("balance pre-flight must fail before any discovery rpc");
        }

        async fn subscribers(
            &self,
            _topic: &str,
            _prefix: Option<&str>,
            _offset: u64,
            _limit: u64,
        ) -> Result<std::collections::HashMap<String, String>, ChainError> {
            unreachable!()
        }

        async fn subscription(
            &self,
            _topic: &str,
            _subscriber: &str,
        ) -> Result<SubscriptionInfo, ChainError> {
            unreachable!()
        }

        async fn subscribe(
            &self,
            _identifier: &str,
            _topic: &str,
            _duration_blocks: u64,
            _meta: &str,
            _fee: Amount,
        ) -> Result<String, ChainError> {
            unreachable!()
        }

        async fn height(&self) -> Result<u64, ChainError> {
            unreachable!()
        }
    }

    fn entry_with(config: Config) -> Entry {
        let client: Arc<dyn ChainClient> = Arc::new(NoChain);
        let (tunnel, _events) =
            Tunnel::new(config, Keypair::generate(), Arc::new(PoorWallet), client.clone())
                .unwrap();
        let discovery = Discovery::new(client, "causeway-v1.test".into());
        let measurement = Measurement {
            keypair: tunnel.keypair.clone(),
            shared_keys: tunnel.shared_keys.clone(),
            cipher: tunnel.validated.cipher,
            storage: None,
            pool_size: 2,
            dial_timeout: Duration::from_millis(100),
            measure_bandwidth: false,
        };
        Entry { tunnel, discovery, measurement }
    }

    #[tokio::test]
    async fn test_insufficient_balance_before_dialing() {
        let config = Config {
            min_balance: "0.001".into(),
            max_price: "0.01 0.01".into(),
            ..Default::default()
        };
        let entry = entry_with(config);
        // Balance 0.0005 < 0.001: fails before NoChain can panic.
        assert!(matches!(
            entry.connect().await,
            Err(TunnelError::InsufficientBalance)
        ));
    }

    #[tokio::test]
    async fn test_zero_min_balance_skips_preflight() {
        let entry = entry_with(Config::default());
        entry.tunnel.close(Linger::Now).await;
        // With the tunnel closed the loop exits instead of touching RPC.
        assert!(matches!(entry.connect().await, Err(TunnelError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_linger_waits_for_sessions() {
        let entry = entry_with(Config::default());
        let tunnel = entry.tunnel.clone();

        // One session that finishes after 2 seconds.
        let guard = tunnel.sessions().guard();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(guard);
        });

        let started = tokio::time::Instant::now();
        tunnel.close(Linger::For(Duration::from_secs(5))).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(5));
        assert!(tunnel.is_closed());

        // Idempotent: closing again returns immediately.
        tunnel.close(Linger::Forever).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_linger_gives_up_at_deadline() {
        let entry = entry_with(Config::default());
        let tunnel = entry.tunnel.clone();

        // A session that never finishes.
        let _guard = Box::leak(Box::new(tunnel.sessions().guard()));

        let started = tokio::time::Instant::now();
        tunnel.close(Linger::For(Duration::from_secs(5))).await;
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(tunnel.is_closed());
    }

    #[tokio::test]
    async fn test_metered_stream_counts_both_roles() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let counters = Arc::new(TrafficCounters::new());
        let (a, b) = tokio::io::duplex(1024);
        let mut entry_side = MeteredStream::new(a, counters.clone(), Role::Dialer);
        let mut exit_side = MeteredStream::new(b, counters.clone(), Role::Listener);

        entry_side.write_all(b"0123456789").await.unwrap();
        entry_side.flush().await.unwrap();
        let mut buf = [0u8; 10];
        exit_side.read_exact(&mut buf).await.unwrap();

        let (ue, ux, _, _) = counters.load();
        // Entry write and Exit read both observed entry→exit bytes.
        assert_eq!(ue, 20);
        assert_eq!(ux, 0);
    }
}
