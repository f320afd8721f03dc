//! End-to-end loopback tunnel tests.
//!
//! A real Exit (TCP + UDP sockets on 127.0.0.1) is advertised on an
//! in-memory topic; the Entry discovers it, measures it, handshakes, binds
//! the UDP session, pushes bytes through a user stream, and settles the
//! session cost over the payment stream. The chain, wallet, and
//! multiplexer collaborators are the in-memory seam implementations.

use async_trait::async_trait;
use causeway::chain::{
    ChainClient, ChainError, NanoPayClaimer, NanoPayer, SubscriptionInfo, Wallet,
};
use causeway::net::mux::{MemoryMux, StreamMux};
use causeway::net::udp::UdpMux;
use causeway::{
    Amount, Config, Discovery, Entry, Exit, Keypair, Linger, Measurement, PaymentTerms, Role,
    ServiceMetadata, Tunnel, TunnelError,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;

// =============================================================================
// IN-MEMORY COLLABORATORS
// =============================================================================

struct MockChain {
    subscribers: Mutex<HashMap<String, String>>,
}

impl MockChain {
    fn new() -> Self {
        Self { subscribers: Mutex::new(HashMap::new()) }
    }

    fn publish(&self, address: &str, meta: String) {
        self.subscribers.lock().unwrap().insert(address.to_string(), meta);
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn subscriber_count(
        &self,
        _topic: &str,
        prefix: Option<&str>,
    ) -> Result<u64, ChainError> {
        let subs = self.subscribers.lock().unwrap();
        Ok(subs
            .keys()
            .filter(|a| prefix.is_none_or(|p| a.rsplit('.').next().unwrap_or(a).starts_with(p)))
            .count() as u64)
    }

    async fn subscribers(
        &self,
        _topic: &str,
        _prefix: Option<&str>,
        offset: u64,
        limit: u64,
    ) -> Result<HashMap<String, String>, ChainError> {
        let subs = self.subscribers.lock().unwrap();
        let mut list: Vec<_> = subs.iter().map(|(a, m)| (a.clone(), m.clone())).collect();
        list.sort();
        Ok(list.into_iter().skip(offset as usize).take(limit as usize).collect())
    }

    async fn subscription(
        &self,
        _topic: &str,
        subscriber: &str,
    ) -> Result<SubscriptionInfo, ChainError> {
        let subs = self.subscribers.lock().unwrap();
        subs.get(subscriber)
            .map(|meta| SubscriptionInfo { meta: meta.clone(), expires_at: 10_000 })
            .ok_or_else(|| ChainError::Rpc(format!("no subscription for {subscriber}")))
    }

    async fn subscribe(
        &self,
        identifier: &str,
        _topic: &str,
        _duration_blocks: u64,
        meta: &str,
        _fee: Amount,
    ) -> Result<String, ChainError> {
        self.subscribers.lock().unwrap().insert(identifier.to_string(), meta.to_string());
        Ok("txhash".into())
    }

    async fn height(&self) -> Result<u64, ChainError> {
        Ok(100)
    }
}

/// Shared nano-pay ledger: payer encodes the cumulative amount, claimer
/// decodes and records it.
#[derive(Default)]
struct Ledger {
    cumulative: Mutex<Amount>,
    claimed: Mutex<Vec<Amount>>,
}

impl Ledger {
    fn total_claimed(&self) -> Amount {
        self.claimed.lock().unwrap().last().copied().unwrap_or(Amount::ZERO)
    }
}

struct LedgerPayer(Arc<Ledger>);

#[async_trait]
impl NanoPayer for LedgerPayer {
    async fn increment(&mut self, delta: Amount, _fee: Amount) -> Result<Vec<u8>, ChainError> {
        let mut total = self.0.cumulative.lock().unwrap();
        *total = total.saturating_add(delta);
        postcard::to_allocvec(&*total).map_err(|e| ChainError::InvalidTransaction(e.to_string()))
    }
}

struct LedgerClaimer(Arc<Ledger>);

#[async_trait]
impl NanoPayClaimer for LedgerClaimer {
    async fn claim(&self, txn: &[u8]) -> Result<Amount, ChainError> {
        let amount: Amount = postcard::from_bytes(txn)
            .map_err(|e| ChainError::InvalidTransaction(e.to_string()))?;
        self.0.claimed.lock().unwrap().push(amount);
        Ok(amount)
    }
}

struct LedgerWallet {
    address: String,
    balance: Amount,
    ledger: Arc<Ledger>,
}

#[async_trait]
impl Wallet for LedgerWallet {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn balance(&self) -> Result<Amount, ChainError> {
        Ok(self.balance)
    }

    async fn new_nano_payer(&self, _receiver: &str) -> Result<Box<dyn NanoPayer>, ChainError> {
        Ok(Box::new(LedgerPayer(self.ledger.clone())))
    }

    async fn new_nano_pay_claimer(&self) -> Result<Box<dyn NanoPayClaimer>, ChainError> {
        Ok(Box::new(LedgerClaimer(self.ledger.clone())))
    }
}

// =============================================================================
// WIRING HELPERS
// =============================================================================

fn entry_for(
    chain: Arc<MockChain>,
    ledger: Arc<Ledger>,
    topic: &str,
    config: Config,
) -> Entry {
    let client: Arc<dyn ChainClient> = chain;
    let wallet = Arc::new(LedgerWallet {
        address: "entry.wallet".into(),
        balance: "10".parse().unwrap(),
        ledger,
    });
    let (tunnel, _events) =
        Tunnel::new(config, Keypair::generate(), wallet, client.clone()).unwrap();

    let mut discovery = Discovery::new(client, topic.to_string());
    discovery.max_price = tunnel.validated.max_price;

    let measurement = Measurement {
        keypair: tunnel.keypair.clone(),
        shared_keys: tunnel.shared_keys.clone(),
        cipher: tunnel.validated.cipher,
        storage: None,
        pool_size: 4,
        dial_timeout: Duration::from_secs(2),
        measure_bandwidth: false,
    };
    Entry { tunnel, discovery, measurement }
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[tokio::test]
async fn test_full_tunnel_with_payment() {
    let topic = "causeway-v1.itest";
    let chain = Arc::new(MockChain::new());
    let ledger = Arc::new(Ledger::default());

    // ---- Exit side ----------------------------------------------------
    let exit_keys = Keypair::generate();
    let exit_address = format!("itest.{}", hex::encode(exit_keys.public()));
    let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let udp_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let tcp_port = tcp_listener.local_addr().unwrap().port();
    let udp_addr = udp_socket.local_addr().unwrap();

    let metadata = ServiceMetadata {
        ip: "127.0.0.1".into(),
        tcp_port,
        udp_port: udp_addr.port(),
        service_id: 0,
        service_tcp: vec![8080],
        service_udp: vec![53],
        price: "0.001 0.001".into(),
        beneficiary_addr: String::new(),
    };
    chain.publish(&exit_address, metadata.encode().unwrap());

    let exit_wallet = Arc::new(LedgerWallet {
        address: exit_address.clone(),
        balance: "10".parse().unwrap(),
        ledger: ledger.clone(),
    });
    let (exit_tunnel, _exit_events) = Tunnel::new(
        Config::default(),
        exit_keys,
        exit_wallet,
        chain.clone() as Arc<dyn ChainClient>,
    )
    .unwrap();
    *exit_tunnel.terms.write().unwrap() = PaymentTerms {
        price: metadata.parse_price().unwrap(),
        receiver: String::new(),
    };
    let exit = Arc::new(Exit { tunnel: exit_tunnel.clone() });

    let exit_udp = Arc::new(UdpMux::new(
        udp_socket,
        Role::Listener,
        exit_tunnel.validated.cipher,
        exit_tunnel.registry.clone(),
        exit_tunnel.counters.clone(),
        exit_tunnel.close_token().child_token(),
    ));

    // Session mux seam: in-memory pair standing in for an smux adapter.
    let (entry_mux, exit_mux) = MemoryMux::pair();
    let exit_mux = Arc::new(exit_mux);

    // Accept loop: measurement probes are served inline; the first real
    // session starts the stream dispatcher.
    let (streams_tx, mut streams_rx) = mpsc::channel(4);
    {
        let exit = exit.clone();
        let exit_mux = exit_mux.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let Ok((stream, _)) = tcp_listener.accept().await else { return };
                match exit.serve_conn(stream).await {
                    Ok(Some(session)) => {
                        // Keep the TCP session alive for the tunnel's lifetime.
                        held.push(session);
                        let exit = exit.clone();
                        let exit_mux = exit_mux.clone();
                        let streams_tx = streams_tx.clone();
                        tokio::spawn(async move {
                            let _ = exit
                                .run_session(exit_mux as Arc<dyn StreamMux>, streams_tx)
                                .await;
                        });
                    }
                    Ok(None) | Err(_) => {}
                }
            }
        });
    }

    // Echo every user stream back at the Exit.
    tokio::spawn(async move {
        while let Some(mut incoming) = streams_rx.recv().await {
            assert_eq!(incoming.metadata.service_id, 0);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                loop {
                    match incoming.stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if incoming.stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    // ---- Entry side ---------------------------------------------------
    let config = Config { max_price: "0.01 0.01".into(), ..Default::default() };
    let entry = entry_for(chain.clone(), ledger.clone(), topic, config);

    let session = entry.connect().await.unwrap();
    assert_eq!(session.node.address, exit_address);
    assert!(entry.tunnel.state().connected);

    // UDP is bound to the same handshake: the Exit installs the codec once
    // the metadata burst lands, then traffic flows both ways.
    let udp = session.udp.clone().unwrap();
    let mut installed = false;
    for _ in 0..50 {
        udp.send(b"\x01\x00\x07udp probe".to_vec(), Some(udp_addr)).await.unwrap();
        if let Ok(Some((payload, _))) =
            tokio::time::timeout(Duration::from_millis(100), exit_udp.recv()).await
        {
            assert_eq!(payload, b"\x01\x00\x07udp probe");
            installed = true;
            break;
        }
    }
    assert!(installed, "udp codec never installed");

    exit_udp.send(b"\x01\x00\x07udp reply".to_vec(), None).await.unwrap();
    let (reply, _) = tokio::time::timeout(Duration::from_secs(2), udp.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"\x01\x00\x07udp reply");

    // ---- User stream and payment --------------------------------------
    let pump = entry.start_payment(&entry_mux).await.unwrap();
    let mut stream = entry.open_user_stream(&entry_mux, 0, 0).await.unwrap();

    let chunk = vec![0x5au8; 64 * 1024];
    for _ in 0..16 {
        stream.write_all(&chunk).await.unwrap();
    }
    stream.flush().await.unwrap();
    let mut echoed = vec![0u8; chunk.len()];
    let mut received = 0usize;
    while received < 16 * chunk.len() {
        let n = stream.read(&mut echoed).await.unwrap();
        assert!(n > 0, "echo stream ended early");
        received += n;
    }

    let (used_e2x, used_x2e, _, _) = entry.tunnel.counters.load();
    assert!(used_e2x >= 16 * chunk.len() as u64);
    assert!(used_x2e >= 16 * chunk.len() as u64);

    // Closing settles the outstanding cost on the payment stream.
    entry.tunnel.close(Linger::For(Duration::from_secs(2))).await;
    pump.await.unwrap().unwrap();

    let price = metadata.parse_price().unwrap();
    let expected = price
        .entry_to_exit
        .traffic_cost(used_e2x)
        .saturating_add(price.exit_to_entry.traffic_cost(used_x2e));
    let mut settled = false;
    for _ in 0..50 {
        if ledger.total_claimed() >= expected && !expected.is_zero() {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(settled, "exit never claimed the session cost");

    // Paid never exceeds used.
    let (ue, ux, pe, px) = entry.tunnel.counters.load();
    assert!(pe + px <= ue + ux);

    exit_tunnel.close(Linger::Now).await;
}

#[tokio::test(start_paused = true)]
async fn test_overpriced_exits_keep_entry_retrying() {
    let topic = "causeway-v1.pricey";
    let chain = Arc::new(MockChain::new());
    let ledger = Arc::new(Ledger::default());

    // The only Exit on the topic costs 100× the Entry's ceiling.
    let metadata = ServiceMetadata {
        ip: "127.0.0.1".into(),
        tcp_port: 30020,
        price: "0.01 0.01".into(),
        ..Default::default()
    };
    chain.publish("pricey.ab12cd34", metadata.encode().unwrap());

    let config = Config { max_price: "0.0001 0.0001".into(), ..Default::default() };
    let entry = Arc::new(entry_for(chain, ledger, topic, config));

    let connector = {
        let entry = entry.clone();
        tokio::spawn(async move { entry.connect().await })
    };

    // The reconnect loop spins with its 1-second backoff until the tunnel
    // closes, then surfaces Closed instead of a candidate.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!connector.is_finished());

    entry.tunnel.close(Linger::Now).await;
    let result = tokio::time::timeout(Duration::from_secs(10), connector)
        .await
        .expect("connect should observe close")
        .unwrap();
    assert!(matches!(result, Err(TunnelError::Closed)));
}

#[tokio::test]
async fn test_measurement_probe_served_by_exit() {
    // An Exit accept loop must serve measurement-mode handshakes inline
    // without surfacing a session.
    let chain = Arc::new(MockChain::new());
    let ledger = Arc::new(Ledger::default());
    let exit_keys = Keypair::generate();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let exit_wallet = Arc::new(LedgerWallet {
        address: "probe.exit".into(),
        balance: "1".parse().unwrap(),
        ledger: ledger.clone(),
    });
    let (exit_tunnel, _events) = Tunnel::new(
        Config::default(),
        exit_keys,
        exit_wallet,
        chain.clone() as Arc<dyn ChainClient>,
    )
    .unwrap();
    let exit = Arc::new(Exit { tunnel: exit_tunnel.clone() });

    {
        let exit = exit.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let exit = exit.clone();
                tokio::spawn(async move {
                    // Latency probes disconnect without a handshake; the
                    // bandwidth probe must complete inline as Ok(None).
                    if let Ok(session) = exit.serve_conn(stream).await {
                        assert!(session.is_none(), "probe surfaced a session");
                    }
                });
            }
        });
    }

    // Drive it with the Entry-side measurement machinery.
    let metadata = ServiceMetadata {
        ip: "127.0.0.1".into(),
        tcp_port: port,
        price: "0.001".into(),
        ..Default::default()
    };
    let node = causeway::Node::new(
        "probe.ffff".into(),
        metadata.encode().unwrap(),
        metadata,
    );
    let measurement = Measurement {
        keypair: Arc::new(Keypair::generate()),
        shared_keys: Arc::new(causeway::SharedKeyCache::new()),
        cipher: causeway::Cipher::XChaCha20Poly1305,
        storage: None,
        pool_size: 2,
        dial_timeout: Duration::from_secs(2),
        measure_bandwidth: true,
    };
    let ranked = measurement.rank(vec![node]).await;
    assert_eq!(ranked.len(), 1);
    assert!(ranked[0].bandwidth_kbps.unwrap() > 0);

    exit_tunnel.close(Linger::Now).await;
}
