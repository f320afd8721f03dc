//! Candidate ranking: concurrent latency and bandwidth probes.
//!
//! Both stages run on a bounded worker pool sized by `max_pool_size` —
//! never one task per candidate. The latency stage is a timed TCP dial;
//! survivors are sorted by delay and truncated. The optional bandwidth
//! stage runs a measurement-mode handshake and download against each
//! survivor, records verdicts in measurement storage, and cancels the
//! remaining workers once enough successes are in. Cancellation aborts
//! in-flight probes at their next suspension point.
//!
//! When a disk-backed storage is configured, the whole run holds that
//! directory's lock so concurrent tunnel instances do not race the files.

use crate::crypto::{Keypair, SharedKeyCache};
use crate::net::conn::{HandshakeOptions, Role, SessionKeyRegistry, handshake, measure_download};
use crate::storage::{AvoidNode, FavoriteNode, MeasureStorage, storage_lock};
use crate::types::{
    Cipher, DEFAULT_POOL_SIZE, MEASURE_BANDWIDTH_TOP_COUNT, MEASURE_BANDWIDTH_WORKERS_TIMEOUT,
    MEASUREMENT_BYTES_DOWNLINK, MEASURE_DELAY_TOP_COUNT, Node,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Probe driver for one topic's candidates.
pub struct Measurement {
    pub keypair: Arc<Keypair>,
    pub shared_keys: Arc<SharedKeyCache>,
    pub cipher: Cipher,
    pub storage: Option<Arc<MeasureStorage>>,
    pub pool_size: usize,
    pub dial_timeout: Duration,
    pub measure_bandwidth: bool,
}

impl Measurement {
    /// Rank candidates: latency stage always, bandwidth stage when
    /// configured. Nodes that fail a stage drop out.
    pub async fn rank(&self, nodes: Vec<Node>) -> Vec<Node> {
        // Serialize runs only when disk writes are possible.
        let _guard = match &self.storage {
            Some(storage) => Some(storage_lock(storage.path()).lock_owned().await),
            None => None,
        };

        let ranked = self.measure_delay(nodes).await;
        if !self.measure_bandwidth || ranked.is_empty() {
            return ranked;
        }
        self.measure_bandwidth_stage(ranked).await
    }

    fn pool(&self) -> usize {
        if self.pool_size == 0 { DEFAULT_POOL_SIZE } else { self.pool_size }
    }

    /// Timed TCP dial per node; ascending delay, truncated to the top set.
    async fn measure_delay(&self, nodes: Vec<Node>) -> Vec<Node> {
        let semaphore = Arc::new(Semaphore::new(self.pool()));
        let mut tasks = JoinSet::new();

        for mut node in nodes {
            let semaphore = semaphore.clone();
            let dial_timeout = self.dial_timeout;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                let addr = node.metadata.tcp_addr().ok()?;
                let started = tokio::time::Instant::now();
                match tokio::time::timeout(dial_timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(_stream)) => {
                        node.delay_ms = Some(started.elapsed().as_millis() as u64);
                        Some(node)
                    }
                    Ok(Err(e)) => {
                        debug!("delay probe to {} failed: {}", addr, e);
                        None
                    }
                    Err(_) => {
                        debug!("delay probe to {} timed out", addr);
                        None
                    }
                }
            });
        }

        let mut measured = Vec::new();
        while let Some(result) = tasks.join_next().await {
            if let Ok(Some(node)) = result {
                measured.push(node);
            }
        }
        measured.sort_by_key(|n| n.delay_ms.unwrap_or(u64::MAX));
        measured.truncate(MEASURE_DELAY_TOP_COUNT);
        info!("delay stage kept {} nodes", measured.len());
        measured
    }

    /// Measurement-mode download per node; descending bandwidth. Verdicts
    /// go to storage; enough successes cancel the stragglers.
    async fn measure_bandwidth_stage(&self, nodes: Vec<Node>) -> Vec<Node> {
        let semaphore = Arc::new(Semaphore::new(self.pool()));
        let cancel = CancellationToken::new();
        let successes = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();

        for mut node in nodes {
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let successes = successes.clone();
            let keypair = self.keypair.clone();
            let shared_keys = self.shared_keys.clone();
            let storage = self.storage.clone();
            let cipher = self.cipher;
            let dial_timeout = self.dial_timeout;

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                let probe = probe_bandwidth(&node, keypair, shared_keys, cipher, dial_timeout);
                let result = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    result = probe => result,
                };
                match result {
                    Ok((min_kbps, max_kbps)) => {
                        node.bandwidth_kbps = Some(min_kbps);
                        if let Some(storage) = &storage {
                            let verdict = FavoriteNode {
                                ip: node.metadata.ip.clone(),
                                address: node.address.clone(),
                                metadata: node.metadata_raw.clone(),
                                delay_ms: node.delay_ms.unwrap_or(0),
                                min_bandwidth_kbps: min_kbps,
                                max_bandwidth_kbps: max_kbps,
                            };
                            if let Err(e) = storage.add_favorite(verdict) {
                                warn!("failed to persist favorite: {}", e);
                            }
                        }
                        if successes.fetch_add(1, Ordering::SeqCst) + 1
                            >= MEASURE_BANDWIDTH_TOP_COUNT
                        {
                            cancel.cancel();
                        }
                        Some(node)
                    }
                    Err(e) => {
                        warn!("bandwidth probe to {} failed: {}", node.address, e);
                        if let Some(storage) = &storage {
                            let verdict = AvoidNode {
                                ip: node.metadata.ip.clone(),
                                address: node.address.clone(),
                            };
                            if let Err(e) = storage.add_avoid(verdict) {
                                warn!("failed to persist avoid entry: {}", e);
                            }
                        }
                        None
                    }
                }
            });
        }

        let deadline = tokio::time::sleep(MEASURE_BANDWIDTH_WORKERS_TIMEOUT);
        tokio::pin!(deadline);
        let mut measured = Vec::new();
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    cancel.cancel();
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(Some(node))) => measured.push(node),
                    Some(_) => {}
                    None => break,
                },
            }
        }
        // Drain whatever finished before the cancel landed.
        while let Some(result) = tasks.join_next().await {
            if let Ok(Some(node)) = result {
                measured.push(node);
            }
        }

        measured.sort_by(|a, b| b.bandwidth_kbps.cmp(&a.bandwidth_kbps));
        info!("bandwidth stage kept {} nodes", measured.len());
        measured
    }
}

async fn probe_bandwidth(
    node: &Node,
    keypair: Arc<Keypair>,
    shared_keys: Arc<SharedKeyCache>,
    cipher: Cipher,
    dial_timeout: Duration,
) -> Result<(u64, u64), Box<dyn std::error::Error + Send + Sync>> {
    let addr = node.metadata.tcp_addr()?;
    let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(addr)).await??;

    let options = HandshakeOptions {
        keypair,
        shared_keys,
        cipher,
        expected_peer: node.public_key(),
        is_measurement: true,
        measurement_bytes_downlink: MEASUREMENT_BYTES_DOWNLINK,
    };
    // Probe connections are throwaway; nothing waits on this registry.
    let registry = SessionKeyRegistry::new();
    let mut session = handshake(stream, Role::Dialer, &options, &registry).await?;
    let rates = measure_download(&mut session.stream, MEASUREMENT_BYTES_DOWNLINK).await?;
    Ok(rates)
}
