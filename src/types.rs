// Causeway Protocol — Constants and Wire Types
// Distributed under the MIT software license.

//! Protocol constants and wire types for the Causeway tunnel.
//!
//! # Design Goals
//!
//! 1. **Bounded memory usage** — Every length-prefixed blob on the wire has
//!    an explicit size limit. A peer cannot exhaust memory by sending a
//!    large metadata frame or payment transaction.
//!
//! 2. **Deterministic framing** — All metadata travels as postcard bytes
//!    behind a `u32` little-endian length prefix. Postcard's varint
//!    collections keep malicious length fields from over-allocating.
//!
//! 3. **One traffic unit everywhere** — Prices, payment thresholds, and
//!    coverage enforcement all divide by [`TRAFFIC_UNIT`]. Do not hardcode
//!    1 MiB elsewhere.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// TRAFFIC AND PAYMENT
// =============================================================================

/// Billing denominator: prices are tokens per MiB.
pub const TRAFFIC_UNIT: u64 = 1024 * 1024;

/// Unpaid traffic (in traffic units) that forces an immediate payment,
/// regardless of the update interval.
pub const TRAFFIC_PAYMENT_THRESHOLD: u64 = 32;

/// Payment pump wake interval. Cheap: two atomic loads per tick.
pub const PAYMENT_TICK: Duration = Duration::from_millis(100);

/// Send a payment at least this often while traffic flows, even when the
/// unpaid-bytes threshold never trips.
pub const DEFAULT_NANOPAY_UPDATE_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on one serialized nano-pay transaction on the payment stream.
pub const MAX_NANOPAY_TXN_SIZE: usize = 4096;

/// Attempts for building or claiming one nano-pay transaction before the
/// failure propagates.
pub const NANOPAY_RETRIES: u32 = 3;

/// Fraction of the accumulated cost that must stay covered by the last
/// claimed payment once the grace window has passed.
pub const MIN_TRAFFIC_COVERAGE: f64 = 0.9;

/// Unpaid traffic tolerance (in traffic units) for coverage enforcement.
pub const MAX_TRAFFIC_UNPAID: u64 = 1;

/// Grace window before the Exit's watchdog adopts a cost/byte sample.
/// Covers payments that are in flight when the sample is taken.
pub const TRAFFIC_DELAY: Duration = Duration::from_secs(10);

/// Worst-case time for an issued nano-pay to reach the claimer.
pub const MAX_NANOPAY_DELAY: Duration = Duration::from_secs(60);

/// Default fee fraction applied to the payment amount when no explicit
/// nano-pay fee is configured.
pub const NANOPAY_FEE_PERCENTAGE: f64 = 0.01;

// =============================================================================
// HANDSHAKE AND FRAMING LIMITS
// =============================================================================

/// Absolute deadline for the TCP metadata exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum serialized [`ConnectionMetadata`].
pub const MAX_CONN_METADATA_SIZE: usize = 1024;

/// Maximum serialized [`StreamMetadata`].
pub const MAX_STREAM_METADATA_SIZE: usize = 1024;

/// Maximum serialized [`ServiceMetadata`] (topic payloads carry port lists).
pub const MAX_SERVICE_METADATA_SIZE: usize = 4096;

/// Signing/identity public key length. Anything else fails the handshake.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Per-connection nonce length, chosen by the nonce-picking side.
pub const NONCE_SIZE: usize = 32;

// =============================================================================
// UDP
// =============================================================================

/// A datagram whose first `UDP_PREFIX_LEN` bytes are all zero is a control
/// datagram (conn-metadata), never user traffic. User payload framing
/// guarantees a non-zero first byte.
pub const UDP_PREFIX_LEN: usize = 2;

/// Copies of the UDP conn-metadata datagram sent per handshake, to ride out
/// loss without a retransmit timer.
pub const UDP_HANDSHAKE_COPIES: usize = 3;

/// Read buffer per datagram; also the largest payload the mux accepts.
pub const MAX_UDP_BUFFER_SIZE: usize = 65507;

/// Buffered datagrams on the mux read and write channels.
pub const UDP_CHANNEL_DEPTH: usize = 64;

/// Byte index of the reverse-channel selector inside user UDP payload.
/// Datagrams shorter than `UDP_CHANNEL_OFFSET + 1` are dropped.
pub const UDP_CHANNEL_OFFSET: usize = 2;

// =============================================================================
// DISCOVERY AND MEASUREMENT
// =============================================================================

/// Subscribers fetched per enumeration round; also the full-fetch cutoff.
pub const GET_SUBSCRIBERS_BATCH_SIZE: u64 = 32;

/// Hard cap on RPCs one enumeration may issue across prefix shards.
pub const MAX_RPC_REQUESTS: usize = 8;

/// Survivors kept after the latency stage, sorted by delay.
pub const MEASURE_DELAY_TOP_COUNT: usize = 32;

/// Successful bandwidth probes collected before the stage cancels the rest.
pub const MEASURE_BANDWIDTH_TOP_COUNT: usize = 8;

/// Latency probe timeout when the config supplies no dial timeout.
pub const DEFAULT_MEASURE_DELAY_TIMEOUT: Duration = Duration::from_secs(5);

/// Overall deadline for the bandwidth stage.
pub const MEASURE_BANDWIDTH_WORKERS_TIMEOUT: Duration = Duration::from_secs(60);

/// Bytes downloaded by one bandwidth probe.
pub const MEASUREMENT_BYTES_DOWNLINK: u64 = 256 * 1024;

/// Worker-pool size when the config leaves `max_pool_size` at zero.
pub const DEFAULT_POOL_SIZE: usize = 8;

/// Pause before the Entry retries an empty candidate set.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

// =============================================================================
// SUBSCRIPTION
// =============================================================================

/// Renew immediately once the subscription has at most this many blocks left.
pub const SUBSCRIBE_EXPIRY_MARGIN_BLOCKS: u64 = 3;

/// Jitter factor on the renewal schedule, so a fleet of Exits does not
/// renew in lockstep.
pub const SUBSCRIBE_DURATION_RANDOM_FACTOR: f64 = 0.1;

// =============================================================================
// AMOUNT
// =============================================================================

/// Fixed-point token amount with 8 decimal places.
///
/// All prices, balances, fees, and payment amounts use this type; float
/// arithmetic never touches money except the documented fee-percentage and
/// coverage-ratio spots, which round through integers immediately.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Amount(i64);

/// Fixed-point units per whole token.
const AMOUNT_UNIT: i64 = 100_000_000;

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_units(units: i64) -> Self {
        Amount(units)
    }

    pub const fn units(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }

    pub fn saturating_sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0))
    }

    /// Cost of `bytes` at `self` tokens per [`TRAFFIC_UNIT`].
    /// i128 intermediate: u64 byte counts cannot overflow the product.
    pub fn traffic_cost(self, bytes: u64) -> Amount {
        let units = (self.0 as i128) * (bytes as i128) / (TRAFFIC_UNIT as i128);
        Amount(units.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }

    /// Fraction of the amount, rounded down to a unit. Used for the
    /// nano-pay fee percentage only.
    pub fn percent(self, fraction: f64) -> Amount {
        Amount((self.0 as f64 * fraction) as i64)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / AMOUNT_UNIT;
        let frac = (self.0 % AMOUNT_UNIT).unsigned_abs();
        if frac == 0 {
            return write!(f, "{}", whole);
        }
        let s = format!("{:08}", frac);
        write!(f, "{}.{}", whole, s.trim_end_matches('0'))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid amount: {0}")]
pub struct AmountError(pub String);

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AmountError("empty".into()));
        }
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if frac.len() > 8 {
            return Err(AmountError(format!("more than 8 decimal places: {s}")));
        }
        let whole_units: i64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse::<i64>()
                .ok()
                .and_then(|w| w.checked_mul(AMOUNT_UNIT))
                .ok_or_else(|| AmountError(s.into()))?
        };
        let frac_units: i64 = if frac.is_empty() {
            0
        } else {
            let scale = 10_i64.pow(8 - frac.len() as u32);
            frac.parse::<i64>()
                .ok()
                .filter(|f| *f >= 0)
                .map(|f| f * scale)
                .ok_or_else(|| AmountError(s.into()))?
        };
        if whole.starts_with('-') {
            return Err(AmountError(format!("negative amount: {s}")));
        }
        Ok(Amount(whole_units + frac_units))
    }
}

// =============================================================================
// PRICE
// =============================================================================

/// Per-direction price in tokens per [`TRAFFIC_UNIT`], parsed from the
/// `"entryToExit exitToEntry"` form used in service metadata and config.
/// A single decimal applies to both directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Price {
    pub entry_to_exit: Amount,
    pub exit_to_entry: Amount,
}

impl Price {
    pub fn is_free(&self) -> bool {
        self.entry_to_exit.is_zero() && self.exit_to_entry.is_zero()
    }
}

impl FromStr for Price {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let first = parts.next().ok_or_else(|| AmountError("empty price".into()))?;
        let entry_to_exit: Amount = first.parse()?;
        let exit_to_entry = match parts.next() {
            Some(second) => second.parse()?,
            None => entry_to_exit,
        };
        if parts.next().is_some() {
            return Err(AmountError(format!("trailing tokens in price: {s}")));
        }
        Ok(Price { entry_to_exit, exit_to_entry })
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.entry_to_exit, self.exit_to_entry)
    }
}

// =============================================================================
// CIPHER SELECTION
// =============================================================================

/// Symmetric cipher negotiated in the handshake. If either side selects
/// `None`, the connection passes through unencrypted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Cipher {
    None = 0,
    #[default]
    XChaCha20Poly1305 = 1,
    Aes256Gcm = 2,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown encryption algorithm: {0}")]
pub struct CipherParseError(pub String);

impl FromStr for Cipher {
    type Err = CipherParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Cipher::None),
            "xchacha20-poly1305" => Ok(Cipher::XChaCha20Poly1305),
            "aes-gcm" | "aes-256-gcm" => Ok(Cipher::Aes256Gcm),
            other => Err(CipherParseError(other.into())),
        }
    }
}

// =============================================================================
// WIRE METADATA
// =============================================================================

/// Exchanged once per TCP connection, length-prefixed, before any payload.
///
/// The nonce-picking side (the listener role) fills `nonce`; the other side
/// reuses it verbatim, which binds the UDP handshake to the same session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    /// 32-byte Ed25519 identity of the sender.
    pub public_key: Vec<u8>,
    /// 32-byte per-connection nonce; empty until the listener picks it.
    pub nonce: Vec<u8>,
    /// Cipher the sender wants for this connection.
    pub cipher: Cipher,
    /// Bandwidth-probe connection: the listener streams random bytes and
    /// closes instead of starting a session.
    pub is_measurement: bool,
    /// Bytes the listener must send when `is_measurement` is set.
    pub measurement_bytes_downlink: u64,
    /// Keep-alive probe; the receiver drops it after the prefix check.
    pub is_ping: bool,
}

/// First frame on every multiplexed stream.
///
/// Exactly one stream per session sets `is_payment`; every other stream
/// selects the forwarded port via `(service_id, port_index)`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamMetadata {
    pub is_payment: bool,
    pub service_id: u32,
    pub port_index: u32,
}

/// Published on the subscription topic as base64 of the postcard bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceMetadata {
    /// Externally reachable IP of the Exit.
    pub ip: String,
    pub tcp_port: u16,
    /// 0 when the Exit forwards no UDP.
    pub udp_port: u16,
    /// Index of the offered service bundle.
    pub service_id: u32,
    /// TCP ports forwarded at the Exit, addressed by index.
    pub service_tcp: Vec<u16>,
    /// UDP ports forwarded at the Exit, addressed by index.
    pub service_udp: Vec<u16>,
    /// `"entryToExit exitToEntry"` in tokens per MiB.
    pub price: String,
    /// Wallet receiving payments; empty means the Exit's own address.
    pub beneficiary_addr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata too large: {0} > {1}")]
    TooLarge(usize, usize),
    #[error("metadata is not valid base64")]
    Base64,
    #[error("metadata decode failed: {0}")]
    Decode(#[from] postcard::Error),
    #[error("metadata has no usable address")]
    BadAddress,
    #[error(transparent)]
    Price(#[from] AmountError),
}

impl ServiceMetadata {
    /// Serialize for topic publication: base64 over postcard bytes.
    pub fn encode(&self) -> Result<String, MetadataError> {
        use base64::Engine;
        let bytes = postcard::to_allocvec(self)?;
        if bytes.len() > MAX_SERVICE_METADATA_SIZE {
            return Err(MetadataError::TooLarge(bytes.len(), MAX_SERVICE_METADATA_SIZE));
        }
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn decode(raw: &str) -> Result<Self, MetadataError> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(raw.trim())
            .map_err(|_| MetadataError::Base64)?;
        if bytes.len() > MAX_SERVICE_METADATA_SIZE {
            return Err(MetadataError::TooLarge(bytes.len(), MAX_SERVICE_METADATA_SIZE));
        }
        Ok(postcard::from_bytes(&bytes)?)
    }

    pub fn parse_price(&self) -> Result<Price, AmountError> {
        self.price.parse()
    }

    pub fn tcp_addr(&self) -> Result<SocketAddr, MetadataError> {
        let ip: IpAddr = self.ip.parse().map_err(|_| MetadataError::BadAddress)?;
        Ok(SocketAddr::new(ip, self.tcp_port))
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        if self.udp_port == 0 {
            return None;
        }
        let ip: IpAddr = self.ip.parse().ok()?;
        Some(SocketAddr::new(ip, self.udp_port))
    }
}

// =============================================================================
// TRAFFIC COUNTERS
// =============================================================================

/// Session byte counters, one set per tunnel.
///
/// Monotone `u64`s updated with atomic fetch-add from the relay loops and
/// the UDP mux; the payment pump reads them with plain loads and tolerates
/// staleness up to [`TRAFFIC_DELAY`]. "Paid" always trails "used".
#[derive(Debug, Default)]
pub struct TrafficCounters {
    pub used_entry_to_exit: std::sync::atomic::AtomicU64,
    pub used_exit_to_entry: std::sync::atomic::AtomicU64,
    pub paid_entry_to_exit: std::sync::atomic::AtomicU64,
    pub paid_exit_to_entry: std::sync::atomic::AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry_to_exit(&self, n: u64) {
        self.used_entry_to_exit.fetch_add(n, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn add_exit_to_entry(&self, n: u64) {
        self.used_exit_to_entry.fetch_add(n, std::sync::atomic::Ordering::Relaxed);
    }

    /// (used e2x, used x2e, paid e2x, paid x2e) snapshot.
    pub fn load(&self) -> (u64, u64, u64, u64) {
        use std::sync::atomic::Ordering::Relaxed;
        (
            self.used_entry_to_exit.load(Relaxed),
            self.used_exit_to_entry.load(Relaxed),
            self.paid_entry_to_exit.load(Relaxed),
            self.paid_exit_to_entry.load(Relaxed),
        )
    }

    pub fn unpaid(&self) -> u64 {
        let (ue, ux, pe, px) = self.load();
        (ue + ux).saturating_sub(pe + px)
    }

    /// Cost of the used counters at `price`.
    pub fn cost(&self, price: &Price) -> Amount {
        let (ue, ux, _, _) = self.load();
        price
            .entry_to_exit
            .traffic_cost(ue)
            .saturating_add(price.exit_to_entry.traffic_cost(ux))
    }
}

// =============================================================================
// NODE
// =============================================================================

/// A candidate Exit: topic subscriber plus measurement results.
#[derive(Debug, Clone)]
pub struct Node {
    /// Network address of the subscriber (identifier.pubkey form).
    pub address: String,
    /// Raw base64 metadata as published, kept for favorite caching.
    pub metadata_raw: String,
    pub metadata: ServiceMetadata,
    /// TCP connect time, millis. None until the latency stage ran.
    pub delay_ms: Option<u64>,
    /// Measured downlink, KB/s. None until the bandwidth stage ran.
    pub bandwidth_kbps: Option<u64>,
}

impl Node {
    pub fn new(address: String, metadata_raw: String, metadata: ServiceMetadata) -> Self {
        Self { address, metadata_raw, metadata, delay_ms: None, bandwidth_kbps: None }
    }

    /// Hex public-key part of an `identifier.pubkey` address, lowercased.
    pub fn pubkey_part(address: &str) -> &str {
        match address.rsplit_once('.') {
            Some((_, pk)) => pk,
            None => address,
        }
    }

    /// Identity key encoded in the address, when it is well-formed hex.
    /// Used to pin the handshake to the advertised Exit.
    pub fn public_key(&self) -> Option<[u8; PUBLIC_KEY_SIZE]> {
        let bytes = hex::decode(Node::pubkey_part(&self.address)).ok()?;
        bytes.try_into().ok()
    }
}

// =============================================================================
// TESTS
// =============================================================================
