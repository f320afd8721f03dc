//! Streaming micropayments over the dedicated payment stream.
//!
//! The Entry runs a [`PaymentPump`]: every 100 ms it compares used against
//! paid byte counters and, past the unpaid-traffic threshold or the update
//! interval, issues an incremented nano-pay transaction onto the payment
//! stream (`varint length ‖ signed tx`, each ≤ 4 KiB). The Exit runs a
//! [`PaymentCollector`] that claims each transaction, plus a watchdog that
//! samples cost with a grace delay and closes the session when coverage
//! falls below 90% with at least a traffic unit's worth unpaid.

use crate::chain::{ChainError, NanoPayClaimer, NanoPayer, Wallet};
use crate::net::mux::MuxStream;
use crate::types::{
    Amount, DEFAULT_NANOPAY_UPDATE_INTERVAL, MAX_NANOPAY_TXN_SIZE, MAX_TRAFFIC_UNPAID,
    MIN_TRAFFIC_COVERAGE, NANOPAY_RETRIES, PAYMENT_TICK, Price, TRAFFIC_DELAY,
    TRAFFIC_PAYMENT_THRESHOLD, TRAFFIC_UNIT, TrafficCounters,
};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("nano-pay transaction too large: {0}")]
    TxTooLarge(usize),
}

/// Who gets paid how much, refreshed on every (re)connect.
#[derive(Debug, Clone, Default)]
pub struct PaymentTerms {
    pub price: Price,
    pub receiver: String,
}

// =============================================================================
// VARINT FRAMING
// =============================================================================
// LEB128 length prefix on the payment stream; transactions are opaque
// signed bytes capped at MAX_NANOPAY_TXN_SIZE.

async fn write_varint<W: AsyncWrite + Unpin>(writer: &mut W, mut value: u64) -> io::Result<()> {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        writer.write_all(&[byte]).await?;
        if value == 0 {
            return Ok(());
        }
    }
}

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<u64> {
    let mut value: u64 = 0;
    for shift in (0..64).step_by(7) {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).await?;
        value |= ((byte[0] & 0x7f) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(io::Error::new(io::ErrorKind::InvalidData, "varint too long"))
}

async fn write_txn<W: AsyncWrite + Unpin>(writer: &mut W, txn: &[u8]) -> Result<(), PaymentError> {
    if txn.len() > MAX_NANOPAY_TXN_SIZE {
        return Err(PaymentError::TxTooLarge(txn.len()));
    }
    write_varint(writer, txn.len() as u64).await?;
    writer.write_all(txn).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_txn<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, PaymentError> {
    let len = read_varint(reader).await? as usize;
    if len > MAX_NANOPAY_TXN_SIZE {
        return Err(PaymentError::TxTooLarge(len));
    }
    let mut txn = vec![0u8; len];
    reader.read_exact(&mut txn).await?;
    Ok(txn)
}

// =============================================================================
// ENTRY: PAYMENT PUMP
// =============================================================================

/// Entry-side payment issuer.
pub struct PaymentPump {
    pub wallet: Arc<dyn Wallet>,
    pub counters: Arc<TrafficCounters>,
    pub terms: Arc<RwLock<PaymentTerms>>,
    pub explicit_fee: Option<Amount>,
    pub min_fee: Amount,
    pub fee_percentage: f64,
    pub close: CancellationToken,
}

impl PaymentPump {
    /// Drive payments until close; sends one final settlement on the way
    /// out. Errors other than close propagate to the session.
    pub async fn run(mut self, mut stream: Box<dyn MuxStream>) -> Result<(), PaymentError> {
        let mut payer: Option<Box<dyn NanoPayer>> = None;
        let mut payer_receiver = String::new();
        let mut last_cost = Amount::ZERO;
        let mut last_payment = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(PAYMENT_TICK);

        loop {
            tokio::select! {
                _ = self.close.cancelled() => {
                    // Best-effort final settlement; the session is going away.
                    let _ = self
                        .settle(&mut payer, &mut payer_receiver, &mut last_cost, &mut stream)
                        .await;
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let unpaid = self.counters.unpaid();
            let over_threshold = unpaid > TRAFFIC_PAYMENT_THRESHOLD * TRAFFIC_UNIT;
            let interval_due =
                unpaid > 0 && last_payment.elapsed() > DEFAULT_NANOPAY_UPDATE_INTERVAL;
            if !over_threshold && !interval_due {
                continue;
            }

            self.settle(&mut payer, &mut payer_receiver, &mut last_cost, &mut stream).await?;
            last_payment = tokio::time::Instant::now();
        }
    }

    /// Pay the difference between the current cost and the last paid cost.
    async fn settle(
        &mut self,
        payer: &mut Option<Box<dyn NanoPayer>>,
        payer_receiver: &mut String,
        last_cost: &mut Amount,
        stream: &mut Box<dyn MuxStream>,
    ) -> Result<(), PaymentError> {
        let terms = self.terms.read().unwrap().clone();
        let (used_e2x, used_x2e, _, _) = self.counters.load();

        if terms.price.is_free() {
            // Nothing to pay; keep the paid counters trailing used.
            self.counters.paid_entry_to_exit.store(used_e2x, Relaxed);
            self.counters.paid_exit_to_entry.store(used_x2e, Relaxed);
            return Ok(());
        }

        let cost = terms
            .price
            .entry_to_exit
            .traffic_cost(used_e2x)
            .saturating_add(terms.price.exit_to_entry.traffic_cost(used_x2e));
        let delta = cost.saturating_sub(*last_cost);
        if delta.is_zero() {
            return Ok(());
        }

        // The nano-pay instance is bound to its receiver; a beneficiary
        // change on reconnect needs a fresh one.
        if payer.is_none() || *payer_receiver != terms.receiver {
            *payer = Some(self.wallet.new_nano_payer(&terms.receiver).await?);
            *payer_receiver = terms.receiver.clone();
        }

        let fee = self
            .explicit_fee
            .unwrap_or_else(|| cost.percent(self.fee_percentage).max(self.min_fee));

        let txn = increment_with_retries(payer.as_mut().unwrap(), delta, fee).await?;
        write_txn(stream, &txn).await?;

        self.counters.paid_entry_to_exit.store(used_e2x, Relaxed);
        self.counters.paid_exit_to_entry.store(used_x2e, Relaxed);
        *last_cost = cost;
        debug!("paid {} (cost {} fee {})", delta, cost, fee);
        Ok(())
    }
}

async fn increment_with_retries(
    payer: &mut Box<dyn NanoPayer>,
    delta: Amount,
    fee: Amount,
) -> Result<Vec<u8>, PaymentError> {
    let mut attempt = 0;
    loop {
        match payer.increment(delta, fee).await {
            Ok(txn) => return Ok(txn),
            Err(e) => {
                attempt += 1;
                if attempt >= NANOPAY_RETRIES {
                    return Err(e.into());
                }
                warn!("nano-pay increment failed (attempt {}): {}", attempt, e);
            }
        }
    }
}

// =============================================================================
// EXIT: CLAIMER AND WATCHDOG
// =============================================================================

/// Exit-side view of what has actually been claimed.
#[derive(Default)]
pub struct ClaimState {
    last_amount: Mutex<Amount>,
    bytes_paid: std::sync::atomic::AtomicU64,
}

impl ClaimState {
    pub fn last_amount(&self) -> Amount {
        *self.last_amount.lock().unwrap()
    }

    pub fn bytes_paid(&self) -> u64 {
        self.bytes_paid.load(Relaxed)
    }
}

/// Exit-side payment consumer.
pub struct PaymentCollector {
    pub claimer: Box<dyn NanoPayClaimer>,
    pub counters: Arc<TrafficCounters>,
    pub terms: Arc<RwLock<PaymentTerms>>,
    pub state: Arc<ClaimState>,
    pub close: CancellationToken,
}

impl PaymentCollector {
    /// Read and claim transactions until the stream or the session ends.
    /// A fatal claimer error cancels the session.
    pub async fn run(self, mut stream: Box<dyn MuxStream>) -> Result<(), PaymentError> {
        loop {
            let txn = tokio::select! {
                _ = self.close.cancelled() => return Ok(()),
                txn = read_txn(&mut stream) => txn,
            };
            let txn = match txn {
                Ok(txn) => txn,
                Err(e) => {
                    // Stream gone: the payer side closed; the watchdog
                    // decides whether the session was sufficiently paid.
                    debug!("payment stream ended: {}", e);
                    return Ok(());
                }
            };

            let claimed = match self.claim_with_retries(&txn).await {
                Ok(amount) => amount,
                Err(e) => {
                    warn!("nano-pay claim failed fatally: {}", e);
                    self.close.cancel();
                    return Err(e);
                }
            };

            *self.state.last_amount.lock().unwrap() = claimed;

            // bytes_paid = total_bytes × claimed / total_cost.
            let terms = self.terms.read().unwrap().clone();
            let total_bytes = {
                let (e2x, x2e, _, _) = self.counters.load();
                e2x + x2e
            };
            let total_cost = self.counters.cost(&terms.price);
            if !total_cost.is_zero() {
                let paid = (total_bytes as i128) * (claimed.units() as i128)
                    / (total_cost.units() as i128);
                self.state.bytes_paid.store(paid.clamp(0, u64::MAX as i128) as u64, Relaxed);
            }
            debug!("claimed {} ({} bytes covered)", claimed, self.state.bytes_paid());
        }
    }

    async fn claim_with_retries(&self, txn: &[u8]) -> Result<Amount, PaymentError> {
        let mut attempt = 0;
        loop {
            match self.claimer.claim(txn).await {
                Ok(amount) => return Ok(amount),
                Err(ChainError::Closed) => return Err(ChainError::Closed.into()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= NANOPAY_RETRIES {
                        return Err(e.into());
                    }
                    warn!("nano-pay claim failed (attempt {}): {}", attempt, e);
                }
            }
        }
    }
}

/// Coverage enforcement. Samples `(cost, bytes)` every second, adopts each
/// sample only after [`TRAFFIC_DELAY`], and closes the session when both
/// hold for the adopted sample:
///
/// 1. `last_claimed < MIN_TRAFFIC_COVERAGE × cost`
/// 2. `cost − last_claimed > MAX_TRAFFIC_UNPAID × TRAFFIC_UNIT × cost/bytes`
pub async fn enforcement_watchdog(
    counters: Arc<TrafficCounters>,
    terms: Arc<RwLock<PaymentTerms>>,
    state: Arc<ClaimState>,
    close: CancellationToken,
) {
    let mut samples: VecDeque<(tokio::time::Instant, Amount, u64)> = VecDeque::new();
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = close.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let price = terms.read().unwrap().price;
        if price.is_free() {
            continue;
        }
        let (e2x, x2e, _, _) = counters.load();
        let now = tokio::time::Instant::now();
        samples.push_back((now, counters.cost(&price), e2x + x2e));

        // Adopt the newest sample old enough to be past in-flight payments.
        let mut adopted = None;
        while let Some((t, cost, bytes)) = samples.front().copied() {
            if now.duration_since(t) < TRAFFIC_DELAY {
                break;
            }
            samples.pop_front();
            adopted = Some((cost, bytes));
        }
        let Some((cost, bytes)) = adopted else { continue };
        if cost.is_zero() || bytes == 0 {
            continue;
        }

        let last = state.last_amount();
        let covered = last.units() as f64 >= cost.units() as f64 * MIN_TRAFFIC_COVERAGE;
        let unpaid_ok = (cost.saturating_sub(last).units() as i128) * (bytes as i128)
            <= (MAX_TRAFFIC_UNPAID as i128) * (TRAFFIC_UNIT as i128) * (cost.units() as i128);

        if !covered && !unpaid_ok {
            warn!(
                "payment shortfall: claimed {} of {} over {} bytes, closing session",
                last, cost, bytes
            );
            close.cancel();
            return;
        }
    }
}
