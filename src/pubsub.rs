//! Exit-side topic publication: keep the subscription carrying the
//! service metadata alive on chain.
//!
//! Before each cycle the current subscription is inspected: a metadata
//! mismatch or an expiry within a few blocks renews immediately, otherwise
//! the next check lands at a jittered fraction of the remaining lifetime
//! so a fleet of Exits spreads its renewals instead of thundering in the
//! same block.

use crate::chain::{ChainClient, ChainError, Wallet};
use crate::types::{
    Amount, RECONNECT_BACKOFF, SUBSCRIBE_DURATION_RANDOM_FACTOR, SUBSCRIBE_EXPIRY_MARGIN_BLOCKS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Blocks requested per subscribe transaction.
pub const SUBSCRIBE_DURATION_BLOCKS: u64 = 400;

/// Expected block interval, for converting remaining blocks to a timer.
pub const BLOCK_INTERVAL: Duration = Duration::from_secs(20);

/// Subscription maintenance loop for one service topic.
pub struct MetadataPub {
    pub client: Arc<dyn ChainClient>,
    pub wallet: Arc<dyn Wallet>,
    /// Identifier part of our subscriber address.
    pub identifier: String,
    /// Full subscriber address, as the topic lists it.
    pub subscriber: String,
    pub topic: String,
    /// Base64 service metadata to keep published.
    pub metadata_raw: String,
    /// Configured subscribe fee; capped by the live balance each cycle.
    pub fee: Amount,
    pub close: CancellationToken,
}

impl MetadataPub {
    /// Renew until closed. RPC errors back off and retry; they never kill
    /// the loop.
    pub async fn run(self) {
        loop {
            let wait = match self.maintain().await {
                Ok(wait) => wait,
                Err(e) => {
                    warn!("subscription maintenance failed: {}", e);
                    RECONNECT_BACKOFF
                }
            };
            tokio::select! {
                _ = self.close.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// One maintenance cycle; returns how long to sleep before the next.
    async fn maintain(&self) -> Result<Duration, ChainError> {
        let height = self.client.height().await?;
        let current = match self.client.subscription(&self.topic, &self.subscriber).await {
            Ok(info) => info,
            // Not subscribed yet is a normal first-run state.
            Err(ChainError::Rpc(e)) => {
                debug!("no current subscription ({}), publishing", e);
                Default::default()
            }
            Err(e) => return Err(e),
        };

        let expiring =
            current.expires_at <= height.saturating_add(SUBSCRIBE_EXPIRY_MARGIN_BLOCKS);
        let remaining_blocks = if current.meta != self.metadata_raw || expiring {
            let balance = self.wallet.balance().await?;
            let fee = self.fee.min(balance);
            let txn = self
                .client
                .subscribe(
                    &self.identifier,
                    &self.topic,
                    SUBSCRIBE_DURATION_BLOCKS,
                    &self.metadata_raw,
                    fee,
                )
                .await?;
            info!("renewed subscription to {} ({})", self.topic, txn);
            SUBSCRIBE_DURATION_BLOCKS
        } else {
            current.expires_at - height
        };

        // Sleep a jittered fraction of the lifetime that is left, staying
        // clear of the expiry margin.
        let usable = remaining_blocks.saturating_sub(SUBSCRIBE_EXPIRY_MARGIN_BLOCKS).max(1);
        let jitter = 1.0 - SUBSCRIBE_DURATION_RANDOM_FACTOR * rand::random::<f64>();
        Ok(BLOCK_INTERVAL.mul_f64(usable as f64 * jitter))
    }
}
