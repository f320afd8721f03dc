//! Seams to the decentralized name/messaging network.
//!
//! The chain client, wallet, and nano-pay machinery are external
//! collaborators; the tunnel only depends on these traits. Discovery uses
//! [`ChainClient`] for topic subscriber RPCs, the session uses [`Wallet`]
//! for balance pre-flight and payment construction, and the payment layer
//! drives [`NanoPayer`] / [`NanoPayClaimer`].

use crate::types::Amount;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("rpc failed: {0}")]
    Rpc(String),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// The collaborator shut down; callers treat this as fatal for the
    /// session rather than retrying.
    #[error("chain client closed")]
    Closed,
}

/// One on-chain subscription record.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionInfo {
    /// Published metadata, base64 of the serialized service record.
    pub meta: String,
    /// Block height at which the subscription lapses; 0 when absent.
    pub expires_at: u64,
}

/// Topic RPC surface of the messaging network.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Number of subscribers under `topic`, optionally restricted to
    /// addresses whose public-key part starts with `prefix` (lowercase hex).
    async fn subscriber_count(&self, topic: &str, prefix: Option<&str>) -> Result<u64, ChainError>;

    /// One page of subscribers: address → published metadata.
    async fn subscribers(
        &self,
        topic: &str,
        prefix: Option<&str>,
        offset: u64,
        limit: u64,
    ) -> Result<HashMap<String, String>, ChainError>;

    /// Current subscription of `subscriber` under `topic`.
    async fn subscription(
        &self,
        topic: &str,
        subscriber: &str,
    ) -> Result<SubscriptionInfo, ChainError>;

    /// Queue a subscribe transaction for `duration_blocks`, replacing any
    /// queued one. Returns the transaction hash.
    async fn subscribe(
        &self,
        identifier: &str,
        topic: &str,
        duration_blocks: u64,
        meta: &str,
        fee: Amount,
    ) -> Result<String, ChainError>;

    /// Current block height.
    async fn height(&self) -> Result<u64, ChainError>;
}

/// Wallet surface: balance plus nano-pay construction.
#[async_trait]
pub trait Wallet: Send + Sync {
    /// This wallet's network address (payment default beneficiary).
    fn address(&self) -> String;

    async fn balance(&self) -> Result<Amount, ChainError>;

    /// New nano-pay instance addressed to `receiver`. Recreated whenever
    /// the payment receiver changes.
    async fn new_nano_payer(&self, receiver: &str) -> Result<Box<dyn NanoPayer>, ChainError>;

    /// New claimer for incoming nano-pay transactions.
    async fn new_nano_pay_claimer(&self) -> Result<Box<dyn NanoPayClaimer>, ChainError>;
}

/// Entry-side streaming micropayment: a monotonically increasing signed
/// claim the payee can settle at any time.
#[async_trait]
pub trait NanoPayer: Send + Sync {
    /// Raise the cumulative amount by `delta` and return the serialized
    /// signed transaction carrying the new total.
    async fn increment(&mut self, delta: Amount, fee: Amount) -> Result<Vec<u8>, ChainError>;
}

/// Exit-side settlement of received nano-pay transactions.
#[async_trait]
pub trait NanoPayClaimer: Send + Sync {
    /// Verify and absorb one transaction; returns the cumulative claimed
    /// amount. [`ChainError::Closed`] is fatal to the session.
    async fn claim(&self, txn: &[u8]) -> Result<Amount, ChainError>;
}

/// MaxMind-style geo database lookup.
pub trait GeoProvider: Send + Sync {
    /// ISO 3166-1 alpha-2 country code for `ip`, when known.
    fn country_code(&self, ip: IpAddr) -> Option<String>;
}
