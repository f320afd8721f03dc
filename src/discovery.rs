//! Exit discovery: enumerate topic subscribers, merge cached favorites,
//! filter to acceptable candidates.
//!
//! # Enumeration
//!
//! Small topics are fetched in one RPC. Large topics are sharded by the
//! 256 one-byte hex prefixes of the subscriber public key: prefixes are
//! visited in random order, each contributing one random page, until a
//! batch is collected or the RPC budget runs out. Randomizing both the
//! prefix order and the page keeps repeated runs converging on the full
//! subscriber set instead of the same head page.
//!
//! # Filtering
//!
//! Decode failure, over-limit price, address-filter rejection, IP/geo
//! rejection, avoid-set membership, and avoid-CIDR membership each drop a
//! candidate. An IP inside any avoid CIDR rejects the node entirely.

use crate::chain::{ChainClient, ChainError, GeoProvider};
use crate::filter::{CompiledIpFilter, NodeAddressFilter};
use crate::storage::MeasureStorage;
use crate::types::{
    GET_SUBSCRIBERS_BATCH_SIZE, MAX_RPC_REQUESTS, Node, Price, ServiceMetadata,
};
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("no subscribers under topic {0}")]
    NoSubscribers(String),

    #[error("empty node whitelist")]
    EmptyWhitelist,
}

/// Operator-pinned Exit; metadata is fetched over RPC when absent.
#[derive(Debug, Clone)]
pub struct PresetNode {
    pub address: String,
    pub metadata: Option<String>,
}

/// Candidate source for one topic.
pub struct Discovery {
    client: Arc<dyn ChainClient>,
    topic: String,
    /// Pinned nodes override enumeration entirely.
    pub whitelist: Option<Vec<PresetNode>>,
    pub max_price: Option<Price>,
    pub address_filter: NodeAddressFilter,
    pub ip_filter: CompiledIpFilter,
    pub geo: Option<Arc<dyn GeoProvider>>,
    pub storage: Option<Arc<MeasureStorage>>,
}

impl Discovery {
    pub fn new(client: Arc<dyn ChainClient>, topic: String) -> Self {
        Self {
            client,
            topic,
            whitelist: None,
            max_price: None,
            address_filter: NodeAddressFilter::default(),
            ip_filter: CompiledIpFilter::default(),
            geo: None,
            storage: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Enumerate, merge favorites, filter. The returned nodes are
    /// unranked; measurement orders them.
    pub async fn candidates(&self) -> Result<Vec<Node>, DiscoveryError> {
        let subscribers = self.enumerate().await?;

        let mut nodes = Vec::with_capacity(subscribers.len());
        for (address, raw) in subscribers {
            match ServiceMetadata::decode(&raw) {
                Ok(metadata) => nodes.push(Node::new(address, raw, metadata)),
                Err(e) => warn!("dropping subscriber {} with bad metadata: {}", address, e),
            }
        }
        Ok(self.filter_nodes(nodes))
    }

    /// Raw `(address, metadata)` pairs before filtering.
    async fn enumerate(&self) -> Result<HashMap<String, String>, DiscoveryError> {
        if let Some(whitelist) = &self.whitelist {
            if whitelist.is_empty() {
                return Err(DiscoveryError::EmptyWhitelist);
            }
            let mut subscribers = HashMap::new();
            for preset in whitelist {
                let raw = match &preset.metadata {
                    Some(raw) => raw.clone(),
                    None => {
                        self.client.subscription(&self.topic, &preset.address).await?.meta
                    }
                };
                subscribers.insert(preset.address.clone(), raw);
            }
            return Ok(subscribers);
        }

        let total = self.client.subscriber_count(&self.topic, None).await?;
        if total == 0 && self.cached_favorites().is_empty() {
            return Err(DiscoveryError::NoSubscribers(self.topic.clone()));
        }

        let mut subscribers = if total < GET_SUBSCRIBERS_BATCH_SIZE {
            self.client.subscribers(&self.topic, None, 0, total).await?
        } else {
            self.enumerate_sharded().await?
        };

        // Favorites stand in for a fresh RPC with their cached metadata;
        // live topic data wins when both exist.
        for favorite in self.cached_favorites() {
            subscribers.entry(favorite.address).or_insert(favorite.metadata);
        }
        Ok(subscribers)
    }

    /// Shard by one-byte pubkey prefix, shuffled, one random page each.
    async fn enumerate_sharded(&self) -> Result<HashMap<String, String>, DiscoveryError> {
        let mut prefixes: Vec<u8> = (0..=255).collect();
        prefixes.shuffle(&mut rand::thread_rng());

        let mut subscribers = HashMap::new();
        let mut rpcs_used = 0usize;

        for byte in prefixes {
            // Each shard costs two RPCs (count + page); stop when the
            // budget cannot cover another.
            if rpcs_used + 2 > MAX_RPC_REQUESTS {
                debug!("discovery rpc budget exhausted after {} calls", rpcs_used);
                break;
            }
            let prefix = format!("{byte:02x}");
            let count =
                self.client.subscriber_count(&self.topic, Some(prefix.as_str())).await?;
            rpcs_used += 1;
            if count == 0 {
                continue;
            }

            let pages = count.div_ceil(GET_SUBSCRIBERS_BATCH_SIZE);
            let page = rand::thread_rng().gen_range(0..pages);
            let fetched = self
                .client
                .subscribers(
                    &self.topic,
                    Some(prefix.as_str()),
                    page * GET_SUBSCRIBERS_BATCH_SIZE,
                    GET_SUBSCRIBERS_BATCH_SIZE,
                )
                .await?;
            rpcs_used += 1;
            subscribers.extend(fetched);

            if subscribers.len() as u64 >= GET_SUBSCRIBERS_BATCH_SIZE {
                break;
            }
        }
        Ok(subscribers)
    }

    fn cached_favorites(&self) -> Vec<crate::storage::FavoriteNode> {
        self.storage.as_ref().map(|s| s.favorites()).unwrap_or_default()
    }

    fn filter_nodes(&self, nodes: Vec<Node>) -> Vec<Node> {
        nodes
            .into_iter()
            .filter(|node| {
                let price = match node.metadata.parse_price() {
                    Ok(price) => price,
                    Err(e) => {
                        warn!("dropping {}: unparseable price: {}", node.address, e);
                        return false;
                    }
                };
                if let Some(max) = self.max_price
                    && (price.entry_to_exit > max.entry_to_exit
                        || price.exit_to_entry > max.exit_to_entry)
                {
                    debug!("dropping {}: price {} over limit", node.address, price);
                    return false;
                }
                if !self.address_filter.permits(&node.address) {
                    debug!("dropping {}: address filter", node.address);
                    return false;
                }
                let Ok(ip) = node.metadata.ip.parse::<std::net::IpAddr>() else {
                    warn!("dropping {}: bad ip {:?}", node.address, node.metadata.ip);
                    return false;
                };
                if !self.ip_filter.permits(ip, self.geo.as_deref()) {
                    debug!("dropping {}: ip filter", node.address);
                    return false;
                }
                if let Some(storage) = &self.storage {
                    if storage.is_avoided(&node.metadata.ip) {
                        debug!("dropping {}: avoid set", node.address);
                        return false;
                    }
                    if storage.avoid_cidrs().iter().any(|c| c.contains(ip)) {
                        debug!("dropping {}: avoid cidr", node.address);
                        return false;
                    }
                }
                true
            })
            .collect()
    }
}
