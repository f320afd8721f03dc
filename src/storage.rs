//! Measurement verdict storage: favorites, avoid set, avoid CIDRs.
//!
//! One directory per subscription topic holds `favorite.json` and
//! `avoid.json` plus a human-edited `avoid-cidr` list. Verdicts persist
//! across runs: favorites re-enter discovery with their cached metadata,
//! avoid entries and avoid CIDRs reject candidates outright.
//!
//! Exclusivity invariant: an IP is never in both sets. Inserting a
//! favorite removes the IP from avoid and vice versa.

use crate::filter::Cidr;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tracing::warn;

const FAVORITE_FILE: &str = "favorite.json";
const AVOID_FILE: &str = "avoid.json";
const AVOID_CIDR_FILE: &str = "avoid-cidr";

/// Reject storage files larger than this before deserialization.
const MAX_STORAGE_FILE_SIZE: u64 = 1024 * 1024;

/// A node that passed bandwidth measurement. Cached metadata lets
/// discovery re-include it without a fresh RPC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FavoriteNode {
    pub ip: String,
    pub address: String,
    /// Base64 service metadata as last seen on the topic.
    pub metadata: String,
    pub delay_ms: u64,
    pub min_bandwidth_kbps: u64,
    pub max_bandwidth_kbps: u64,
}

/// A node that failed measurement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AvoidNode {
    pub ip: String,
    pub address: String,
}

/// Disk-backed verdict store, keyed by IP.
pub struct MeasureStorage {
    dir: PathBuf,
    favorites: RwLock<HashMap<String, FavoriteNode>>,
    avoid: RwLock<HashMap<String, AvoidNode>>,
    avoid_cidrs: Vec<Cidr>,
}

impl MeasureStorage {
    /// Open (creating the directory if needed) and load all three files.
    pub fn open<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let favorites: Vec<FavoriteNode> = load_json(&dir.join(FAVORITE_FILE))?;
        let avoid: Vec<AvoidNode> = load_json(&dir.join(AVOID_FILE))?;
        let avoid_cidrs = load_avoid_cidrs(&dir.join(AVOID_CIDR_FILE))?;

        Ok(Self {
            dir,
            favorites: RwLock::new(
                favorites.into_iter().map(|f| (f.ip.clone(), f)).collect(),
            ),
            avoid: RwLock::new(avoid.into_iter().map(|a| (a.ip.clone(), a)).collect()),
            avoid_cidrs,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn favorites(&self) -> Vec<FavoriteNode> {
        self.favorites.read().unwrap().values().cloned().collect()
    }

    pub fn is_avoided(&self, ip: &str) -> bool {
        self.avoid.read().unwrap().contains_key(ip)
    }

    /// Operator-edited CIDR blocks; an IP inside any of them rejects the
    /// node during discovery.
    pub fn avoid_cidrs(&self) -> &[Cidr] {
        &self.avoid_cidrs
    }

    /// Record a measurement success. Removes the IP from the avoid set.
    pub fn add_favorite(&self, node: FavoriteNode) -> io::Result<()> {
        let removed = self.avoid.write().unwrap().remove(&node.ip).is_some();
        self.favorites.write().unwrap().insert(node.ip.clone(), node);
        self.save_favorites()?;
        if removed {
            self.save_avoid()?;
        }
        Ok(())
    }

    /// Record a measurement failure. Removes the IP from favorites.
    pub fn add_avoid(&self, node: AvoidNode) -> io::Result<()> {
        let removed = self.favorites.write().unwrap().remove(&node.ip).is_some();
        self.avoid.write().unwrap().insert(node.ip.clone(), node);
        self.save_avoid()?;
        if removed {
            self.save_favorites()?;
        }
        Ok(())
    }

    fn save_favorites(&self) -> io::Result<()> {
        let list: Vec<FavoriteNode> = self.favorites.read().unwrap().values().cloned().collect();
        write_json(&self.dir.join(FAVORITE_FILE), &list)
    }

    fn save_avoid(&self) -> io::Result<()> {
        let list: Vec<AvoidNode> = self.avoid.read().unwrap().values().cloned().collect();
        write_json(&self.dir.join(AVOID_FILE), &list)
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read(path)?;
    if data.len() as u64 > MAX_STORAGE_FILE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("storage file too large: {} bytes", data.len()),
        ));
    }
    serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, data)
}

fn load_avoid_cidrs(path: &Path) -> io::Result<Vec<Cidr>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path)?;
    let mut cidrs = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.parse::<Cidr>() {
            Ok(cidr) => cidrs.push(cidr),
            // The file is hand-edited; skip junk instead of refusing to start.
            Err(e) => warn!("skipping avoid-cidr line {:?}: {}", line, e),
        }
    }
    Ok(cidrs)
}

// =============================================================================
// PER-DIRECTORY LOCKS
// =============================================================================

/// One async lock per storage directory, shared by every tunnel instance
/// in the process. Serializes measurement runs that would otherwise race
/// on the same files; tunnels without disk storage never take it.
pub fn storage_lock(path: &Path) -> Arc<tokio::sync::Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>> = OnceLock::new();
    let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    LOCKS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap()
        .entry(key)
        .or_default()
        .clone()
}
