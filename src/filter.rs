// Causeway Candidate Filters
// Distributed under the MIT software license.

//! Address filtering for Exit candidates.
//!
//! Three layers, applied by discovery after metadata decode:
//!
//! 1. **Network-address allow-list** — operator pins the exact Exits it
//!    trusts; an empty list allows everyone.
//! 2. **IP filter** — CIDR allow/block lists plus country allow/deny via a
//!    [`GeoProvider`] database.
//! 3. **Avoid CIDRs** — operator-edited blocks from measurement storage; an
//!    IP inside any of them rejects the node entirely.

use crate::chain::GeoProvider;
use crate::types::Node;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;

// =============================================================================
// CIDR
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid CIDR: {0}")]
pub struct CidrParseError(pub String);

/// One CIDR block. Families never match across: a v4 address is not
/// contained in a v6 block, and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    ip: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.ip, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                prefix_match(&net.octets(), &ip.octets(), self.prefix)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                prefix_match(&net.octets(), &ip.octets(), self.prefix)
            }
            _ => false,
        }
    }
}

fn prefix_match(net: &[u8], ip: &[u8], prefix: u8) -> bool {
    let full = prefix as usize / 8;
    if net[..full] != ip[..full] {
        return false;
    }
    let rem = prefix % 8;
    if rem == 0 {
        return true;
    }
    let mask = !(0xffu8 >> rem);
    (net[full] & mask) == (ip[full] & mask)
}

impl FromStr for Cidr {
    type Err = CidrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (ip_part, prefix_part) = match s.split_once('/') {
            Some(pair) => pair,
            // A bare address is a host block.
            None => (s, ""),
        };
        let ip: IpAddr = ip_part.parse().map_err(|_| CidrParseError(s.into()))?;
        let max = if ip.is_ipv4() { 32 } else { 128 };
        let prefix = if prefix_part.is_empty() {
            max
        } else {
            prefix_part.parse::<u8>().map_err(|_| CidrParseError(s.into()))?
        };
        if prefix > max {
            return Err(CidrParseError(s.into()));
        }
        Ok(Cidr { ip, prefix })
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix)
    }
}

// =============================================================================
// IP FILTER
// =============================================================================

/// CIDR and country filtering for Exit endpoints.
///
/// Block lists win over allow lists; empty lists are permissive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IpFilter {
    /// Only IPs inside one of these blocks pass (empty = all).
    pub allow: Vec<String>,
    /// IPs inside any of these blocks are rejected.
    pub block: Vec<String>,
    /// Only these country codes pass (empty = all).
    pub geo_allow: Vec<String>,
    /// These country codes are rejected.
    pub geo_block: Vec<String>,
}

impl IpFilter {
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty()
            && self.block.is_empty()
            && self.geo_allow.is_empty()
            && self.geo_block.is_empty()
    }

    /// Parse the configured CIDR strings once; bad entries are fatal at
    /// startup.
    pub fn compile(&self) -> Result<CompiledIpFilter, CidrParseError> {
        Ok(CompiledIpFilter {
            allow: self.allow.iter().map(|s| s.parse()).collect::<Result<_, _>>()?,
            block: self.block.iter().map(|s| s.parse()).collect::<Result<_, _>>()?,
            geo_allow: self.geo_allow.iter().map(|c| c.to_ascii_uppercase()).collect(),
            geo_block: self.geo_block.iter().map(|c| c.to_ascii_uppercase()).collect(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompiledIpFilter {
    allow: Vec<Cidr>,
    block: Vec<Cidr>,
    geo_allow: Vec<String>,
    geo_block: Vec<String>,
}

impl CompiledIpFilter {
    pub fn permits(&self, ip: IpAddr, geo: Option<&dyn GeoProvider>) -> bool {
        if self.block.iter().any(|c| c.contains(ip)) {
            return false;
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|c| c.contains(ip)) {
            return false;
        }
        if self.geo_allow.is_empty() && self.geo_block.is_empty() {
            return true;
        }
        let country = geo.and_then(|g| g.country_code(ip)).map(|c| c.to_ascii_uppercase());
        if let Some(country) = &country
            && self.geo_block.contains(country)
        {
            return false;
        }
        if !self.geo_allow.is_empty() {
            // Unknown location cannot satisfy an allow list.
            return country.map(|c| self.geo_allow.contains(&c)).unwrap_or(false);
        }
        true
    }
}

// =============================================================================
// NETWORK-ADDRESS FILTER
// =============================================================================

/// Allow-list over subscriber addresses (`identifier.pubkey` form). An
/// entry matches the full address or just its public-key part.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeAddressFilter {
    pub allow: Vec<String>,
}

impl NodeAddressFilter {
    pub fn permits(&self, address: &str) -> bool {
        if self.allow.is_empty() {
            return true;
        }
        let pubkey = Node::pubkey_part(address);
        self.allow.iter().any(|a| a == address || a == pubkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct StaticGeo(&'static str);

    impl GeoProvider for StaticGeo {
        fn country_code(&self, _ip: IpAddr) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_cidr_contains() {
        let block: Cidr = "10.0.0.0/8".parse().unwrap();
        assert!(block.contains(v4(10, 1, 2, 3)));
        assert!(!block.contains(v4(11, 0, 0, 1)));

        let narrow: Cidr = "192.168.1.128/25".parse().unwrap();
        assert!(narrow.contains(v4(192, 168, 1, 200)));
        assert!(!narrow.contains(v4(192, 168, 1, 100)));

        let host: Cidr = "203.0.113.7".parse().unwrap();
        assert!(host.contains(v4(203, 0, 113, 7)));
        assert!(!host.contains(v4(203, 0, 113, 8)));

        let v6: Cidr = "2001:db8::/32".parse().unwrap();
        assert!(v6.contains("2001:db8::1".parse().unwrap()));
        assert!(!v6.contains(v4(10, 0, 0, 1)));
    }

    #[test]
    fn test_cidr_parse_errors() {
        assert!("not-an-ip/8".parse::<Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("2001:db8::/129".parse::<Cidr>().is_err());
    }

    #[test]
    fn test_ip_filter_block_wins() {
        let filter = IpFilter {
            allow: vec!["10.0.0.0/8".into()],
            block: vec!["10.5.0.0/16".into()],
            ..Default::default()
        }
        .compile()
        .unwrap();

        assert!(filter.permits(v4(10, 1, 1, 1), None));
        assert!(!filter.permits(v4(10, 5, 1, 1), None));
        assert!(!filter.permits(v4(11, 1, 1, 1), None));
    }

    #[test]
    fn test_geo_filtering() {
        let allow_de = IpFilter { geo_allow: vec!["de".into()], ..Default::default() }
            .compile()
            .unwrap();
        let de = StaticGeo("DE");
        let us = StaticGeo("US");
        assert!(allow_de.permits(v4(1, 2, 3, 4), Some(&de)));
        assert!(!allow_de.permits(v4(1, 2, 3, 4), Some(&us)));
        // No database: an allow list rejects unknowns.
        assert!(!allow_de.permits(v4(1, 2, 3, 4), None));

        let block_us = IpFilter { geo_block: vec!["US".into()], ..Default::default() }
            .compile()
            .unwrap();
        assert!(!block_us.permits(v4(1, 2, 3, 4), Some(&us)));
        assert!(block_us.permits(v4(1, 2, 3, 4), Some(&de)));
        assert!(block_us.permits(v4(1, 2, 3, 4), None));
    }

    #[test]
    fn test_address_filter() {
        let open = NodeAddressFilter::default();
        assert!(open.permits("anything.ab12"));

        let pinned = NodeAddressFilter { allow: vec!["ab12".into(), "exit-3.cd34".into()] };
        assert!(pinned.permits("tunnel.ab12"));
        assert!(pinned.permits("exit-3.cd34"));
        assert!(!pinned.permits("tunnel.ffff"));
    }
}
