//! Recognized configuration surface for both tunnel roles.
//!
//! JSON loading and CLI flags belong to the embedding application; this
//! module only defines the option set and validates it once at startup.
//! Validation failures (unparseable price, unknown cipher, bad CIDR) are
//! fatal — a tunnel never starts on a half-understood config.

use crate::filter::{CidrParseError, CompiledIpFilter, IpFilter, NodeAddressFilter};
use crate::types::{
    Amount, AmountError, Cipher, CipherParseError, DEFAULT_MEASURE_DELAY_TIMEOUT,
    DEFAULT_POOL_SIZE, NANOPAY_FEE_PERCENTAGE, Price,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Topic prefix when the config leaves it empty.
pub const DEFAULT_SUBSCRIPTION_PREFIX: &str = "causeway-v1.";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("bad price: {0}")]
    Price(#[from] AmountError),

    #[error(transparent)]
    Cipher(#[from] CipherParseError),

    #[error(transparent)]
    Cidr(#[from] CidrParseError),
}

/// Raw option surface, shared by Entry and Exit configs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// `"entryToExit exitToEntry"` ceiling for acceptable Exit prices;
    /// empty means any price.
    pub max_price: String,
    /// Local address for listener sockets.
    #[serde(rename = "listenIP")]
    pub listen_ip: String,
    pub ip_filter: IpFilter,
    /// Allow-list over subscriber network addresses.
    pub address_filter: NodeAddressFilter,
    /// Payment beneficiary advertised by an Exit; empty = its own wallet.
    pub beneficiary_addr: String,
    /// Topic prefix; the topic is `prefix + service_name`.
    pub subscription_prefix: String,
    /// Run the bandwidth stage after latency ranking.
    pub measure_bandwidth: bool,
    /// Directory for favorite/avoid verdicts; empty disables persistence.
    pub measure_storage_path: String,
    /// Worker-pool bound for measurement stages; 0 = small default.
    pub max_pool_size: usize,
    /// Seconds; 0 falls back to the default probe timeout.
    pub dial_timeout_secs: u64,
    /// Refuse to connect below this wallet balance when prices are
    /// non-zero; empty disables the pre-flight.
    pub min_balance: String,
    pub encryption: String,
    /// Explicit nano-pay fee; empty = percentage rule.
    pub nano_pay_fee: String,
    pub min_nano_pay_fee: String,
    pub nano_pay_fee_percentage: f64,
    /// Swap dial direction: the Exit opens the tunnel outbound to a NATed
    /// Entry. Same protocol, handshake roles unchanged.
    pub reverse: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_price: String::new(),
            listen_ip: "0.0.0.0".into(),
            ip_filter: IpFilter::default(),
            address_filter: NodeAddressFilter::default(),
            beneficiary_addr: String::new(),
            subscription_prefix: DEFAULT_SUBSCRIPTION_PREFIX.into(),
            measure_bandwidth: false,
            measure_storage_path: String::new(),
            max_pool_size: 0,
            dial_timeout_secs: 0,
            min_balance: String::new(),
            encryption: "xchacha20-poly1305".into(),
            nano_pay_fee: String::new(),
            min_nano_pay_fee: String::new(),
            nano_pay_fee_percentage: NANOPAY_FEE_PERCENTAGE,
            reverse: false,
        }
    }
}

impl Config {
    pub fn topic(&self, service_name: &str) -> String {
        let prefix = if self.subscription_prefix.is_empty() {
            DEFAULT_SUBSCRIPTION_PREFIX
        } else {
            &self.subscription_prefix
        };
        format!("{prefix}{service_name}")
    }

    /// Parse every string-typed option once. Call at startup; errors are
    /// fatal.
    pub fn validate(&self) -> Result<ValidatedConfig, ConfigError> {
        let max_price = match self.max_price.trim() {
            "" => None,
            s => Some(s.parse::<Price>()?),
        };
        let min_balance = match self.min_balance.trim() {
            "" => Amount::ZERO,
            s => s.parse()?,
        };
        let nano_pay_fee = match self.nano_pay_fee.trim() {
            "" => None,
            s => Some(s.parse::<Amount>()?),
        };
        let min_nano_pay_fee = match self.min_nano_pay_fee.trim() {
            "" => Amount::ZERO,
            s => s.parse()?,
        };
        Ok(ValidatedConfig {
            max_price,
            min_balance,
            cipher: self.encryption.parse()?,
            ip_filter: self.ip_filter.compile()?,
            nano_pay_fee,
            min_nano_pay_fee,
            nano_pay_fee_percentage: self.nano_pay_fee_percentage,
            dial_timeout: if self.dial_timeout_secs == 0 {
                DEFAULT_MEASURE_DELAY_TIMEOUT
            } else {
                Duration::from_secs(self.dial_timeout_secs)
            },
            pool_size: if self.max_pool_size == 0 { DEFAULT_POOL_SIZE } else { self.max_pool_size },
        })
    }
}

/// Parsed, startup-validated view of [`Config`].
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub max_price: Option<Price>,
    pub min_balance: Amount,
    pub cipher: Cipher,
    pub ip_filter: CompiledIpFilter,
    pub nano_pay_fee: Option<Amount>,
    pub min_nano_pay_fee: Amount,
    pub nano_pay_fee_percentage: f64,
    pub dial_timeout: Duration,
    pub pool_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let validated = Config::default().validate().unwrap();
        assert!(validated.max_price.is_none());
        assert_eq!(validated.cipher, Cipher::XChaCha20Poly1305);
        assert_eq!(validated.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(validated.dial_timeout, DEFAULT_MEASURE_DELAY_TIMEOUT);
    }

    #[test]
    fn test_bad_options_are_fatal() {
        let bad_price = Config { max_price: "cheap".into(), ..Default::default() };
        assert!(bad_price.validate().is_err());

        let bad_cipher = Config { encryption: "rot13".into(), ..Default::default() };
        assert!(bad_cipher.validate().is_err());

        let bad_cidr = Config {
            ip_filter: IpFilter { block: vec!["10.0.0.0/99".into()], ..Default::default() },
            ..Default::default()
        };
        assert!(bad_cidr.validate().is_err());
    }

    #[test]
    fn test_topic_name() {
        let config = Config::default();
        assert_eq!(config.topic("socks"), "causeway-v1.socks");

        let custom =
            Config { subscription_prefix: "test.".into(), ..Default::default() };
        assert_eq!(custom.topic("web"), "test.web");
    }

    #[test]
    fn test_recognized_json_surface() {
        let json = r#"{
            "maxPrice": "0.01 0.01",
            "listenIP": "127.0.0.1",
            "ipFilter": {"block": ["203.0.113.0/24"], "geoAllow": ["DE"]},
            "addressFilter": {"allow": ["ab12"]},
            "measureBandwidth": true,
            "encryption": "aes-gcm",
            "minBalance": "0.001",
            "nanoPayFeePercentage": 0.05,
            "reverse": true
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.listen_ip, "127.0.0.1");
        assert!(config.measure_bandwidth);
        assert!(config.reverse);
        let validated = config.validate().unwrap();
        assert_eq!(validated.cipher, Cipher::Aes256Gcm);
        assert_eq!(validated.max_price.unwrap().entry_to_exit, "0.01".parse().unwrap());
        assert_eq!(validated.min_balance, "0.001".parse().unwrap());
    }
}
