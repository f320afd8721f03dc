pub mod chain;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod filter;
pub mod measure;
pub mod net;
pub mod payment;
pub mod pubsub;
pub mod session;
pub mod storage;
pub mod types;

pub use chain::{ChainClient, ChainError, GeoProvider, NanoPayClaimer, NanoPayer, Wallet};
pub use config::{Config, ConfigError, DEFAULT_SUBSCRIPTION_PREFIX, ValidatedConfig};
pub use crypto::{Keypair, SharedKeyCache, pubkey_fingerprint};
pub use discovery::{Discovery, DiscoveryError, PresetNode};
pub use filter::{Cidr, IpFilter, NodeAddressFilter};
pub use measure::Measurement;
pub use net::{
    Codec, ProtoError, Role, SecureStream, Session, SessionKeyRegistry, StreamMux, UdpMux,
};
pub use payment::{PaymentCollector, PaymentError, PaymentPump, PaymentTerms};
pub use pubsub::MetadataPub;
pub use session::{
    Entry, EntrySession, Exit, IncomingStream, Linger, MeteredStream, Tunnel, TunnelError,
    TunnelEvent,
};
pub use storage::{AvoidNode, FavoriteNode, MeasureStorage};
pub use types::*;
