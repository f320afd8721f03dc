//! Transport layer: ciphers, TCP handshake, UDP mux, stream seam.

pub mod codec;
pub mod conn;
pub mod mux;
pub mod udp;

// Re-exports
pub use codec::{Codec, CodecError, TAG_SIZE};
pub use conn::{
    HandshakeOptions, ProtoError, Role, SecureReader, SecureStream, SecureWriter, Session,
    SessionKeyRegistry, handshake, measure_download, negotiate, read_frame, read_metadata,
    send_measurement_payload, write_frame, write_metadata,
};
pub use mux::{MuxStream, StreamMux};
pub use udp::{Datagram, UdpMux};
