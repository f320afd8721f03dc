//! Stream multiplexer seam.
//!
//! The tunnel multiplexes its control, payment, and user streams over the
//! encrypted TCP connection, but does not implement a multiplexer itself;
//! any smux-style library can be adapted behind [`StreamMux`]. Stream
//! ordering within one stream is the adapter's guarantee.
//!
//! [`MemoryMux`] is the in-process implementation used by the integration
//! tests and by same-process loopback tunnels.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::{Mutex, mpsc};

/// One multiplexed byte stream.
pub trait MuxStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> MuxStream for T {}

/// Open and accept streams over an established session transport.
#[async_trait]
pub trait StreamMux: Send + Sync {
    async fn open_stream(&self) -> io::Result<Box<dyn MuxStream>>;
    async fn accept_stream(&self) -> io::Result<Box<dyn MuxStream>>;
}

/// In-process mux: each opened stream hands its far end to the paired
/// endpoint's accept queue.
pub struct MemoryMux {
    outgoing: mpsc::Sender<DuplexStream>,
    incoming: Mutex<mpsc::Receiver<DuplexStream>>,
}

impl MemoryMux {
    /// Two connected endpoints; streams opened on one side pop out of
    /// `accept_stream` on the other.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(16);
        let (b_tx, a_rx) = mpsc::channel(16);
        (
            Self { outgoing: a_tx, incoming: Mutex::new(a_rx) },
            Self { outgoing: b_tx, incoming: Mutex::new(b_rx) },
        )
    }
}

#[async_trait]
impl StreamMux for MemoryMux {
    async fn open_stream(&self) -> io::Result<Box<dyn MuxStream>> {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        self.outgoing
            .send(remote)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mux peer closed"))?;
        Ok(Box::new(local))
    }

    async fn accept_stream(&self) -> io::Result<Box<dyn MuxStream>> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .map(|s| Box::new(s) as Box<dyn MuxStream>)
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "mux peer closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_memory_mux_roundtrip() {
        let (a, b) = MemoryMux::pair();

        let server = tokio::spawn(async move {
            let mut stream = b.accept_stream().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").await.unwrap();
        });

        let mut stream = a.open_stream().await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        server.await.unwrap();
    }
}
