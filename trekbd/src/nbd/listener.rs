//! Listener trait and implementations for accepting NBD connections.
//!
//! Provides a unified abstraction over different connection sources:
//! - TCP sockets (production)
//! - Channel-based streams (testing/simulation via `StreamListener`)

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Trait for accepting incoming connections.
///
/// Implemented for `TcpListener` and `StreamListener`.
#[async_trait]
pub trait Listener: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Accept the next incoming connection, along with a printable
    /// description of the peer.
    async fn accept(&mut self) -> std::io::Result<(Self::Stream, String)>;
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> std::io::Result<(Self::Stream, String)> {
        let (stream, addr) = TcpListener::accept(self).await?;
        Ok((stream, addr.to_string()))
    }
}

/// A listener that accepts streams from a channel.
///
/// Useful for tests and simulations where connections are established
/// via in-memory duplex streams rather than real sockets. Closing every
/// sender ends the accept loop.
pub struct StreamListener<S> {
    rx: mpsc::Receiver<S>,
    accepted: u64,
}

impl<S> StreamListener<S> {
    /// Create a new stream listener with the given buffer capacity.
    ///
    /// Returns the sender half for pushing streams and the listener.
    pub fn new(buffer: usize) -> (mpsc::Sender<S>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx, accepted: 0 })
    }
}

#[async_trait]
impl<S> Listener for StreamListener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    async fn accept(&mut self) -> std::io::Result<(Self::Stream, String)> {
        let stream = self.rx.recv().await.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel closed")
        })?;
        self.accepted += 1;
        Ok((stream, format!("stream-{}", self.accepted)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn stream_listener_accepts_streams() {
        let (tx, mut listener) = StreamListener::new(2);

        let (_, server1) = duplex(1024);
        let (_, server2) = duplex(1024);

        tx.send(server1).await.unwrap();
        tx.send(server2).await.unwrap();

        // Accept should return the streams in order
        assert_eq!(listener.accept().await.unwrap().1, "stream-1");
        assert_eq!(listener.accept().await.unwrap().1, "stream-2");
    }

    #[tokio::test]
    async fn stream_listener_returns_error_when_closed() {
        let (tx, mut listener) = StreamListener::<tokio::io::DuplexStream>::new(1);
        drop(tx);

        let result = listener.accept().await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn tcp_listener_reports_peer_address() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (_stream, peer) = Listener::accept(&mut listener).await.unwrap();
        assert_eq!(peer, client.local_addr().unwrap().to_string());
    }
}
