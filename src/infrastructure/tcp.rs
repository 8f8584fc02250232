//! Byte-stream transport over TCP.
//!
//! A [`Connection`] always hands out exactly the number of bytes asked for, or
//! a typed failure. Bytes that arrive ahead of a complete request are retained
//! and served first on the next call, and framing code can push bytes back
//! with [`ConnectionReader::unreceive`] to re-parse them later.

use crate::error::TransportError;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::debug;

/// Receiving half of a connection, owner of the retained-bytes buffer.
pub struct ConnectionReader {
    half: OwnedReadHalf,
    retained: Vec<u8>,
}

impl ConnectionReader {
    /// Receives exactly `size` bytes.
    ///
    /// Retained bytes are served first. Otherwise a single read, bounded by
    /// `timeout`, tries to fill the shortfall; whatever it returns is kept, so
    /// a [`TransportError::Timeout`] never loses data.
    pub async fn receive(
        &mut self,
        size: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if self.retained.len() >= size {
            return Ok(self.retained.drain(..size).collect());
        }

        let needed = size - self.retained.len();
        let mut fresh = vec![0u8; needed];
        let read = match tokio::time::timeout(timeout, self.half.read(&mut fresh)).await {
            Err(_) => return Err(TransportError::Timeout),
            Ok(Ok(0)) => return Err(TransportError::Closed),
            Ok(Ok(read)) => read,
            Ok(Err(e)) => return Err(TransportError::Receive(e)),
        };

        self.retained.extend_from_slice(&fresh[..read]);
        if read < needed {
            return Err(TransportError::Timeout);
        }
        Ok(std::mem::take(&mut self.retained))
    }

    /// Puts `bytes` back in front of everything retained so far.
    pub fn unreceive(&mut self, bytes: &[u8]) {
        self.retained.splice(0..0, bytes.iter().copied());
    }

    pub fn retained_len(&self) -> usize {
        self.retained.len()
    }
}

/// Sending half of a connection. Dropping it shuts the write side down.
pub struct ConnectionWriter {
    half: OwnedWriteHalf,
}

impl ConnectionWriter {
    /// Writes the whole buffer, looping over partial writes.
    ///
    /// After a failure the stream is in an undefined state and should not be
    /// used for further sends.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut start = 0;
        while start < data.len() {
            let written = self
                .half
                .write(&data[start..])
                .await
                .map_err(TransportError::Send)?;
            if written == 0 {
                return Err(TransportError::Send(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("tried to send {} bytes, but none were written", data.len() - start),
                )));
            }
            start += written;
        }
        Ok(())
    }
}

/// An open TCP connection with a retained receive buffer.
pub struct Connection {
    peer: Option<SocketAddr>,
    reader: ConnectionReader,
    writer: ConnectionWriter,
}

impl Connection {
    /// Resolves `host`:`service` and connects to the first candidate address
    /// that accepts.
    pub async fn connect(host: &str, service: &str) -> Result<Self, TransportError> {
        let candidates = resolve(format!("{host}:{service}")).await?;

        let mut last_error = None;
        for addr in candidates {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(Self::from_stream(stream)),
                Err(e) => {
                    debug!(%addr, error = %e, "connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(TransportError::Connect(match last_error {
            Some(e) => format!("failed to connect to {host}:{service}: {e}"),
            None => format!("no addresses found for {host}:{service}"),
        }))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let (read, write) = stream.into_split();
        Self {
            peer,
            reader: ConnectionReader {
                half: read,
                retained: Vec::new(),
            },
            writer: ConnectionWriter { half: write },
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.writer.send(data).await
    }

    pub async fn receive(
        &mut self,
        size: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.reader.receive(size, timeout).await
    }

    pub fn unreceive(&mut self, bytes: &[u8]) {
        self.reader.unreceive(bytes);
    }

    pub fn reader(&mut self) -> &mut ConnectionReader {
        &mut self.reader
    }

    pub fn writer(&mut self) -> &mut ConnectionWriter {
        &mut self.writer
    }

    /// Splits into independently usable halves; retained bytes go with the reader.
    pub fn into_split(self) -> (ConnectionReader, ConnectionWriter) {
        (self.reader, self.writer)
    }
}

async fn resolve(target: impl ToSocketAddrs) -> Result<Vec<SocketAddr>, TransportError> {
    tokio::net::lookup_host(target)
        .await
        .map(|addrs| addrs.collect())
        .map_err(|e| TransportError::Connect(format!("address resolution failed: {e}")))
}

/// Source of inbound transport connections.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Waits a bounded time for one connection; expiry is [`TransportError::Timeout`].
    async fn accept(&self) -> Result<Connection, TransportError>;
}

pub struct TcpAcceptor {
    listener: TcpListener,
    timeout: Duration,
}

impl TcpAcceptor {
    pub async fn bind(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Connect(format!("bind failed: {e}")))?;
        Ok(Self { listener, timeout })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(|e| TransportError::Connect(e.to_string()))
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> Result<Connection, TransportError> {
        match tokio::time::timeout(self.timeout, self.listener.accept()).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Ok((stream, addr))) => {
                debug!(%addr, "accepted connection");
                Ok(Connection::from_stream(stream))
            }
            Ok(Err(e)) => Err(TransportError::Connect(format!("accept failed: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(200);

    async fn pair() -> (Connection, Connection) {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0", Duration::from_secs(5))
            .await
            .unwrap();
        let port = acceptor.local_addr().unwrap().port().to_string();
        let (client, server) = tokio::join!(Connection::connect("127.0.0.1", &port), acceptor.accept());
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn test_transfers_data() {
        let (mut c1, mut c2) = pair().await;
        c1.send(b"abcdef").await.unwrap();
        let data = c2.receive(6, SHORT).await.unwrap();
        assert_eq!(data, b"abcdef");
    }

    #[tokio::test]
    async fn test_receive_times_out_without_data() {
        let (_c1, mut c2) = pair().await;
        let result = c2.receive(4, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
        assert_eq!(c2.reader().retained_len(), 0);
    }

    #[tokio::test]
    async fn test_partial_data_is_kept_across_timeout() {
        let (mut c1, mut c2) = pair().await;

        c1.send(b"gh").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = c2.receive(6, SHORT).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
        assert_eq!(c2.reader().retained_len(), 2);

        c1.send(b"ijkl").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let data = c2.receive(6, SHORT).await.unwrap();
        assert_eq!(data, b"ghijkl");
        assert_eq!(c2.reader().retained_len(), 0);
    }

    #[tokio::test]
    async fn test_retained_bytes_are_served_fifo() {
        let (mut c1, mut c2) = pair().await;
        c2.unreceive(b"abcdef");

        assert_eq!(c2.receive(2, SHORT).await.unwrap(), b"ab");
        assert_eq!(c2.receive(4, SHORT).await.unwrap(), b"cdef");

        c1.send(b"xy").await.unwrap();
        assert_eq!(c2.receive(2, SHORT).await.unwrap(), b"xy");
    }

    #[tokio::test]
    async fn test_unreceive_goes_before_retained_bytes() {
        let (mut c1, mut c2) = pair().await;

        c1.send(b"mnop").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(c2.receive(2, SHORT).await.unwrap(), b"mn");

        c2.unreceive(b"qr");
        c1.send(b"st").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(c2.receive(6, SHORT).await.unwrap(), b"qropst");
    }

    #[tokio::test]
    async fn test_peer_close_is_detected() {
        let (c1, mut c2) = pair().await;
        drop(c1);
        let result = c2.receive(1, SHORT).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_zero_size_receive_returns_immediately() {
        let (_c1, mut c2) = pair().await;
        assert!(c2.receive(0, SHORT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0", SHORT).await.unwrap();
        let port = acceptor.local_addr().unwrap().port().to_string();
        drop(acceptor);

        let result = Connection::connect("127.0.0.1", &port).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn test_accept_times_out() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(matches!(acceptor.accept().await, Err(TransportError::Timeout)));
    }
}
