//! The `amikolink` link variant.
//!
//! Both sides open with `AMIKOPAY/<min>/<max>\n` and settle on the highest
//! protocol version they share. Each then sends a hello frame carrying its
//! 20-byte address, which the other side checks before the link goes
//! operational. Every later message is a frame: a 4-byte big-endian length
//! followed by the payload.

use crate::domain::ports::IdentityVerifier;
use crate::domain::transaction::Address;
use crate::error::{LinkError, TransportError};
use crate::infrastructure::link::{Link, LinkProtocol};
use crate::infrastructure::registry::SchemeHandler;
use crate::infrastructure::tcp::{Connection, ConnectionReader, ConnectionWriter};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub const SCHEME: &str = "amikolink";
pub const DEFAULT_PORT: u16 = 4321;
pub const MIN_PROTOCOL_VERSION: u32 = 1;
pub const MAX_PROTOCOL_VERSION: u32 = 1;
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

const MAGIC: &[u8] = b"AMIKOPAY/";
const MAX_VERSION_LINE: usize = 128;

pub struct AmikoLinkProtocol {
    local_address: Address,
    expected_remote: Option<Address>,
    verifier: Arc<dyn IdentityVerifier>,
    poll_interval: Duration,
}

impl AmikoLinkProtocol {
    pub fn new(
        local_address: Address,
        expected_remote: Option<Address>,
        verifier: Arc<dyn IdentityVerifier>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            local_address,
            expected_remote,
            verifier,
            poll_interval,
        }
    }

    async fn receive_version(&self, reader: &mut ConnectionReader) -> Result<u32, LinkError> {
        let magic = receive_blocking(reader, MAGIC.len(), self.poll_interval).await?;
        if magic != MAGIC {
            return Err(LinkError::Handshake("received invalid magic bytes".to_string()));
        }

        let mut line = Vec::new();
        loop {
            let byte = receive_blocking(reader, 1, self.poll_interval).await?;
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() > MAX_VERSION_LINE {
                return Err(LinkError::Handshake(
                    "did not receive version negotiation terminator".to_string(),
                ));
            }
        }

        let (min, max) = parse_version_range(&line)?;
        if min > MAX_PROTOCOL_VERSION || max < MIN_PROTOCOL_VERSION {
            return Err(LinkError::Handshake(format!(
                "no matching protocol version: peer supports {min}..={max}"
            )));
        }
        Ok(max.min(MAX_PROTOCOL_VERSION))
    }
}

fn parse_version_range(line: &[u8]) -> Result<(u32, u32), LinkError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| LinkError::Handshake("version string is not UTF-8".to_string()))?;
    let (min, max) = text
        .split_once('/')
        .ok_or_else(|| LinkError::Handshake("no min/max separator in version string".to_string()))?;
    let parse = |value: &str| {
        value
            .parse::<u32>()
            .map_err(|_| LinkError::Handshake(format!("invalid protocol version {value:?}")))
    };
    Ok((parse(min)?, parse(max)?))
}

/// Retries a receive until the requested bytes are complete.
///
/// Partial data survives each timeout in the retained buffer, so retrying is
/// lossless. Used only during the handshake, which is bounded from outside.
async fn receive_blocking(
    reader: &mut ConnectionReader,
    size: usize,
    poll: Duration,
) -> Result<Vec<u8>, LinkError> {
    loop {
        match reader.receive(size, poll).await {
            Ok(bytes) => return Ok(bytes),
            Err(TransportError::Timeout) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

pub async fn write_frame(writer: &mut ConnectionWriter, message: &[u8]) -> Result<(), LinkError> {
    if message.len() > MAX_MESSAGE_SIZE {
        return Err(LinkError::Protocol(format!(
            "message of {} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit",
            message.len()
        )));
    }
    let mut frame = Vec::with_capacity(4 + message.len());
    frame.extend_from_slice(&(message.len() as u32).to_be_bytes());
    frame.extend_from_slice(message);
    Ok(writer.send(&frame).await?)
}

/// Reads one frame, or pushes the header back and reports
/// [`LinkError::NoDataAvailable`] when the body is still incomplete.
pub async fn read_frame(reader: &mut ConnectionReader, poll: Duration) -> Result<Vec<u8>, LinkError> {
    let header = match reader.receive(4, poll).await {
        Ok(header) => header,
        Err(TransportError::Timeout) => return Err(LinkError::NoDataAvailable),
        Err(e) => return Err(e.into()),
    };

    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(LinkError::Protocol(format!(
            "announced message of {len} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit"
        )));
    }

    match reader.receive(len, poll).await {
        Ok(body) => Ok(body),
        Err(TransportError::Timeout) => {
            reader.unreceive(&header);
            Err(LinkError::NoDataAvailable)
        }
        Err(e) => Err(e.into()),
    }
}

impl AmikoLinkProtocol {
    /// Runs version negotiation and the address exchange, returning the
    /// peer's address and the negotiated version.
    async fn handshake(&self, connection: &mut Connection) -> Result<(Address, u32), LinkError> {
        let greeting = format!("AMIKOPAY/{MIN_PROTOCOL_VERSION}/{MAX_PROTOCOL_VERSION}\n");
        connection.send(greeting.as_bytes()).await?;
        let version = self.receive_version(connection.reader()).await?;
        debug!(version, "negotiated protocol version");

        write_frame(connection.writer(), self.local_address.as_bytes()).await?;
        let hello = loop {
            match read_frame(connection.reader(), self.poll_interval).await {
                Ok(hello) => break hello,
                Err(LinkError::NoDataAvailable) => continue,
                Err(e) => return Err(e),
            }
        };

        let remote = Address::from_slice(&hello).ok_or_else(|| {
            LinkError::Handshake(format!("hello carries {} bytes, not an address", hello.len()))
        })?;
        if let Some(expected) = self.expected_remote
            && expected != remote
        {
            return Err(LinkError::Handshake(format!(
                "peer presented {remote}, expected {expected}"
            )));
        }
        if !self.verifier.verify(&remote) {
            return Err(LinkError::Handshake(format!("peer {remote} is not trusted")));
        }

        Ok((remote, version))
    }
}

#[async_trait]
impl LinkProtocol for AmikoLinkProtocol {
    async fn initialize(&self, connection: &mut Connection) -> Result<(), LinkError> {
        let (remote, version) = self.handshake(connection).await?;
        info!(peer = %remote, version, "amikolink handshake complete");
        Ok(())
    }

    async fn send_message_direct(
        &self,
        writer: &mut ConnectionWriter,
        message: &[u8],
    ) -> Result<(), LinkError> {
        write_frame(writer, message).await
    }

    async fn receive_message_direct(
        &self,
        reader: &mut ConnectionReader,
    ) -> Result<Vec<u8>, LinkError> {
        read_frame(reader, self.poll_interval).await
    }
}

/// Builds `amikolink` links, outbound from a URI or inbound from an accepted
/// connection.
pub struct AmikoLinkHandler {
    local_address: Address,
    verifier: Arc<dyn IdentityVerifier>,
    poll_interval: Duration,
    handshake_timeout: Option<Duration>,
}

impl AmikoLinkHandler {
    pub fn new(local_address: Address, verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self {
            local_address,
            verifier,
            poll_interval: Duration::from_millis(100),
            handshake_timeout: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    fn protocol(&self, expected_remote: Option<Address>) -> Arc<AmikoLinkProtocol> {
        Arc::new(AmikoLinkProtocol::new(
            self.local_address,
            expected_remote,
            self.verifier.clone(),
            self.poll_interval,
        ))
    }
}

#[async_trait]
impl SchemeHandler for AmikoLinkHandler {
    async fn connect(&self, uri: &Url) -> Result<Link, LinkError> {
        let host = uri
            .host_str()
            .ok_or_else(|| LinkError::ConstructionFailed(format!("{uri} has no host")))?;
        let port = uri.port().unwrap_or(DEFAULT_PORT);

        let path = uri.path().trim_start_matches('/');
        let expected_remote = if path.is_empty() {
            None
        } else {
            Some(path.parse::<Address>().map_err(|e| {
                LinkError::ConstructionFailed(format!("{uri}: path is not an address: {e}"))
            })?)
        };

        let connection = Connection::connect(host, &port.to_string()).await?;
        Ok(Link::new(uri.as_str(), connection, self.protocol(expected_remote))
            .with_handshake_timeout(self.handshake_timeout))
    }

    fn accept(&self, connection: Connection) -> Link {
        let name = connection
            .peer_addr()
            .map(|addr| format!("{SCHEME}://{addr}"))
            .unwrap_or_else(|| format!("{SCHEME}://unknown"));
        Link::new(name, connection, self.protocol(None))
            .with_handshake_timeout(self.handshake_timeout)
    }
}
