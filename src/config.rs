//! Node settings and the parsing helpers for their command-line forms.

use crate::application::listener::{IDLE_POLL_INTERVAL, MAX_PENDING_LINKS};
use crate::application::router::{HAVE_ROUTE_TIMEOUT, TICK_INTERVAL};
use crate::domain::transaction::Address;
use crate::error::ConfigError;
use std::time::Duration;

/// How long one accept call waits before the listener moves on.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_millis(10);

/// Everything a [`crate::application::node::Node`] needs to start.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// `host:port` to accept `amikolink` connections on.
    pub listen: Option<String>,
    /// Link URIs to connect to at start-up.
    pub links: Vec<String>,
    /// Public key this node presents during handshakes.
    pub node_key: Option<Vec<u8>>,
    /// Public key of the meeting point this node serves.
    pub meeting_point_key: Option<Vec<u8>>,
    /// When non-empty, only these peers pass the handshake.
    pub trusted_peers: Vec<Address>,
    pub max_pending_links: usize,
    pub accept_timeout: Duration,
    pub listener_poll_interval: Duration,
    pub tick_interval: Duration,
    pub have_route_timeout: Duration,
    pub handshake_timeout: Option<Duration>,
    pub strict_amounts: bool,
    pub reap_finished: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            listen: None,
            links: Vec::new(),
            node_key: None,
            meeting_point_key: None,
            trusted_peers: Vec::new(),
            max_pending_links: MAX_PENDING_LINKS,
            accept_timeout: ACCEPT_TIMEOUT,
            listener_poll_interval: IDLE_POLL_INTERVAL,
            tick_interval: TICK_INTERVAL,
            have_route_timeout: HAVE_ROUTE_TIMEOUT,
            handshake_timeout: None,
            strict_amounts: false,
            reap_finished: false,
        }
    }
}

impl NodeSettings {
    /// True when the node talks to peers and so needs an identity.
    pub fn needs_identity(&self) -> bool {
        self.listen.is_some() || !self.links.is_empty()
    }
}

/// Decodes a hex-encoded public key.
pub fn parse_key(field: &'static str, value: &str) -> Result<Vec<u8>, ConfigError> {
    hex::decode(value.trim()).map_err(|source| ConfigError::InvalidHex { field, source })
}

pub fn parse_address(value: &str) -> Result<Address, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(value.to_string()))
}

/// Checks that `value` has the `host:port` form.
pub fn parse_listen_address(value: &str) -> Result<String, ConfigError> {
    match value.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(value.to_string())
        }
        _ => Err(ConfigError::InvalidListenAddress(value.to_string())),
    }
}
