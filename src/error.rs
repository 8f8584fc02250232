use crate::domain::transaction::CommitHash;
use thiserror::Error;

/// Failures of the byte-stream transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("data not available before the timeout")]
    Timeout,
    #[error("connection closed by peer")]
    Closed,
    #[error("error receiving from connection: {0}")]
    Receive(#[source] std::io::Error),
    #[error("error sending to connection: {0}")]
    Send(#[source] std::io::Error),
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("link construction failed: {0}")]
    ConstructionFailed(String),
    #[error("no complete message available")]
    NoDataAvailable,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("link is closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("payment failed: {0}")]
    PaymentFailed(String),
    #[error("no route confirmed before the deadline for commit hash {0}")]
    RouteTimeout(CommitHash),
    #[error("validation error: {0}")]
    ValidationError(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid hex in {field}: {source}")]
    InvalidHex {
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },
    #[error("invalid address {0:?}: expected 40 hex characters")]
    InvalidAddress(String),
    #[error("invalid listen address {0:?}")]
    InvalidListenAddress(String),
    #[error("a node key is required to {0}")]
    MissingNodeKey(&'static str),
}

/// Failures while starting or running a node.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("listener failed: {0}")]
    Listener(#[from] TransportError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Payment(#[from] PaymentError),
    #[error("node task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T, E = PaymentError> = std::result::Result<T, E>;
