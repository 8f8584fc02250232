use super::transaction::{Address, Side, Transaction};
use crate::error::LinkError;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayLinkState {
    Pending,
    Operational,
    Closed,
}

/// One leg of a payment, owned by whoever accepted the payment request.
///
/// The routing engine only reads the transaction and signals back once the
/// route for it has been confirmed.
pub trait PayLink: Send + Sync {
    fn state(&self) -> PayLinkState;

    fn transaction(&self) -> &Transaction;

    fn is_receiver_side(&self) -> bool {
        self.transaction().side == Side::Receiver
    }

    /// Called by the routing engine when the route for this leg is confirmed.
    fn report_have_route(&self);
}

/// A link to a financial peer, drained once per routing-engine tick.
#[async_trait]
pub trait FinLink: Send + Sync {
    async fn process_inbox(&self) -> Result<(), LinkError>;
    async fn send_outbound_message(&self, message: Vec<u8>) -> Result<(), LinkError>;
}

/// Inbound delivery target of a link.
pub trait MessageReceiver: Send + Sync {
    fn deliver(&self, message: Vec<u8>);
}

/// Maps a public key to the identity hash used for addressing.
pub trait AddressDeriver: Send + Sync {
    fn derive_address(&self, public_key: &[u8]) -> Address;
}

/// Decides whether a peer presenting `address` during a handshake is admitted.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, address: &Address) -> bool;
}

pub type PayLinkBox = Arc<dyn PayLink>;
pub type FinLinkBox = Arc<dyn FinLink>;
pub type ReceiverBox = Arc<dyn MessageReceiver>;
