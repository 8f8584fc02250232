use crate::domain::ports::ReceiverBox;
use crate::infrastructure::link::{Link, LinkState};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// The node's links, split into those still handshaking and those in use.
///
/// Each set has its own lock. Code that needs both always takes `pending`
/// first and `operational` second.
pub struct LinkContainer {
    pending: Mutex<Vec<Arc<Link>>>,
    operational: Mutex<Vec<Arc<Link>>>,
    receiver: parking_lot::Mutex<Option<ReceiverBox>>,
}

impl Default for LinkContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkContainer {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            operational: Mutex::new(Vec::new()),
            receiver: parking_lot::Mutex::new(None),
        }
    }

    /// Receiver installed on every link when it is promoted to operational.
    pub fn set_default_receiver(&self, receiver: Option<ReceiverBox>) {
        *self.receiver.lock() = receiver;
    }

    pub async fn add_pending(&self, link: Arc<Link>) {
        debug!(link = link.name(), "adding pending link");
        self.pending.lock().await.push(link);
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn operational_count(&self) -> usize {
        self.operational.lock().await.len()
    }

    pub async fn operational_links(&self) -> Vec<Arc<Link>> {
        self.operational.lock().await.clone()
    }

    /// One reconciliation pass over the link sets.
    ///
    /// Pending links whose handshake failed are dropped, those that finished
    /// it move to the operational set. Operational links that closed since
    /// the previous pass are dropped too. Removed links are stopped after both
    /// locks have been released.
    pub async fn process_pending_links(&self) {
        let receiver = self.receiver.lock().clone();
        let mut closed = Vec::new();
        {
            let mut pending = self.pending.lock().await;
            let mut operational = self.operational.lock().await;

            pending.retain(|link| match link.state() {
                LinkState::Pending => true,
                LinkState::Closed => {
                    closed.push(link.clone());
                    false
                }
                LinkState::Operational => {
                    info!(link = link.name(), "link became operational");
                    link.set_receiver(receiver.clone());
                    operational.push(link.clone());
                    false
                }
            });

            operational.retain(|link| {
                if link.state() == LinkState::Closed {
                    closed.push(link.clone());
                    false
                } else {
                    true
                }
            });
        }

        for link in closed {
            debug!(link = link.name(), "releasing closed link");
            link.stop().await;
        }
    }

    /// Stops and releases every link.
    pub async fn shutdown(&self) {
        let mut links = std::mem::take(&mut *self.pending.lock().await);
        links.append(&mut *self.operational.lock().await);

        for link in links {
            link.set_receiver(None);
            link.stop().await;
        }
    }
}
