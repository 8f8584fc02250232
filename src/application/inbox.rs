use crate::application::container::LinkContainer;
use crate::domain::ports::{FinLink, MessageReceiver};
use crate::error::LinkError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Collects messages from the node's operational links for the routing engine.
///
/// The container installs the inbox as receiver on every link it promotes;
/// the routing engine drains it once per tick. Outbound messages go to every
/// operational link.
pub struct LinkInbox {
    container: Weak<LinkContainer>,
    queue: Mutex<VecDeque<Vec<u8>>>,
    processed: AtomicU64,
}

impl LinkInbox {
    pub fn new(container: Weak<LinkContainer>) -> Self {
        Self {
            container,
            queue: Mutex::new(VecDeque::new()),
            processed: AtomicU64::new(0),
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

impl MessageReceiver for LinkInbox {
    fn deliver(&self, message: Vec<u8>) {
        self.queue.lock().push_back(message);
    }
}

#[async_trait]
impl FinLink for LinkInbox {
    async fn process_inbox(&self) -> Result<(), LinkError> {
        let messages: Vec<_> = self.queue.lock().drain(..).collect();
        for message in messages {
            // Message contents belong to the financial protocol layer.
            debug!(len = message.len(), "processing inbound link message");
            self.processed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn send_outbound_message(&self, message: Vec<u8>) -> Result<(), LinkError> {
        let Some(container) = self.container.upgrade() else {
            return Err(LinkError::Closed);
        };
        for link in container.operational_links().await {
            if let Err(e) = link.send_message(message.clone()) {
                warn!(link = link.name(), error = %e, "could not queue outbound message");
            }
        }
        Ok(())
    }
}
