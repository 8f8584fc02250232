use crate::application::container::LinkContainer;
use crate::error::TransportError;
use crate::infrastructure::registry::SchemeHandler;
use crate::infrastructure::tcp::Acceptor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Most links allowed to sit in the handshake phase at once.
pub const MAX_PENDING_LINKS: usize = 100;

/// Sleep between accept cycles.
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Accepts inbound connections and feeds them to a [`LinkContainer`].
pub struct Listener {
    acceptor: Arc<dyn Acceptor>,
    handler: Arc<dyn SchemeHandler>,
    container: Arc<LinkContainer>,
    max_pending: usize,
    poll_interval: Duration,
    stop: watch::Sender<bool>,
}

impl Listener {
    /// Creates a listener that wraps accepted connections with `handler`.
    ///
    /// # Arguments
    ///
    /// * `acceptor` - Source of inbound connections.
    /// * `handler` - Scheme handler of the listening protocol.
    /// * `container` - Where new links are registered as pending.
    pub fn new(
        acceptor: Arc<dyn Acceptor>,
        handler: Arc<dyn SchemeHandler>,
        container: Arc<LinkContainer>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            acceptor,
            handler,
            container,
            max_pending: MAX_PENDING_LINKS,
            poll_interval: IDLE_POLL_INTERVAL,
            stop,
        }
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Runs accept cycles until [`Listener::stop`] is called.
    ///
    /// Accept timeouts are part of normal polling. Any other accept failure
    /// ends the loop with that error, and the node is expected to shut down.
    pub async fn run(&self) -> Result<(), TransportError> {
        let mut stop = self.stop.subscribe();
        info!(max_pending = self.max_pending, "listener started");

        while !*stop.borrow() {
            if let Err(e) = self.accept_new_connections().await {
                error!(error = %e, "listener failed to accept connections");
                return Err(e);
            }
            self.container.process_pending_links().await;

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = stop.changed() => {}
            }
        }

        info!("listener stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Accepts connections while the pending set is below the ceiling.
    pub async fn accept_new_connections(&self) -> Result<usize, TransportError> {
        let mut accepted = 0;
        while self.container.pending_count().await < self.max_pending {
            match self.acceptor.accept().await {
                Ok(connection) => {
                    let link = Arc::new(self.handler.accept(connection));
                    link.start();
                    self.container.add_pending(link).await;
                    accepted += 1;
                }
                Err(TransportError::Timeout) => break,
                Err(e) => return Err(e),
            }
        }
        if accepted > 0 {
            debug!(accepted, "accepted new connections");
        }
        Ok(accepted)
    }
}
