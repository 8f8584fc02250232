//! Message-oriented links over a [`Connection`].
//!
//! A link starts `Pending`, runs its protocol's handshake on its own task and
//! then becomes `Operational`, or `Closed` when the handshake fails. Once
//! operational, one loop drains the outbound queue while a second one frames
//! inbound messages and hands them to the current receiver. Any I/O error or
//! an explicit stop closes the link for good.

use crate::domain::ports::{MessageReceiver, ReceiverBox};
use crate::error::LinkError;
use crate::infrastructure::tcp::{Connection, ConnectionReader, ConnectionWriter};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Pending,
    Operational,
    Closed,
}

/// Handshake and framing behaviour of one link variant.
#[async_trait]
pub trait LinkProtocol: Send + Sync {
    /// Runs the handshake on a freshly connected transport.
    async fn initialize(&self, connection: &mut Connection) -> Result<(), LinkError>;

    async fn send_message_direct(
        &self,
        writer: &mut ConnectionWriter,
        message: &[u8],
    ) -> Result<(), LinkError>;

    /// Returns one complete inbound message, or [`LinkError::NoDataAvailable`]
    /// when none arrived within the protocol's poll window.
    async fn receive_message_direct(
        &self,
        reader: &mut ConnectionReader,
    ) -> Result<Vec<u8>, LinkError>;
}

struct Shared {
    state: Mutex<LinkState>,
    receiver: Mutex<Option<ReceiverBox>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    stop: watch::Sender<bool>,
    dropped: AtomicU64,
}

impl Shared {
    fn state(&self) -> LinkState {
        *self.state.lock()
    }

    fn transition(&self, to: LinkState) -> bool {
        let mut state = self.state.lock();
        let allowed = matches!(
            (*state, to),
            (LinkState::Pending, LinkState::Operational)
                | (LinkState::Pending, LinkState::Closed)
                | (LinkState::Operational, LinkState::Closed)
        );
        if allowed {
            *state = to;
        }
        allowed
    }

    fn deliver(&self, name: &str, message: Vec<u8>) {
        let receiver = self.receiver.lock().clone();
        match receiver {
            Some(receiver) => receiver.deliver(message),
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(link = name, len = message.len(), "no receiver set, dropping message");
            }
        }
    }
}

struct Startup {
    connection: Connection,
    protocol: Arc<dyn LinkProtocol>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    handshake_timeout: Option<Duration>,
}

pub struct Link {
    name: String,
    shared: Arc<Shared>,
    startup: Mutex<Option<Startup>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    /// Wraps a connected transport; the link stays `Pending` until [`Link::start`].
    pub fn new(
        name: impl Into<String>,
        connection: Connection,
        protocol: Arc<dyn LinkProtocol>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                state: Mutex::new(LinkState::Pending),
                receiver: Mutex::new(None),
                outbound: outbound_tx,
                stop,
                dropped: AtomicU64::new(0),
            }),
            startup: Mutex::new(Some(Startup {
                connection,
                protocol,
                outbound: outbound_rx,
                handshake_timeout: None,
            })),
            task: Mutex::new(None),
        }
    }

    /// Closes the link if its handshake has not finished within `timeout`.
    pub fn with_handshake_timeout(self, timeout: Option<Duration>) -> Self {
        if let Some(startup) = self.startup.lock().as_mut() {
            startup.handshake_timeout = timeout;
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the processing task. Calling it again has no effect.
    pub fn start(&self) {
        let Some(startup) = self.startup.lock().take() else {
            debug!(link = %self.name, "link already started");
            return;
        };
        let handle = tokio::spawn(run(self.name.clone(), self.shared.clone(), startup));
        *self.task.lock() = Some(handle);
    }

    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    /// Queues a message for sending; fails only once the link is closed.
    pub fn send_message(&self, message: Vec<u8>) -> Result<(), LinkError> {
        if self.state() == LinkState::Closed {
            return Err(LinkError::Closed);
        }
        self.shared
            .outbound
            .send(message)
            .map_err(|_| LinkError::Closed)
    }

    pub fn set_receiver(&self, receiver: Option<ReceiverBox>) {
        *self.shared.receiver.lock() = receiver;
    }

    pub fn has_receiver(&self) -> bool {
        self.shared.receiver.lock().is_some()
    }

    /// Number of inbound messages dropped because no receiver was set.
    pub fn dropped_messages(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Stops the processing task and waits for it; the link ends `Closed`.
    pub async fn stop(&self) {
        self.shared.stop.send_replace(true);
        self.set_receiver(None);
        self.startup.lock().take();

        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(link = %self.name, error = %e, "link task ended abnormally");
        }
        self.shared.transition(LinkState::Closed);
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.shared.stop.send_replace(true);
    }
}

/// Delivering to a link sends the message back out over it.
impl MessageReceiver for Link {
    fn deliver(&self, message: Vec<u8>) {
        if let Err(e) = self.send_message(message) {
            debug!(link = %self.name, error = %e, "could not forward message");
        }
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn run(name: String, shared: Arc<Shared>, startup: Startup) {
    let Startup {
        mut connection,
        protocol,
        mut outbound,
        handshake_timeout,
    } = startup;
    let mut stop = shared.stop.subscribe();

    let handshake = async {
        match handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, protocol.initialize(&mut connection))
                .await
                .unwrap_or_else(|_| Err(LinkError::Handshake("timed out".to_string()))),
            None => protocol.initialize(&mut connection).await,
        }
    };
    let result = tokio::select! {
        result = handshake => result,
        _ = stopped(&mut stop) => Err(LinkError::Closed),
    };

    if let Err(e) = result {
        warn!(link = %name, error = %e, "link initialization failed");
        shared.transition(LinkState::Closed);
        return;
    }
    if !shared.transition(LinkState::Operational) {
        return;
    }
    info!(link = %name, "link operational");

    let (mut reader, mut writer) = connection.into_split();
    let mut send_stop = stop.clone();

    let send_loop = async {
        loop {
            tokio::select! {
                message = outbound.recv() => match message {
                    Some(message) => {
                        protocol.send_message_direct(&mut writer, &message).await?;
                        debug!(link = %name, len = message.len(), "sent message");
                    }
                    None => return Ok::<(), LinkError>(()),
                },
                _ = stopped(&mut send_stop) => return Ok(()),
            }
        }
    };

    let receive_loop = async {
        loop {
            tokio::select! {
                received = protocol.receive_message_direct(&mut reader) => match received {
                    Ok(message) => shared.deliver(&name, message),
                    Err(LinkError::NoDataAvailable) => {}
                    Err(e) => return Err(e),
                },
                _ = stopped(&mut stop) => return Ok::<(), LinkError>(()),
            }
        }
    };

    match tokio::try_join!(send_loop, receive_loop) {
        Ok(_) => info!(link = %name, "link stopped"),
        Err(e) => warn!(link = %name, error = %e, "link closed after error"),
    }
    shared.transition(LinkState::Closed);
}
