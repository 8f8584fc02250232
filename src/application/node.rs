//! A running node: links, listener and routing engine wired together.

use crate::application::container::LinkContainer;
use crate::application::inbox::LinkInbox;
use crate::application::listener::Listener;
use crate::application::router::{AnyAmount, EqualAmount, MatchValidator, ReapPolicy, RoutingEngine};
use crate::config::NodeSettings;
use crate::domain::identity::{AcceptAll, Hash160, KnownPeers};
use crate::domain::ports::{AddressDeriver, FinLinkBox, IdentityVerifier};
use crate::domain::transaction::{PaymentReport, PaymentStatus, Side, Transaction};
use crate::error::{ConfigError, LinkError, NodeError, PaymentError, TransportError};
use crate::infrastructure::amiko_link::{AmikoLinkHandler, SCHEME};
use crate::infrastructure::in_memory::LocalPayLink;
use crate::infrastructure::link::Link;
use crate::infrastructure::registry::{LinkFactory, SchemeRegistry};
use crate::infrastructure::tcp::TcpAcceptor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

pub struct Node {
    settings: NodeSettings,
    engine: Arc<RoutingEngine>,
    container: Arc<LinkContainer>,
    inbox: Arc<LinkInbox>,
    factory: LinkFactory,
    listener: Option<Arc<Listener>>,
    listen_addr: Option<SocketAddr>,
    listener_task: Option<JoinHandle<Result<(), TransportError>>>,
    maintenance_task: Option<JoinHandle<()>>,
    maintenance_stop: watch::Sender<bool>,
    engine_task: JoinHandle<()>,
}

impl Node {
    /// Starts the routing engine, the listener (when `settings.listen` is set)
    /// and every configured outbound link.
    ///
    /// Without a listener a background task still promotes pending links, so
    /// outbound links become operational either way.
    pub async fn start(settings: NodeSettings) -> Result<Self, NodeError> {
        let container = Arc::new(LinkContainer::new());
        let inbox = Arc::new(LinkInbox::new(Arc::downgrade(&container)));
        container.set_default_receiver(Some(inbox.clone()));

        let verifier: Arc<dyn IdentityVerifier> = if settings.trusted_peers.is_empty() {
            Arc::new(AcceptAll)
        } else {
            Arc::new(KnownPeers::new(settings.trusted_peers.iter().copied()))
        };

        let handler = settings.node_key.as_deref().map(|key| {
            let local_address = Hash160.derive_address(key);
            info!(%local_address, "node identity");
            Arc::new(
                AmikoLinkHandler::new(local_address, verifier)
                    .with_poll_interval(settings.listener_poll_interval)
                    .with_handshake_timeout(settings.handshake_timeout),
            )
        });
        if handler.is_none() && settings.needs_identity() {
            return Err(ConfigError::MissingNodeKey("listen or open links").into());
        }

        let mut registry = SchemeRegistry::new();
        if let Some(handler) = &handler {
            registry = registry.register(SCHEME, handler.clone());
        }
        let factory = registry.build();
        info!(schemes = ?factory.schemes().collect::<Vec<_>>(), "link factory ready");

        let (listener, listen_addr) = match (&settings.listen, &handler) {
            (Some(addr), Some(handler)) => {
                let acceptor = TcpAcceptor::bind(addr.as_str(), settings.accept_timeout).await?;
                let local = acceptor.local_addr()?;
                info!(%local, "listening for {SCHEME} connections");
                let listener = Listener::new(Arc::new(acceptor), handler.clone(), container.clone())
                    .with_max_pending(settings.max_pending_links)
                    .with_poll_interval(settings.listener_poll_interval);
                (Some(Arc::new(listener)), Some(local))
            }
            _ => (None, None),
        };

        let listener_task = listener.clone().map(|listener| {
            tokio::spawn(async move { listener.run().await })
        });

        let (maintenance_stop, _) = watch::channel(false);
        let maintenance_task = listener.is_none().then(|| {
            let container = container.clone();
            let mut stop = maintenance_stop.subscribe();
            let poll = settings.listener_poll_interval;
            tokio::spawn(async move {
                while !*stop.borrow() {
                    container.process_pending_links().await;
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = stop.changed() => {}
                    }
                }
            })
        });

        let validator: Box<dyn MatchValidator> = if settings.strict_amounts {
            Box::new(EqualAmount)
        } else {
            Box::new(AnyAmount)
        };
        let reap_policy = if settings.reap_finished {
            ReapPolicy::Finished
        } else {
            ReapPolicy::Never
        };
        let engine = Arc::new(
            RoutingEngine::new(settings.meeting_point_key.as_deref(), &Hash160)
                .with_fin_links(vec![inbox.clone() as FinLinkBox])
                .with_validator(validator)
                .with_reap_policy(reap_policy)
                .with_have_route_timeout(settings.have_route_timeout)
                .with_tick_interval(settings.tick_interval),
        );
        let engine_task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };

        let node = Self {
            settings,
            engine,
            container,
            inbox,
            factory,
            listener,
            listen_addr,
            listener_task,
            maintenance_task,
            maintenance_stop,
            engine_task,
        };

        for uri in node.settings.links.clone() {
            node.connect(&uri).await?;
        }
        Ok(node)
    }

    /// Opens an outbound link and registers it as pending.
    pub async fn connect(&self, uri: &str) -> Result<Arc<Link>, LinkError> {
        let link = Arc::new(self.factory.make(uri).await?);
        info!(link = link.name(), "opened outbound link");
        link.start();
        self.container.add_pending(link.clone()).await;
        Ok(link)
    }

    pub fn engine(&self) -> &Arc<RoutingEngine> {
        &self.engine
    }

    pub fn container(&self) -> &Arc<LinkContainer> {
        &self.container
    }

    pub fn inbox(&self) -> &Arc<LinkInbox> {
        &self.inbox
    }

    pub fn factory(&self) -> &LinkFactory {
        &self.factory
    }

    /// Bound listening address, when the node listens.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Routes a batch of payment legs through the local meeting point.
    ///
    /// Receiver legs are registered first. Sender legs are then paid one at a
    /// time, since the engine carries a single outgoing payment. Finally each
    /// receiver is given until its route deadline to be matched. Reports come
    /// back in input order.
    pub async fn process_payments(&self, legs: &[Transaction]) -> Vec<PaymentReport> {
        let mut statuses = vec![PaymentStatus::Rejected; legs.len()];

        let receivers: Vec<(usize, Arc<LocalPayLink>)> = legs
            .iter()
            .enumerate()
            .filter(|(_, leg)| leg.side == Side::Receiver)
            .map(|(i, leg)| (i, Arc::new(LocalPayLink::new(leg.clone()))))
            .collect();
        let receivers_deadline = Instant::now() + self.settings.have_route_timeout;
        for (_, link) in &receivers {
            self.engine.add_pay_link(link.clone());
        }

        for (i, leg) in legs.iter().enumerate().filter(|(_, leg)| leg.side == Side::Sender) {
            let link = Arc::new(LocalPayLink::new(leg.clone()));
            statuses[i] = match self.engine.do_payment(link.clone()).await {
                Ok(()) => {
                    info!(commit_hash = %leg.commit_hash, amount = %leg.amount, "payment routed");
                    PaymentStatus::Routed
                }
                Err(PaymentError::RouteTimeout(commit_hash)) => {
                    warn!(%commit_hash, "payment timed out");
                    PaymentStatus::TimedOut
                }
                Err(e) => {
                    warn!(commit_hash = %leg.commit_hash, error = %e, "payment rejected");
                    PaymentStatus::Rejected
                }
            };
            link.close();
        }

        for (i, link) in &receivers {
            let remaining = receivers_deadline.saturating_duration_since(Instant::now());
            statuses[*i] = if link.wait_for_route(remaining).await {
                PaymentStatus::Routed
            } else {
                PaymentStatus::TimedOut
            };
            link.close();
        }

        legs.iter()
            .zip(statuses)
            .map(|(leg, status)| PaymentReport::new(leg, status))
            .collect()
    }

    /// Keeps the node up for `duration`, or until Ctrl-C when `None`.
    ///
    /// Returns early with the listener's error if accepting fails.
    pub async fn serve(&mut self, duration: Option<Duration>) -> Result<(), NodeError> {
        let deadline = async {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        };

        let Some(task) = self.listener_task.as_mut() else {
            deadline.await;
            return Ok(());
        };
        let joined = tokio::select! {
            _ = deadline => None,
            joined = task => Some(joined),
        };

        match joined {
            None => Ok(()),
            Some(joined) => {
                self.listener_task = None;
                joined??;
                Ok(())
            }
        }
    }

    /// Stops the listener, the engine and every link.
    pub async fn shutdown(mut self) {
        info!("shutting down node");
        if let Some(listener) = &self.listener {
            listener.stop();
        }
        self.maintenance_stop.send_replace(true);

        if let Some(task) = self.listener_task.take()
            && let Ok(Err(e)) = task.await
        {
            warn!(error = %e, "listener ended with an error");
        }
        if let Some(task) = self.maintenance_task.take() {
            let _ = task.await;
        }

        self.engine.stop();
        let _ = self.engine_task.await;
        self.container.shutdown().await;
    }
}
