//! Payment routing engine.
//!
//! The engine keeps one [`ActiveTransaction`] per payment leg it has seen and
//! matches sender-side and receiver-side legs of the same commit hash when
//! both meet at this node's own meeting point. A tick runs, in order:
//!
//! 1. inbound processing on every financial link,
//! 2. discovery of new operational pay links,
//! 3. the have-route deadline sweep,
//! 4. lifecycle bookkeeping and reaping.
//!
//! At most one outgoing payment is in flight; [`RoutingEngine::do_payment`]
//! rejects a second one instead of queueing it.

use crate::domain::ports::{AddressDeriver, FinLinkBox, PayLink, PayLinkBox, PayLinkState};
use crate::domain::transaction::{Address, Amount, CommitHash, Side, Transaction};
use crate::error::{LinkError, PaymentError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Time a new transaction gets to be matched.
pub const HAVE_ROUTE_TIMEOUT: Duration = Duration::from_millis(10_000);

pub const TICK_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Waiting for the opposite leg.
    Discovered,
    /// Route confirmed.
    Matched,
    /// Route confirmed and the pay link has gone away.
    Completed,
    /// Deadline passed without a route. The leg can still be matched.
    Abandoned,
}

/// The engine's record of one payment leg.
#[derive(Debug, Clone)]
pub struct ActiveTransaction {
    pub inbound_interface: Vec<u8>,
    pub amount: Amount,
    pub side: Side,
    pub is_endpoint: bool,
    pub commit_hash: CommitHash,
    pub meeting_point: Address,
    /// `None` once the deadline fired or no longer applies.
    pub have_route_timeout: Option<Instant>,
    pub current_outbound_interface: Option<Vec<u8>>,
    pub remaining_outbound_interfaces: Vec<Vec<u8>>,
    pub status: TransactionStatus,
}

impl ActiveTransaction {
    fn for_endpoint(transaction: &Transaction, deadline: Instant) -> Self {
        Self {
            inbound_interface: transaction.commit_hash.as_bytes().to_vec(),
            amount: transaction.amount,
            side: transaction.side,
            is_endpoint: true,
            commit_hash: transaction.commit_hash,
            meeting_point: transaction.meeting_point,
            have_route_timeout: Some(deadline),
            current_outbound_interface: None,
            remaining_outbound_interfaces: Vec::new(),
            status: TransactionStatus::Discovered,
        }
    }

    /// True when `link` is the endpoint leg this record was created for.
    fn belongs_to(&self, link: &dyn PayLink) -> bool {
        self.is_endpoint
            && self.side == link.transaction().side
            && self.inbound_interface == link.transaction().commit_hash.as_bytes()
    }
}

/// Extra condition two legs must satisfy before they are matched.
pub trait MatchValidator: Send + Sync {
    fn accepts(&self, new: &ActiveTransaction, candidate: &ActiveTransaction) -> bool;
}

/// Matches legs regardless of their amounts.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnyAmount;

impl MatchValidator for AnyAmount {
    fn accepts(&self, _new: &ActiveTransaction, _candidate: &ActiveTransaction) -> bool {
        true
    }
}

/// Matches legs only when both carry the same amount.
#[derive(Debug, Default, Clone, Copy)]
pub struct EqualAmount;

impl MatchValidator for EqualAmount {
    fn accepts(&self, new: &ActiveTransaction, candidate: &ActiveTransaction) -> bool {
        new.amount == candidate.amount
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ReapPolicy {
    /// Keep every transaction record for the lifetime of the engine.
    #[default]
    Never,
    /// Drop completed and abandoned records once no live pay link refers to
    /// them, and drop closed incoming pay links.
    Finished,
}

struct OutgoingPayment {
    link: PayLinkBox,
    completion: Option<oneshot::Sender<Result<(), PaymentError>>>,
}

impl OutgoingPayment {
    fn resolve(&mut self, outcome: Result<(), PaymentError>) {
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(outcome);
        }
    }
}

/// Clears the outgoing slot when `do_payment` finishes or is dropped.
struct SlotGuard<'a> {
    slot: &'a Mutex<Option<OutgoingPayment>>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.lock().take();
    }
}

pub struct RoutingEngine {
    local_meeting_point: Option<Address>,
    fin_links: Vec<FinLinkBox>,
    validator: Box<dyn MatchValidator>,
    reap_policy: ReapPolicy,
    have_route_timeout: Duration,
    tick_interval: Duration,
    // Lock order: transactions, then incoming, then outgoing.
    transactions: Mutex<Vec<ActiveTransaction>>,
    incoming: Mutex<Vec<PayLinkBox>>,
    outgoing: Mutex<Option<OutgoingPayment>>,
    timeouts_recorded: AtomicU64,
    stop: watch::Sender<bool>,
}

impl RoutingEngine {
    /// Creates an engine for a node whose own meeting point is derived from
    /// `meeting_point_key`. Without a key nothing is matched locally.
    pub fn new(meeting_point_key: Option<&[u8]>, deriver: &dyn AddressDeriver) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            local_meeting_point: meeting_point_key.map(|key| deriver.derive_address(key)),
            fin_links: Vec::new(),
            validator: Box::new(AnyAmount),
            reap_policy: ReapPolicy::default(),
            have_route_timeout: HAVE_ROUTE_TIMEOUT,
            tick_interval: TICK_INTERVAL,
            transactions: Mutex::new(Vec::new()),
            incoming: Mutex::new(Vec::new()),
            outgoing: Mutex::new(None),
            timeouts_recorded: AtomicU64::new(0),
            stop,
        }
    }

    pub fn with_fin_links(mut self, fin_links: Vec<FinLinkBox>) -> Self {
        self.fin_links = fin_links;
        self
    }

    pub fn with_validator(mut self, validator: Box<dyn MatchValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_reap_policy(mut self, reap_policy: ReapPolicy) -> Self {
        self.reap_policy = reap_policy;
        self
    }

    pub fn with_have_route_timeout(mut self, timeout: Duration) -> Self {
        self.have_route_timeout = timeout;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn local_meeting_point(&self) -> Option<Address> {
        self.local_meeting_point
    }

    /// Registers a receiver-side pay link.
    pub fn add_pay_link(&self, link: PayLinkBox) {
        debug!(commit_hash = %link.transaction().commit_hash, "registering incoming pay link");
        self.incoming.lock().push(link);
    }

    /// Performs an outgoing payment over `link` and waits for its outcome.
    ///
    /// Fails at once with [`PaymentError::PaymentFailed`] while another
    /// payment is in progress. Otherwise resolves when the engine confirms
    /// the route, when the have-route deadline passes
    /// ([`PaymentError::RouteTimeout`]), or when the engine stops.
    ///
    /// Paying a leg again after it timed out re-arms its deadline. Paying a
    /// leg whose route was already confirmed fails with
    /// [`PaymentError::PaymentFailed`].
    pub async fn do_payment(&self, link: PayLinkBox) -> Result<(), PaymentError> {
        let (completion, outcome) = oneshot::channel();
        {
            let mut slot = self.outgoing.lock();
            if slot.is_some() {
                return Err(PaymentError::PaymentFailed(
                    "another payment is already being performed".to_string(),
                ));
            }
            info!(commit_hash = %link.transaction().commit_hash, "starting outgoing payment");
            *slot = Some(OutgoingPayment {
                link,
                completion: Some(completion),
            });
        }
        let _guard = SlotGuard {
            slot: &self.outgoing,
        };

        outcome.await.unwrap_or_else(|_| {
            Err(PaymentError::PaymentFailed(
                "routing engine stopped".to_string(),
            ))
        })
    }

    pub fn has_outgoing_payment(&self) -> bool {
        self.outgoing.lock().is_some()
    }

    /// Snapshot of the active transactions, in creation order.
    pub fn active_transactions(&self) -> Vec<ActiveTransaction> {
        self.transactions.lock().clone()
    }

    /// Number of have-route deadlines that expired so far.
    pub fn timeouts_recorded(&self) -> u64 {
        self.timeouts_recorded.load(Ordering::Relaxed)
    }

    /// Runs ticks until [`RoutingEngine::stop`] is called.
    pub async fn run(&self) {
        let mut stop = self.stop.subscribe();
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(meeting_point = ?self.local_meeting_point, "routing engine started");

        while !*stop.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "routing tick failed");
                    }
                }
                _ = stop.changed() => {}
            }
        }

        self.shutdown();
        info!("routing engine stopped");
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// One pass of the routing loop.
    pub async fn tick(&self) -> Result<(), LinkError> {
        self.process_incoming_messages().await?;
        self.search_for_new_pay_links();
        self.process_timeouts(Instant::now());
        self.update_lifecycle();
        Ok(())
    }

    async fn process_incoming_messages(&self) -> Result<(), LinkError> {
        for fin_link in &self.fin_links {
            fin_link.process_inbox().await?;
        }
        Ok(())
    }

    fn search_for_new_pay_links(&self) {
        let incoming: Vec<PayLinkBox> = self.incoming.lock().clone();
        let outgoing = self
            .outgoing
            .lock()
            .as_ref()
            .map(|p| (p.link.clone(), p.completion.is_some()));

        let mut transactions = self.transactions.lock();
        for link in incoming
            .iter()
            .filter(|link| link.state() == PayLinkState::Operational)
        {
            if !transactions.iter().any(|t| t.belongs_to(link.as_ref())) {
                self.add_and_process_pay_link(&mut transactions, link.as_ref());
            }
        }

        let Some((link, waiting)) = outgoing else {
            return;
        };
        let Some(index) = transactions.iter().position(|t| t.belongs_to(link.as_ref())) else {
            self.add_and_process_pay_link(&mut transactions, link.as_ref());
            return;
        };
        if !waiting {
            return;
        }

        // A new payment for a leg this engine has already seen.
        let status = transactions[index].status;
        match status {
            TransactionStatus::Discovered => {}
            TransactionStatus::Abandoned => {
                info!(
                    commit_hash = %transactions[index].commit_hash,
                    "retrying abandoned payment"
                );
                transactions[index].status = TransactionStatus::Discovered;
                transactions[index].have_route_timeout =
                    Some(Instant::now() + self.have_route_timeout);
                self.match_with_own_meeting_point(&mut transactions, index);
            }
            TransactionStatus::Matched | TransactionStatus::Completed => {
                let commit_hash = transactions[index].commit_hash;
                warn!(%commit_hash, "payment repeats an already routed leg");
                if let Some(payment) = self.outgoing.lock().as_mut() {
                    payment.resolve(Err(PaymentError::PaymentFailed(format!(
                        "route for commit hash {commit_hash} was already confirmed"
                    ))));
                }
            }
        }
    }

    fn add_and_process_pay_link(&self, transactions: &mut Vec<ActiveTransaction>, link: &dyn PayLink) {
        let transaction = link.transaction();
        info!(
            commit_hash = %transaction.commit_hash,
            side = %transaction.side,
            amount = %transaction.amount,
            "adding operational pay link"
        );

        let deadline = Instant::now() + self.have_route_timeout;
        transactions.push(ActiveTransaction::for_endpoint(transaction, deadline));
        let index = transactions.len() - 1;
        self.match_with_own_meeting_point(transactions, index);
    }

    fn match_with_own_meeting_point(&self, transactions: &mut [ActiveTransaction], index: usize) {
        let Some(local) = self.local_meeting_point else {
            return;
        };
        if transactions[index].meeting_point != local {
            return;
        }
        debug!(commit_hash = %transactions[index].commit_hash, "transaction arrives at local meeting point");

        transactions[index].remaining_outbound_interfaces.clear();
        transactions[index].current_outbound_interface = None;

        let new = &transactions[index];
        let candidate = transactions.iter().enumerate().position(|(i, other)| {
            i != index
                && !matches!(
                    other.status,
                    TransactionStatus::Matched | TransactionStatus::Completed
                )
                && other.current_outbound_interface.is_none()
                && other.side == new.side.opposite()
                && other.commit_hash == new.commit_hash
                && {
                    let accepted = self.validator.accepts(new, other);
                    if !accepted {
                        warn!(
                            commit_hash = %new.commit_hash,
                            amount = %new.amount,
                            other_amount = %other.amount,
                            "matching leg rejected by validator"
                        );
                    }
                    accepted
                }
        });

        if let Some(other) = candidate {
            self.report_have_route(&mut transactions[index]);
            self.report_have_route(&mut transactions[other]);
        }
    }

    fn report_have_route(&self, t: &mut ActiveTransaction) {
        t.status = TransactionStatus::Matched;
        t.have_route_timeout = None;

        if !t.is_endpoint {
            return;
        }
        debug!(commit_hash = %t.commit_hash, side = %t.side, "reporting have-route");

        match t.side {
            Side::Receiver => {
                let incoming = self.incoming.lock();
                let link = incoming.iter().find(|link| {
                    link.is_receiver_side()
                        && link.transaction().commit_hash.as_bytes() == t.inbound_interface
                });
                match link {
                    Some(link) => link.report_have_route(),
                    None => warn!(commit_hash = %t.commit_hash, "no receiver-side pay link to report to"),
                }
            }
            Side::Sender => {
                let mut outgoing = self.outgoing.lock();
                match outgoing.as_mut() {
                    Some(payment)
                        if payment.link.transaction().commit_hash.as_bytes()
                            == t.inbound_interface =>
                    {
                        payment.link.report_have_route();
                        payment.resolve(Ok(()));
                    }
                    _ => warn!(commit_hash = %t.commit_hash, "no sender-side pay link to report to"),
                }
            }
        }
    }

    fn process_timeouts(&self, now: Instant) {
        let mut transactions = self.transactions.lock();
        for t in transactions.iter_mut() {
            let Some(deadline) = t.have_route_timeout else {
                continue;
            };
            if now <= deadline {
                continue;
            }

            warn!(commit_hash = %t.commit_hash, side = %t.side, "time-out: did not receive have-route");
            t.have_route_timeout = None;
            t.status = TransactionStatus::Abandoned;
            self.timeouts_recorded.fetch_add(1, Ordering::Relaxed);

            if t.is_endpoint && t.side == Side::Sender {
                let mut outgoing = self.outgoing.lock();
                if let Some(payment) = outgoing.as_mut()
                    && payment.link.transaction().commit_hash == t.commit_hash
                {
                    payment.resolve(Err(PaymentError::RouteTimeout(t.commit_hash)));
                }
            }
        }
    }

    fn update_lifecycle(&self) {
        let mut transactions = self.transactions.lock();
        let mut incoming = self.incoming.lock();
        let outgoing = self.outgoing.lock();

        let live = |t: &ActiveTransaction| {
            incoming
                .iter()
                .chain(outgoing.as_ref().map(|p| &p.link))
                .any(|link| link.state() != PayLinkState::Closed && t.belongs_to(link.as_ref()))
        };

        for t in transactions.iter_mut() {
            if t.status == TransactionStatus::Matched && !live(t) {
                debug!(commit_hash = %t.commit_hash, side = %t.side, "transaction completed");
                t.status = TransactionStatus::Completed;
            }
        }

        if self.reap_policy == ReapPolicy::Finished {
            transactions.retain(|t| {
                !matches!(
                    t.status,
                    TransactionStatus::Completed | TransactionStatus::Abandoned
                ) || live(t)
            });
            incoming.retain(|link| link.state() != PayLinkState::Closed);
        }
    }

    fn shutdown(&self) {
        if let Some(payment) = self.outgoing.lock().as_mut() {
            payment.resolve(Err(PaymentError::PaymentFailed(
                "routing engine stopped".to_string(),
            )));
        }
        self.incoming.lock().clear();
    }
}
