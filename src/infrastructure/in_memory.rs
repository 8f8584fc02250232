use crate::domain::ports::{PayLink, PayLinkState};
use crate::domain::transaction::Transaction;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// A pay link living inside this process.
///
/// Used by the CSV front end and by tests: it holds its transaction in memory
/// and lets the owner await the route confirmation.
pub struct LocalPayLink {
    transaction: Transaction,
    state: Mutex<PayLinkState>,
    routed: watch::Sender<bool>,
    reports: AtomicUsize,
}

impl LocalPayLink {
    /// Creates an operational pay link for `transaction`.
    pub fn new(transaction: Transaction) -> Self {
        Self::with_state(transaction, PayLinkState::Operational)
    }

    pub fn with_state(transaction: Transaction, state: PayLinkState) -> Self {
        let (routed, _) = watch::channel(false);
        Self {
            transaction,
            state: Mutex::new(state),
            routed,
            reports: AtomicUsize::new(0),
        }
    }

    pub fn set_state(&self, state: PayLinkState) {
        *self.state.lock() = state;
    }

    pub fn close(&self) {
        self.set_state(PayLinkState::Closed);
    }

    pub fn is_routed(&self) -> bool {
        *self.routed.borrow()
    }

    /// How many times the routing engine confirmed the route.
    pub fn have_route_reports(&self) -> usize {
        self.reports.load(Ordering::SeqCst)
    }

    /// Waits up to `timeout` for the route confirmation.
    pub async fn wait_for_route(&self, timeout: Duration) -> bool {
        let mut routed = self.routed.subscribe();
        let _ = tokio::time::timeout(timeout, async move {
            let _ = routed.wait_for(|routed| *routed).await;
        })
        .await;
        self.is_routed()
    }
}

impl PayLink for LocalPayLink {
    fn state(&self) -> PayLinkState {
        *self.state.lock()
    }

    fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    fn report_have_route(&self) {
        self.reports.fetch_add(1, Ordering::SeqCst);
        self.routed.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transaction::{Address, Amount, CommitHash, Side};
    use rust_decimal_macros::dec;

    fn transaction(side: Side) -> Transaction {
        Transaction {
            side,
            commit_hash: CommitHash::new([7; 32]),
            amount: Amount::new(dec!(0.25)).unwrap(),
            meeting_point: Address::new([3; 20]),
        }
    }

    #[tokio::test]
    async fn test_route_confirmation_wakes_waiter() {
        let link = std::sync::Arc::new(LocalPayLink::new(transaction(Side::Receiver)));
        assert!(link.is_receiver_side());
        assert_eq!(link.state(), PayLinkState::Operational);

        let waiter = {
            let link = link.clone();
            tokio::spawn(async move { link.wait_for_route(Duration::from_secs(5)).await })
        };
        link.report_have_route();

        assert!(waiter.await.unwrap());
        assert_eq!(link.have_route_reports(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_route_times_out() {
        let link = LocalPayLink::new(transaction(Side::Sender));
        assert!(!link.is_receiver_side());
        assert!(!link.wait_for_route(Duration::from_millis(20)).await);
        assert_eq!(link.have_route_reports(), 0);
    }

    #[test]
    fn test_close() {
        let link = LocalPayLink::with_state(transaction(Side::Sender), PayLinkState::Pending);
        assert_eq!(link.state(), PayLinkState::Pending);
        link.close();
        assert_eq!(link.state(), PayLinkState::Closed);
    }
}
