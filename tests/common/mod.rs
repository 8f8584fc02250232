#![allow(dead_code)]

use amiko_pay::domain::identity::hash160;
use amiko_pay::domain::transaction::{Address, Amount, CommitHash, Side, Transaction};
use amiko_pay::infrastructure::in_memory::LocalPayLink;
use rust_decimal::Decimal;
use std::future::Future;
use std::io::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Compressed secp256k1 generator point, used as the meeting-point key.
pub const MEETING_POINT_KEY: &str =
    "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

/// HASH160 of [`MEETING_POINT_KEY`].
pub const MEETING_POINT: &str = "751e76e8199196d454941c45d1b3a323f1433bd6";

pub fn meeting_point_key() -> Vec<u8> {
    hex::decode(MEETING_POINT_KEY).unwrap()
}

pub fn meeting_point() -> Address {
    Address::new(hash160(&meeting_point_key()))
}

pub fn commit_hash(seed: u8) -> CommitHash {
    CommitHash::new([seed; 32])
}

pub fn leg(side: Side, seed: u8, amount: Decimal) -> Transaction {
    Transaction {
        side,
        commit_hash: commit_hash(seed),
        amount: Amount::new(amount).unwrap(),
        meeting_point: meeting_point(),
    }
}

pub fn pay_link(side: Side, seed: u8, amount: Decimal) -> Arc<LocalPayLink> {
    Arc::new(LocalPayLink::new(leg(side, seed, amount)))
}

/// Writes a payments file with the given `(side, seed, amount)` rows.
pub fn write_payments_csv(path: &Path, rows: &[(&str, u8, &str)]) -> Result<(), Error> {
    let mut wtr = csv::WriterBuilder::new().from_path(path)?;
    wtr.write_record(["side", "commit_hash", "amount", "meeting_point"])?;
    for (side, seed, amount) in rows {
        let hash = commit_hash(*seed).to_string();
        wtr.write_record([*side, hash.as_str(), *amount, MEETING_POINT])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Polls `condition` every 10 ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
