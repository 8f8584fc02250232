use crate::domain::transaction::Transaction;
use crate::error::{PaymentError, Result};
use std::io::Read;

/// Reads payment legs from a CSV source.
///
/// Expects the columns `side, commit_hash, amount, meeting_point`. Fields are
/// trimmed, so `receiver, 01..` and `receiver,01..` read the same.
pub struct PaymentReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> PaymentReader<R> {
    /// Wraps a payments file, stdin or any other byte source.
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(source);
        Self { reader }
    }

    /// Returns an iterator that lazily reads and deserializes payment legs.
    ///
    /// A malformed row yields an error for that row only; reading carries on
    /// with the next one.
    pub fn payments(self) -> impl Iterator<Item = Result<Transaction>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(PaymentError::from))
    }
}
