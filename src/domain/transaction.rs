use crate::error::PaymentError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A strictly positive amount of bitcoin.
///
/// Wraps `rust_decimal::Decimal` so that a payment leg can never carry a zero
/// or negative value.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, PaymentError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(PaymentError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = PaymentError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn decode_fixed<const N: usize>(value: &str, what: &str) -> Result<[u8; N], PaymentError> {
    let bytes = hex::decode(value.trim())
        .map_err(|e| PaymentError::ValidationError(format!("{what} is not valid hex: {e}")))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        PaymentError::ValidationError(format!(
            "{what} must be {N} bytes, got {}",
            bytes.len()
        ))
    })
}

/// Opaque correlation id shared by both legs of one logical payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommitHash([u8; 32]);

impl CommitHash {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for CommitHash {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed(s, "commit hash").map(Self)
    }
}

impl TryFrom<String> for CommitHash {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CommitHash> for String {
    fn from(hash: CommitHash) -> Self {
        hash.to_string()
    }
}

impl fmt::Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Identity hash of a node or meeting point: HASH160 of its public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address([u8; 20]);

impl Address {
    pub const LEN: usize = 20;

    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }
}

impl FromStr for Address {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed(s, "address").map(Self)
    }
}

impl TryFrom<String> for Address {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Sender,
    Receiver,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Sender => Side::Receiver,
            Side::Receiver => Side::Sender,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Sender => f.write_str("sender"),
            Side::Receiver => f.write_str("receiver"),
        }
    }
}

/// One leg of a logical payment, as carried by a pay link.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct Transaction {
    pub side: Side,
    pub commit_hash: CommitHash,
    pub amount: Amount,
    pub meeting_point: Address,
}

/// How a payment leg ended.
#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Routed,
    TimedOut,
    Rejected,
}

/// Outcome of one leg, as written to the payment report.
#[derive(Debug, Serialize, PartialEq, Clone)]
pub struct PaymentReport {
    pub commit_hash: CommitHash,
    pub side: Side,
    pub amount: Amount,
    pub status: PaymentStatus,
}

impl PaymentReport {
    pub fn new(transaction: &Transaction, status: PaymentStatus) -> Self {
        Self {
            commit_hash: transaction.commit_hash,
            side: transaction.side,
            amount: transaction.amount,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_amount_validation() {
        assert!(Amount::new(dec!(0.001)).is_ok());
        assert!(matches!(
            Amount::new(dec!(0.0)),
            Err(PaymentError::ValidationError(_))
        ));
        assert!(matches!(
            Amount::new(dec!(-1.0)),
            Err(PaymentError::ValidationError(_))
        ));
    }

    #[test]
    fn test_commit_hash_hex() {
        let text = format!("{}ff", "00".repeat(31));
        let hash: CommitHash = text.parse().unwrap();
        assert_eq!(hash.as_bytes()[31], 0xff);
        assert_eq!(hash.to_string(), text);

        assert!("abcd".parse::<CommitHash>().is_err());
        assert!("zz".repeat(32).parse::<CommitHash>().is_err());
    }

    #[test]
    fn test_address_length_is_checked() {
        let address: Address = "751e76e8199196d454941c45d1b3a323f1433bd6".parse().unwrap();
        assert_eq!(address.as_bytes().len(), Address::LEN);
        assert!("751e76e8".parse::<Address>().is_err());
        assert_eq!(Address::from_slice(&[1u8; 19]), None);
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Sender.opposite(), Side::Receiver);
        assert_eq!(Side::Receiver.opposite(), Side::Sender);
    }

    #[test]
    fn test_transaction_deserialization() {
        let csv = "side, commit_hash, amount, meeting_point\n\
                   receiver, 0101010101010101010101010101010101010101010101010101010101010101, 0.5, 751e76e8199196d454941c45d1b3a323f1433bd6";
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(csv.as_bytes());
        let mut iter = reader.deserialize();

        let result: Transaction = iter
            .next()
            .unwrap()
            .expect("Failed to deserialize transaction");

        assert_eq!(result.side, Side::Receiver);
        assert_eq!(result.commit_hash, CommitHash::new([1u8; 32]));
        assert_eq!(result.amount.value(), dec!(0.5));
    }
}
