use super::ports::{AddressDeriver, IdentityVerifier};
use super::transaction::Address;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// SHA-256 followed by RIPEMD-160, also known as HASH160.
pub fn hash160(bytes: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(bytes)).into()
}

/// Bitcoin-style address derivation: the identity is the HASH160 of the key.
#[derive(Debug, Default, Clone, Copy)]
pub struct Hash160;

impl AddressDeriver for Hash160 {
    fn derive_address(&self, public_key: &[u8]) -> Address {
        Address::new(hash160(public_key))
    }
}

/// Admits every peer.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl IdentityVerifier for AcceptAll {
    fn verify(&self, _address: &Address) -> bool {
        true
    }
}

/// Admits only the listed peers.
#[derive(Debug, Default, Clone)]
pub struct KnownPeers {
    peers: HashSet<Address>,
}

impl KnownPeers {
    pub fn new(peers: impl IntoIterator<Item = Address>) -> Self {
        Self {
            peers: peers.into_iter().collect(),
        }
    }
}

impl IdentityVerifier for KnownPeers {
    fn verify(&self, address: &Address) -> bool {
        self.peers.contains(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash160_of_generator_key() {
        let key = hex::decode("0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798")
            .unwrap();
        let address = Hash160.derive_address(&key);
        assert_eq!(
            address.to_string(),
            "751e76e8199196d454941c45d1b3a323f1433bd6"
        );
    }

    #[test]
    fn test_hash160_of_empty_input() {
        assert_eq!(
            hex::encode(hash160(b"")),
            "b472a266d0bd89c13706a4132ccfb16f7c3b9fcb"
        );
    }

    #[test]
    fn test_known_peers() {
        let known = Address::new([1u8; 20]);
        let verifier = KnownPeers::new([known]);
        assert!(verifier.verify(&known));
        assert!(!verifier.verify(&Address::new([2u8; 20])));
        assert!(AcceptAll.verify(&Address::new([2u8; 20])));
    }
}
