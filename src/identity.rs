// src/identity.rs
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::transaction::TxId;

/// Raw Ed25519 public key bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

/// A named ledger participant identified by its signing key.
///
/// Name resolution is someone else's job; by the time a `Party` reaches this
/// crate it is already bound to a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Party {
    pub name: String,
    pub key: PublicKey,
}

impl Party {
    pub fn new(name: impl Into<String>, key: PublicKey) -> Self {
        Self {
            name: name.into(),
            key,
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl PartialOrd for Party {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Party {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.name.cmp(&other.name))
    }
}

/// A party's signature over a transaction id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSignature {
    pub by: PublicKey,
    pub bytes: Vec<u8>,
}

impl TransactionSignature {
    pub fn verify(&self, id: &TxId) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(self.by.as_bytes()) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&self.bytes) else {
            return false;
        };
        key.verify(id.as_bytes(), &signature).is_ok()
    }
}

/// Local signing capability. The private half never leaves the node.
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            signing: SigningKey::generate(&mut rng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    pub fn party(&self, name: impl Into<String>) -> Party {
        Party::new(name, self.public_key())
    }

    pub fn sign(&self, id: &TxId) -> TransactionSignature {
        TransactionSignature {
            by: self.public_key(),
            bytes: self.signing.sign(id.as_bytes()).to_bytes().to_vec(),
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_verifies_only_for_the_signed_id() {
        let keys = KeyPair::from_seed([7; 32]);
        let id = TxId([1; 32]);
        let signature = keys.sign(&id);

        assert_eq!(signature.by, keys.public_key());
        assert!(signature.verify(&id));
        assert!(!signature.verify(&TxId([2; 32])));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let keys = KeyPair::generate();
        let id = TxId([9; 32]);
        let mut signature = keys.sign(&id);
        signature.bytes[0] ^= 0xff;
        assert!(!signature.verify(&id));

        signature.bytes.truncate(10);
        assert!(!signature.verify(&id));
    }

    #[test]
    fn parties_order_by_key() {
        let a = Party::new("A", PublicKey([1; 32]));
        let b = Party::new("B", PublicKey([0; 32]));
        let mut parties = vec![a.clone(), b.clone()];
        parties.sort();
        assert_eq!(parties, vec![b, a]);
    }
}
