// src/record.rs
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::identity::Party;
use crate::transaction::TxId;

/// What an asset record holds. Shared fields live on [`AssetRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssetKind {
    Cash { currency: String },
    Stock { ticker: String },
}

impl AssetKind {
    pub fn cash(currency: impl Into<String>) -> Self {
        Self::Cash {
            currency: currency.into(),
        }
    }

    pub fn stock(ticker: impl Into<String>) -> Self {
        Self::Stock {
            ticker: ticker.into(),
        }
    }

    /// Currency or ticker.
    pub fn code(&self) -> &str {
        match self {
            Self::Cash { currency } => currency,
            Self::Stock { ticker } => ticker,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Cash { .. } => "cash",
            Self::Stock { .. } => "stock",
        }
    }
}

/// An immutable unit of ownership.
///
/// Invariants:
/// - `participants` always contains `owner`
/// - a change of owner or amount produces a new record; the old one is consumed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub kind: AssetKind,
    pub amount: f64,
    pub owner: Party,
    participants: Vec<Party>,
}

impl AssetRecord {
    pub fn new(kind: AssetKind, amount: f64, owner: Party) -> Self {
        Self {
            kind,
            amount,
            participants: vec![owner.clone()],
            owner,
        }
    }

    pub fn cash(currency: impl Into<String>, amount: f64, owner: Party) -> Self {
        Self::new(AssetKind::cash(currency), amount, owner)
    }

    pub fn stock(ticker: impl Into<String>, amount: f64, owner: Party) -> Self {
        Self::new(AssetKind::stock(ticker), amount, owner)
    }

    /// Extend the set of parties that must see this record.
    pub fn add_participant(&mut self, party: Party) {
        if !self.participants.contains(&party) {
            self.participants.push(party);
        }
    }

    pub fn with_participant(mut self, party: Party) -> Self {
        self.add_participant(party);
        self
    }

    pub fn participants(&self) -> &[Party] {
        &self.participants
    }

    pub fn is_participant(&self, party: &Party) -> bool {
        self.participants.contains(party)
    }

    pub fn is_cash(&self) -> bool {
        matches!(self.kind, AssetKind::Cash { .. })
    }

    pub fn is_stock(&self) -> bool {
        matches!(self.kind, AssetKind::Stock { .. })
    }

    pub fn currency(&self) -> Option<&str> {
        match &self.kind {
            AssetKind::Cash { currency } => Some(currency),
            AssetKind::Stock { .. } => None,
        }
    }

    pub fn ticker(&self) -> Option<&str> {
        match &self.kind {
            AssetKind::Stock { ticker } => Some(ticker),
            AssetKind::Cash { .. } => None,
        }
    }

    pub fn code(&self) -> &str {
        self.kind.code()
    }

    /// Same asset and amount, new owner. The previous owner stays a participant
    /// so it records the transaction that moved the asset away from it.
    pub fn reassigned(&self, new_owner: Party) -> Self {
        Self::new(self.kind.clone(), self.amount, new_owner).with_participant(self.owner.clone())
    }
}

impl fmt::Display for AssetRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} owned by {}",
            self.kind.label(),
            self.amount,
            self.code(),
            self.owner
        )
    }
}

/// Pointer to an output of a transaction: creating tx id plus output position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateRef {
    pub tx_id: TxId,
    pub index: u32,
}

impl StateRef {
    pub fn new(tx_id: TxId, index: u32) -> Self {
        Self { tx_id, index }
    }
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.tx_id, self.index)
    }
}

/// A resolved record together with the reference it was created under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateAndRef {
    pub state: AssetRecord,
    pub reference: StateRef,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PublicKey;

    fn party(name: &str, byte: u8) -> Party {
        Party::new(name, PublicKey([byte; 32]))
    }

    #[test]
    fn constructors_seed_participants_with_owner() {
        let alice = party("Alice", 1);
        let cash = AssetRecord::cash("USD", 10.0, alice.clone());
        assert_eq!(cash.participants(), &[alice.clone()]);
        assert_eq!(cash.currency(), Some("USD"));
        assert_eq!(cash.ticker(), None);

        let stock = AssetRecord::stock("IBM", 5.0, alice.clone());
        assert!(stock.is_stock());
        assert_eq!(stock.code(), "IBM");
    }

    #[test]
    fn add_participant_keeps_set_semantics() {
        let alice = party("Alice", 1);
        let bob = party("Bob", 2);
        let mut cash = AssetRecord::cash("USD", 10.0, alice.clone());
        cash.add_participant(bob.clone());
        cash.add_participant(bob.clone());
        cash.add_participant(alice.clone());
        assert_eq!(cash.participants(), &[alice, bob]);
    }

    #[test]
    fn equality_includes_owner() {
        let a = AssetRecord::stock("XYZ", 10.0, party("Alice", 1));
        let b = AssetRecord::stock("XYZ", 10.0, party("Bob", 2));
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
    }

    #[test]
    fn reassigned_moves_owner_and_keeps_previous_as_participant() {
        let alice = party("Alice", 1);
        let bob = party("Bob", 2);
        let moved = AssetRecord::cash("USD", 42.5, alice.clone()).reassigned(bob.clone());
        assert_eq!(moved.owner, bob);
        assert_eq!(moved.amount, 42.5);
        assert!(moved.is_participant(&alice));
    }
}
