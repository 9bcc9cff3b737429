// src/error.rs
use thiserror::Error;

use crate::identity::Party;
use crate::record::StateRef;
use crate::session::SessionError;
use crate::transaction::TxId;

/// Why a transaction failed contract verification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractViolation {
    /// Missing or ambiguous intent, wrong input/output counts or kinds.
    #[error("malformed transaction: {0}")]
    Structural(String),
    /// A business rule for the declared intent does not hold.
    #[error("{0}")]
    Rule(String),
}

impl ContractViolation {
    pub fn reason(&self) -> &str {
        match self {
            Self::Structural(reason) | Self::Rule(reason) => reason,
        }
    }
}

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("structural error: {0}")]
    Structural(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("input not found: {0}")]
    InputNotFound(String),

    #[error("counterparty {party} rejected the transaction: {reason}")]
    CounterpartyRejected { party: Party, reason: String },

    #[error("double spend: {} input(s) already consumed", conflicts.len())]
    DoubleSpend { conflicts: Vec<(StateRef, TxId)> },

    #[error("session failure: {0}")]
    Session(#[from] SessionError),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("notary error: {0}")]
    Notary(String),

    #[error("vault error: {0}")]
    Vault(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

impl ExchangeError {
    /// Nothing was committed, so the whole exchange may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InputNotFound(_)
                | Self::Session(_)
                | Self::CounterpartyRejected { .. }
                | Self::Notary(_)
        )
    }
}

impl From<ContractViolation> for ExchangeError {
    fn from(violation: ContractViolation) -> Self {
        match violation {
            ContractViolation::Structural(reason) => Self::Structural(reason),
            ContractViolation::Rule(reason) => Self::Validation(reason),
        }
    }
}
