// src/notary.rs
use async_trait::async_trait;
use thiserror::Error;

use crate::error::ExchangeError;
use crate::identity::{Party, TransactionSignature};
use crate::record::StateRef;
use crate::transaction::{SignedTransaction, TxId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotaryError {
    /// Some inputs were already consumed by another accepted transaction.
    #[error("{} input(s) already consumed", conflicts.len())]
    Conflict { conflicts: Vec<(StateRef, TxId)> },
    /// The transaction is not eligible for notarisation (wrong notary, bad signatures).
    #[error("transaction refused: {0}")]
    Refused(String),
    #[error("notary unavailable: {0}")]
    Unavailable(String),
}

impl From<NotaryError> for ExchangeError {
    fn from(err: NotaryError) -> Self {
        match err {
            NotaryError::Conflict { conflicts } => ExchangeError::DoubleSpend { conflicts },
            other => ExchangeError::Notary(other.to_string()),
        }
    }
}

/// The uniqueness authority: the single serialization point for consumption.
///
/// Implementors MUST:
/// 1. accept a transaction only if none of its inputs were consumed by a
///    different accepted transaction
/// 2. mark all inputs of an accepted transaction consumed atomically
/// 3. answer a re-submission of an accepted transaction with a signature again
#[async_trait]
pub trait UniquenessProvider: Send + Sync {
    fn identity(&self) -> &Party;

    /// On acceptance returns the notary's signature over the transaction id.
    async fn commit(&self, stx: &SignedTransaction) -> Result<TransactionSignature, NotaryError>;
}
