// src/vault.rs
use async_trait::async_trait;

use crate::error::ExchangeError;
use crate::record::{AssetRecord, StateAndRef, StateRef};
use crate::transaction::{SignedTransaction, TxId};

/// A party's local index of the records it holds or can see.
///
/// Implementors MUST:
/// 1. only ever be fed finalized transactions through [`Vault::record`]
/// 2. never mutate or delete a stored record; consumption is an index flag
/// 3. make `record` idempotent for a transaction that is already stored
#[async_trait]
pub trait Vault: Send + Sync {
    /// Store a finalized transaction: its inputs become consumed and its
    /// outputs that name this vault's party as participant become unconsumed.
    async fn record(&self, stx: &SignedTransaction) -> Result<(), ExchangeError>;

    // READ OPERATIONS
    async fn transaction(&self, id: &TxId) -> Result<Option<SignedTransaction>, ExchangeError>;
    async fn unconsumed(&self) -> Result<Vec<StateAndRef>, ExchangeError>;
    async fn is_consumed(&self, reference: &StateRef) -> Result<bool, ExchangeError>;

    async fn find_unconsumed(
        &self,
        predicate: &(dyn for<'r> Fn(&'r AssetRecord) -> bool + Send + Sync),
    ) -> Result<Option<StateAndRef>, ExchangeError> {
        Ok(self
            .unconsumed()
            .await?
            .into_iter()
            .find(|candidate| predicate(&candidate.state)))
    }
}
