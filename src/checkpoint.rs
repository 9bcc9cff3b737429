// src/checkpoint.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::identity::Party;
use crate::transaction::{SignedTransaction, TxId};

/// Initiator progress. Strictly linear; `Aborted` can follow any stage
/// before `Finalizing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InitiatorStage {
    ResolvingInputs,
    Building,
    SelfValidating,
    Signing,
    CollectingSignatures,
    Notarising,
    Finalizing,
    Completed,
    Aborted,
}

impl InitiatorStage {
    /// The notary has accepted; the transaction is irreversible.
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Finalizing | Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponderState {
    AwaitingProposal,
    Validating,
    Signed,
    Rejected,
    AwaitingFinality,
    Recorded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStage {
    Initiator(InitiatorStage),
    Responder(ResponderState),
}

impl FlowStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Initiator(InitiatorStage::Completed | InitiatorStage::Aborted)
                | Self::Responder(ResponderState::Rejected | ResponderState::Recorded)
        )
    }
}

/// Snapshot of one protocol instance, written at every suspension point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub flow_id: Uuid,
    pub counterparties: Vec<Party>,
    pub stage: FlowStage,
    pub tx_id: Option<TxId>,
    /// Present once the transaction is signed by this party.
    pub transaction: Option<SignedTransaction>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(flow_id: Uuid, stage: FlowStage) -> Self {
        Self {
            flow_id,
            counterparties: Vec::new(),
            stage,
            tx_id: None,
            transaction: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_transaction(mut self, stx: &SignedTransaction) -> Self {
        self.tx_id = Some(stx.id());
        self.transaction = Some(stx.clone());
        self
    }

    pub fn with_counterparties(mut self, parties: Vec<Party>) -> Self {
        self.counterparties = parties;
        self
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert or replace the checkpoint for `checkpoint.flow_id`.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), ExchangeError>;
    async fn remove(&self, flow_id: &Uuid) -> Result<(), ExchangeError>;
    async fn list(&self) -> Result<Vec<Checkpoint>, ExchangeError>;
}

/// What [`crate::Node::recover`] did with checkpoints left behind.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveryReport {
    /// Pre-commit instances that were dropped without any ledger effect.
    pub aborted: Vec<Uuid>,
    /// Committed transactions re-recorded locally and re-sent to counterparties.
    pub recorded: Vec<TxId>,
}
