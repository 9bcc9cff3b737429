// src/flows/responder.rs
use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, FlowStage, ResponderState};
use crate::contract;
use crate::error::ExchangeError;
use crate::identity::{Party, PublicKey};
use crate::locator;
use crate::node::NodeServices;
use crate::record::AssetRecord;
use crate::session::{Message, Proposal, ResolvedInput, Session};
use crate::transaction::{LedgerTransaction, SignedTransaction, TxId};

/// Node-specific acceptance rules, applied after the contract passes.
///
/// The contract says what any transaction of a given intent must satisfy; a
/// policy says what this party is willing to sign.
#[async_trait]
pub trait AcceptancePolicy: Send + Sync {
    async fn check(&self, proposer: &Party, tx: &LedgerTransaction) -> Result<(), String>;
}

pub struct AcceptAll;

#[async_trait]
impl AcceptancePolicy for AcceptAll {
    async fn check(&self, _proposer: &Party, _tx: &LedgerTransaction) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponderOutcome {
    /// The finalized transaction is recorded in the local vault.
    Recorded(SignedTransaction),
    /// This party refused to sign or to resolve a record.
    Rejected(String),
    /// The initiator abandoned the exchange.
    Aborted(String),
}

impl ResponderOutcome {
    fn status(&self) -> &'static str {
        match self {
            Self::Recorded(_) => "recorded",
            Self::Rejected(_) => "rejected",
            Self::Aborted(_) => "aborted",
        }
    }
}

/// Counterparty side of one exchange.
///
/// Never trusts the initiator's own validation: inputs are re-resolved from
/// the supplied dependencies and the contract is run again locally.
pub struct Responder<'a> {
    services: &'a NodeServices,
    session: Session,
    state: ResponderState,
    validated: Option<TxId>,
}

impl<'a> Responder<'a> {
    pub fn new(services: &'a NodeServices, mut session: Session) -> Self {
        session.set_timeout(services.config.session_timeout());
        Self {
            services,
            session,
            state: ResponderState::AwaitingProposal,
            validated: None,
        }
    }

    pub async fn run(mut self) -> Result<ResponderOutcome, ExchangeError> {
        let result = self.drive().await;

        let status = match &result {
            Ok(outcome) => outcome.status(),
            Err(_) => "failed",
        };
        counter!("exchange.flows.total", "role" => "responder", "status" => status).increment(1);

        if let Err(err) = self.services.checkpoints.remove(&self.session.flow_id()).await {
            warn!(flow_id = %self.session.flow_id(), "failed to clear checkpoint: {}", err);
        }
        result
    }

    async fn enter(
        &mut self,
        state: ResponderState,
        stx: Option<&SignedTransaction>,
    ) -> Result<(), ExchangeError> {
        debug!(flow_id = %self.session.flow_id(), ?state, "responder state");
        self.state = state;
        let mut checkpoint = Checkpoint::new(self.session.flow_id(), FlowStage::Responder(state))
            .with_counterparties(vec![self.session.counterparty().clone()]);
        if let Some(stx) = stx {
            checkpoint = checkpoint.with_transaction(stx);
        }
        self.services.checkpoints.save(checkpoint).await
    }

    async fn drive(&mut self) -> Result<ResponderOutcome, ExchangeError> {
        self.enter(ResponderState::AwaitingProposal, None).await?;

        loop {
            let message = self.session.receive().await?;
            match (self.state, message) {
                (ResponderState::AwaitingProposal, Message::Locate(description)) => {
                    if let Some(reason) = self.answer_locate(&description).await? {
                        return Ok(ResponderOutcome::Rejected(reason));
                    }
                }
                (ResponderState::AwaitingProposal, Message::Proposal(proposal)) => {
                    let stx = proposal.transaction.clone();
                    self.enter(ResponderState::Validating, Some(&stx)).await?;

                    if let Err(reason) = self.validate(&proposal).await {
                        warn!(
                            flow_id = %self.session.flow_id(),
                            proposer = %self.session.counterparty(),
                            "rejecting proposal: {}",
                            reason
                        );
                        self.enter(ResponderState::Rejected, Some(&stx)).await?;
                        if let Err(err) = self.session.send(Message::Reject(reason.clone())).await {
                            debug!("initiator gone before rejection was delivered: {}", err);
                        }
                        return Ok(ResponderOutcome::Rejected(reason));
                    }

                    let id = stx.id();
                    let signature = self.services.keys.sign(&id);
                    self.enter(ResponderState::Signed, Some(&stx)).await?;
                    self.session.send(Message::Signature(signature)).await?;
                    self.validated = Some(id);
                    self.enter(ResponderState::AwaitingFinality, Some(&stx)).await?;
                }
                (ResponderState::AwaitingProposal, Message::Finalized(stx)) => {
                    // Re-delivery of a transaction signed in an earlier session.
                    if stx.signature_of(&self.services.identity.key).is_none() {
                        let reason = format!("transaction {} was never signed by us", stx.id());
                        self.session.send(Message::Reject(reason.clone())).await?;
                        return Ok(ResponderOutcome::Rejected(reason));
                    }
                    return self.record(stx).await;
                }
                (ResponderState::AwaitingFinality, Message::Finalized(stx)) => {
                    if self.validated != Some(stx.id()) {
                        return Err(ExchangeError::Signature(format!(
                            "finalized transaction {} is not the one validated",
                            stx.id()
                        )));
                    }
                    return self.record(stx).await;
                }
                (_, Message::Abort(reason)) => {
                    info!(flow_id = %self.session.flow_id(), "initiator aborted: {}", reason);
                    return Ok(ResponderOutcome::Aborted(reason));
                }
                (state, other) => {
                    let expected = match state {
                        ResponderState::AwaitingFinality => "finalized",
                        _ => "proposal",
                    };
                    return Err(other.unexpected(expected).into());
                }
            }
        }
    }

    /// Returns the rejection reason when the record cannot be resolved.
    async fn answer_locate(&mut self, description: &AssetRecord) -> Result<Option<String>, ExchangeError> {
        let me = &self.services.identity;
        if &description.owner != me {
            let reason = format!("{} does not hold records owned by {}", me, description.owner);
            self.session.send(Message::Reject(reason.clone())).await?;
            return Ok(Some(reason));
        }

        let located = locator::locate(
            self.services.vault.as_ref(),
            description,
            self.services.config.locator_epsilon,
        )
        .await;
        let state = match located {
            Ok(state) => state,
            Err(err) => {
                let reason = err.to_string();
                self.session.send(Message::Reject(reason.clone())).await?;
                return Ok(Some(reason));
            }
        };

        let origin = self
            .services
            .vault
            .transaction(&state.reference.tx_id)
            .await?
            .ok_or_else(|| {
                ExchangeError::Vault(format!("creating transaction {} missing", state.reference.tx_id))
            })?;
        self.session
            .send(Message::Located(ResolvedInput { state, origin }))
            .await?;
        Ok(None)
    }

    async fn validate(&self, proposal: &Proposal) -> Result<(), String> {
        let stx = &proposal.transaction;
        let me = &self.services.identity;
        let proposer = self.session.counterparty();

        if !stx.tx.is_signer(&me.key) {
            return Err(format!("{me} is not a required signer"));
        }
        if &stx.tx.notary != self.services.notary.identity() {
            return Err(format!("unrecognised notary {}", stx.tx.notary));
        }
        if stx.signature_of(&proposer.key).is_none() {
            return Err(format!("proposal is not signed by {proposer}"));
        }
        let signer_keys: Vec<PublicKey> = stx.tx.signers.iter().map(|p| p.key).collect();
        stx.verify_signatures_except(&signer_keys)
            .map_err(|e| e.to_string())?;

        let ltx = self.resolve(stx, &proposal.dependencies).await?;
        let unlisted = stx
            .tx
            .unlisted_participants(ltx.inputs.iter().map(|input| &input.state));
        if !unlisted.is_empty() {
            let names: Vec<&str> = unlisted.iter().map(|p| p.name.as_str()).collect();
            return Err(format!("affected parties are not signers: {}", names.join(", ")));
        }
        contract::verify(&ltx).map_err(|violation| violation.to_string())?;
        self.services.policy.check(proposer, &ltx).await
    }

    async fn resolve(
        &self,
        stx: &SignedTransaction,
        dependencies: &[SignedTransaction],
    ) -> Result<LedgerTransaction, String> {
        let mut inputs = Vec::with_capacity(stx.tx.inputs.len());
        for reference in &stx.tx.inputs {
            let origin = dependencies
                .iter()
                .find(|d| d.id() == reference.tx_id)
                .ok_or_else(|| format!("no dependency supplied for input {reference}"))?;
            if origin.tx.notary != stx.tx.notary {
                return Err(format!("input {reference} is controlled by another notary"));
            }
            origin
                .verify_finality()
                .map_err(|e| format!("dependency {}: {}", reference.tx_id, e))?;
            let state = origin
                .output(reference.index)
                .ok_or_else(|| format!("input {reference} does not exist"))?;

            let consumed = self
                .services
                .vault
                .is_consumed(reference)
                .await
                .map_err(|e| e.to_string())?;
            if consumed {
                return Err(format!("input {reference} is already consumed"));
            }
            inputs.push(state);
        }

        Ok(LedgerTransaction {
            inputs,
            outputs: stx.tx.outputs.clone(),
            commands: stx.tx.commands.clone(),
        })
    }

    async fn record(&mut self, stx: SignedTransaction) -> Result<ResponderOutcome, ExchangeError> {
        if &stx.tx.notary != self.services.notary.identity() {
            return Err(ExchangeError::Signature(format!(
                "finalized by unrecognised notary {}",
                stx.tx.notary
            )));
        }
        stx.verify_finality()?;

        self.services.vault.record(&stx).await?;
        self.enter(ResponderState::Recorded, Some(&stx)).await?;
        info!(tx_id = %stx.id(), party = %self.services.identity, "recorded finalized transaction");
        self.session.send(Message::Recorded(stx.id())).await?;
        Ok(ResponderOutcome::Recorded(stx))
    }
}
