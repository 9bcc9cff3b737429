// src/flows/initiator.rs
use metrics::{counter, histogram};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, FlowStage, InitiatorStage};
use crate::contract;
use crate::error::ExchangeError;
use crate::identity::{Party, PublicKey};
use crate::locator;
use crate::node::NodeServices;
use crate::record::AssetRecord;
use crate::session::{Message, Proposal, ResolvedInput, Session, SessionError};
use crate::transaction::{Command, SignedTransaction, TransactionBuilder};

/// What the initiator was asked to do.
#[derive(Debug, Clone)]
pub enum ExchangePlan {
    Issue { record: AssetRecord },
    Transfer { description: AssetRecord, to: Party },
    Swap { cash: AssetRecord, stock: AssetRecord },
}

impl ExchangePlan {
    fn label(&self) -> &'static str {
        match self {
            Self::Issue { .. } => "issue",
            Self::Transfer { .. } => "transfer",
            Self::Swap { .. } => "swap",
        }
    }

    fn descriptions(&self) -> Vec<&AssetRecord> {
        match self {
            Self::Issue { .. } => vec![],
            Self::Transfer { description, .. } => vec![description],
            Self::Swap { cash, stock } => vec![cash, stock],
        }
    }
}

/// Proposing side of one exchange. Stages run strictly in order; nothing
/// touches the shared ledger before the notary accepts.
pub struct Initiator<'a> {
    services: &'a NodeServices,
    flow_id: Uuid,
    stage: InitiatorStage,
    sessions: HashMap<PublicKey, Session>,
}

impl<'a> Initiator<'a> {
    pub fn new(services: &'a NodeServices) -> Self {
        Self {
            services,
            flow_id: Uuid::now_v7(),
            stage: InitiatorStage::ResolvingInputs,
            sessions: HashMap::new(),
        }
    }

    pub fn flow_id(&self) -> Uuid {
        self.flow_id
    }

    pub async fn run(mut self, plan: ExchangePlan) -> Result<SignedTransaction, ExchangeError> {
        let label = plan.label();
        info!(flow_id = %self.flow_id, party = %self.services.identity, plan = label, "starting exchange");

        let committed = match self.propose(plan).await {
            Ok(stx) => stx,
            Err(err) => {
                warn!(flow_id = %self.flow_id, stage = ?self.stage, "exchange aborted: {}", err);
                self.stage = InitiatorStage::Aborted;
                self.abort_sessions(&err.to_string()).await;
                counter!("exchange.flows.total",
                    "role" => "initiator",
                    "plan" => label,
                    "status" => "aborted"
                )
                .increment(1);
                self.clear_checkpoint().await;
                return Err(err);
            }
        };

        // Commit point: the transaction is final whatever happens below.
        let settled = self.finalize(&committed).await;
        info!(flow_id = %self.flow_id, tx_id = %committed.id(), settled, "exchange finalized");
        for output in &committed.tx.outputs {
            histogram!("exchange.transaction.amount", "kind" => output.kind.label())
                .record(output.amount);
        }
        counter!("exchange.flows.total",
            "role" => "initiator",
            "plan" => label,
            "status" => if settled { "finalized" } else { "unsettled" }
        )
        .increment(1);

        if settled {
            self.clear_checkpoint().await;
        } else {
            warn!(flow_id = %self.flow_id, tx_id = %committed.id(), "checkpoint kept for recovery");
        }
        Ok(committed)
    }

    async fn clear_checkpoint(&self) {
        if let Err(err) = self.services.checkpoints.remove(&self.flow_id).await {
            warn!(flow_id = %self.flow_id, "failed to clear checkpoint: {}", err);
        }
    }

    async fn enter(
        &mut self,
        stage: InitiatorStage,
        stx: Option<&SignedTransaction>,
    ) -> Result<(), ExchangeError> {
        debug!(flow_id = %self.flow_id, ?stage, "initiator stage");
        self.stage = stage;
        let counterparties = self
            .sessions
            .values()
            .map(|s| s.counterparty().clone())
            .collect();
        let mut checkpoint = Checkpoint::new(self.flow_id, FlowStage::Initiator(stage))
            .with_counterparties(counterparties);
        if let Some(stx) = stx {
            checkpoint = checkpoint.with_transaction(stx);
        }
        self.services.checkpoints.save(checkpoint).await
    }

    /// Everything up to and including the notary commit. An error here means
    /// nothing was committed.
    async fn propose(&mut self, plan: ExchangePlan) -> Result<SignedTransaction, ExchangeError> {
        self.enter(InitiatorStage::ResolvingInputs, None).await?;
        let mut inputs = Vec::new();
        for description in plan.descriptions() {
            inputs.push(self.resolve_input(description).await?);
        }

        self.enter(InitiatorStage::Building, None).await?;
        let builder = self.build(&plan, &inputs);

        self.enter(InitiatorStage::SelfValidating, None).await?;
        contract::verify(&builder.ledger_transaction())?;

        self.enter(InitiatorStage::Signing, None).await?;
        let tx = builder.to_wire_transaction();
        let id = tx.id();
        let stx = SignedTransaction::new(tx, self.services.keys.sign(&id));

        self.enter(InitiatorStage::CollectingSignatures, Some(&stx)).await?;
        let mut dependencies: Vec<SignedTransaction> = Vec::new();
        for input in inputs {
            if !dependencies.iter().any(|d| d.id() == input.origin.id()) {
                dependencies.push(input.origin);
            }
        }
        let mut stx = self.collect_signatures(stx, dependencies).await?;

        self.enter(InitiatorStage::Notarising, Some(&stx)).await?;
        let notary_signature = self.services.notary.commit(&stx).await?;
        stx.add_signature(notary_signature);
        Ok(stx)
    }

    /// Record and distribute a committed transaction. Never fails; returns
    /// whether every step succeeded. When it did not, the last saved
    /// checkpoint stays behind for [`crate::Node::recover`], which resubmits
    /// or redistributes as needed.
    async fn finalize(&mut self, stx: &SignedTransaction) -> bool {
        let mut settled = true;

        if let Err(err) = self.enter(InitiatorStage::Finalizing, Some(stx)).await {
            error!(flow_id = %self.flow_id, tx_id = %stx.id(), "failed to checkpoint committed transaction: {}", err);
            counter!("exchange.finalization.failures", "step" => "checkpoint").increment(1);
            settled = false;
        }
        if let Err(err) = self.services.vault.record(stx).await {
            error!(flow_id = %self.flow_id, tx_id = %stx.id(), "failed to record committed transaction: {}", err);
            counter!("exchange.finalization.failures", "step" => "record").increment(1);
            settled = false;
        }
        if !self.distribute(stx).await {
            settled = false;
        }

        if settled {
            if let Err(err) = self.enter(InitiatorStage::Completed, Some(stx)).await {
                debug!(flow_id = %self.flow_id, "completion not checkpointed: {}", err);
            }
        }
        settled
    }

    async fn session_with(&mut self, party: &Party) -> Result<&mut Session, ExchangeError> {
        if !self.sessions.contains_key(&party.key) {
            let session = self
                .services
                .network
                .open(
                    &self.services.identity,
                    party,
                    self.flow_id,
                    self.services.config.session_timeout(),
                )
                .await?;
            self.sessions.insert(party.key, session);
        }
        self.sessions
            .get_mut(&party.key)
            .ok_or_else(|| SessionError::UnknownParty(party.name.clone()).into())
    }

    /// Local vault first; a record owned by someone else is asked of its owner.
    async fn resolve_input(&mut self, description: &AssetRecord) -> Result<ResolvedInput, ExchangeError> {
        let services = self.services;
        let epsilon = services.config.locator_epsilon;

        match locator::locate(services.vault.as_ref(), description, epsilon).await {
            Ok(state) => {
                let origin = services
                    .vault
                    .transaction(&state.reference.tx_id)
                    .await?
                    .ok_or_else(|| {
                        ExchangeError::Vault(format!(
                            "creating transaction {} missing",
                            state.reference.tx_id
                        ))
                    })?;
                return Ok(ResolvedInput { state, origin });
            }
            Err(ExchangeError::InputNotFound(_)) if description.owner != services.identity => {}
            Err(err) => return Err(err),
        }

        let owner = description.owner.clone();
        let session = self.session_with(&owner).await?;
        session.send(Message::Locate(description.clone())).await?;
        let resolved = match session.receive().await? {
            Message::Located(resolved) => resolved,
            Message::Reject(reason) => return Err(ExchangeError::InputNotFound(reason)),
            other => return Err(other.unexpected("located").into()),
        };

        resolved.origin.verify_finality()?;
        let reference = resolved.state.reference;
        let genuine = reference.tx_id == resolved.origin.id()
            && resolved.origin.output(reference.index).as_ref() == Some(&resolved.state);
        if !genuine || !locator::matches(&resolved.state.state, description, epsilon) {
            return Err(ExchangeError::InputNotFound(format!(
                "{} answered with a record that does not match {}",
                owner, description
            )));
        }
        Ok(resolved)
    }

    fn build(&self, plan: &ExchangePlan, inputs: &[ResolvedInput]) -> TransactionBuilder {
        let me = &self.services.identity;
        let mut builder = TransactionBuilder::new(self.services.notary.identity().clone());
        builder.add_signer(me.clone());
        for input in inputs {
            builder.add_input(input.state.clone());
        }

        match plan {
            ExchangePlan::Issue { record } => {
                builder
                    .add_output(record.clone().with_participant(me.clone()))
                    .add_command(Command::issue(&record.kind));
            }
            ExchangePlan::Transfer { to, .. } => {
                for input in inputs {
                    builder
                        .add_output(input.state.state.reassigned(to.clone()))
                        .add_command(Command::transfer(&input.state.state.kind));
                }
            }
            ExchangePlan::Swap { .. } => {
                if let [cash, stock] = inputs {
                    let (cash, stock) = (&cash.state.state, &stock.state.state);
                    builder
                        .add_output(cash.reassigned(stock.owner.clone()))
                        .add_output(stock.reassigned(cash.owner.clone()));
                }
                builder.add_command(Command::SwapCashForStock);
            }
        }
        builder
    }

    /// All-or-nothing: every required signer must sign.
    async fn collect_signatures(
        &mut self,
        mut stx: SignedTransaction,
        dependencies: Vec<SignedTransaction>,
    ) -> Result<SignedTransaction, ExchangeError> {
        let me = self.services.identity.clone();
        let counterparties: Vec<Party> = stx
            .tx
            .signers
            .iter()
            .filter(|p| **p != me)
            .cloned()
            .collect();

        let proposal = Proposal {
            transaction: stx.clone(),
            dependencies,
        };
        for party in &counterparties {
            let session = self.session_with(party).await?;
            session.send(Message::Proposal(proposal.clone())).await?;
        }
        self.enter(InitiatorStage::CollectingSignatures, Some(&stx)).await?;

        let id = stx.id();
        for party in &counterparties {
            let session = self.session_with(party).await?;
            match session.receive().await? {
                Message::Signature(signature) if signature.by == party.key => {
                    if !signature.verify(&id) {
                        return Err(ExchangeError::Signature(format!(
                            "invalid signature from {}",
                            party
                        )));
                    }
                    stx.add_signature(signature);
                }
                Message::Signature(_) => {
                    return Err(ExchangeError::Signature(format!(
                        "{} returned a signature under another key",
                        party
                    )));
                }
                Message::Reject(reason) => {
                    return Err(ExchangeError::CounterpartyRejected {
                        party: party.clone(),
                        reason,
                    });
                }
                other => return Err(other.unexpected("signature").into()),
            }
        }

        stx.verify_required_signatures()?;
        Ok(stx)
    }

    /// Send the final transaction to every counterparty and wait for each to
    /// record it. Returns whether every counterparty acknowledged.
    async fn distribute(&mut self, stx: &SignedTransaction) -> bool {
        let id = stx.id();
        let mut acknowledged = true;
        for session in self.sessions.values_mut() {
            let party = session.counterparty().clone();
            let delivered = async {
                session.send(Message::Finalized(stx.clone())).await?;
                match session.receive().await? {
                    Message::Recorded(recorded) if recorded == id => Ok::<(), SessionError>(()),
                    other => Err(other.unexpected("recorded")),
                }
            };
            if let Err(err) = delivered.await {
                error!(tx_id = %id, %party, "finalized transaction not acknowledged: {}", err);
                counter!("exchange.distribution.failures").increment(1);
                acknowledged = false;
            }
        }
        acknowledged
    }

    async fn abort_sessions(&self, reason: &str) {
        for session in self.sessions.values() {
            if let Err(err) = session.send(Message::Abort(reason.to_string())).await {
                debug!(party = %session.counterparty(), "abort not delivered: {}", err);
            }
        }
    }
}
