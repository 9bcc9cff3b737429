// src/node.rs
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::{MemoryCheckpointStore, MemoryVault};
use crate::checkpoint::{CheckpointStore, FlowStage, InitiatorStage, RecoveryReport};
use crate::config::NodeConfig;
use crate::error::ExchangeError;
use crate::flows::{AcceptAll, AcceptancePolicy, ExchangePlan, Initiator, Responder, ResponderOutcome};
use crate::identity::{KeyPair, Party};
use crate::notary::UniquenessProvider;
use crate::record::{AssetKind, AssetRecord, StateAndRef};
use crate::session::{Message, Messaging, Session, SessionError};
use crate::transaction::SignedTransaction;
use crate::vault::Vault;

/// Everything a flow needs from the node it runs on.
pub struct NodeServices {
    pub(crate) identity: Party,
    pub(crate) keys: KeyPair,
    pub(crate) vault: Arc<dyn Vault>,
    pub(crate) notary: Arc<dyn UniquenessProvider>,
    pub(crate) network: Arc<dyn Messaging>,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) policy: Arc<dyn AcceptancePolicy>,
    pub(crate) config: NodeConfig,
}

pub struct NodeBuilder {
    name: String,
    keys: KeyPair,
    notary: Arc<dyn UniquenessProvider>,
    network: Arc<dyn Messaging>,
    vault: Option<Arc<dyn Vault>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    policy: Option<Arc<dyn AcceptancePolicy>>,
    config: NodeConfig,
}

impl NodeBuilder {
    pub fn vault(mut self, vault: Arc<dyn Vault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn AcceptancePolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Node {
        let identity = self.keys.party(self.name);
        let vault = self
            .vault
            .unwrap_or_else(|| Arc::new(MemoryVault::new(identity.clone())));
        Node {
            services: Arc::new(NodeServices {
                identity,
                keys: self.keys,
                vault,
                notary: self.notary,
                network: self.network,
                checkpoints: self
                    .checkpoints
                    .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new())),
                policy: self.policy.unwrap_or_else(|| Arc::new(AcceptAll)),
                config: self.config,
            }),
        }
    }
}

/// A ledger participant: starts exchanges and answers counterparties.
#[derive(Clone)]
pub struct Node {
    services: Arc<NodeServices>,
}

impl Node {
    pub fn builder(
        name: impl Into<String>,
        keys: KeyPair,
        notary: Arc<dyn UniquenessProvider>,
        network: Arc<dyn Messaging>,
    ) -> NodeBuilder {
        NodeBuilder {
            name: name.into(),
            keys,
            notary,
            network,
            vault: None,
            checkpoints: None,
            policy: None,
            config: NodeConfig::default(),
        }
    }

    pub fn identity(&self) -> &Party {
        &self.services.identity
    }

    pub fn vault(&self) -> &dyn Vault {
        self.services.vault.as_ref()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.services.config
    }

    /// Issue a new cash or stock record owned by `receiver`.
    pub async fn issue(
        &self,
        kind: AssetKind,
        amount: f64,
        receiver: &Party,
    ) -> Result<SignedTransaction, ExchangeError> {
        let record = AssetRecord::new(kind, amount, receiver.clone());
        Initiator::new(&self.services)
            .run(ExchangePlan::Issue { record })
            .await
    }

    /// Move the record matching `(kind, amount, from)` to `to`.
    pub async fn transfer(
        &self,
        kind: AssetKind,
        amount: f64,
        from: &Party,
        to: &Party,
    ) -> Result<SignedTransaction, ExchangeError> {
        let description = AssetRecord::new(kind, amount, from.clone());
        Initiator::new(&self.services)
            .run(ExchangePlan::Transfer {
                description,
                to: to.clone(),
            })
            .await
    }

    /// Exchange a cash record for a stock record between their two owners.
    pub async fn swap(
        &self,
        cash: AssetRecord,
        stock: AssetRecord,
    ) -> Result<SignedTransaction, ExchangeError> {
        Initiator::new(&self.services)
            .run(ExchangePlan::Swap { cash, stock })
            .await
    }

    /// Every unconsumed record this node can see.
    pub async fn records(&self) -> Result<Vec<StateAndRef>, ExchangeError> {
        self.services.vault.unconsumed().await
    }

    pub async fn my_cash(&self) -> Result<Vec<StateAndRef>, ExchangeError> {
        self.owned(AssetRecord::is_cash).await
    }

    pub async fn my_stocks(&self) -> Result<Vec<StateAndRef>, ExchangeError> {
        self.owned(AssetRecord::is_stock).await
    }

    async fn owned(&self, is_kind: fn(&AssetRecord) -> bool) -> Result<Vec<StateAndRef>, ExchangeError> {
        let me = self.identity();
        Ok(self
            .records()
            .await?
            .into_iter()
            .filter(|r| &r.state.owner == me && is_kind(&r.state))
            .collect())
    }

    /// Answer one incoming session.
    pub async fn respond(&self, session: Session) -> Result<ResponderOutcome, ExchangeError> {
        Responder::new(&self.services, session).run().await
    }

    /// Answer every session arriving on `inbox`, each on its own task.
    pub fn serve(&self, mut inbox: mpsc::Receiver<Session>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(session) = inbox.recv().await {
                let node = node.clone();
                tokio::spawn(async move {
                    let flow_id = session.flow_id();
                    if let Err(err) = node.respond(session).await {
                        warn!(%flow_id, party = %node.identity(), "responder failed: {}", err);
                    }
                });
            }
        })
    }

    /// Send an already final transaction to every other signer, waiting for
    /// each to acknowledge. Returns the parties that did not.
    pub async fn redistribute(&self, stx: &SignedTransaction) -> Result<Vec<Party>, ExchangeError> {
        stx.verify_finality()?;
        let flow_id = Uuid::now_v7();
        let timeout = self.services.config.session_timeout();
        let mut unreachable = Vec::new();

        for party in stx.tx.signers.iter().filter(|p| *p != self.identity()) {
            let delivered = async {
                let mut session = self
                    .services
                    .network
                    .open(self.identity(), party, flow_id, timeout)
                    .await?;
                session.send(Message::Finalized(stx.clone())).await?;
                match session.receive().await? {
                    Message::Recorded(id) if id == stx.id() => Ok::<(), SessionError>(()),
                    other => Err(other.unexpected("recorded")),
                }
            };
            if let Err(err) = delivered.await {
                warn!(tx_id = %stx.id(), %party, "redistribution failed: {}", err);
                unreachable.push(party.clone());
            }
        }
        Ok(unreachable)
    }

    /// Resolve checkpoints left behind by a previous run.
    ///
    /// Instances that never reached the notary are dropped. An instance that
    /// was waiting on the notary is re-submitted: the notary answers an
    /// already accepted transaction again, and refuses one it never saw that
    /// now conflicts. Committed transactions are recorded and re-sent.
    pub async fn recover(&self) -> Result<RecoveryReport, ExchangeError> {
        let mut report = RecoveryReport::default();
        let services = &self.services;

        for checkpoint in services.checkpoints.list().await? {
            let committed = match (checkpoint.stage, &checkpoint.transaction) {
                (FlowStage::Initiator(InitiatorStage::Notarising), Some(stx)) => {
                    match services.notary.commit(stx).await {
                        Ok(signature) => Some(stx.clone().with_signature(signature)),
                        Err(err) => {
                            info!(flow_id = %checkpoint.flow_id, "abandoning uncommitted exchange: {}", err);
                            None
                        }
                    }
                }
                (FlowStage::Initiator(stage), Some(stx)) if stage.is_committed() => Some(stx.clone()),
                _ => None,
            };

            match committed {
                Some(stx) => {
                    services.vault.record(&stx).await?;
                    self.redistribute(&stx).await?;
                    report.recorded.push(stx.id());
                }
                None => report.aborted.push(checkpoint.flow_id),
            }
            services.checkpoints.remove(&checkpoint.flow_id).await?;
        }

        info!(
            aborted = report.aborted.len(),
            recorded = report.recorded.len(),
            "checkpoint recovery finished"
        );
        Ok(report)
    }
}
