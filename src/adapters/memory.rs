// src/adapters/memory.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::ExchangeError;
use crate::identity::{KeyPair, Party, TransactionSignature};
use crate::notary::{NotaryError, UniquenessProvider};
use crate::record::{AssetRecord, StateAndRef, StateRef};
use crate::transaction::{SignedTransaction, TxId};
use crate::vault::Vault;

fn poisoned(what: &str) -> ExchangeError {
    ExchangeError::Vault(format!("{what} lock poisoned"))
}

#[derive(Default)]
struct VaultState {
    /// Append-only arena, in recording order.
    records: Vec<StateAndRef>,
    known: HashSet<StateRef>,
    consumed: HashSet<StateRef>,
    transactions: HashMap<TxId, (SignedTransaction, DateTime<Utc>)>,
}

/// Vault kept in process memory, scoped to one party.
#[derive(Clone)]
pub struct MemoryVault {
    party: Party,
    store: Arc<Mutex<VaultState>>,
}

impl MemoryVault {
    pub fn new(party: Party) -> Self {
        Self {
            party,
            store: Arc::new(Mutex::new(VaultState::default())),
        }
    }

    pub fn party(&self) -> &Party {
        &self.party
    }

    fn lock(&self) -> Result<MutexGuard<'_, VaultState>, ExchangeError> {
        self.store.lock().map_err(|_| poisoned("vault"))
    }

    /// Every record ever stored, consumed or not.
    pub fn history(&self) -> Result<Vec<StateAndRef>, ExchangeError> {
        Ok(self.lock()?.records.clone())
    }

    pub fn recorded_at(&self, id: &TxId) -> Result<Option<DateTime<Utc>>, ExchangeError> {
        Ok(self.lock()?.transactions.get(id).map(|(_, at)| *at))
    }
}

#[async_trait]
impl Vault for MemoryVault {
    async fn record(&self, stx: &SignedTransaction) -> Result<(), ExchangeError> {
        let id = stx.id();
        let mut store = self.lock()?;
        if store.transactions.contains_key(&id) {
            debug!(tx_id = %id, "transaction already recorded");
            return Ok(());
        }

        for input in &stx.tx.inputs {
            store.consumed.insert(*input);
        }
        for output in stx.outputs_with_refs() {
            if output.state.is_participant(&self.party) && store.known.insert(output.reference) {
                store.records.push(output);
            }
        }
        store.transactions.insert(id, (stx.clone(), Utc::now()));
        Ok(())
    }

    async fn transaction(&self, id: &TxId) -> Result<Option<SignedTransaction>, ExchangeError> {
        Ok(self.lock()?.transactions.get(id).map(|(stx, _)| stx.clone()))
    }

    async fn unconsumed(&self) -> Result<Vec<StateAndRef>, ExchangeError> {
        let store = self.lock()?;
        Ok(store
            .records
            .iter()
            .filter(|r| !store.consumed.contains(&r.reference))
            .cloned()
            .collect())
    }

    async fn is_consumed(&self, reference: &StateRef) -> Result<bool, ExchangeError> {
        Ok(self.lock()?.consumed.contains(reference))
    }
}

#[derive(Default)]
struct NotaryState {
    /// Input reference to the accepted transaction that consumed it.
    consumed: HashMap<StateRef, TxId>,
    /// Every record created by an accepted transaction.
    created: HashMap<StateRef, AssetRecord>,
}

/// Single-process uniqueness authority. One lock serializes every commit.
///
/// Inputs must have been created by a transaction this notary accepted, so
/// the participants of a consumed record are always known and must have
/// signed.
pub struct MemoryNotary {
    identity: Party,
    keys: KeyPair,
    state: Mutex<NotaryState>,
}

impl MemoryNotary {
    pub fn new(name: impl Into<String>, keys: KeyPair) -> Self {
        Self {
            identity: keys.party(name),
            keys,
            state: Mutex::new(NotaryState::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, NotaryState>, NotaryError> {
        self.state
            .lock()
            .map_err(|_| NotaryError::Unavailable("notary lock poisoned".into()))
    }

    pub fn is_consumed(&self, reference: &StateRef) -> Result<bool, NotaryError> {
        Ok(self.lock()?.consumed.contains_key(reference))
    }

    fn try_commit(&self, stx: &SignedTransaction) -> Result<TransactionSignature, NotaryError> {
        if stx.tx.notary != self.identity {
            return Err(NotaryError::Refused(format!(
                "transaction names notary {}, not {}",
                stx.tx.notary, self.identity
            )));
        }
        stx.verify_required_signatures()
            .map_err(|e| NotaryError::Refused(e.to_string()))?;

        let id = stx.id();
        let mut state = self.lock()?;

        let mut inputs = Vec::with_capacity(stx.tx.inputs.len());
        for input in &stx.tx.inputs {
            let record = state.created.get(input).ok_or_else(|| {
                NotaryError::Refused(format!("input {input} was not created through this notary"))
            })?;
            inputs.push(record);
        }
        let unlisted = stx.tx.unlisted_participants(inputs);
        if !unlisted.is_empty() {
            let names: Vec<&str> = unlisted.iter().map(|p| p.name.as_str()).collect();
            return Err(NotaryError::Refused(format!(
                "affected parties did not sign: {}",
                names.join(", ")
            )));
        }

        let conflicts: Vec<(StateRef, TxId)> = stx
            .tx
            .inputs
            .iter()
            .filter_map(|input| match state.consumed.get(input) {
                Some(by) if *by != id => Some((*input, *by)),
                _ => None,
            })
            .collect();
        if !conflicts.is_empty() {
            return Err(NotaryError::Conflict { conflicts });
        }

        for input in &stx.tx.inputs {
            state.consumed.insert(*input, id);
        }
        for output in stx.outputs_with_refs() {
            state.created.insert(output.reference, output.state);
        }
        Ok(self.keys.sign(&id))
    }
}

#[async_trait]
impl UniquenessProvider for MemoryNotary {
    fn identity(&self) -> &Party {
        &self.identity
    }

    async fn commit(&self, stx: &SignedTransaction) -> Result<TransactionSignature, NotaryError> {
        let result = self.try_commit(stx);
        let status = match &result {
            Ok(_) => "accepted",
            Err(NotaryError::Conflict { .. }) => "conflict",
            Err(_) => "refused",
        };
        counter!("exchange.notary.commits", "status" => status).increment(1);
        if let Err(err) = &result {
            warn!(tx_id = %stx.id(), "notary rejected transaction: {}", err);
        }
        result
    }
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<Uuid, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Uuid, Checkpoint>>, ExchangeError> {
        self.checkpoints
            .lock()
            .map_err(|_| ExchangeError::Checkpoint("checkpoint lock poisoned".into()))
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), ExchangeError> {
        self.lock()?.insert(checkpoint.flow_id, checkpoint);
        Ok(())
    }

    async fn remove(&self, flow_id: &Uuid) -> Result<(), ExchangeError> {
        self.lock()?.remove(flow_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, ExchangeError> {
        let mut all: Vec<Checkpoint> = self.lock()?.values().cloned().collect();
        all.sort_by_key(|c| c.updated_at);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{FlowStage, InitiatorStage};
    use crate::transaction::{Command, TransactionBuilder, WireTransaction};

    struct Fixture {
        alice: KeyPair,
        notary: MemoryNotary,
        issued: SignedTransaction,
    }

    async fn fixture() -> Fixture {
        let alice = KeyPair::from_seed([1; 32]);
        let notary = MemoryNotary::new("Notary", KeyPair::from_seed([9; 32]));
        let mut builder = TransactionBuilder::new(notary.identity().clone());
        builder
            .add_output(AssetRecord::cash("USD", 100.0, alice.party("Alice")))
            .add_command(Command::IssueCash);
        let tx = builder.to_wire_transaction();
        let issued = SignedTransaction::new(tx.clone(), alice.sign(&tx.id()));
        let notarised = notary.commit(&issued).await.unwrap();
        let issued = issued.with_signature(notarised);
        Fixture {
            alice,
            notary,
            issued,
        }
    }

    fn spend(f: &Fixture, to: &str, seed: u8) -> SignedTransaction {
        let input = f.issued.output(0).unwrap();
        let receiver = KeyPair::from_seed([seed; 32]);
        let mut builder = TransactionBuilder::new(f.notary.identity().clone());
        builder
            .add_input(input.clone())
            .add_output(input.state.reassigned(receiver.party(to)))
            .add_command(Command::TransferCash);
        let tx = builder.to_wire_transaction();
        let id = tx.id();
        SignedTransaction::new(tx, f.alice.sign(&id)).with_signature(receiver.sign(&id))
    }

    #[tokio::test]
    async fn vault_tracks_consumption_without_deleting() {
        let f = fixture().await;
        let vault = MemoryVault::new(f.alice.party("Alice"));
        vault.record(&f.issued).await.unwrap();
        vault.record(&f.issued).await.unwrap();
        assert_eq!(vault.unconsumed().await.unwrap().len(), 1);

        let transfer = spend(&f, "Bob", 2);
        vault.record(&transfer).await.unwrap();

        let unconsumed = vault.unconsumed().await.unwrap();
        assert_eq!(unconsumed.len(), 1);
        assert_eq!(unconsumed[0].state.owner.name, "Bob");
        assert_eq!(vault.history().unwrap().len(), 2);
        assert!(vault.is_consumed(&f.issued.output(0).unwrap().reference).await.unwrap());
        assert!(vault.transaction(&transfer.id()).await.unwrap().is_some());
        assert!(vault.recorded_at(&transfer.id()).unwrap().is_some());
    }

    #[tokio::test]
    async fn vault_ignores_outputs_it_does_not_participate_in() {
        let f = fixture().await;
        let vault = MemoryVault::new(KeyPair::from_seed([5; 32]).party("Eve"));
        vault.record(&f.issued).await.unwrap();
        assert!(vault.unconsumed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn notary_accepts_once_per_input() {
        let f = fixture().await;
        let first = spend(&f, "Bob", 2);
        let second = spend(&f, "Carol", 3);

        assert!(f.notary.commit(&first).await.is_ok());
        // resubmission of the accepted transaction is answered again
        assert!(f.notary.commit(&first).await.is_ok());

        match f.notary.commit(&second).await {
            Err(NotaryError::Conflict { conflicts }) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].1, first.id());
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_conflicting_commits_accept_exactly_one() {
        for _ in 0..20 {
            let f = Arc::new(fixture().await);
            let first = spend(&f, "Bob", 2);
            let second = spend(&f, "Carol", 3);

            let (a, b) = {
                let fa = Arc::clone(&f);
                let fb = Arc::clone(&f);
                let ha = tokio::spawn(async move { fa.notary.commit(&first).await });
                let hb = tokio::spawn(async move { fb.notary.commit(&second).await });
                (ha.await.unwrap(), hb.await.unwrap())
            };

            let accepted = [&a, &b].iter().filter(|r| r.is_ok()).count();
            let conflicts = [&a, &b]
                .iter()
                .filter(|r| matches!(r, Err(NotaryError::Conflict { .. })))
                .count();
            assert_eq!((accepted, conflicts), (1, 1));
        }
    }

    #[tokio::test]
    async fn notary_refuses_unsigned_or_foreign_transactions() {
        let f = fixture().await;
        let mut unsigned = spend(&f, "Bob", 2);
        unsigned.signatures.truncate(1);
        assert!(matches!(
            f.notary.commit(&unsigned).await,
            Err(NotaryError::Refused(_))
        ));

        let other = MemoryNotary::new("Other", KeyPair::from_seed([8; 32]));
        assert!(matches!(
            other.commit(&spend(&f, "Bob", 2)).await,
            Err(NotaryError::Refused(_))
        ));
        assert!(!f.notary.is_consumed(&f.issued.output(0).unwrap().reference).unwrap());
    }

    #[tokio::test]
    async fn notary_refuses_to_consume_without_the_owner() {
        let f = fixture().await;
        let input = f.issued.output(0).unwrap();
        let mallory = KeyPair::from_seed([6; 32]);
        let tx = WireTransaction {
            inputs: vec![input.reference],
            outputs: vec![AssetRecord::cash("USD", 100.0, mallory.party("Mallory"))],
            commands: vec![Command::TransferCash],
            signers: vec![mallory.party("Mallory")],
            notary: f.notary.identity().clone(),
            nonce: Uuid::now_v7(),
        };
        let id = tx.id();
        let stx = SignedTransaction::new(tx, mallory.sign(&id));

        match f.notary.commit(&stx).await {
            Err(NotaryError::Refused(reason)) => assert!(reason.contains("Alice"), "{reason}"),
            other => panic!("expected refusal, got {other:?}"),
        }
        assert!(!f.notary.is_consumed(&input.reference).unwrap());
    }

    #[tokio::test]
    async fn notary_refuses_inputs_it_never_saw_created() {
        let f = fixture().await;
        let alice = f.alice.party("Alice");
        let mut builder = TransactionBuilder::new(f.notary.identity().clone());
        builder
            .add_input(StateAndRef {
                state: AssetRecord::cash("USD", 5.0, alice.clone()),
                reference: StateRef::new(TxId([4; 32]), 0),
            })
            .add_output(AssetRecord::cash("USD", 5.0, alice))
            .add_command(Command::TransferCash);
        let tx = builder.to_wire_transaction();
        let stx = SignedTransaction::new(tx.clone(), f.alice.sign(&tx.id()));

        assert!(matches!(
            f.notary.commit(&stx).await,
            Err(NotaryError::Refused(_))
        ));
    }

    #[tokio::test]
    async fn checkpoints_replace_by_flow_id() {
        let store = MemoryCheckpointStore::new();
        let flow_id = Uuid::now_v7();
        store
            .save(Checkpoint::new(flow_id, FlowStage::Initiator(InitiatorStage::Building)))
            .await
            .unwrap();
        store
            .save(Checkpoint::new(flow_id, FlowStage::Initiator(InitiatorStage::Signing)))
            .await
            .unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].stage, FlowStage::Initiator(InitiatorStage::Signing));

        store.remove(&flow_id).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}
