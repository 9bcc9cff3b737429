// src/transaction.rs
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::identity::{Party, PublicKey, TransactionSignature};
use crate::record::{AssetKind, AssetRecord, StateAndRef, StateRef};

const TX_DOMAIN: &[u8] = b"ousia-exchange/tx/v1";

/// BLAKE3 digest of a transaction's canonical encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(pub [u8; 32]);

impl TxId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", blake3::Hash::from(self.0).to_hex())
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", self)
    }
}

/// Declared intent of a transaction. Selects the contract rules that apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    IssueCash,
    IssueStock,
    TransferCash,
    TransferStock,
    SwapCashForStock,
}

impl Command {
    pub fn issue(kind: &AssetKind) -> Self {
        match kind {
            AssetKind::Cash { .. } => Self::IssueCash,
            AssetKind::Stock { .. } => Self::IssueStock,
        }
    }

    pub fn transfer(kind: &AssetKind) -> Self {
        match kind {
            AssetKind::Cash { .. } => Self::TransferCash,
            AssetKind::Stock { .. } => Self::TransferStock,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::IssueCash => "issue_cash",
            Self::IssueStock => "issue_stock",
            Self::TransferCash => "transfer_cash",
            Self::TransferStock => "transfer_stock",
            Self::SwapCashForStock => "swap_cash_for_stock",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Self::IssueCash => 1,
            Self::IssueStock => 2,
            Self::TransferCash => 3,
            Self::TransferStock => 4,
            Self::SwapCashForStock => 5,
        }
    }
}

/// The proposed transaction: what every signer signs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTransaction {
    pub inputs: Vec<StateRef>,
    pub outputs: Vec<AssetRecord>,
    pub commands: Vec<Command>,
    pub signers: Vec<Party>,
    pub notary: Party,
    pub nonce: Uuid,
}

impl WireTransaction {
    pub fn id(&self) -> TxId {
        TxId(*blake3::hash(&self.canonical_bytes()).as_bytes())
    }

    /// Length-prefixed encoding of every field, in declaration order.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(TX_DOMAIN);

        put_len(&mut out, self.inputs.len());
        for input in &self.inputs {
            out.extend_from_slice(input.tx_id.as_bytes());
            out.extend_from_slice(&input.index.to_le_bytes());
        }

        put_len(&mut out, self.outputs.len());
        for output in &self.outputs {
            out.push(match output.kind {
                AssetKind::Cash { .. } => 1,
                AssetKind::Stock { .. } => 2,
            });
            put_str(&mut out, output.code());
            out.extend_from_slice(&output.amount.to_bits().to_le_bytes());
            put_party(&mut out, &output.owner);
            put_len(&mut out, output.participants().len());
            for party in output.participants() {
                put_party(&mut out, party);
            }
        }

        put_len(&mut out, self.commands.len());
        for command in &self.commands {
            out.push(command.tag());
        }

        put_len(&mut out, self.signers.len());
        for signer in &self.signers {
            put_party(&mut out, signer);
        }

        put_party(&mut out, &self.notary);
        out.extend_from_slice(self.nonce.as_bytes());
        out
    }

    pub fn is_signer(&self, key: &PublicKey) -> bool {
        self.signers.iter().any(|p| &p.key == key)
    }

    /// Participants of `inputs` and of every output that are not listed as
    /// signers. Empty for a transaction every affected party must sign.
    pub fn unlisted_participants<'r>(
        &self,
        inputs: impl IntoIterator<Item = &'r AssetRecord>,
    ) -> Vec<Party> {
        let mut unlisted: Vec<Party> = Vec::new();
        let mut note = |record: &AssetRecord| {
            for party in record.participants() {
                if !self.is_signer(&party.key) && !unlisted.contains(party) {
                    unlisted.push(party.clone());
                }
            }
        };
        inputs.into_iter().for_each(&mut note);
        self.outputs.iter().for_each(&mut note);
        unlisted
    }

    pub fn output_ref(&self, index: u32) -> StateRef {
        StateRef::new(self.id(), index)
    }
}

fn put_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u64).to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_len(out, s.len());
    out.extend_from_slice(s.as_bytes());
}

fn put_party(out: &mut Vec<u8>, party: &Party) {
    put_str(out, &party.name);
    out.extend_from_slice(party.key.as_bytes());
}

/// Accumulates resolved inputs, outputs and the intent before signing.
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    notary: Party,
    inputs: Vec<StateAndRef>,
    outputs: Vec<AssetRecord>,
    commands: Vec<Command>,
    signers: BTreeSet<Party>,
}

impl TransactionBuilder {
    pub fn new(notary: Party) -> Self {
        Self {
            notary,
            inputs: Vec::new(),
            outputs: Vec::new(),
            commands: Vec::new(),
            signers: BTreeSet::new(),
        }
    }

    pub fn add_input(&mut self, input: StateAndRef) -> &mut Self {
        self.inputs.push(input);
        self
    }

    pub fn add_output(&mut self, output: AssetRecord) -> &mut Self {
        self.outputs.push(output);
        self
    }

    pub fn add_command(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn add_signer(&mut self, party: Party) -> &mut Self {
        self.signers.insert(party);
        self
    }

    /// Explicit signers plus every participant of every input and output.
    pub fn required_signers(&self) -> Vec<Party> {
        let mut signers = self.signers.clone();
        for input in &self.inputs {
            signers.extend(input.state.participants().iter().cloned());
        }
        for output in &self.outputs {
            signers.extend(output.participants().iter().cloned());
        }
        signers.into_iter().collect()
    }

    /// The view the contract validator checks.
    pub fn ledger_transaction(&self) -> LedgerTransaction {
        LedgerTransaction {
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            commands: self.commands.clone(),
        }
    }

    pub fn inputs(&self) -> &[StateAndRef] {
        &self.inputs
    }

    pub fn to_wire_transaction(&self) -> WireTransaction {
        WireTransaction {
            inputs: self.inputs.iter().map(|i| i.reference).collect(),
            outputs: self.outputs.clone(),
            commands: self.commands.clone(),
            signers: self.required_signers(),
            notary: self.notary.clone(),
            nonce: Uuid::now_v7(),
        }
    }
}

/// A proposed transaction and the signatures gathered so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub tx: WireTransaction,
    pub signatures: Vec<TransactionSignature>,
}

impl SignedTransaction {
    pub fn new(tx: WireTransaction, signature: TransactionSignature) -> Self {
        Self {
            tx,
            signatures: vec![signature],
        }
    }

    pub fn id(&self) -> TxId {
        self.tx.id()
    }

    pub fn add_signature(&mut self, signature: TransactionSignature) {
        if self.signature_of(&signature.by).is_none() {
            self.signatures.push(signature);
        }
    }

    pub fn with_signature(mut self, signature: TransactionSignature) -> Self {
        self.add_signature(signature);
        self
    }

    pub fn signature_of(&self, key: &PublicKey) -> Option<&TransactionSignature> {
        self.signatures.iter().find(|s| &s.by == key)
    }

    pub fn missing_signers(&self) -> Vec<&Party> {
        self.tx
            .signers
            .iter()
            .filter(|p| self.signature_of(&p.key).is_none())
            .collect()
    }

    /// Every attached signature must be valid and come from a signer or the
    /// notary; every signer not listed in `allowed_missing` must have signed.
    pub fn verify_signatures_except(&self, allowed_missing: &[PublicKey]) -> Result<(), ExchangeError> {
        let id = self.id();
        for signature in &self.signatures {
            if !self.tx.is_signer(&signature.by) && signature.by != self.tx.notary.key {
                return Err(ExchangeError::Signature(format!(
                    "signature by {} who is not a required signer",
                    signature.by
                )));
            }
            if !signature.verify(&id) {
                return Err(ExchangeError::Signature(format!(
                    "invalid signature by {} over {}",
                    signature.by, id
                )));
            }
        }

        let missing: Vec<String> = self
            .missing_signers()
            .into_iter()
            .filter(|p| !allowed_missing.contains(&p.key))
            .map(|p| p.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(ExchangeError::Signature(format!(
                "missing signatures from {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    pub fn verify_required_signatures(&self) -> Result<(), ExchangeError> {
        self.verify_signatures_except(&[])
    }

    /// Fully signed and carrying a valid notary signature.
    pub fn verify_finality(&self) -> Result<(), ExchangeError> {
        self.verify_required_signatures()?;
        match self.signature_of(&self.tx.notary.key) {
            Some(signature) if signature.verify(&self.id()) => Ok(()),
            Some(_) => Err(ExchangeError::Signature("invalid notary signature".into())),
            None => Err(ExchangeError::Signature(format!(
                "transaction {} is not notarised",
                self.id()
            ))),
        }
    }

    /// Outputs paired with the references they are created under.
    pub fn outputs_with_refs(&self) -> Vec<StateAndRef> {
        let id = self.id();
        self.tx
            .outputs
            .iter()
            .enumerate()
            .map(|(index, state)| StateAndRef {
                state: state.clone(),
                reference: StateRef::new(id, index as u32),
            })
            .collect()
    }

    pub fn output(&self, index: u32) -> Option<StateAndRef> {
        self.tx
            .outputs
            .get(index as usize)
            .map(|state| StateAndRef {
                state: state.clone(),
                reference: StateRef::new(self.id(), index),
            })
    }
}

/// A transaction with its inputs resolved to the records they point at.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerTransaction {
    pub inputs: Vec<StateAndRef>,
    pub outputs: Vec<AssetRecord>,
    pub commands: Vec<Command>,
}

impl LedgerTransaction {
    pub fn cash_inputs(&self) -> impl Iterator<Item = &AssetRecord> {
        self.inputs.iter().map(|i| &i.state).filter(|s| s.is_cash())
    }

    pub fn stock_inputs(&self) -> impl Iterator<Item = &AssetRecord> {
        self.inputs.iter().map(|i| &i.state).filter(|s| s.is_stock())
    }

    pub fn cash_outputs(&self) -> impl Iterator<Item = &AssetRecord> {
        self.outputs.iter().filter(|s| s.is_cash())
    }

    pub fn stock_outputs(&self) -> impl Iterator<Item = &AssetRecord> {
        self.outputs.iter().filter(|s| s.is_stock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;

    fn builder() -> (KeyPair, KeyPair, TransactionBuilder) {
        let alice = KeyPair::from_seed([1; 32]);
        let notary = KeyPair::from_seed([9; 32]);
        let mut builder = TransactionBuilder::new(notary.party("Notary"));
        builder
            .add_output(AssetRecord::cash("USD", 100.0, alice.party("Alice")))
            .add_command(Command::IssueCash);
        (alice, notary, builder)
    }

    #[test]
    fn id_is_stable_and_sensitive_to_content() {
        let (_, _, builder) = builder();
        let tx = builder.to_wire_transaction();
        assert_eq!(tx.id(), tx.clone().id());

        let mut changed = tx.clone();
        changed.outputs[0].amount = 100.5;
        assert_ne!(tx.id(), changed.id());
    }

    #[test]
    fn identical_proposals_get_distinct_ids() {
        let (_, _, builder) = builder();
        assert_ne!(
            builder.to_wire_transaction().id(),
            builder.to_wire_transaction().id()
        );
    }

    #[test]
    fn required_signers_cover_participants() {
        let (alice, _, mut builder) = builder();
        let issuer = KeyPair::from_seed([2; 32]).party("Issuer");
        builder.add_signer(issuer.clone());
        let signers = builder.required_signers();
        assert_eq!(signers.len(), 2);
        assert!(signers.contains(&issuer));
        assert!(signers.contains(&alice.party("Alice")));
    }

    #[test]
    fn unlisted_participants_of_inputs_are_reported() {
        let (alice, notary, _) = builder();
        let bob = KeyPair::from_seed([2; 32]).party("Bob");
        let carol = KeyPair::from_seed([3; 32]).party("Carol");
        let held = AssetRecord::cash("USD", 100.0, bob.clone()).with_participant(alice.party("Alice"));

        let tx = WireTransaction {
            inputs: vec![StateRef::new(TxId([7; 32]), 0)],
            outputs: vec![AssetRecord::cash("USD", 100.0, carol.clone())],
            commands: vec![Command::TransferCash],
            signers: vec![alice.party("Alice"), carol],
            notary: notary.party("Notary"),
            nonce: Uuid::now_v7(),
        };
        assert_eq!(tx.unlisted_participants([&held]), vec![bob]);
        assert!(tx.unlisted_participants([]).is_empty());
    }

    #[test]
    fn finality_needs_every_signer_and_the_notary() {
        let (alice, notary, builder) = builder();
        let tx = builder.to_wire_transaction();
        let id = tx.id();

        let stx = SignedTransaction::new(tx, alice.sign(&id));
        assert!(stx.verify_required_signatures().is_ok());
        assert!(stx.verify_finality().is_err());

        let stx = stx.with_signature(notary.sign(&id));
        assert!(stx.verify_finality().is_ok());
        assert_eq!(stx.outputs_with_refs()[0].reference, StateRef::new(id, 0));
    }

    #[test]
    fn stranger_signature_is_rejected() {
        let (alice, _, builder) = builder();
        let tx = builder.to_wire_transaction();
        let id = tx.id();
        let stranger = KeyPair::from_seed([3; 32]);

        let stx = SignedTransaction::new(tx, alice.sign(&id)).with_signature(stranger.sign(&id));
        assert!(matches!(
            stx.verify_required_signatures(),
            Err(ExchangeError::Signature(_))
        ));
    }

    #[test]
    fn missing_signers_can_be_tolerated_explicitly() {
        let (alice, _, mut builder) = builder();
        let bob = KeyPair::from_seed([4; 32]);
        builder.add_signer(bob.party("Bob"));
        let tx = builder.to_wire_transaction();
        let stx = SignedTransaction::new(tx.clone(), alice.sign(&tx.id()));

        assert!(stx.verify_required_signatures().is_err());
        assert!(stx.verify_signatures_except(&[bob.public_key()]).is_ok());
    }
}
