// src/locator.rs
use tracing::debug;

use crate::error::ExchangeError;
use crate::record::{AssetRecord, StateAndRef};
use crate::vault::Vault;

/// Tolerance on `amount` when matching a description against held records.
pub const DEFAULT_EPSILON: f64 = 1e-3;

/// Same kind and code, same owner, amount within `epsilon`.
///
/// Participants are not compared: a description built by a front end only
/// knows the owner, while the stored record also names earlier owners.
pub fn matches(candidate: &AssetRecord, description: &AssetRecord, epsilon: f64) -> bool {
    candidate.kind == description.kind
        && candidate.owner == description.owner
        && (candidate.amount - description.amount).abs() <= epsilon
}

/// Resolve a logical description to a concrete unconsumed record.
pub async fn locate(
    vault: &dyn Vault,
    description: &AssetRecord,
    epsilon: f64,
) -> Result<StateAndRef, ExchangeError> {
    let found = vault
        .find_unconsumed(&|candidate| matches(candidate, description, epsilon))
        .await?;

    match found {
        Some(state) => {
            debug!(reference = %state.reference, "located {}", description);
            Ok(state)
        }
        None => Err(ExchangeError::InputNotFound(description.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryVault;
    use crate::identity::KeyPair;
    use crate::transaction::{Command, SignedTransaction, TransactionBuilder};

    async fn vault_with(record: AssetRecord, keys: &KeyPair) -> (MemoryVault, SignedTransaction) {
        let vault = MemoryVault::new(record.owner.clone());
        let mut builder = TransactionBuilder::new(keys.party("Notary"));
        builder
            .add_output(record)
            .add_command(Command::IssueCash);
        let tx = builder.to_wire_transaction();
        let stx = SignedTransaction::new(tx.clone(), keys.sign(&tx.id()));
        vault.record(&stx).await.unwrap();
        (vault, stx)
    }

    #[tokio::test]
    async fn locates_within_tolerance() {
        let keys = KeyPair::from_seed([1; 32]);
        let alice = keys.party("Alice");
        let (vault, stx) = vault_with(AssetRecord::cash("USD", 100.0, alice.clone()), &keys).await;

        let found = locate(&vault, &AssetRecord::cash("USD", 100.0004, alice.clone()), DEFAULT_EPSILON)
            .await
            .unwrap();
        assert_eq!(found.reference, stx.outputs_with_refs()[0].reference);

        let missing = locate(&vault, &AssetRecord::cash("USD", 100.01, alice), DEFAULT_EPSILON).await;
        assert!(matches!(missing, Err(ExchangeError::InputNotFound(_))));
    }

    #[tokio::test]
    async fn owner_and_code_must_match() {
        let keys = KeyPair::from_seed([1; 32]);
        let alice = keys.party("Alice");
        let bob = KeyPair::from_seed([2; 32]).party("Bob");
        let (vault, _) = vault_with(AssetRecord::cash("USD", 100.0, alice.clone()), &keys).await;

        assert!(locate(&vault, &AssetRecord::cash("USD", 100.0, bob), DEFAULT_EPSILON).await.is_err());
        assert!(locate(&vault, &AssetRecord::stock("USD", 100.0, alice), DEFAULT_EPSILON).await.is_err());
    }

    #[tokio::test]
    async fn consumed_records_are_never_matched() {
        let keys = KeyPair::from_seed([1; 32]);
        let alice = keys.party("Alice");
        let bob = KeyPair::from_seed([2; 32]).party("Bob");
        let description = AssetRecord::cash("USD", 100.0, alice.clone());
        let (vault, _) = vault_with(description.clone(), &keys).await;

        let input = locate(&vault, &description, DEFAULT_EPSILON).await.unwrap();
        let mut builder = TransactionBuilder::new(keys.party("Notary"));
        builder
            .add_input(input.clone())
            .add_output(input.state.reassigned(bob))
            .add_command(Command::TransferCash);
        let tx = builder.to_wire_transaction();
        vault
            .record(&SignedTransaction::new(tx.clone(), keys.sign(&tx.id())))
            .await
            .unwrap();

        assert!(vault.is_consumed(&input.reference).await.unwrap());
        assert!(matches!(
            locate(&vault, &description, DEFAULT_EPSILON).await,
            Err(ExchangeError::InputNotFound(_))
        ));
    }
}
