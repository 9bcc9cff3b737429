// src/lib.rs
pub mod adapters;
pub mod checkpoint;
pub mod config;
pub mod contract;
pub mod error;
pub mod flows;
pub mod identity;
pub mod locator;
pub mod node;
pub mod notary;
pub mod record;
pub mod session;
pub mod transaction;
pub mod vault;

pub use adapters::{MemoryCheckpointStore, MemoryNotary, MemoryVault};
pub use checkpoint::{Checkpoint, CheckpointStore, FlowStage, InitiatorStage, RecoveryReport, ResponderState};
pub use config::{ConfigError, NodeConfig};
pub use error::{ContractViolation, ExchangeError};
pub use flows::{AcceptAll, AcceptancePolicy, ExchangePlan, ResponderOutcome};
pub use identity::{KeyPair, Party, PublicKey, TransactionSignature};
pub use node::{Node, NodeBuilder};
pub use notary::{NotaryError, UniquenessProvider};
pub use record::{AssetKind, AssetRecord, StateAndRef, StateRef};
pub use session::{LocalNetwork, Message, Messaging, Session, SessionError};
pub use transaction::{Command, LedgerTransaction, SignedTransaction, TransactionBuilder, TxId, WireTransaction};
pub use vault::Vault;
