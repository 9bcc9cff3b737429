// src/session.rs
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::identity::{Party, PublicKey, TransactionSignature};
use crate::node::Node;
use crate::record::{AssetRecord, StateAndRef};
use crate::transaction::{SignedTransaction, TxId};

const CHANNEL_CAPACITY: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session timed out")]
    Timeout,
    #[error("session closed by {0}")]
    Closed(String),
    #[error("no route to party {0}")]
    UnknownParty(String),
    #[error("unexpected message: expected {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },
}

/// A record resolved by its owner, with the transaction that created it so
/// the receiver can check it independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedInput {
    pub state: StateAndRef,
    pub origin: SignedTransaction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub transaction: SignedTransaction,
    /// Finalized transactions that created the proposal's inputs.
    pub dependencies: Vec<SignedTransaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Locate(AssetRecord),
    Located(ResolvedInput),
    Proposal(Proposal),
    Signature(TransactionSignature),
    Reject(String),
    Abort(String),
    Finalized(SignedTransaction),
    Recorded(TxId),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Locate(_) => "locate",
            Self::Located(_) => "located",
            Self::Proposal(_) => "proposal",
            Self::Signature(_) => "signature",
            Self::Reject(_) => "reject",
            Self::Abort(_) => "abort",
            Self::Finalized(_) => "finalized",
            Self::Recorded(_) => "recorded",
        }
    }

    pub(crate) fn unexpected(&self, expected: &'static str) -> SessionError {
        SessionError::Unexpected {
            expected,
            got: self.kind(),
        }
    }
}

/// One end of a point-to-point channel scoped to a single flow.
#[derive(Debug)]
pub struct Session {
    flow_id: Uuid,
    counterparty: Party,
    outbound: mpsc::Sender<Message>,
    inbound: mpsc::Receiver<Message>,
    timeout: Duration,
}

impl Session {
    /// Two connected ends: the first belongs to `initiator`, the second to `responder`.
    pub fn pair(flow_id: Uuid, initiator: Party, responder: Party, timeout: Duration) -> (Self, Self) {
        let (to_responder, from_initiator) = mpsc::channel(CHANNEL_CAPACITY);
        let (to_initiator, from_responder) = mpsc::channel(CHANNEL_CAPACITY);
        let initiator_end = Self {
            flow_id,
            counterparty: responder,
            outbound: to_responder,
            inbound: from_responder,
            timeout,
        };
        let responder_end = Self {
            flow_id,
            counterparty: initiator,
            outbound: to_initiator,
            inbound: from_initiator,
            timeout,
        };
        (initiator_end, responder_end)
    }

    pub fn flow_id(&self) -> Uuid {
        self.flow_id
    }

    pub fn counterparty(&self) -> &Party {
        &self.counterparty
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub async fn send(&self, message: Message) -> Result<(), SessionError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| SessionError::Closed(self.counterparty.name.clone()))
    }

    /// Waits at most the session timeout for the next message.
    pub async fn receive(&mut self) -> Result<Message, SessionError> {
        match tokio::time::timeout(self.timeout, self.inbound.recv()).await {
            Err(_) => Err(SessionError::Timeout),
            Ok(None) => Err(SessionError::Closed(self.counterparty.name.clone())),
            Ok(Some(message)) => Ok(message),
        }
    }
}

/// Opens sessions to other parties. Transport is the implementor's concern.
#[async_trait]
pub trait Messaging: Send + Sync {
    async fn open(
        &self,
        from: &Party,
        to: &Party,
        flow_id: Uuid,
        timeout: Duration,
    ) -> Result<Session, SessionError>;
}

/// In-process routing between nodes over tokio channels.
#[derive(Default)]
pub struct LocalNetwork {
    routes: Mutex<HashMap<PublicKey, mpsc::Sender<Session>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inbox of sessions opened towards `party`. Re-registering replaces the route.
    pub fn register(&self, party: &Party) -> mpsc::Receiver<Session> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(party.key, tx);
        }
        rx
    }

    pub fn unregister(&self, party: &Party) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.remove(&party.key);
        }
    }

    /// Register `node` and serve its incoming sessions.
    pub fn attach(&self, node: &Node) -> JoinHandle<()> {
        node.serve(self.register(node.identity()))
    }
}

#[async_trait]
impl Messaging for LocalNetwork {
    async fn open(
        &self,
        from: &Party,
        to: &Party,
        flow_id: Uuid,
        timeout: Duration,
    ) -> Result<Session, SessionError> {
        let route = self
            .routes
            .lock()
            .ok()
            .and_then(|routes| routes.get(&to.key).cloned())
            .ok_or_else(|| SessionError::UnknownParty(to.name.clone()))?;

        let (ours, theirs) = Session::pair(flow_id, from.clone(), to.clone(), timeout);
        route
            .send(theirs)
            .await
            .map_err(|_| SessionError::UnknownParty(to.name.clone()))?;
        Ok(ours)
    }
}
