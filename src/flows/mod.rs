// src/flows/mod.rs
pub mod initiator;
pub mod responder;

pub use initiator::{ExchangePlan, Initiator};
pub use responder::{AcceptAll, AcceptancePolicy, Responder, ResponderOutcome};
