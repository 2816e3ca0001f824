// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the Endorsement Client Core.
//

// Endorsement client core
// Drives one transaction through the endorse-then-order workflow:
// 1. Builds and signs a proposal from a logical request
// 2. Fans the proposal out to the endorsing peers and collects their responses
// 3. Checks the responses against an endorsement policy
// 4. Assembles the accepted endorsements into an envelope
// 5. Submits the envelope to the ordering service
// 6. Watches the ledger until the transaction commits or the wait runs out

// Every stage is usable on its own; `service` composes them

// data model shared by all stages
pub mod types;

pub mod error;

// signing and network collaborators
pub mod identity;
pub mod transport;

pub mod proposal;

pub mod endorsement;

pub mod policy;

pub mod assembler;

pub mod ordering;

pub mod commit;

// composition of the stages, configuration and shutdown
pub mod service;

// in-memory collaborators and end-to-end scenarios
pub mod testing;

pub use error::{Recovery, SubmitError};
pub use service::{ClientConfig, Options, PendingCommit, Timeouts, TransactionReceipt, TransactionService};

use async_compatibility_layer::channel::UnboundedReceiver;

/// A value that arrives once over a channel and is kept from then on.
pub enum WaitAndKeep<T> {
    Keep(T),
    Wait(UnboundedReceiver<T>),
}

impl<T: Clone> WaitAndKeep<T> {
    /// `None` if the sender went away without delivering.
    pub async fn get(&mut self) -> Option<T> {
        match self {
            WaitAndKeep::Keep(t) => Some(t.clone()),
            WaitAndKeep::Wait(receiver) => {
                let got = receiver.recv().await.ok()?;
                *self = WaitAndKeep::Keep(got.clone());
                Some(got)
            }
        }
    }
}
