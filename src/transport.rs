// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the Endorsement Client Core.
//

//! Network collaborators consumed by the core.
//!
//! Implementations own connection pooling and must be safe to share between
//! concurrently running submissions.

use async_broadcast::Receiver;
use async_trait::async_trait;
use std::time::Duration;

use crate::types::{
    CommitEvent, CommitStatus, EndorsementResponse, Envelope, OrdererRef, OrderingAck, PeerRef,
    Proposal, TransactionId,
};

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Point-to-point proposal RPC. An `Err` means the peer gave no usable
    /// response; retrying at the transport level is the transport's business.
    async fn send_proposal(
        &self,
        peer: &PeerRef,
        proposal: &Proposal,
        timeout: Duration,
    ) -> anyhow::Result<EndorsementResponse>;
}

#[async_trait]
pub trait OrderingTransport: Send + Sync {
    /// Resubmitting an envelope the orderer already accepted must be harmless.
    async fn submit(&self, orderer: &OrdererRef, envelope: &Envelope)
        -> anyhow::Result<OrderingAck>;
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// `Ok(None)` when the ledger has no record of `tx_id` yet.
    async fn query_transaction_status(
        &self,
        channel_id: &str,
        tx_id: &TransactionId,
    ) -> anyhow::Result<Option<CommitStatus>>;

    /// Commit event stream for `channel_id`, if the ledger pushes events.
    fn subscribe(&self, _channel_id: &str) -> Option<Receiver<CommitEvent>> {
        None
    }
}
