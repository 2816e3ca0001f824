// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the Endorsement Client Core.
//

//! Fan-out of a proposal to its endorsing peers.

use async_compatibility_layer::art::async_timeout;
use futures::stream::{FuturesUnordered, StreamExt};
use snafu::ensure;
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    error::{NoEndorsersConfiguredSnafu, Result},
    transport::PeerTransport,
    types::{EndorsementResponse, EndorsementSet, NoResponse, PeerOutcome, PeerRef, Proposal},
};

#[derive(Clone)]
pub struct EndorsementCoordinator {
    transport: Arc<dyn PeerTransport>,
}

impl EndorsementCoordinator {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self { transport }
    }

    /// Sends `proposal` to every target at once and gathers replies until all
    /// have answered or `timeout` elapses. Calls still in flight at the
    /// deadline are dropped and their peers recorded as timed out.
    pub async fn collect(
        &self,
        proposal: &Proposal,
        targets: &[PeerRef],
        timeout: Duration,
    ) -> Result<EndorsementSet> {
        let tx_id = proposal.tx_id();
        ensure!(!targets.is_empty(), NoEndorsersConfiguredSnafu { tx_id });

        let mut seen = HashSet::new();
        let mut unique: Vec<&PeerRef> = Vec::with_capacity(targets.len());
        for peer in targets {
            if seen.insert(&peer.id) {
                unique.push(peer);
            } else {
                warn!(%tx_id, peer = %peer.id, "duplicate target ignored");
            }
        }

        let deadline = Instant::now() + timeout;
        let transport = self.transport.as_ref();
        let mut in_flight: FuturesUnordered<_> = unique
            .iter()
            .map(|&peer| async move {
                debug!(%tx_id, peer = %peer.id, endpoint = %peer.endpoint, "sending proposal");
                let result = transport.send_proposal(peer, proposal, timeout).await;
                (peer, result)
            })
            .collect();

        let mut outcomes = BTreeMap::new();
        while !in_flight.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let next = async_timeout(remaining, in_flight.next()).await;
            match next {
                Ok(Some((peer, result))) => {
                    let outcome = classify(proposal, peer, result);
                    outcomes.insert(peer.id.clone(), outcome);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        %tx_id,
                        outstanding = in_flight.len(),
                        ?timeout,
                        "endorsement collection timed out"
                    );
                    break;
                }
            }
        }
        drop(in_flight);

        for peer in &unique {
            outcomes
                .entry(peer.id.clone())
                .or_insert(PeerOutcome::NoResponse(NoResponse::TimedOut));
        }
        let set = EndorsementSet::new(tx_id, outcomes);
        info!(
            %tx_id,
            targets = set.len(),
            responded = set.responses().count(),
            complete = set.is_complete(),
            "collected endorsements"
        );
        Ok(set)
    }
}

fn classify(
    proposal: &Proposal,
    peer: &PeerRef,
    result: anyhow::Result<EndorsementResponse>,
) -> PeerOutcome {
    let tx_id = proposal.tx_id();
    match result {
        Ok(response) if response.tx_id != tx_id => {
            warn!(%tx_id, peer = %peer.id, other = %response.tx_id, "reply for another transaction");
            PeerOutcome::NoResponse(NoResponse::Mismatched {
                reason: format!("reply names transaction {}", response.tx_id),
            })
        }
        Ok(response) if response.peer_id != peer.id => {
            warn!(%tx_id, peer = %peer.id, other = %response.peer_id, "reply from another peer");
            PeerOutcome::NoResponse(NoResponse::Mismatched {
                reason: format!("reply names peer {}", response.peer_id),
            })
        }
        Ok(response) => {
            debug!(%tx_id, peer = %peer.id, status = response.status, "endorsement received");
            PeerOutcome::Endorsed(response)
        }
        Err(err) => {
            warn!(%tx_id, peer = %peer.id, "peer unreachable: {err:#}");
            PeerOutcome::NoResponse(NoResponse::Unreachable {
                reason: format!("{err:#}"),
            })
        }
    }
}
