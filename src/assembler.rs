// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the Endorsement Client Core.
//

use snafu::ensure;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, warn};

use crate::{
    error::{InsufficientEndorsementsSnafu, Result, SigningSnafu},
    identity::{Signature, SigningIdentity},
    types::{EndorsementResponse, Envelope, Proposal},
};

/// Packs a proposal and its accepted endorsements into a signed envelope.
#[derive(Clone)]
pub struct TransactionAssembler {
    identity: Arc<dyn SigningIdentity>,
}

impl TransactionAssembler {
    pub fn new(identity: Arc<dyn SigningIdentity>) -> Self {
        Self { identity }
    }

    /// Only successful endorsements of this proposal's transaction count, one
    /// per peer. The same inputs always yield the same envelope.
    pub fn assemble(
        &self,
        proposal: &Proposal,
        accepted: &[EndorsementResponse],
        min_endorsements: usize,
    ) -> Result<Envelope> {
        let tx_id = proposal.tx_id();
        let mut by_peer = BTreeMap::new();
        for endorsement in accepted {
            if endorsement.tx_id != tx_id || !endorsement.is_success() {
                warn!(%tx_id, peer = %endorsement.peer_id, "dropping endorsement not valid for this transaction");
                continue;
            }
            by_peer
                .entry(endorsement.peer_id.clone())
                .or_insert_with(|| endorsement.clone());
        }

        let required = min_endorsements.max(1);
        ensure!(
            by_peer.len() >= required,
            InsufficientEndorsementsSnafu {
                tx_id,
                required,
                provided: by_peer.len(),
            }
        );

        let mut envelope = Envelope {
            proposal: proposal.clone(),
            endorsements: by_peer.into_values().collect(),
            signature: Signature::default(),
        };
        envelope.signature = self.identity.sign(&envelope.digest()).map_err(|err| {
            SigningSnafu {
                what: "envelope",
                reason: format!("{err:#}"),
            }
            .build()
        })?;

        debug!(
            %tx_id,
            endorsements = envelope.endorsements.len(),
            "assembled envelope"
        );
        Ok(envelope)
    }
}
