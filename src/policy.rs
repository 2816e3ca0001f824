// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the Endorsement Client Core.
//

//! Endorsement policy evaluation.
//!
//! A response counts toward a policy only when it
//! 1. carries the canonical success status,
//! 2. is signed by its endorser (if a verifier is configured), and
//! 3. returns the reference payload: the payload shared by the largest group
//!    of successful responses, ties going to the group with the lowest peer id.
//!
//! A response failing any check disqualifies that peer alone.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, warn};

use crate::{
    identity::EndorsementVerifier,
    types::{EndorsementResponse, EndorsementSet, NoResponse, PeerId, PeerOutcome, TransactionId},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndorsementPolicy {
    /// Matching endorsements needed; zero is treated as one.
    pub min_endorsements: usize,
    /// Every target must endorse the reference payload.
    pub unanimous: bool,
}

impl EndorsementPolicy {
    pub fn threshold(min_endorsements: usize) -> Self {
        Self {
            min_endorsements,
            unanimous: false,
        }
    }

    pub fn unanimous() -> Self {
        Self {
            min_endorsements: 1,
            unanimous: true,
        }
    }

    /// Number of accepted endorsements needed out of `targets` peers.
    pub fn required(&self, targets: usize) -> usize {
        let min = self.min_endorsements.max(1);
        if self.unanimous {
            min.max(targets)
        } else {
            min
        }
    }
}

impl Default for EndorsementPolicy {
    fn default() -> Self {
        Self::threshold(1)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disqualification {
    NoResponse(NoResponse),
    NotSuccessful { status: u32, message: String },
    BadSignature,
    PayloadMismatch,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub tx_id: TransactionId,
    pub satisfied: bool,
    pub required: usize,
    /// Sorted by peer id.
    pub accepted: Vec<EndorsementResponse>,
    pub reference_payload: Option<Vec<u8>>,
    pub disqualified: BTreeMap<PeerId, Disqualification>,
}

#[derive(Clone, Default)]
pub struct PolicyEvaluator {
    verifier: Option<Arc<dyn EndorsementVerifier>>,
}

impl PolicyEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_verifier(verifier: Arc<dyn EndorsementVerifier>) -> Self {
        Self {
            verifier: Some(verifier),
        }
    }

    pub fn evaluate(&self, set: &EndorsementSet, policy: &EndorsementPolicy) -> PolicyDecision {
        let tx_id = set.tx_id();
        let required = policy.required(set.len());
        let mut disqualified = BTreeMap::new();
        let mut successful = Vec::new();

        for (peer, outcome) in set.outcomes() {
            match outcome {
                PeerOutcome::NoResponse(reason) => {
                    disqualified.insert(peer.clone(), Disqualification::NoResponse(reason.clone()));
                }
                PeerOutcome::Endorsed(response) if !response.is_success() => {
                    disqualified.insert(
                        peer.clone(),
                        Disqualification::NotSuccessful {
                            status: response.status,
                            message: response.message.clone(),
                        },
                    );
                }
                PeerOutcome::Endorsed(response) if !self.is_valid_endorsement(response) => {
                    warn!(%tx_id, %peer, "endorsement signature does not verify");
                    disqualified.insert(peer.clone(), Disqualification::BadSignature);
                }
                PeerOutcome::Endorsed(response) => successful.push(response),
            }
        }

        let reference_payload = reference_payload(&successful);
        let mut accepted = Vec::new();
        for response in successful {
            if Some(&response.payload) == reference_payload.as_ref() {
                accepted.push(response.clone());
            } else {
                debug!(%tx_id, peer = %response.peer_id, "payload differs from reference");
                disqualified.insert(response.peer_id.clone(), Disqualification::PayloadMismatch);
            }
        }

        let satisfied = accepted.len() >= required && !(policy.unanimous && !disqualified.is_empty());
        debug!(
            %tx_id,
            accepted = accepted.len(),
            required,
            satisfied,
            "evaluated endorsement policy"
        );
        PolicyDecision {
            tx_id,
            satisfied,
            required,
            accepted,
            reference_payload,
            disqualified,
        }
    }

    /// Signature check only; status and payload are judged by [`Self::evaluate`].
    pub fn is_valid_endorsement(&self, response: &EndorsementResponse) -> bool {
        match &self.verifier {
            Some(verifier) => verifier.verify(
                &response.endorser,
                &response.signed_message(),
                &response.signature,
            ),
            None => !response.signature.is_empty(),
        }
    }
}

/// `responses` arrive in peer id order, so the first group to reach the
/// largest size also holds the lowest peer id among tied groups.
fn reference_payload(responses: &[&EndorsementResponse]) -> Option<Vec<u8>> {
    let mut groups: Vec<(&[u8], usize)> = Vec::new();
    for response in responses {
        match groups
            .iter_mut()
            .find(|(payload, _)| *payload == response.payload.as_slice())
        {
            Some((_, count)) => *count += 1,
            None => groups.push((response.payload.as_slice(), 1)),
        }
    }
    let mut best: Option<(&[u8], usize)> = None;
    for (payload, count) in groups {
        if best.map_or(true, |(_, best_count)| count > best_count) {
            best = Some((payload, count));
        }
    }
    best.map(|(payload, _)| payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        identity::{Certificate, Signature},
        testing::MockVerifier,
        types::{TX_ID_LEN, SUCCESS_STATUS},
    };

    const TX: TransactionId = TransactionId::from_bytes([9; TX_ID_LEN]);

    fn endorsed(peer: &str, status: u32, payload: &str) -> (PeerId, PeerOutcome) {
        let endorser = Certificate(format!("cert:{peer}").into_bytes());
        let message = EndorsementResponse::signed_bytes(&TX, status, payload.as_bytes());
        (
            PeerId::from(peer),
            PeerOutcome::Endorsed(EndorsementResponse {
                peer_id: PeerId::from(peer),
                tx_id: TX,
                status,
                message: String::new(),
                payload: payload.as_bytes().to_vec(),
                signature: MockVerifier::sign_as(&endorser, &message),
                endorser,
            }),
        )
    }

    fn silent(peer: &str) -> (PeerId, PeerOutcome) {
        (
            PeerId::from(peer),
            PeerOutcome::NoResponse(NoResponse::TimedOut),
        )
    }

    fn set(outcomes: Vec<(PeerId, PeerOutcome)>) -> EndorsementSet {
        EndorsementSet::new(TX, outcomes.into_iter().collect())
    }

    #[test]
    fn majority_payload_wins() {
        let set = set(vec![
            endorsed("peer0", SUCCESS_STATUS, "99"),
            endorsed("peer1", SUCCESS_STATUS, "100"),
            endorsed("peer2", SUCCESS_STATUS, "100"),
        ]);
        let decision = PolicyEvaluator::new().evaluate(&set, &EndorsementPolicy::threshold(2));
        assert!(decision.satisfied);
        assert_eq!(decision.reference_payload.as_deref(), Some(&b"100"[..]));
        assert_eq!(decision.accepted.len(), 2);
        assert_eq!(
            decision.disqualified.get(&PeerId::from("peer0")),
            Some(&Disqualification::PayloadMismatch)
        );
    }

    #[test]
    fn tie_goes_to_lowest_peer() {
        let set = set(vec![
            endorsed("peer1", SUCCESS_STATUS, "b"),
            endorsed("peer0", SUCCESS_STATUS, "a"),
        ]);
        let decision = PolicyEvaluator::new().evaluate(&set, &EndorsementPolicy::threshold(1));
        assert!(decision.satisfied);
        assert_eq!(decision.reference_payload.as_deref(), Some(&b"a"[..]));
        assert_eq!(decision.accepted[0].peer_id, PeerId::from("peer0"));
    }

    #[test]
    fn failed_status_does_not_count() {
        let set = set(vec![
            endorsed("peer0", SUCCESS_STATUS, "100"),
            endorsed("peer1", 500, "100"),
            silent("peer2"),
        ]);
        let decision = PolicyEvaluator::new().evaluate(&set, &EndorsementPolicy::threshold(2));
        assert!(!decision.satisfied);
        assert_eq!(decision.accepted.len(), 1);
        assert!(matches!(
            decision.disqualified.get(&PeerId::from("peer1")),
            Some(Disqualification::NotSuccessful { status: 500, .. })
        ));
    }

    #[test]
    fn unanimous_requires_every_target() {
        let partial = set(vec![
            endorsed("peer0", SUCCESS_STATUS, "100"),
            endorsed("peer1", SUCCESS_STATUS, "100"),
            silent("peer2"),
        ]);
        let evaluator = PolicyEvaluator::new();
        assert!(!evaluator.evaluate(&partial, &EndorsementPolicy::unanimous()).satisfied);

        let full = set(vec![
            endorsed("peer0", SUCCESS_STATUS, "100"),
            endorsed("peer1", SUCCESS_STATUS, "100"),
        ]);
        let decision = evaluator.evaluate(&full, &EndorsementPolicy::unanimous());
        assert!(decision.satisfied);
        assert_eq!(decision.required, 2);
    }

    #[test]
    fn forged_signature_is_disqualified() {
        let (peer, mut outcome) = endorsed("peer0", SUCCESS_STATUS, "100");
        if let PeerOutcome::Endorsed(response) = &mut outcome {
            response.signature = Signature(vec![0; 32]);
        }
        let set = set(vec![(peer.clone(), outcome), endorsed("peer1", SUCCESS_STATUS, "100")]);
        let evaluator = PolicyEvaluator::with_verifier(Arc::new(MockVerifier));
        let decision = evaluator.evaluate(&set, &EndorsementPolicy::threshold(2));
        assert!(!decision.satisfied);
        assert_eq!(
            decision.disqualified.get(&peer),
            Some(&Disqualification::BadSignature)
        );
    }

    #[test]
    fn zero_minimum_still_needs_one() {
        let set = set(vec![silent("peer0")]);
        let decision = PolicyEvaluator::new().evaluate(&set, &EndorsementPolicy::threshold(0));
        assert_eq!(decision.required, 1);
        assert!(!decision.satisfied);
        assert!(decision.reference_payload.is_none());
    }
}
