// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the Endorsement Client Core.
//

use snafu::ensure;
use std::{collections::HashSet, sync::Arc};
use tracing::debug;

use crate::{
    error::{InvalidRequestSnafu, Result, SigningSnafu},
    identity::{Signature, SigningIdentity},
    types::{
        ChaincodeInvocation, Proposal, ProposalHeader, ProposalKind, Timestamp, TransactionId,
        TransactionRequest,
    },
};

/// Turns a [`TransactionRequest`] into a signed [`Proposal`]. Local only.
#[derive(Clone)]
pub struct ProposalBuilder {
    identity: Arc<dyn SigningIdentity>,
}

impl ProposalBuilder {
    pub fn new(identity: Arc<dyn SigningIdentity>) -> Self {
        Self { identity }
    }

    pub fn build(&self, request: &TransactionRequest) -> Result<Proposal> {
        validate(request, self.identity.as_ref())?;

        let header = ProposalHeader {
            channel_id: request.channel_id().to_string(),
            tx_id: request.tx_id(),
            nonce: *request.nonce(),
            creator: self.identity.certificate(),
            timestamp: Timestamp::now(),
        };
        let payload = ChaincodeInvocation {
            chaincode_id: request.chaincode_id().to_string(),
            kind: request.kind().clone(),
            function: request.function().to_string(),
            args: request.args().to_vec(),
        };
        let mut proposal = Proposal {
            header,
            payload,
            signature: Signature::default(),
        };
        proposal.signature = self
            .identity
            .sign(&proposal.digest())
            .map_err(|err| {
                SigningSnafu {
                    what: "proposal",
                    reason: format!("{err:#}"),
                }
                .build()
            })?;
        ensure!(
            !proposal.signature.is_empty(),
            SigningSnafu {
                what: "proposal",
                reason: "identity produced an empty signature",
            }
        );

        debug!(
            tx_id = %proposal.tx_id(),
            channel = %proposal.header.channel_id,
            chaincode = %proposal.payload.chaincode_id,
            kind = proposal.payload.kind.tag(),
            "built proposal"
        );
        Ok(proposal)
    }
}

fn validate(request: &TransactionRequest, identity: &dyn SigningIdentity) -> Result<()> {
    ensure!(
        !request.channel_id().trim().is_empty(),
        InvalidRequestSnafu {
            reason: "channel id is empty",
        }
    );
    ensure!(
        !request.chaincode_id().trim().is_empty(),
        InvalidRequestSnafu {
            reason: "chaincode id is empty",
        }
    );
    match request.kind() {
        ProposalKind::Deployment { chaincode_path } => {
            ensure!(
                !chaincode_path.trim().is_empty(),
                InvalidRequestSnafu {
                    reason: "deployment needs a chaincode path",
                }
            );
        }
        ProposalKind::Invocation | ProposalKind::Query => {
            ensure!(
                !request.function().trim().is_empty(),
                InvalidRequestSnafu {
                    reason: "function name is empty",
                }
            );
            ensure!(
                !request.args().is_empty(),
                InvalidRequestSnafu {
                    reason: format!("{} requires at least one argument", request.kind().tag()),
                }
            );
        }
    }

    // the id must come from this request's nonce and this submitter
    let expected = TransactionId::derive(request.nonce(), &identity.certificate());
    ensure!(
        request.tx_id() == expected,
        InvalidRequestSnafu {
            reason: format!(
                "transaction id {} was not minted from the request nonce by this identity",
                request.tx_id()
            ),
        }
    );

    let mut seen = HashSet::new();
    for peer in request.targets() {
        ensure!(
            seen.insert(&peer.id),
            InvalidRequestSnafu {
                reason: format!("peer {} targeted twice", peer.id),
            }
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::SubmitError,
        testing::{FailingIdentity, MockIdentity},
        types::PeerRef,
    };

    fn builder() -> (Arc<MockIdentity>, ProposalBuilder) {
        let identity = Arc::new(MockIdentity::new("admin"));
        (identity.clone(), ProposalBuilder::new(identity))
    }

    #[test]
    fn builds_signed_invocation() {
        let (identity, builder) = builder();
        let request = TransactionRequest::invocation("myc1", "mycc")
            .function("invoke")
            .args(["move", "a", "b", "100"])
            .build(identity.as_ref());
        let proposal = builder.build(&request).unwrap();

        assert_eq!(proposal.tx_id(), request.tx_id());
        assert_eq!(proposal.header.creator, identity.certificate());
        assert_eq!(proposal.payload.args.len(), 4);
        assert!(identity.verify_own(&proposal.digest(), &proposal.signature));
    }

    #[test]
    fn rejects_missing_fields() {
        let (identity, builder) = builder();
        let cases = [
            TransactionRequest::invocation("", "mycc")
                .function("invoke")
                .args(["a"])
                .build(identity.as_ref()),
            TransactionRequest::invocation("myc1", " ")
                .function("invoke")
                .args(["a"])
                .build(identity.as_ref()),
            TransactionRequest::invocation("myc1", "mycc")
                .function("invoke")
                .build(identity.as_ref()),
            TransactionRequest::deployment("myc1", "mycc", "")
                .function("init")
                .build(identity.as_ref()),
        ];
        for request in cases {
            assert!(matches!(
                builder.build(&request),
                Err(SubmitError::InvalidRequest { .. })
            ));
        }
    }

    #[test]
    fn deployment_allows_empty_args() {
        let (identity, builder) = builder();
        let request = TransactionRequest::deployment("myc1", "mycc", "github.com/example_cc")
            .function("init")
            .build(identity.as_ref());
        let proposal = builder.build(&request).unwrap();
        assert_eq!(
            proposal.payload.kind,
            ProposalKind::Deployment {
                chaincode_path: "github.com/example_cc".to_string()
            }
        );
    }

    #[test]
    fn rejects_id_minted_by_another_identity() {
        let (_, builder) = builder();
        let other = MockIdentity::new("intruder");
        let request = TransactionRequest::invocation("myc1", "mycc")
            .function("invoke")
            .args(["a"])
            .build(&other);
        assert!(matches!(
            builder.build(&request),
            Err(SubmitError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_targets() {
        let (identity, builder) = builder();
        let request = TransactionRequest::invocation("myc1", "mycc")
            .function("invoke")
            .args(["a"])
            .targets([
                PeerRef::new("peer0", "grpc://localhost:7051"),
                PeerRef::new("peer0", "grpc://localhost:8051"),
            ])
            .build(identity.as_ref());
        assert!(matches!(
            builder.build(&request),
            Err(SubmitError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn surfaces_signing_failure() {
        let identity = Arc::new(FailingIdentity::new("admin"));
        let builder = ProposalBuilder::new(identity.clone());
        let request = TransactionRequest::invocation("myc1", "mycc")
            .function("invoke")
            .args(["a"])
            .build(identity.as_ref());
        assert!(matches!(
            builder.build(&request),
            Err(SubmitError::SigningError { .. })
        ));
    }

    #[test]
    fn renewed_request_gets_fresh_id() {
        let (identity, builder) = builder();
        let request = TransactionRequest::invocation("myc1", "mycc")
            .function("invoke")
            .args(["a"])
            .build(identity.as_ref());
        let renewed = request.renew(identity.as_ref());
        assert_ne!(renewed.tx_id(), request.tx_id());
        assert_eq!(renewed.args(), request.args());
        assert!(builder.build(&renewed).is_ok());
    }
}
