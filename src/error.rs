// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the Endorsement Client Core.
//

use snafu::Snafu;
use std::time::Duration;

use crate::types::TransactionId;

/// Every way a submission can end other than a valid commit.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SubmitError {
    #[snafu(display("invalid transaction request: {reason}"))]
    InvalidRequest { reason: String },

    #[snafu(display("identity could not sign {what}: {reason}"))]
    SigningError { what: String, reason: String },

    #[snafu(display("no endorsing peers configured for transaction {tx_id}"))]
    NoEndorsersConfigured { tx_id: TransactionId },

    #[snafu(display(
        "endorsement policy not satisfied for transaction {tx_id}: {accepted} of {required} required endorsements"
    ))]
    PolicyNotSatisfied {
        tx_id: TransactionId,
        required: usize,
        accepted: usize,
    },

    #[snafu(display(
        "cannot assemble transaction {tx_id}: {provided} endorsements, {required} required"
    ))]
    InsufficientEndorsements {
        tx_id: TransactionId,
        required: usize,
        provided: usize,
    },

    #[snafu(display(
        "ordering service unavailable for transaction {tx_id} after {attempts} attempts: {reason}"
    ))]
    OrderingUnavailable {
        tx_id: TransactionId,
        attempts: usize,
        reason: String,
    },

    #[snafu(display("ordering service rejected transaction {tx_id}: {info}"))]
    OrderingRejected { tx_id: TransactionId, info: String },

    #[snafu(display("transaction {tx_id} not observed committed within {waited:?}"))]
    CommitTimedOut {
        tx_id: TransactionId,
        waited: Duration,
    },

    #[snafu(display("transaction {tx_id} committed as invalid"))]
    CommitInvalid { tx_id: TransactionId },

    #[snafu(display("wait for transaction {tx_id} cancelled by shutdown"))]
    Cancelled { tx_id: TransactionId },
}

/// What a caller should do after a failed submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recovery {
    /// Fix the request or give up; retrying as-is cannot succeed.
    Abort,
    /// Build a new request with a fresh transaction id and start over.
    RetryWithNewTransactionId,
    /// Resubmit the already assembled envelope, later.
    RetrySameEnvelope,
    /// The transaction may still commit; query its status again later.
    WaitLonger,
}

impl SubmitError {
    pub fn recovery(&self) -> Recovery {
        match self {
            SubmitError::InvalidRequest { .. }
            | SubmitError::SigningError { .. }
            | SubmitError::NoEndorsersConfigured { .. }
            | SubmitError::InsufficientEndorsements { .. }
            | SubmitError::OrderingRejected { .. } => Recovery::Abort,
            SubmitError::PolicyNotSatisfied { .. } | SubmitError::CommitInvalid { .. } => {
                Recovery::RetryWithNewTransactionId
            }
            SubmitError::OrderingUnavailable { .. } => Recovery::RetrySameEnvelope,
            SubmitError::CommitTimedOut { .. } | SubmitError::Cancelled { .. } => {
                Recovery::WaitLonger
            }
        }
    }

    pub fn tx_id(&self) -> Option<TransactionId> {
        match self {
            SubmitError::InvalidRequest { .. } | SubmitError::SigningError { .. } => None,
            SubmitError::NoEndorsersConfigured { tx_id }
            | SubmitError::PolicyNotSatisfied { tx_id, .. }
            | SubmitError::InsufficientEndorsements { tx_id, .. }
            | SubmitError::OrderingUnavailable { tx_id, .. }
            | SubmitError::OrderingRejected { tx_id, .. }
            | SubmitError::CommitTimedOut { tx_id, .. }
            | SubmitError::CommitInvalid { tx_id }
            | SubmitError::Cancelled { tx_id } => Some(*tx_id),
        }
    }
}

pub type Result<T, E = SubmitError> = std::result::Result<T, E>;
