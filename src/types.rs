// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the Endorsement Client Core.
//

//! Data model shared by every stage of a submission.
//!
//! Every value that describes one transaction carries that transaction's
//! [`TransactionId`]; stages never mutate each other's outputs.

use committable::{Commitment, Committable, RawCommitmentBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::identity::{Certificate, Signature, SigningIdentity};

/// Status code a peer returns for a successful endorsement.
pub const SUCCESS_STATUS: u32 = 200;

/// Length of the random nonce bound into every transaction id.
pub const NONCE_LEN: usize = 24;

/// Length of a transaction id in bytes.
pub const TX_ID_LEN: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub const fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", hex::encode(self.0))
    }
}

/// Identifier of a transaction, `sha256(nonce || creator certificate)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId([u8; TX_ID_LEN]);

impl TransactionId {
    pub fn derive(nonce: &Nonce, creator: &Certificate) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(nonce.as_bytes());
        hasher.update(creator.as_bytes());
        Self(hasher.finalize().into())
    }

    pub const fn from_bytes(bytes: [u8; TX_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TX_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({self})")
    }
}

impl FromStr for TransactionId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; TX_ID_LEN];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// An endorsing peer: a stable id plus the endpoint the transport dials.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRef {
    pub id: PeerId,
    pub endpoint: String,
}

impl PeerRef {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: PeerId::new(id),
            endpoint: endpoint.into(),
        }
    }
}

/// Parses `id=endpoint`, or a bare endpoint which then doubles as the id.
impl FromStr for PeerRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once('=') {
            Some((id, endpoint)) if !id.is_empty() && !endpoint.is_empty() => {
                Ok(Self::new(id, endpoint))
            }
            Some(_) => Err(format!("malformed peer `{s}`, expected id=endpoint")),
            None if !s.is_empty() => Ok(Self::new(s, s)),
            None => Err("empty peer".to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrdererRef {
    pub endpoint: String,
}

impl OrdererRef {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl FromStr for OrdererRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty orderer endpoint".to_string());
        }
        Ok(Self::new(s))
    }
}

/// What the proposal asks the chaincode to do.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProposalKind {
    /// Instantiate the chaincode found at `chaincode_path`.
    Deployment { chaincode_path: String },
    Invocation,
    /// Read-only evaluation; endorsed but never ordered.
    Query,
}

impl ProposalKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ProposalKind::Deployment { .. } => "deployment",
            ProposalKind::Invocation => "invocation",
            ProposalKind::Query => "query",
        }
    }
}

/// A logical request, fixed before a proposal is built from it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    kind: ProposalKind,
    channel_id: String,
    chaincode_id: String,
    function: String,
    args: Vec<String>,
    tx_id: TransactionId,
    nonce: Nonce,
    targets: Vec<PeerRef>,
}

impl TransactionRequest {
    pub fn invocation(
        channel_id: impl Into<String>,
        chaincode_id: impl Into<String>,
    ) -> TransactionRequestBuilder {
        TransactionRequestBuilder::new(ProposalKind::Invocation, channel_id, chaincode_id)
    }

    pub fn deployment(
        channel_id: impl Into<String>,
        chaincode_id: impl Into<String>,
        chaincode_path: impl Into<String>,
    ) -> TransactionRequestBuilder {
        TransactionRequestBuilder::new(
            ProposalKind::Deployment {
                chaincode_path: chaincode_path.into(),
            },
            channel_id,
            chaincode_id,
        )
    }

    pub fn query(
        channel_id: impl Into<String>,
        chaincode_id: impl Into<String>,
    ) -> TransactionRequestBuilder {
        TransactionRequestBuilder::new(ProposalKind::Query, channel_id, chaincode_id)
    }

    /// Same request under a freshly minted nonce and transaction id, for a
    /// retry after a failure that requires a new id.
    pub fn renew(&self, identity: &dyn SigningIdentity) -> Self {
        let nonce = Nonce::generate();
        Self {
            tx_id: TransactionId::derive(&nonce, &identity.certificate()),
            nonce,
            ..self.clone()
        }
    }

    pub fn kind(&self) -> &ProposalKind {
        &self.kind
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn chaincode_id(&self) -> &str {
        &self.chaincode_id
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn tx_id(&self) -> TransactionId {
        self.tx_id
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    /// Peers named by the caller; empty means the configured endorsers.
    pub fn targets(&self) -> &[PeerRef] {
        &self.targets
    }
}

pub struct TransactionRequestBuilder {
    kind: ProposalKind,
    channel_id: String,
    chaincode_id: String,
    function: String,
    args: Vec<String>,
    targets: Vec<PeerRef>,
    nonce: Option<Nonce>,
}

impl TransactionRequestBuilder {
    fn new(
        kind: ProposalKind,
        channel_id: impl Into<String>,
        chaincode_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            channel_id: channel_id.into(),
            chaincode_id: chaincode_id.into(),
            function: String::new(),
            args: Vec::new(),
            targets: Vec::new(),
            nonce: None,
        }
    }

    pub fn function(mut self, function: impl Into<String>) -> Self {
        self.function = function.into();
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn targets(mut self, targets: impl IntoIterator<Item = PeerRef>) -> Self {
        self.targets = targets.into_iter().collect();
        self
    }

    /// Pins the nonce instead of drawing a random one.
    pub fn nonce(mut self, nonce: Nonce) -> Self {
        self.nonce = Some(nonce);
        self
    }

    /// Mints the transaction id for `identity` and freezes the request.
    pub fn build(self, identity: &dyn SigningIdentity) -> TransactionRequest {
        let nonce = self.nonce.unwrap_or_else(Nonce::generate);
        TransactionRequest {
            tx_id: TransactionId::derive(&nonce, &identity.certificate()),
            nonce,
            kind: self.kind,
            channel_id: self.channel_id,
            chaincode_id: self.chaincode_id,
            function: self.function,
            args: self.args,
            targets: self.targets,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: u64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: elapsed.as_secs(),
            nanos: elapsed.subsec_nanos(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalHeader {
    pub channel_id: String,
    pub tx_id: TransactionId,
    pub nonce: Nonce,
    pub creator: Certificate,
    pub timestamp: Timestamp,
}

/// What a proposal asks the chaincode to run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaincodeInvocation {
    pub chaincode_id: String,
    pub kind: ProposalKind,
    pub function: String,
    pub args: Vec<String>,
}

/// A signed, not yet endorsed, description of a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub header: ProposalHeader,
    pub payload: ChaincodeInvocation,
    pub signature: Signature,
}

impl Proposal {
    pub fn tx_id(&self) -> TransactionId {
        self.header.tx_id
    }

    /// Bytes covered by the submitter's signature.
    pub fn digest(&self) -> [u8; 32] {
        self.commit().into()
    }

    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

/// Covers header and payload; the signature is excluded.
impl Committable for Proposal {
    fn commit(&self) -> Commitment<Self> {
        let header = &self.header;
        let payload = &self.payload;
        let chaincode_path = match &payload.kind {
            ProposalKind::Deployment { chaincode_path } => chaincode_path.as_str(),
            _ => "",
        };
        let mut builder = RawCommitmentBuilder::new(&Self::tag())
            .var_size_field("channel_id", header.channel_id.as_bytes())
            .fixed_size_field("tx_id", header.tx_id.as_bytes())
            .fixed_size_field("nonce", header.nonce.as_bytes())
            .var_size_field("creator", header.creator.as_bytes())
            .u64_field("timestamp_seconds", header.timestamp.seconds)
            .u64_field("timestamp_nanos", u64::from(header.timestamp.nanos))
            .var_size_field("chaincode_id", payload.chaincode_id.as_bytes())
            .var_size_field("kind", payload.kind.tag().as_bytes())
            .var_size_field("chaincode_path", chaincode_path.as_bytes())
            .var_size_field("function", payload.function.as_bytes())
            .u64_field("num_args", payload.args.len() as u64);
        for arg in &payload.args {
            builder = builder.var_size_field("arg", arg.as_bytes());
        }
        builder.finalize()
    }

    fn tag() -> String {
        "PROPOSAL".to_string()
    }
}

/// A peer's signed attestation of the result of executing a proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndorsementResponse {
    pub peer_id: PeerId,
    pub tx_id: TransactionId,
    pub status: u32,
    pub message: String,
    pub payload: Vec<u8>,
    pub signature: Signature,
    pub endorser: Certificate,
}

impl EndorsementResponse {
    pub fn is_success(&self) -> bool {
        self.status == SUCCESS_STATUS
    }

    /// Bytes an endorser signs: `tx_id || status (big endian) || payload`.
    pub fn signed_bytes(tx_id: &TransactionId, status: u32, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(TX_ID_LEN + 4 + payload.len());
        bytes.extend_from_slice(tx_id.as_bytes());
        bytes.extend_from_slice(&status.to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    pub fn signed_message(&self) -> Vec<u8> {
        Self::signed_bytes(&self.tx_id, self.status, &self.payload)
    }
}

impl Committable for EndorsementResponse {
    fn commit(&self) -> Commitment<Self> {
        RawCommitmentBuilder::new(&Self::tag())
            .var_size_field("peer_id", self.peer_id.as_str().as_bytes())
            .fixed_size_field("tx_id", self.tx_id.as_bytes())
            .u64_field("status", u64::from(self.status))
            .var_size_field("payload", &self.payload)
            .var_size_field("signature", self.signature.as_bytes())
            .var_size_field("endorser", self.endorser.as_bytes())
            .finalize()
    }

    fn tag() -> String {
        "ENDORSEMENT".to_string()
    }
}

/// Why a target contributed no endorsement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoResponse {
    /// Nothing arrived before the collection deadline.
    TimedOut,
    Unreachable { reason: String },
    /// The reply named another transaction or another peer.
    Mismatched { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerOutcome {
    Endorsed(EndorsementResponse),
    NoResponse(NoResponse),
}

impl PeerOutcome {
    pub fn response(&self) -> Option<&EndorsementResponse> {
        match self {
            PeerOutcome::Endorsed(response) => Some(response),
            PeerOutcome::NoResponse(_) => None,
        }
    }
}

/// Outcomes of one proposal's fan-out, keyed by peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndorsementSet {
    tx_id: TransactionId,
    outcomes: BTreeMap<PeerId, PeerOutcome>,
    complete: bool,
}

impl EndorsementSet {
    /// Freezes collected outcomes; complete when every target replied.
    pub fn new(tx_id: TransactionId, outcomes: BTreeMap<PeerId, PeerOutcome>) -> Self {
        let complete = outcomes
            .values()
            .all(|outcome| matches!(outcome, PeerOutcome::Endorsed(_)));
        Self {
            tx_id,
            outcomes,
            complete,
        }
    }

    pub fn tx_id(&self) -> TransactionId {
        self.tx_id
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerOutcome> {
        self.outcomes.get(peer)
    }

    pub fn outcomes(&self) -> impl Iterator<Item = (&PeerId, &PeerOutcome)> {
        self.outcomes.iter()
    }

    pub fn responses(&self) -> impl Iterator<Item = &EndorsementResponse> {
        self.outcomes.values().filter_map(PeerOutcome::response)
    }

    pub fn missing(&self) -> impl Iterator<Item = (&PeerId, &NoResponse)> {
        self.outcomes.iter().filter_map(|(peer, outcome)| match outcome {
            PeerOutcome::NoResponse(reason) => Some((peer, reason)),
            PeerOutcome::Endorsed(_) => None,
        })
    }
}

/// The policy-satisfying package handed to the ordering service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub proposal: Proposal,
    /// Sorted by peer id.
    pub endorsements: Vec<EndorsementResponse>,
    pub signature: Signature,
}

impl Envelope {
    pub fn tx_id(&self) -> TransactionId {
        self.proposal.tx_id()
    }

    pub fn channel_id(&self) -> &str {
        &self.proposal.header.channel_id
    }

    /// Key the ordering side deduplicates resubmissions by.
    pub fn resubmission_key(&self) -> TransactionId {
        self.tx_id()
    }

    pub fn digest(&self) -> [u8; 32] {
        self.commit().into()
    }

    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

/// Covers the proposal and the endorsements; the assembler signature is excluded.
impl Committable for Envelope {
    fn commit(&self) -> Commitment<Self> {
        let mut builder = RawCommitmentBuilder::new(&Self::tag())
            .field("proposal", self.proposal.commit())
            .var_size_field("proposal_signature", self.proposal.signature.as_bytes())
            .u64_field("num_endorsements", self.endorsements.len() as u64);
        for endorsement in &self.endorsements {
            builder = builder.field("endorsement", endorsement.commit());
        }
        builder.finalize()
    }

    fn tag() -> String {
        "ENVELOPE".to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderingStatus {
    Success,
    Rejected,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingAck {
    pub status: OrderingStatus,
    /// Opaque position hint from the ordering service.
    pub sequence_hint: Option<String>,
    pub info: String,
}

impl OrderingAck {
    pub fn success(sequence_hint: Option<String>) -> Self {
        Self {
            status: OrderingStatus::Success,
            sequence_hint,
            info: String::new(),
        }
    }

    pub fn rejected(info: impl Into<String>) -> Self {
        Self {
            status: OrderingStatus::Rejected,
            sequence_hint: None,
            info: info.into(),
        }
    }

    pub fn error(info: impl Into<String>) -> Self {
        Self {
            status: OrderingStatus::Error,
            sequence_hint: None,
            info: info.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitStatus {
    Pending,
    Valid,
    Invalid,
    TimedOut,
}

impl CommitStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CommitStatus::Pending)
    }

    /// Terminal states a ledger can report; `TimedOut` is only ever local.
    pub fn is_committed(self) -> bool {
        matches!(self, CommitStatus::Valid | CommitStatus::Invalid)
    }
}

/// Pushed by a ledger subscription when a block carrying `tx_id` is validated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEvent {
    pub tx_id: TransactionId,
    pub block_number: u64,
    pub status: CommitStatus,
}
