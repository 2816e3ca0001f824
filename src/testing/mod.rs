// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the Endorsement Client Core.
//

//! In-memory collaborators
//! Stand-ins for the identity provider, the peers, the ordering service and
//! the ledger, scriptable enough to replay partial failures.

use anyhow::{anyhow, bail};
use async_broadcast::{broadcast, InactiveReceiver, Receiver, Sender};
use async_compatibility_layer::art::{async_sleep, async_spawn};
use async_lock::{Mutex, RwLock};
use async_trait::async_trait;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::debug;

use crate::{
    identity::{Certificate, EndorsementVerifier, Signature, SigningIdentity},
    transport::{Ledger, OrderingTransport, PeerTransport},
    types::{
        CommitEvent, CommitStatus, EndorsementResponse, Envelope, OrdererRef, OrderingAck, PeerId,
        PeerRef, Proposal, TransactionId, SUCCESS_STATUS, TX_ID_LEN,
    },
};


const ORDERED_CACHE_SIZE: usize = 1024;
const EVENT_CAPACITY: usize = 256;

/// Signatures are digests over the certificate, so anyone holding the
/// certificate can check them. Good enough to catch tampering in tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct MockVerifier;

impl MockVerifier {
    pub fn sign_as(certificate: &Certificate, message: &[u8]) -> Signature {
        let mut hasher = Sha256::new();
        hasher.update(b"mock-signature");
        hasher.update(certificate.as_bytes());
        hasher.update(message);
        Signature(hasher.finalize().to_vec())
    }
}

impl EndorsementVerifier for MockVerifier {
    fn verify(&self, endorser: &Certificate, message: &[u8], signature: &Signature) -> bool {
        Self::sign_as(endorser, message) == *signature
    }
}

pub fn mock_certificate(name: &str) -> Certificate {
    Certificate(format!("cert:{name}").into_bytes())
}

#[derive(Clone, Debug)]
pub struct MockIdentity {
    certificate: Certificate,
}

impl MockIdentity {
    pub fn new(name: &str) -> Self {
        Self {
            certificate: mock_certificate(name),
        }
    }

    pub fn verify_own(&self, message: &[u8], signature: &Signature) -> bool {
        MockVerifier.verify(&self.certificate, message, signature)
    }
}

impl SigningIdentity for MockIdentity {
    fn sign(&self, message: &[u8]) -> anyhow::Result<Signature> {
        Ok(MockVerifier::sign_as(&self.certificate, message))
    }

    fn certificate(&self) -> Certificate {
        self.certificate.clone()
    }
}

/// An enrolled identity whose key is not available.
#[derive(Clone, Debug)]
pub struct FailingIdentity {
    certificate: Certificate,
}

impl FailingIdentity {
    pub fn new(name: &str) -> Self {
        Self {
            certificate: mock_certificate(name),
        }
    }
}

impl SigningIdentity for FailingIdentity {
    fn sign(&self, _message: &[u8]) -> anyhow::Result<Signature> {
        bail!("private key for {:?} is not in the key store", self.certificate)
    }

    fn certificate(&self) -> Certificate {
        self.certificate.clone()
    }
}

#[derive(Clone, Debug)]
pub enum PeerBehavior {
    Endorse(Vec<u8>),
    EndorseAfter(Duration, Vec<u8>),
    Fail { status: u32, message: String },
    /// Accepts the call and never answers.
    Silent,
    Unreachable,
    /// Answers as if the proposal belonged to another transaction.
    WrongTransaction(Vec<u8>),
}

impl PeerBehavior {
    pub fn endorse(payload: &str) -> Self {
        PeerBehavior::Endorse(payload.as_bytes().to_vec())
    }
}

/// Decrements the in-flight count when a call finishes or is dropped.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockPeerTransport {
    behaviors: HashMap<PeerId, PeerBehavior>,
    calls: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
}

impl MockPeerTransport {
    pub fn new<I, S>(behaviors: I) -> Self
    where
        I: IntoIterator<Item = (S, PeerBehavior)>,
        S: Into<String>,
    {
        Self {
            behaviors: behaviors
                .into_iter()
                .map(|(peer, behavior)| (PeerId::new(peer), behavior))
                .collect(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls started but neither finished nor dropped.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn respond(
        peer: &PeerId,
        tx_id: TransactionId,
        status: u32,
        message: &str,
        payload: Vec<u8>,
    ) -> EndorsementResponse {
        let endorser = mock_certificate(peer.as_str());
        let signed = EndorsementResponse::signed_bytes(&tx_id, status, &payload);
        EndorsementResponse {
            peer_id: peer.clone(),
            tx_id,
            status,
            message: message.to_string(),
            signature: MockVerifier::sign_as(&endorser, &signed),
            payload,
            endorser,
        }
    }
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    async fn send_proposal(
        &self,
        peer: &PeerRef,
        proposal: &Proposal,
        _timeout: Duration,
    ) -> anyhow::Result<EndorsementResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight::enter(&self.in_flight);

        // what crosses the wire is the encoded proposal
        let proposal = Proposal::from_bytes(&proposal.to_bytes()?)?;
        let tx_id = proposal.tx_id();
        let behavior = self
            .behaviors
            .get(&peer.id)
            .ok_or_else(|| anyhow!("no peer listening at {}", peer.endpoint))?;
        debug!(peer = %peer.id, ?behavior, "mock peer handling proposal");

        match behavior {
            PeerBehavior::Endorse(payload) => {
                Ok(Self::respond(&peer.id, tx_id, SUCCESS_STATUS, "OK", payload.clone()))
            }
            PeerBehavior::EndorseAfter(delay, payload) => {
                async_sleep(*delay).await;
                Ok(Self::respond(&peer.id, tx_id, SUCCESS_STATUS, "OK", payload.clone()))
            }
            PeerBehavior::Fail { status, message } => {
                Ok(Self::respond(&peer.id, tx_id, *status, message, Vec::new()))
            }
            PeerBehavior::Silent => futures::future::pending().await,
            PeerBehavior::Unreachable => Err(anyhow!("connection refused: {}", peer.endpoint)),
            PeerBehavior::WrongTransaction(payload) => {
                let other = TransactionId::from_bytes([0xee; TX_ID_LEN]);
                Ok(Self::respond(&peer.id, other, SUCCESS_STATUS, "OK", payload.clone()))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrdererBehavior {
    Accept,
    Reject(String),
    Error(String),
    Unavailable,
}

/// Ordering service that commits what it accepts into a [`MockLedger`].
/// Envelopes are deduplicated by transaction id.
pub struct MockOrderer {
    ledger: Arc<MockLedger>,
    script: Mutex<VecDeque<OrdererBehavior>>,
    unreachable: HashSet<String>,
    commit_status: CommitStatus,
    commit_delay: Duration,
    commits: bool,
    ordered: Mutex<LruCache<TransactionId, u64>>,
    sequence: AtomicU64,
    submissions: AtomicUsize,
    envelopes: Mutex<Vec<Envelope>>,
}

impl MockOrderer {
    pub fn new(ledger: Arc<MockLedger>) -> Self {
        Self {
            ledger,
            script: Mutex::new(VecDeque::new()),
            unreachable: HashSet::new(),
            commit_status: CommitStatus::Valid,
            commit_delay: Duration::ZERO,
            commits: true,
            ordered: Mutex::new(LruCache::new(
                NonZeroUsize::new(ORDERED_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
            sequence: AtomicU64::new(0),
            submissions: AtomicUsize::new(0),
            envelopes: Mutex::new(Vec::new()),
        }
    }

    /// Behaviors used for the next submissions, in order; `Accept` afterwards.
    pub fn with_script(mut self, script: impl IntoIterator<Item = OrdererBehavior>) -> Self {
        self.script = Mutex::new(script.into_iter().collect());
        self
    }

    pub fn with_unreachable(mut self, endpoint: &str) -> Self {
        self.unreachable.insert(endpoint.to_string());
        self
    }

    pub fn with_commit_status(mut self, status: CommitStatus) -> Self {
        self.commit_status = status;
        self
    }

    pub fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = delay;
        self
    }

    /// Accepts envelopes but never lets them reach the ledger.
    pub fn never_commit(mut self) -> Self {
        self.commits = false;
        self
    }

    /// Submission attempts that reached this orderer, duplicates included.
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    pub async fn envelopes(&self) -> Vec<Envelope> {
        self.envelopes.lock().await.clone()
    }
}

#[async_trait]
impl OrderingTransport for MockOrderer {
    async fn submit(&self, orderer: &OrdererRef, envelope: &Envelope) -> anyhow::Result<OrderingAck> {
        if self.unreachable.contains(&orderer.endpoint) {
            bail!("connection refused: {}", orderer.endpoint);
        }
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope::from_bytes(&envelope.to_bytes()?)?;

        let behavior = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or(OrdererBehavior::Accept);
        match behavior {
            OrdererBehavior::Accept => {}
            OrdererBehavior::Reject(info) => return Ok(OrderingAck::rejected(info)),
            OrdererBehavior::Error(info) => return Ok(OrderingAck::error(info)),
            OrdererBehavior::Unavailable => bail!("ordering service at {} unavailable", orderer.endpoint),
        }

        let tx_id = envelope.resubmission_key();
        let mut ordered = self.ordered.lock().await;
        if let Some(sequence) = ordered.get(&tx_id) {
            debug!(%tx_id, sequence, "duplicate envelope ignored");
            return Ok(OrderingAck::success(Some(sequence.to_string())));
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        ordered.put(tx_id, sequence);
        drop(ordered);
        self.envelopes.lock().await.push(envelope);

        if self.commits {
            let ledger = Arc::clone(&self.ledger);
            let status = self.commit_status;
            if self.commit_delay.is_zero() {
                ledger.commit(tx_id, status).await;
            } else {
                let delay = self.commit_delay;
                async_spawn(async move {
                    async_sleep(delay).await;
                    ledger.commit(tx_id, status).await;
                });
            }
        }
        Ok(OrderingAck::success(Some(sequence.to_string())))
    }
}

/// Ledger of one channel recording each committed transaction.
pub struct MockLedger {
    statuses: RwLock<HashMap<TransactionId, CommitStatus>>,
    records: RwLock<HashMap<TransactionId, usize>>,
    height: AtomicU64,
    events: Sender<CommitEvent>,
    _events_keepalive: InactiveReceiver<CommitEvent>,
    subscriptions: bool,
    failing_queries: AtomicUsize,
    queries: AtomicUsize,
}

impl MockLedger {
    pub fn new() -> Self {
        let (mut events, receiver) = broadcast(EVENT_CAPACITY);
        events.set_overflow(true);
        Self {
            statuses: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
            height: AtomicU64::new(0),
            events,
            _events_keepalive: receiver.deactivate(),
            subscriptions: true,
            failing_queries: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
        }
    }

    /// A ledger that can only be polled.
    pub fn without_subscriptions() -> Self {
        Self {
            subscriptions: false,
            ..Self::new()
        }
    }

    /// Appends a block holding `tx_id` and notifies subscribers.
    pub async fn commit(&self, tx_id: TransactionId, status: CommitStatus) {
        let block_number = self.height.fetch_add(1, Ordering::SeqCst) + 1;
        self.statuses.write().await.insert(tx_id, status);
        *self.records.write().await.entry(tx_id).or_insert(0) += 1;
        debug!(%tx_id, block_number, ?status, "mock ledger committed transaction");
        // no active subscriber is fine
        let _ = self.events.try_broadcast(CommitEvent {
            tx_id,
            block_number,
            status,
        });
    }

    pub async fn commit_count(&self, tx_id: &TransactionId) -> usize {
        self.records.read().await.get(tx_id).copied().unwrap_or(0)
    }

    pub fn fail_next_queries(&self, count: usize) {
        self.failing_queries.store(count, Ordering::SeqCst);
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Ends every subscription stream, current and future.
    pub fn close_subscriptions(&self) {
        self.events.close();
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn query_transaction_status(
        &self,
        _channel_id: &str,
        tx_id: &TransactionId,
    ) -> anyhow::Result<Option<CommitStatus>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_queries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if failing.is_ok() {
            bail!("ledger query timed out");
        }
        Ok(self.statuses.read().await.get(tx_id).copied())
    }

    fn subscribe(&self, _channel_id: &str) -> Option<Receiver<CommitEvent>> {
        self.subscriptions.then(|| self.events.new_receiver())
    }
}
