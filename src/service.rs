// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the Endorsement Client Core.
//

//! Endorsement client service
//! Composes the submission stages into one operation and exposes each stage
//! for callers that drive the workflow step by step:
//! 1. `build_proposal`: request to signed proposal
//! 2. `collect_endorsements`: proposal fanned out to the endorsing peers
//! 3. `evaluate`: endorsement set checked against a policy
//! 4. `assemble`: accepted endorsements packed into an envelope
//! 5. `order`: envelope handed to the ordering service
//! 6. `wait_for_commit`: ledger watched for the final status
//!
//! `submit_transaction` runs all six; `query_by_chaincode` runs the first two
//! for read-only queries.

use async_broadcast::{broadcast, InactiveReceiver, Sender};
use async_compatibility_layer::{
    art::async_spawn,
    channel::{unbounded, UnboundedSender},
};
use derivative::Derivative;
use futures::Future;
use serde::{Deserialize, Serialize};
use snafu::ensure;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, error, info};

use crate::{
    assembler::TransactionAssembler,
    commit::{CommitWatcher, WatchMode},
    endorsement::EndorsementCoordinator,
    error::{
        CancelledSnafu, CommitInvalidSnafu, CommitTimedOutSnafu, InvalidRequestSnafu,
        PolicyNotSatisfiedSnafu, Result,
    },
    identity::{EndorsementVerifier, SigningIdentity},
    ordering::{OrderingSubmitter, RetryPolicy},
    policy::{EndorsementPolicy, PolicyDecision, PolicyEvaluator},
    proposal::ProposalBuilder,
    transport::{Ledger, OrderingTransport, PeerTransport},
    types::{
        CommitStatus, EndorsementSet, Envelope, OrdererRef, OrderingAck, PeerId, PeerRef,
        Proposal, ProposalKind, TransactionId, TransactionRequest,
    },
    WaitAndKeep,
};

const DEFAULT_CHANNEL: &str = "myc1";
const DEFAULT_ENDORSEMENT_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_COMMIT_WAIT_MS: u64 = 30_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_ORDERING_ATTEMPTS: usize = 3;
const DEFAULT_ORDERING_BACKOFF_MS: u64 = 200;
const DEFAULT_ORDERING_MAX_BACKOFF_MS: u64 = 5_000;

fn parse_millis(s: &str) -> std::result::Result<Duration, std::num::ParseIntError> {
    s.trim().parse().map(Duration::from_millis)
}

/// Client settings, flattened into whatever binary hosts the client.
#[derive(clap::Args, Clone, Debug)]
pub struct Options {
    #[clap(long, env = "ENDORSE_CLIENT_CHANNEL", default_value = DEFAULT_CHANNEL)]
    pub channel: String,

    /// Endorsing peers as `id=endpoint`.
    #[clap(long = "peer", env = "ENDORSE_CLIENT_PEERS", value_delimiter = ',')]
    pub peers: Vec<PeerRef>,

    #[clap(long = "orderer", env = "ENDORSE_CLIENT_ORDERERS", value_delimiter = ',')]
    pub orderers: Vec<OrdererRef>,

    #[clap(long, env = "ENDORSE_CLIENT_MIN_ENDORSEMENTS", default_value_t = 1)]
    pub min_endorsements: usize,

    #[clap(long, env = "ENDORSE_CLIENT_UNANIMOUS")]
    pub unanimous: bool,

    /// Milliseconds to wait for endorsements.
    #[clap(long, env = "ENDORSE_CLIENT_ENDORSEMENT_TIMEOUT", default_value = "3000", value_parser = parse_millis)]
    pub endorsement_timeout: Duration,

    /// Milliseconds to wait for a commit after ordering.
    #[clap(long, env = "ENDORSE_CLIENT_COMMIT_WAIT", default_value = "30000", value_parser = parse_millis)]
    pub commit_wait: Duration,

    #[clap(long, env = "ENDORSE_CLIENT_POLL_INTERVAL", default_value = "500", value_parser = parse_millis)]
    pub poll_interval: Duration,

    #[clap(long, env = "ENDORSE_CLIENT_WATCH_MODE", value_enum, default_value = "subscribe")]
    pub watch_mode: WatchMode,

    #[clap(long, env = "ENDORSE_CLIENT_ORDERING_ATTEMPTS", default_value_t = DEFAULT_ORDERING_ATTEMPTS)]
    pub ordering_attempts: usize,

    #[clap(long, env = "ENDORSE_CLIENT_ORDERING_BACKOFF", default_value = "200", value_parser = parse_millis)]
    pub ordering_backoff: Duration,

    #[clap(long, env = "ENDORSE_CLIENT_ORDERING_MAX_BACKOFF", default_value = "5000", value_parser = parse_millis)]
    pub ordering_max_backoff: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            peers: Vec::new(),
            orderers: Vec::new(),
            min_endorsements: 1,
            unanimous: false,
            endorsement_timeout: Duration::from_millis(DEFAULT_ENDORSEMENT_TIMEOUT_MS),
            commit_wait: Duration::from_millis(DEFAULT_COMMIT_WAIT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            watch_mode: WatchMode::Subscribe,
            ordering_attempts: DEFAULT_ORDERING_ATTEMPTS,
            ordering_backoff: Duration::from_millis(DEFAULT_ORDERING_BACKOFF_MS),
            ordering_max_backoff: Duration::from_millis(DEFAULT_ORDERING_MAX_BACKOFF_MS),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    pub endorsement: Duration,
    pub commit_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            endorsement: Duration::from_millis(DEFAULT_ENDORSEMENT_TIMEOUT_MS),
            commit_wait: Duration::from_millis(DEFAULT_COMMIT_WAIT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

/// Everything a submission needs besides the transports.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct ClientConfig {
    pub channel_id: String,
    #[derivative(Debug = "ignore")]
    pub identity: Arc<dyn SigningIdentity>,
    #[derivative(Debug = "ignore")]
    pub verifier: Option<Arc<dyn EndorsementVerifier>>,
    pub peers: Vec<PeerRef>,
    pub orderers: Vec<OrdererRef>,
    pub policy: EndorsementPolicy,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    pub watch_mode: WatchMode,
}

impl ClientConfig {
    pub fn new(channel_id: impl Into<String>, identity: Arc<dyn SigningIdentity>) -> Self {
        Self {
            channel_id: channel_id.into(),
            identity,
            verifier: None,
            peers: Vec::new(),
            orderers: Vec::new(),
            policy: EndorsementPolicy::default(),
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            watch_mode: WatchMode::Subscribe,
        }
    }

    pub fn from_options(options: Options, identity: Arc<dyn SigningIdentity>) -> Self {
        Self {
            channel_id: options.channel,
            identity,
            verifier: None,
            peers: options.peers,
            orderers: options.orderers,
            policy: EndorsementPolicy {
                min_endorsements: options.min_endorsements,
                unanimous: options.unanimous,
            },
            timeouts: Timeouts {
                endorsement: options.endorsement_timeout,
                commit_wait: options.commit_wait,
                poll_interval: options.poll_interval,
            },
            retry: RetryPolicy {
                max_attempts: options.ordering_attempts,
                initial_backoff: options.ordering_backoff,
                max_backoff: options.ordering_max_backoff,
            },
            watch_mode: options.watch_mode,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn EndorsementVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }
}

/// Outcome of a transaction that committed as valid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub tx_id: TransactionId,
    pub status: CommitStatus,
    pub endorsers: Vec<PeerId>,
    pub ordering: OrderingAck,
}

/// An ordered transaction whose commit is still being watched.
pub struct PendingCommit {
    tx_id: TransactionId,
    ordering: OrderingAck,
    status: WaitAndKeep<CommitStatus>,
}

impl PendingCommit {
    pub fn tx_id(&self) -> TransactionId {
        self.tx_id
    }

    pub fn ordering_ack(&self) -> &OrderingAck {
        &self.ordering
    }

    /// Terminal status, `TimedOut` included. `Cancelled` if the service shut
    /// down first.
    pub async fn status(&mut self) -> Result<CommitStatus> {
        let tx_id = self.tx_id;
        self.status
            .get()
            .await
            .ok_or_else(|| CancelledSnafu { tx_id }.build())
    }
}

struct Endorsed {
    envelope: Envelope,
    ack: OrderingAck,
}

pub struct TransactionService {
    config: ClientConfig,
    proposals: ProposalBuilder,
    coordinator: EndorsementCoordinator,
    evaluator: PolicyEvaluator,
    assembler: TransactionAssembler,
    submitter: OrderingSubmitter,
    ledger: Arc<dyn Ledger>,
    shutdown: Sender<()>,
    shutdown_listener: InactiveReceiver<()>,
}

impl TransactionService {
    pub fn new(
        config: ClientConfig,
        peers: Arc<dyn PeerTransport>,
        orderer: Arc<dyn OrderingTransport>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        let evaluator = match &config.verifier {
            Some(verifier) => PolicyEvaluator::with_verifier(Arc::clone(verifier)),
            None => PolicyEvaluator::new(),
        };
        // nothing is ever sent; closing the channel is the shutdown signal
        let (shutdown, listener) = broadcast(1);
        Self {
            proposals: ProposalBuilder::new(Arc::clone(&config.identity)),
            coordinator: EndorsementCoordinator::new(peers),
            evaluator,
            assembler: TransactionAssembler::new(Arc::clone(&config.identity)),
            submitter: OrderingSubmitter::new(orderer, config.orderers.clone(), config.retry.clone()),
            ledger,
            shutdown,
            shutdown_listener: listener.deactivate(),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn identity(&self) -> &dyn SigningIdentity {
        self.config.identity.as_ref()
    }

    /// Targets named by the request, or the configured peers.
    pub fn targets<'a>(&'a self, request: &'a TransactionRequest) -> &'a [PeerRef] {
        if request.targets().is_empty() {
            &self.config.peers
        } else {
            request.targets()
        }
    }

    pub fn build_proposal(&self, request: &TransactionRequest) -> Result<Proposal> {
        self.proposals.build(request)
    }

    pub async fn collect_endorsements(
        &self,
        proposal: &Proposal,
        targets: &[PeerRef],
        timeout: Duration,
    ) -> Result<EndorsementSet> {
        self.coordinator.collect(proposal, targets, timeout).await
    }

    pub fn evaluate(&self, set: &EndorsementSet, policy: &EndorsementPolicy) -> PolicyDecision {
        self.evaluator.evaluate(set, policy)
    }

    pub fn assemble(&self, proposal: &Proposal, decision: &PolicyDecision) -> Result<Envelope> {
        self.assembler
            .assemble(proposal, &decision.accepted, decision.required)
    }

    pub async fn order(&self, envelope: &Envelope) -> Result<OrderingAck> {
        self.submitter.submit(envelope).await
    }

    /// Waits for `tx_id` to reach a terminal status; `Cancelled` on shutdown.
    pub async fn wait_for_commit(
        &self,
        channel_id: &str,
        tx_id: TransactionId,
        timeouts: &Timeouts,
    ) -> Result<CommitStatus> {
        self.watcher(timeouts)
            .watch_until(channel_id, tx_id, timeouts.commit_wait, self.cancel_signal())
            .await
    }

    /// Runs every stage with the configured policy and timeouts.
    pub async fn submit(&self, request: &TransactionRequest) -> Result<TransactionReceipt> {
        let policy = self.config.policy.clone();
        let timeouts = self.config.timeouts;
        self.submit_transaction(request, &policy, &timeouts).await
    }

    /// Builds, endorses, assembles, orders and then waits for the commit.
    /// Nothing reaches the ordering service unless the policy is satisfied.
    pub async fn submit_transaction(
        &self,
        request: &TransactionRequest,
        policy: &EndorsementPolicy,
        timeouts: &Timeouts,
    ) -> Result<TransactionReceipt> {
        let tx_id = request.tx_id();
        let endorsed = self.endorse_and_order(request, policy, timeouts).await?;
        let status = self
            .wait_for_commit(request.channel_id(), tx_id, timeouts)
            .await?;
        match status {
            CommitStatus::Valid => {
                info!(%tx_id, "transaction committed");
                Ok(TransactionReceipt {
                    tx_id,
                    status,
                    endorsers: endorsed
                        .envelope
                        .endorsements
                        .iter()
                        .map(|endorsement| endorsement.peer_id.clone())
                        .collect(),
                    ordering: endorsed.ack,
                })
            }
            CommitStatus::Invalid => {
                error!(%tx_id, "transaction committed as invalid");
                CommitInvalidSnafu { tx_id }.fail()
            }
            CommitStatus::Pending | CommitStatus::TimedOut => CommitTimedOutSnafu {
                tx_id,
                waited: timeouts.commit_wait,
            }
            .fail(),
        }
    }

    /// Like [`Self::submit_transaction`], but returns as soon as the envelope
    /// is accepted for ordering and watches the commit in the background.
    pub async fn submit_detached(
        &self,
        request: &TransactionRequest,
        policy: &EndorsementPolicy,
        timeouts: &Timeouts,
    ) -> Result<PendingCommit> {
        let tx_id = request.tx_id();
        let endorsed = self.endorse_and_order(request, policy, timeouts).await?;

        let (sender, receiver) = unbounded();
        let watcher = self.watcher(timeouts);
        let channel_id = request.channel_id().to_string();
        let max_wait = timeouts.commit_wait;
        let cancel = self.cancel_signal();
        async_spawn(async move {
            report_commit(watcher, channel_id, tx_id, max_wait, cancel, sender).await;
        });

        Ok(PendingCommit {
            tx_id,
            ordering: endorsed.ack,
            status: WaitAndKeep::Wait(receiver),
        })
    }

    /// Sends a query proposal to the targets and returns each successful,
    /// properly signed payload. Nothing is ordered.
    pub async fn query_by_chaincode(
        &self,
        request: &TransactionRequest,
        timeout: Duration,
    ) -> Result<BTreeMap<PeerId, Vec<u8>>> {
        ensure!(
            *request.kind() == ProposalKind::Query,
            InvalidRequestSnafu {
                reason: "query_by_chaincode needs a query request",
            }
        );
        self.check_channel(request)?;
        let proposal = self.build_proposal(request)?;
        let set = self
            .collect_endorsements(&proposal, self.targets(request), timeout)
            .await?;
        let payloads: BTreeMap<_, _> = set
            .responses()
            .filter(|response| response.is_success() && self.evaluator.is_valid_endorsement(response))
            .map(|response| (response.peer_id.clone(), response.payload.clone()))
            .collect();
        ensure!(
            !payloads.is_empty(),
            PolicyNotSatisfiedSnafu {
                tx_id: request.tx_id(),
                required: 1usize,
                accepted: 0usize,
            }
        );
        debug!(tx_id = %request.tx_id(), peers = payloads.len(), "query answered");
        Ok(payloads)
    }

    /// Cancels every commit wait of this service, current and future.
    pub fn shutdown(&self) {
        if self.shutdown.close() {
            info!("transaction service shutting down");
        }
    }

    async fn endorse_and_order(
        &self,
        request: &TransactionRequest,
        policy: &EndorsementPolicy,
        timeouts: &Timeouts,
    ) -> Result<Endorsed> {
        let tx_id = request.tx_id();
        ensure!(
            *request.kind() != ProposalKind::Query,
            InvalidRequestSnafu {
                reason: "queries are evaluated with query_by_chaincode, not ordered",
            }
        );

        self.check_channel(request)?;
        let proposal = self.build_proposal(request)?;
        let set = self
            .collect_endorsements(&proposal, self.targets(request), timeouts.endorsement)
            .await?;
        let decision = self.evaluate(&set, policy);
        if !decision.satisfied {
            error!(
                %tx_id,
                accepted = decision.accepted.len(),
                required = decision.required,
                disqualified = ?decision.disqualified,
                "endorsement policy not satisfied"
            );
            return PolicyNotSatisfiedSnafu {
                tx_id,
                required: decision.required,
                accepted: decision.accepted.len(),
            }
            .fail();
        }

        let envelope = self.assemble(&proposal, &decision)?;
        let ack = self.order(&envelope).await?;
        Ok(Endorsed { envelope, ack })
    }

    /// Peers, orderers and ledger all serve the configured channel only.
    fn check_channel(&self, request: &TransactionRequest) -> Result<()> {
        ensure!(
            request.channel_id() == self.config.channel_id,
            InvalidRequestSnafu {
                reason: format!(
                    "request targets channel `{}`, client serves `{}`",
                    request.channel_id(),
                    self.config.channel_id
                ),
            }
        );
        Ok(())
    }

    fn watcher(&self, timeouts: &Timeouts) -> CommitWatcher {
        CommitWatcher::new(
            Arc::clone(&self.ledger),
            self.config.watch_mode,
            timeouts.poll_interval,
        )
    }

    fn cancel_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut listener = self.shutdown_listener.activate_cloned();
        async move {
            // resolves with `Closed` once `shutdown` runs
            let _ = listener.recv().await;
        }
    }
}

async fn report_commit<C>(
    watcher: CommitWatcher,
    channel_id: String,
    tx_id: TransactionId,
    max_wait: Duration,
    cancel: C,
    sender: UnboundedSender<CommitStatus>,
) where
    C: Future<Output = ()>,
{
    match watcher.watch_until(&channel_id, tx_id, max_wait, cancel).await {
        Ok(status) => {
            if sender.send(status).await.is_err() {
                debug!(%tx_id, "pending commit handle dropped");
            }
        }
        // dropping the sender tells the handle
        Err(err) => debug!(%tx_id, "detached commit watch ended: {err}"),
    }
}
