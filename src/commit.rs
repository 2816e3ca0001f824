// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the Endorsement Client Core.
//

//! Reconciles an ordered transaction with its final ledger status.
//!
//! A transaction starts `Pending` and moves exactly once, either to the
//! `Valid`/`Invalid` status recorded by the ledger for its id, or to
//! `TimedOut` when the bounded wait runs out first. `TimedOut` says nothing
//! about the transaction itself; it may still commit later.

use async_broadcast::RecvError;
use async_compatibility_layer::art::{async_sleep, async_timeout};
use futures::{
    future::{select, Either},
    pin_mut, Future,
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::{
    error::{CancelledSnafu, Result},
    transport::Ledger,
    types::{CommitStatus, TransactionId},
};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum WatchMode {
    /// Query the ledger every poll interval.
    Poll,
    /// Follow the ledger's commit events, polling if it offers none.
    Subscribe,
}

/// Status of one transaction; ignores observations about any other.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitTracker {
    tx_id: TransactionId,
    status: CommitStatus,
}

impl CommitTracker {
    pub fn new(tx_id: TransactionId) -> Self {
        Self {
            tx_id,
            status: CommitStatus::Pending,
        }
    }

    pub fn tx_id(&self) -> TransactionId {
        self.tx_id
    }

    pub fn status(&self) -> CommitStatus {
        self.status
    }

    /// Returns true if this observation settled the tracked transaction.
    pub fn observe(&mut self, tx_id: &TransactionId, status: CommitStatus) -> bool {
        if self.status.is_terminal() || *tx_id != self.tx_id || !status.is_committed() {
            return false;
        }
        self.status = status;
        true
    }

    pub fn expire(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = CommitStatus::TimedOut;
        true
    }
}

#[derive(Clone)]
pub struct CommitWatcher {
    ledger: Arc<dyn Ledger>,
    mode: WatchMode,
    poll_interval: Duration,
}

impl CommitWatcher {
    pub fn new(ledger: Arc<dyn Ledger>, mode: WatchMode, poll_interval: Duration) -> Self {
        Self {
            ledger,
            mode,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        }
    }

    /// Waits at most `max_wait` for `tx_id` to commit on `channel_id`.
    pub async fn watch(
        &self,
        channel_id: &str,
        tx_id: TransactionId,
        max_wait: Duration,
    ) -> CommitStatus {
        let mut tracker = CommitTracker::new(tx_id);
        match async_timeout(max_wait, self.follow(channel_id, &mut tracker)).await {
            Ok(()) => debug!(%tx_id, status = ?tracker.status(), "commit watch settled"),
            Err(_) => {
                tracker.expire();
                warn!(%tx_id, ?max_wait, "commit not observed before deadline");
            }
        }
        tracker.status()
    }

    /// Like [`Self::watch`], but gives up with `Cancelled` once `cancel`
    /// resolves. Other watches are unaffected.
    pub async fn watch_until<C>(
        &self,
        channel_id: &str,
        tx_id: TransactionId,
        max_wait: Duration,
        cancel: C,
    ) -> Result<CommitStatus>
    where
        C: Future<Output = ()>,
    {
        let watch = self.watch(channel_id, tx_id, max_wait);
        pin_mut!(watch);
        pin_mut!(cancel);
        match select(watch, cancel).await {
            Either::Left((status, _)) => Ok(status),
            Either::Right(((), _)) => {
                info!(%tx_id, "commit wait cancelled");
                CancelledSnafu { tx_id }.fail()
            }
        }
    }

    async fn follow(&self, channel_id: &str, tracker: &mut CommitTracker) {
        if self.mode == WatchMode::Subscribe {
            match self.ledger.subscribe(channel_id) {
                Some(mut events) => {
                    // covers a commit that landed before the subscription
                    if self.query(channel_id, tracker).await {
                        return;
                    }
                    loop {
                        match events.recv().await {
                            Ok(event) => {
                                if tracker.observe(&event.tx_id, event.status) {
                                    info!(
                                        tx_id = %tracker.tx_id(),
                                        block = event.block_number,
                                        status = ?event.status,
                                        "commit observed"
                                    );
                                    return;
                                }
                            }
                            Err(RecvError::Overflowed(skipped)) => {
                                warn!(tx_id = %tracker.tx_id(), skipped, "commit events lost, re-querying");
                                if self.query(channel_id, tracker).await {
                                    return;
                                }
                            }
                            Err(RecvError::Closed) => {
                                warn!(tx_id = %tracker.tx_id(), "commit event stream closed, polling instead");
                                break;
                            }
                        }
                    }
                }
                None => debug!(tx_id = %tracker.tx_id(), "ledger offers no subscription, polling"),
            }
        }
        loop {
            if self.query(channel_id, tracker).await {
                return;
            }
            async_sleep(self.poll_interval).await;
        }
    }

    async fn query(&self, channel_id: &str, tracker: &mut CommitTracker) -> bool {
        let tx_id = tracker.tx_id();
        match self.ledger.query_transaction_status(channel_id, &tx_id).await {
            Ok(Some(status)) => {
                let settled = tracker.observe(&tx_id, status);
                if settled {
                    info!(%tx_id, ?status, "commit status queried");
                }
                settled
            }
            Ok(None) => false,
            Err(err) => {
                warn!(%tx_id, "ledger query failed: {err:#}");
                false
            }
        }
    }
}
