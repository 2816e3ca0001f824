// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the Endorsement Client Core.
//

//! Hands envelopes to the ordering service.
//!
//! An acknowledgement only means the envelope was accepted for ordering, not
//! that it committed; see [`crate::commit`] for that.

use async_compatibility_layer::art::async_sleep;
use serde::{Deserialize, Serialize};
use snafu::ensure;
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

use crate::{
    error::{InvalidRequestSnafu, OrderingRejectedSnafu, OrderingUnavailableSnafu, Result, SubmitError},
    transport::OrderingTransport,
    types::{Envelope, OrdererRef, OrderingAck, OrderingStatus},
};

/// Bounded exponential backoff between ordering rounds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Rounds over all orderers; at least one always runs.
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before round `attempt` (1-based, so round 2 waits `initial_backoff`).
    pub fn backoff(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = u32::try_from(attempt - 2).unwrap_or(u32::MAX).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct OrderingSubmitter {
    transport: Arc<dyn OrderingTransport>,
    orderers: Vec<OrdererRef>,
    retry: RetryPolicy,
}

impl OrderingSubmitter {
    pub fn new(
        transport: Arc<dyn OrderingTransport>,
        orderers: Vec<OrdererRef>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            orderers,
            retry,
        }
    }

    /// One attempt against one orderer.
    pub async fn submit_to(&self, orderer: &OrdererRef, envelope: &Envelope) -> Result<OrderingAck> {
        let tx_id = envelope.tx_id();
        let ack = match self.transport.submit(orderer, envelope).await {
            Ok(ack) => ack,
            Err(err) => {
                return OrderingUnavailableSnafu {
                    tx_id,
                    attempts: 1usize,
                    reason: format!("{}: {err:#}", orderer.endpoint),
                }
                .fail()
            }
        };
        match ack.status {
            OrderingStatus::Success => {
                info!(%tx_id, orderer = %orderer.endpoint, hint = ?ack.sequence_hint, "envelope accepted for ordering");
                Ok(ack)
            }
            OrderingStatus::Rejected => {
                error!(%tx_id, orderer = %orderer.endpoint, info = %ack.info, "envelope rejected");
                OrderingRejectedSnafu {
                    tx_id,
                    info: ack.info,
                }
                .fail()
            }
            OrderingStatus::Error => OrderingUnavailableSnafu {
                tx_id,
                attempts: 1usize,
                reason: format!("{}: {}", orderer.endpoint, ack.info),
            }
            .fail(),
        }
    }

    /// Tries each orderer in turn, repeating rounds with backoff while the
    /// service is unavailable. The same envelope is resubmitted every time;
    /// a rejection ends the submission at once.
    pub async fn submit(&self, envelope: &Envelope) -> Result<OrderingAck> {
        let tx_id = envelope.tx_id();
        ensure!(
            !self.orderers.is_empty(),
            InvalidRequestSnafu {
                reason: "no ordering service configured",
            }
        );

        let rounds = self.retry.max_attempts.max(1);
        let mut attempts: usize = 0;
        let mut last_reason = String::new();
        for round in 1..=rounds {
            let backoff = self.retry.backoff(round);
            if !backoff.is_zero() {
                warn!(%tx_id, round, ?backoff, "ordering unavailable, backing off");
                async_sleep(backoff).await;
            }
            for orderer in &self.orderers {
                attempts += 1;
                match self.submit_to(orderer, envelope).await {
                    Ok(ack) => return Ok(ack),
                    Err(SubmitError::OrderingUnavailable { reason, .. }) => {
                        warn!(%tx_id, orderer = %orderer.endpoint, %reason, "ordering attempt failed");
                        last_reason = reason;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        error!(%tx_id, attempts, "ordering service unavailable");
        OrderingUnavailableSnafu {
            tx_id,
            attempts,
            reason: last_reason,
        }
        .fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let retry = RetryPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(retry.backoff(1), Duration::ZERO);
        assert_eq!(retry.backoff(2), Duration::from_millis(100));
        assert_eq!(retry.backoff(3), Duration::from_millis(200));
        assert_eq!(retry.backoff(4), Duration::from_millis(350));
        assert_eq!(retry.backoff(60), Duration::from_millis(350));
    }
}
