use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::handler::OutboxHandler;
use super::TransactionBatch;
use crate::config::OutboxConfig;

/// Attempt budget and linear backoff for handler calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl RetryPolicy {
    pub fn new(retry_count: u32, backoff_step: Duration) -> Self {
        Self {
            max_attempts: retry_count.saturating_add(1),
            backoff_step,
        }
    }

    pub fn from_config(config: &OutboxConfig) -> Self {
        Self {
            max_attempts: config.max_attempts(),
            backoff_step: config.backoff_step(),
        }
    }

    /// Delay after the failed `attempt` (1-based): `step * (attempt + 1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step.saturating_mul(attempt.saturating_add(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&OutboxConfig::default())
    }
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Delivered { attempts: u32 },
    /// Shutdown was requested; the batch must not be acknowledged.
    Cancelled { attempts: u32 },
    /// Every attempt failed; the relay has to stop.
    Exhausted { attempts: u32, error: anyhow::Error },
}

/// Hands `batch` to `handler` until it succeeds, the budget runs out or
/// `cancel` fires.
///
/// A handler call already in flight when `cancel` fires is awaited, not
/// dropped, and its result is discarded.
pub async fn dispatch<H: OutboxHandler>(
    batch: &TransactionBatch,
    handler: &H,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> DispatchOutcome {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        trace!(xid = batch.xid, "Executing handler attempt {}", attempt);
        let result = handler.handle(&batch.events, cancel).await;

        if cancel.is_cancelled() {
            debug!(
                xid = batch.xid,
                lsn = %batch.commit_lsn,
                "Shutdown requested during handler attempt {}, result discarded",
                attempt
            );
            return DispatchOutcome::Cancelled { attempts: attempt };
        }

        let error = match result {
            Ok(()) => {
                debug!(
                    xid = batch.xid,
                    events = batch.len(),
                    "Executed handler with {} attempt(s)",
                    attempt
                );
                return DispatchOutcome::Delivered { attempts: attempt };
            }
            Err(error) => error,
        };

        error!(
            xid = batch.xid,
            attempt,
            "Unable to complete handler. Reason: {:#}",
            error
        );

        if attempt >= max_attempts {
            error!(
                severity = "critical",
                xid = batch.xid,
                lsn = %batch.commit_lsn,
                "The handler failed after {} attempts",
                attempt
            );
            return DispatchOutcome::Exhausted {
                attempts: attempt,
                error,
            };
        }

        let delay = policy.backoff(attempt);
        trace!(xid = batch.xid, ?delay, "Backing off before next attempt");
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(xid = batch.xid, "Shutdown requested during backoff");
                return DispatchOutcome::Cancelled { attempts: attempt };
            }
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}
