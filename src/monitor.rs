//! The outbox relay loop.
//!
//! [`OutboxMonitor`] reads the replication stream one message at a time,
//! frames transactions, hands every committed transaction to the handler
//! and acknowledges its commit position once the handler succeeded. All of
//! it runs sequentially on the caller's task, so positions are acknowledged
//! strictly in commit order.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::outbox::{
    dispatch, CursorTracker, DispatchOutcome, Frame, FrameState, FramerSettings, OutboxHandler,
    RetryPolicy,
};
use crate::postgres::{Lsn, PgOutputClient, StreamClient};
use crate::{Config, Error, Result};

/// Counters for one run of the monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorStats {
    /// Commits observed.
    pub transactions: u64,
    /// Transactions the handler accepted.
    pub delivered: u64,
    /// Commits acknowledged without calling the handler.
    pub acknowledged_only: u64,
    /// Events handed to the handler in delivered transactions.
    pub events: u64,
    /// Columns dropped because their type has no mapping.
    pub omitted_fields: u64,
    /// Failed handler attempts that were retried successfully.
    pub handler_retries: u64,
    pub last_acknowledged: Option<Lsn>,
}

pub struct OutboxMonitor<H> {
    config: Config,
    handler: H,
    policy: RetryPolicy,
    settings: FramerSettings,
}

impl<H: OutboxHandler> OutboxMonitor<H> {
    pub fn new(config: Config, handler: H) -> Self {
        let policy = RetryPolicy::from_config(&config.outbox);
        let settings = FramerSettings {
            unknown_types: config.outbox.unknown_types,
            empty_commit: config.outbox.empty_commit,
        };
        Self {
            config,
            handler,
            policy,
            settings,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connects to PostgreSQL, relays until `cancel` fires or a fatal error
    /// occurs, and closes the connection on every exit path.
    pub async fn run_with_config(&self, cancel: &CancellationToken) -> Result<MonitorStats> {
        let mut client = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Shutdown requested before the replication connection was established");
                return Ok(MonitorStats::default());
            }
            client = PgOutputClient::connect(&self.config) => client?,
        };

        let result = self.run(&mut client, cancel).await;

        match (result, client.close().await) {
            (Ok(stats), Ok(())) => Ok(stats),
            (Ok(_), Err(close_err)) => Err(close_err),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                warn!("Failed to close replication connection: {}", close_err);
                Err(e)
            }
        }
    }

    /// Relays messages from `client` until the stream ends, `cancel` fires
    /// or a fatal error occurs.
    ///
    /// Returns `Ok` on cancellation and stream end. The client is left open.
    pub async fn run<C: StreamClient>(
        &self,
        client: &mut C,
        cancel: &CancellationToken,
    ) -> Result<MonitorStats> {
        info!(
            slot = %self.config.postgres.slot_name,
            publication = %self.config.postgres.publication,
            max_attempts = self.policy.max_attempts,
            "Outbox monitor starting"
        );

        let mut state = FrameState::Idle;
        let mut cursor = CursorTracker::new();
        let mut stats = MonitorStats::default();

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Shutdown requested, stopping outbox monitor");
                    break;
                }
                message = client.next_message() => message?,
            };

            let Some(message) = message else {
                info!("Replication stream ended");
                break;
            };
            debug!("Received message of type '{}'", message.kind());

            let (next, frame) = state.apply(message, &self.settings)?;
            state = next;

            match frame {
                Frame::Pending => {}
                Frame::AcknowledgeOnly(lsn) => {
                    stats.transactions += 1;
                    stats.acknowledged_only += 1;
                    cursor.advance(client, lsn).await?;
                }
                Frame::Dispatch(batch) => {
                    stats.transactions += 1;
                    stats.omitted_fields += batch.omitted_fields as u64;

                    match dispatch(&batch, &self.handler, &self.policy, cancel).await {
                        DispatchOutcome::Delivered { attempts } => {
                            stats.delivered += 1;
                            stats.events += batch.len() as u64;
                            stats.handler_retries += u64::from(attempts - 1);
                            cursor.advance(client, batch.commit_lsn).await?;
                        }
                        DispatchOutcome::Cancelled { .. } => {
                            info!(
                                xid = batch.xid,
                                lsn = %batch.commit_lsn,
                                "Shutdown requested, transaction left unacknowledged for redelivery"
                            );
                            break;
                        }
                        DispatchOutcome::Exhausted { attempts, error } => {
                            return Err(Error::HandlerExhausted {
                                attempts,
                                lsn: batch.commit_lsn.to_string(),
                                last_error: error,
                            });
                        }
                    }
                }
            }
        }

        stats.last_acknowledged = cursor.acknowledged();
        info!(
            transactions = stats.transactions,
            delivered = stats.delivered,
            events = stats.events,
            omitted_fields = stats.omitted_fields,
            "Outbox monitor stopped"
        );
        Ok(stats)
    }
}
