use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::connection::{ReplicationConnection, ReplicationFrame};
use super::decoder::PgOutputDecoder;
use super::types::{Lsn, StreamMessage};
use crate::{Config, Result};

/// Source of logical replication messages for the outbox monitor.
///
/// Implementations own the connection exclusively; the monitor drives them
/// from a single task.
pub trait StreamClient: Send {
    /// Next message, or `None` when the stream has ended.
    ///
    /// Must be cancel safe: the monitor races it against shutdown.
    fn next_message(&mut self) -> impl Future<Output = Result<Option<StreamMessage>>> + Send;

    /// Records the position to report on the next flush.
    fn set_position(&mut self, lsn: Lsn);

    /// Reports the recorded position upstream.
    fn flush(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Releases the connection.
    fn close(self) -> impl Future<Output = Result<()>> + Send
    where
        Self: Sized;
}

/// [`StreamClient`] over a live pgoutput replication connection.
pub struct PgOutputClient {
    connection: ReplicationConnection,
    decoder: PgOutputDecoder,
    position: Lsn,
    status_interval: Duration,
    last_status: Instant,
}

impl PgOutputClient {
    /// Connects and starts streaming from the slot's confirmed position.
    pub async fn connect(config: &Config) -> Result<Self> {
        let mut connection = ReplicationConnection::connect(
            &config.pg_config(),
            config.postgres.slot_name.clone(),
            config.postgres.publication.clone(),
        )
        .await?;

        let system = connection.identify_system().await?;
        info!(
            system_id = %system.system_id,
            timeline = system.timeline,
            xlogpos = %system.xlogpos,
            "Identified PostgreSQL system"
        );

        // 0/0 lets the server resume from the slot's confirmed_flush_lsn
        connection.start_replication(Lsn::ZERO).await?;

        Ok(Self {
            connection,
            decoder: PgOutputDecoder::new(),
            position: Lsn::ZERO,
            status_interval: config.outbox.status_interval(),
            last_status: Instant::now(),
        })
    }

    async fn send_status(&mut self, reply_requested: bool) -> Result<()> {
        self.connection
            .send_standby_status_update(self.position, reply_requested)
            .await?;
        self.last_status = Instant::now();
        Ok(())
    }
}

impl StreamClient for PgOutputClient {
    async fn next_message(&mut self) -> Result<Option<StreamMessage>> {
        loop {
            let deadline = self.last_status + self.status_interval;
            let received = tokio::time::timeout_at(deadline, self.connection.recv_frame()).await;
            let frame = match received {
                Ok(frame) => frame?,
                Err(_) => {
                    trace!("Status interval elapsed, sending standby status");
                    self.send_status(false).await?;
                    continue;
                }
            };

            match frame {
                Some(ReplicationFrame::XLogData { data, .. }) => {
                    return self.decoder.decode(&data).map(Some);
                }
                Some(ReplicationFrame::Keepalive { wal_end, reply }) => {
                    trace!(%wal_end, reply, "Keepalive received");
                    if reply {
                        self.send_status(false).await?;
                    }
                }
                None => return Ok(None),
            }
        }
    }

    fn set_position(&mut self, lsn: Lsn) {
        self.position = lsn;
    }

    async fn flush(&mut self) -> Result<()> {
        debug!("Flushing position {}", self.position);
        self.send_status(false).await
    }

    async fn close(self) -> Result<()> {
        self.connection.close().await
    }
}
