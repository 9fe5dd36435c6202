use tracing::{debug, warn};

use crate::postgres::{Lsn, StreamClient};
use crate::Result;

/// Tracks the last position reported to the replication slot.
///
/// Positions only move forward; a commit at or below the acknowledged
/// position is never reported again.
#[derive(Debug, Default)]
pub struct CursorTracker {
    acknowledged: Option<Lsn>,
}

impl CursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acknowledged(&self) -> Option<Lsn> {
        self.acknowledged
    }

    /// Records `lsn` on the client and flushes it upstream.
    ///
    /// Returns `false` without touching the client when `lsn` would not
    /// move the position forward.
    pub async fn advance<C: StreamClient>(&mut self, client: &mut C, lsn: Lsn) -> Result<bool> {
        if let Some(last) = self.acknowledged {
            if lsn <= last {
                warn!(
                    %lsn,
                    acknowledged = %last,
                    "Commit position is not ahead of the acknowledged position, skipping"
                );
                return Ok(false);
            }
        }

        client.set_position(lsn);
        client.flush().await?;
        self.acknowledged = Some(lsn);

        debug!("Acknowledged position {}", lsn);
        Ok(true)
    }
}
