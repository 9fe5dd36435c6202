use tracing::{info, trace};

use super::row_decoder::decode_row;
use super::{Event, TransactionBatch};
use crate::config::{EmptyCommitPolicy, UnknownTypePolicy};
use crate::postgres::{Lsn, StreamMessage};
use crate::{Error, Result};

const PUBLICATION_HINT: &str =
    "CREATE PUBLICATION outbox_pub FOR TABLE outbox.events WITH (publish = 'insert');";

#[derive(Debug, Clone, Copy, Default)]
pub struct FramerSettings {
    pub unknown_types: UnknownTypePolicy,
    pub empty_commit: EmptyCommitPolicy,
}

/// Position of the stream relative to transaction boundaries.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum FrameState {
    #[default]
    Idle,
    Accumulating {
        xid: u32,
        events: Vec<Event>,
        omitted_fields: usize,
    },
}

/// What the monitor has to do after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Pending,
    Dispatch(TransactionBatch),
    /// A commit with no events under [`EmptyCommitPolicy::Acknowledge`].
    AcknowledgeOnly(Lsn),
}

impl FrameState {
    /// Consumes one message and returns the next state.
    ///
    /// Row decoding errors and messages arriving outside their transaction
    /// are returned as errors; the state is lost with them since the run
    /// stops anyway.
    pub fn apply(
        self,
        message: StreamMessage,
        settings: &FramerSettings,
    ) -> Result<(FrameState, Frame)> {
        match (self, message) {
            (FrameState::Idle, StreamMessage::Begin { xid, final_lsn }) => {
                trace!(xid, %final_lsn, "Transaction started");
                let state = FrameState::Accumulating {
                    xid,
                    events: Vec::new(),
                    omitted_fields: 0,
                };
                Ok((state, Frame::Pending))
            }
            (FrameState::Accumulating { xid: open, .. }, StreamMessage::Begin { xid, .. }) => {
                Err(Error::Protocol(format!(
                    "BEGIN of transaction {} while transaction {} is still open",
                    xid, open
                )))
            }
            (
                FrameState::Accumulating {
                    xid,
                    mut events,
                    omitted_fields,
                },
                StreamMessage::Insert(row),
            ) => {
                let (event, omitted) = decode_row(&row, settings.unknown_types)?;
                trace!(xid, table = %row.table, ?event, "Decoded outbox row");
                events.push(event);
                let state = FrameState::Accumulating {
                    xid,
                    events,
                    omitted_fields: omitted_fields + omitted,
                };
                Ok((state, Frame::Pending))
            }
            (FrameState::Idle, StreamMessage::Insert(row)) => Err(Error::Protocol(format!(
                "INSERT into {}.{} outside of a transaction",
                row.schema, row.table
            ))),
            (
                FrameState::Accumulating {
                    xid,
                    events,
                    omitted_fields,
                },
                StreamMessage::Commit(commit_lsn),
            ) => {
                if events.is_empty() && settings.empty_commit == EmptyCommitPolicy::Acknowledge {
                    trace!(xid, %commit_lsn, "Transaction carried no outbox rows");
                    return Ok((FrameState::Idle, Frame::AcknowledgeOnly(commit_lsn)));
                }
                let batch = TransactionBatch {
                    xid,
                    commit_lsn,
                    events,
                    omitted_fields,
                };
                Ok((FrameState::Idle, Frame::Dispatch(batch)))
            }
            (FrameState::Idle, StreamMessage::Commit(lsn)) => Err(Error::Protocol(format!(
                "COMMIT at {} without a matching BEGIN",
                lsn
            ))),
            (state, StreamMessage::Relation(relation)) => {
                trace!(
                    "Skipping RELATION message for {}.{}",
                    relation.schema,
                    relation.table
                );
                Ok((state, Frame::Pending))
            }
            (state, StreamMessage::Unsupported(kind)) => {
                info!(
                    "The replication message type {} is not supported. \
                     Update your publication definition to only include inserts: {}",
                    kind, PUBLICATION_HINT
                );
                Ok((state, Frame::Pending))
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, FrameState::Idle)
    }
}
