//! The relay core: framing, row decoding, dispatch and acknowledgment.

pub mod cursor;
pub mod dispatcher;
pub mod framer;
pub mod handler;
pub mod row_decoder;

pub use cursor::CursorTracker;
pub use dispatcher::{dispatch, DispatchOutcome, RetryPolicy};
pub use framer::{Frame, FrameState, FramerSettings};
pub use handler::{handler_fn, FnHandler, OutboxHandler};
pub use row_decoder::{decode_field, decode_row, TypeClass};

use crate::postgres::Lsn;

/// One decoded outbox row; fields keep the table's column order.
pub type Event = serde_json::Map<String, serde_json::Value>;

/// The events of one committed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionBatch {
    pub xid: u32,
    pub commit_lsn: Lsn,
    pub events: Vec<Event>,
    /// Columns dropped because their type has no mapping.
    pub omitted_fields: usize,
}

impl TransactionBatch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
