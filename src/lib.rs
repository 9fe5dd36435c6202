//! Transactional outbox relay over PostgreSQL logical replication.
//!
//! Rows inserted into an outbox table are read from a `pgoutput` replication
//! slot, grouped by transaction, converted to JSON events and handed to an
//! [`outbox::OutboxHandler`] once per committed transaction. The slot
//! position is acknowledged only after the handler succeeds, giving
//! at-least-once delivery.

pub mod config;
pub mod error;
pub mod monitor;

pub mod outbox;
pub mod postgres;

pub use config::Config;
pub use error::{Error, Result};
pub use monitor::{MonitorStats, OutboxMonitor};
pub use outbox::{handler_fn, Event, OutboxHandler};
pub use tokio_util::sync::CancellationToken;
