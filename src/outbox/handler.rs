use std::future::Future;
use tokio_util::sync::CancellationToken;

use super::Event;

/// User code receiving the events of each committed transaction.
///
/// A failed call is retried with the same events, and a transaction may be
/// delivered again after a restart, so implementations must be idempotent.
pub trait OutboxHandler: Send + Sync {
    fn handle(
        &self,
        events: &[Event],
        cancel: &CancellationToken,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Adapts a closure into an [`OutboxHandler`].
///
/// The closure receives its own copy of the events on every attempt.
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Vec<Event>, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler(f)
}

impl<F, Fut> OutboxHandler for FnHandler<F>
where
    F: Fn(Vec<Event>, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn handle(
        &self,
        events: &[Event],
        cancel: &CancellationToken,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        (self.0)(events.to_vec(), cancel.clone())
    }
}
