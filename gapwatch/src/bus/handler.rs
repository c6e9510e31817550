use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use gapwatch_core::{Event, GapwatchError};

/// Receives events from the bus.
///
/// Events arrive behind an `Arc` and are shared with sibling handlers, so
/// handlers only ever read them.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event. An error is logged and turned into an error event.
    async fn handle(&self, event: Arc<Event>) -> Result<(), GapwatchError>;
}

/// Predicate deciding whether a subscription sees an event.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), GapwatchError>> + Send + 'static,
{
    async fn handle(&self, event: Arc<Event>) -> Result<(), GapwatchError> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), GapwatchError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Wrap a closure as a filter.
pub fn filter_fn<F>(f: F) -> EventFilter
where
    F: Fn(&Event) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}
