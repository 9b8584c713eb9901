use async_trait::async_trait;
use tracing::info;

use crate::diagnostics::Category;
use crate::event::Event;

/// Application-supplied processing for each consumed event.
///
/// A record's offset is committed only after `handle` returns `Ok`. Records
/// are redelivered after a restart when it does not, so implementations must
/// be idempotent with respect to the event they receive.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Handler that only logs what it receives.
pub struct LogHandler;

#[async_trait]
impl EventHandler for LogHandler {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        info!(
            category = %Category::Record,
            correlation_id = event.correlation_id(),
            topic = event.topic.as_str(),
            partition = event.partition,
            offset = event.offset,
            size = event.size,
            "Received event"
        );
        Ok(())
    }
}
