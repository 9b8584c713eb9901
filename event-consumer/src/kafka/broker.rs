use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BrokerError;
use crate::event::Record;
use crate::kafka::types::{Partition, PartitionOffset, Watermarks};

/// Partition ownership change reported by the group protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum RebalanceSignal {
    Assign(Vec<Partition>),
    Revoke(Vec<Partition>),
    /// Any rebalance outcome that is neither an assignment nor a revocation
    Error(String),
}

/// Everything a broker client reports back to the consumer.
///
/// Events are delivered in order on a single channel, so the consumer sees
/// readiness, records, and rebalances serialized the way the broker emitted them.
#[derive(Debug)]
pub enum BrokerEvent {
    Ready,
    Record(Record),
    Rebalance(RebalanceSignal),
    Disconnected(String),
    Error(String),
    Log {
        level: tracing::Level,
        facility: String,
        message: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<BrokerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<BrokerEvent>;

/// Capabilities the consumer needs from a partitioned log client.
///
/// Implementations push `BrokerEvent`s on the channel handed out alongside the
/// client when it is built.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Start connecting. Completion is reported with `BrokerEvent::Ready`.
    fn connect(&self) -> Result<(), BrokerError>;

    fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError>;

    /// Start delivering records as `BrokerEvent::Record`.
    fn consume(&self) -> Result<(), BrokerError>;

    /// Commit the next offset to consume for one partition.
    async fn commit(&self, offset: &PartitionOffset) -> Result<(), BrokerError>;

    /// Take ownership of partitions handed out by a rebalance.
    fn assign(&self, partitions: &[Partition]) -> Result<(), BrokerError>;

    /// Release partitions taken away by a rebalance.
    fn unassign(&self, partitions: &[Partition]) -> Result<(), BrokerError>;

    /// Stop fetching records for partitions whose queue is full.
    fn pause(&self, partitions: &[Partition]) -> Result<(), BrokerError>;

    fn resume(&self, partitions: &[Partition]) -> Result<(), BrokerError>;

    async fn query_watermark_offsets(
        &self,
        partition: &Partition,
        timeout: Duration,
    ) -> Result<Watermarks, BrokerError>;
}
