use std::time::Duration;

use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::kafka::types::{Partition, PartitionOffset};

/// Failures reported by a `BrokerClient` implementation.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("assignment rejected: {0}")]
    AssignmentRejected(String),
    #[error("broker client is not connected")]
    NotConnected,
    #[error("broker event channel closed")]
    Closed,
    #[error("blocking broker call did not complete: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Reasons a record payload could not be turned into an `Event`.
#[derive(Error, Debug)]
pub enum DeserializeError {
    #[error("received empty payload")]
    Empty,
    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Enumeration of consumer failures.
///
/// Only `ConnectionTimeout` and `Broker` ever reach a caller. Everything else is
/// recovered where it happens and only surfaces through the logs.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("consumer did not become ready within {0:?}")]
    ConnectionTimeout(Duration),
    #[error("handler failed for {partition} offset {offset}: {source}")]
    RecordHandling {
        partition: Partition,
        offset: i64,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to commit {offset}: {source}")]
    Commit {
        offset: PartitionOffset,
        #[source]
        source: BrokerError,
    },
    #[error("failed to apply rebalance: {0}")]
    Rebalance(#[source] BrokerError),
    #[error("unclassified consumer error: {0}")]
    Unclassified(String),
    #[error("failed to deserialize record: {0}")]
    Deserialize(#[from] DeserializeError),
    #[error("broker client error: {0}")]
    Broker(#[from] BrokerError),
}
