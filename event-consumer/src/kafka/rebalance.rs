//! Rebalance Coordinator
//!
//! Applies partition ownership changes reported by the broker. Ownership
//! follows `Unassigned -> Assigned -> Unassigned` as the group rebalances.
//!
//! Nothing here may fail the caller: rebalances are driven by the broker, and a
//! failure applying one is logged and left for the next rebalance to correct.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::diagnostics::{Category, NO_CORRELATION_ID};
use crate::error::ConsumerError;
use crate::kafka::broker::{BrokerClient, RebalanceSignal};
use crate::kafka::types::{Partition, PartitionAssignment};
use crate::metrics_consts::{ASSIGNED_PARTITIONS, REBALANCES, REBALANCE_ERRORS};

/// Result of applying one rebalance signal.
#[derive(Debug, Default)]
pub struct RebalanceOutcome {
    /// Partitions this consumer stopped owning
    pub released: Vec<Partition>,
    /// Diagnostic watermark lookup started for a new assignment
    pub watermark_probe: Option<JoinHandle<()>>,
}

pub struct RebalanceCoordinator {
    broker: Arc<dyn BrokerClient>,
    assignment: PartitionAssignment,
    publisher: watch::Sender<PartitionAssignment>,
    watermark_timeout: Duration,
}

impl RebalanceCoordinator {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        watermark_timeout: Duration,
    ) -> (Self, watch::Receiver<PartitionAssignment>) {
        let (publisher, subscriber) = watch::channel(PartitionAssignment::new());
        let coordinator = Self {
            broker,
            assignment: PartitionAssignment::new(),
            publisher,
            watermark_timeout,
        };
        (coordinator, subscriber)
    }

    pub fn assignment(&self) -> &PartitionAssignment {
        &self.assignment
    }

    pub fn handle(&mut self, signal: RebalanceSignal) -> RebalanceOutcome {
        let outcome = match signal {
            RebalanceSignal::Assign(partitions) => {
                metrics::counter!(REBALANCES, "event_type" => "assign").increment(1);
                self.on_assign(partitions)
            }
            RebalanceSignal::Revoke(partitions) => {
                metrics::counter!(REBALANCES, "event_type" => "revoke").increment(1);
                self.on_revoke(partitions)
            }
            RebalanceSignal::Error(reason) => {
                metrics::counter!(REBALANCES, "event_type" => "error").increment(1);
                error!(
                    category = %Category::Rebalance,
                    correlation_id = NO_CORRELATION_ID,
                    error = %ConsumerError::Unclassified(reason),
                    "Rebalance reported an error"
                );
                RebalanceOutcome::default()
            }
        };

        metrics::gauge!(ASSIGNED_PARTITIONS).set(self.assignment.len() as f64);
        self.publisher.send_replace(self.assignment.clone());
        outcome
    }

    fn on_assign(&mut self, partitions: Vec<Partition>) -> RebalanceOutcome {
        if let Err(e) = self.broker.assign(&partitions) {
            metrics::counter!(REBALANCE_ERRORS, "event_type" => "assign").increment(1);
            error!(
                category = %Category::Rebalance,
                correlation_id = NO_CORRELATION_ID,
                partitions = ?partitions,
                error = %ConsumerError::Rebalance(e),
                "Failed to apply partition assignment"
            );
            return RebalanceOutcome::default();
        }

        let released = self.assignment.replace(&partitions);
        info!(
            category = %Category::Rebalance,
            correlation_id = NO_CORRELATION_ID,
            assigned = ?partitions,
            released = ?released,
            "Partitions assigned"
        );

        let watermark_probe = partitions
            .first()
            .cloned()
            .map(|first| self.spawn_watermark_probe(first));

        RebalanceOutcome {
            released,
            watermark_probe,
        }
    }

    fn on_revoke(&mut self, partitions: Vec<Partition>) -> RebalanceOutcome {
        // The broker has already taken these partitions, so ownership is
        // dropped even when the client disagrees.
        if let Err(e) = self.broker.unassign(&partitions) {
            metrics::counter!(REBALANCE_ERRORS, "event_type" => "revoke").increment(1);
            error!(
                category = %Category::Rebalance,
                correlation_id = NO_CORRELATION_ID,
                partitions = ?partitions,
                error = %ConsumerError::Rebalance(e),
                "Failed to release revoked partitions"
            );
        }

        let released = self.assignment.remove(&partitions);
        info!(
            category = %Category::Rebalance,
            correlation_id = NO_CORRELATION_ID,
            revoked = ?partitions,
            "Partitions revoked"
        );

        RebalanceOutcome {
            released,
            watermark_probe: None,
        }
    }

    /// Best effort: the result is only logged and never affects the assignment.
    fn spawn_watermark_probe(&self, partition: Partition) -> JoinHandle<()> {
        let broker = self.broker.clone();
        let timeout = self.watermark_timeout;

        tokio::spawn(async move {
            match broker.query_watermark_offsets(&partition, timeout).await {
                Ok(watermarks) => info!(
                    category = %Category::Watermark,
                    correlation_id = NO_CORRELATION_ID,
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    low = watermarks.low,
                    high = watermarks.high,
                    "Watermark offsets"
                ),
                Err(e) => warn!(
                    category = %Category::Watermark,
                    correlation_id = NO_CORRELATION_ID,
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    error = %e,
                    "Failed to query watermark offsets"
                ),
            }
        })
    }
}
