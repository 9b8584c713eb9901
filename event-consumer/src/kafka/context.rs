use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::{ClientContext, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::kafka::broker::{BrokerEvent, EventSender, RebalanceSignal};
use crate::kafka::types::Partition;

/// rdkafka context that turns librdkafka callbacks into `BrokerEvent`s.
///
/// Callbacks run on librdkafka's threads. They only translate and enqueue, so
/// nothing raised by the consumer side can unwind into librdkafka.
pub struct KafkaConsumerContext {
    events: EventSender,
}

impl KafkaConsumerContext {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }

    fn forward(&self, event: BrokerEvent) {
        if let Err(e) = self.events.send(event) {
            debug!("Dropping broker event, consumer is gone: {:?}", e.0);
        }
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<Partition> {
    tpl.elements().into_iter().map(Partition::from).collect()
}

fn tracing_level(level: RDKafkaLogLevel) -> tracing::Level {
    match level {
        RDKafkaLogLevel::Emerg
        | RDKafkaLogLevel::Alert
        | RDKafkaLogLevel::Critical
        | RDKafkaLogLevel::Error => tracing::Level::ERROR,
        RDKafkaLogLevel::Warning => tracing::Level::WARN,
        RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => tracing::Level::INFO,
        RDKafkaLogLevel::Debug => tracing::Level::DEBUG,
    }
}

impl ClientContext for KafkaConsumerContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        self.forward(BrokerEvent::Log {
            level: tracing_level(level),
            facility: fac.to_owned(),
            message: log_message.to_owned(),
        });
    }

    fn error(&self, error: KafkaError, reason: &str) {
        let event = match error.rdkafka_error_code() {
            Some(RDKafkaErrorCode::AllBrokersDown) => BrokerEvent::Disconnected(reason.to_owned()),
            _ => BrokerEvent::Error(format!("{error}: {reason}")),
        };
        self.forward(event);
    }
}

/// Revocations are forwarded before librdkafka gives the partitions up, so
/// their queued records can still commit while this member owns them.
fn pre_rebalance_signal(rebalance: &Rebalance) -> Option<RebalanceSignal> {
    match rebalance {
        // Cooperative rebalances revoke nothing when membership changes elsewhere
        Rebalance::Revoke(partitions) if partitions.count() == 0 => None,
        Rebalance::Revoke(partitions) => Some(RebalanceSignal::Revoke(partitions_of(partitions))),
        Rebalance::Assign(_) | Rebalance::Error(_) => None,
    }
}

/// Assignments are forwarded after librdkafka applied them, so the consumer
/// can reconcile against the live assignment.
fn post_rebalance_signal(rebalance: &Rebalance) -> Option<RebalanceSignal> {
    match rebalance {
        Rebalance::Assign(partitions) => Some(RebalanceSignal::Assign(partitions_of(partitions))),
        Rebalance::Revoke(_) => None,
        Rebalance::Error(e) => Some(RebalanceSignal::Error(e.to_string())),
    }
}

impl ConsumerContext for KafkaConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Pre-rebalance event: {:?}", rebalance);
        if let Some(signal) = pre_rebalance_signal(rebalance) {
            self.forward(BrokerEvent::Rebalance(signal));
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Post-rebalance event: {:?}", rebalance);
        if let Some(signal) = post_rebalance_signal(rebalance) {
            self.forward(BrokerEvent::Rebalance(signal));
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!("Commit of {} partitions reported failure: {}", offsets.count(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::Offset;
    use tokio::sync::mpsc;

    #[test]
    fn test_partitions_of_keeps_assignment_order() {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset("user", 2, Offset::Beginning).unwrap();
        tpl.add_partition_offset("user", 0, Offset::Beginning).unwrap();

        assert_eq!(
            partitions_of(&tpl),
            vec![
                Partition::new("user".to_string(), 2),
                Partition::new("user".to_string(), 0),
            ]
        );
    }

    #[test]
    fn test_revoke_is_signalled_before_the_rebalance() {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition("user", 0);
        let revoke = Rebalance::Revoke(&tpl);

        assert_eq!(
            pre_rebalance_signal(&revoke),
            Some(RebalanceSignal::Revoke(vec![Partition::new("user".to_string(), 0)]))
        );
        assert_eq!(post_rebalance_signal(&revoke), None);
    }

    #[test]
    fn test_assign_is_signalled_after_the_rebalance() {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition("user", 1);
        let assign = Rebalance::Assign(&tpl);

        assert_eq!(pre_rebalance_signal(&assign), None);
        assert_eq!(
            post_rebalance_signal(&assign),
            Some(RebalanceSignal::Assign(vec![Partition::new("user".to_string(), 1)]))
        );
    }

    #[test]
    fn test_empty_revoke_is_skipped() {
        let tpl = TopicPartitionList::new();
        assert_eq!(pre_rebalance_signal(&Rebalance::Revoke(&tpl)), None);
    }

    #[test]
    fn test_all_brokers_down_is_a_disconnect() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let context = KafkaConsumerContext::new(tx);

        context.error(
            KafkaError::Global(RDKafkaErrorCode::AllBrokersDown),
            "3/3 brokers are down",
        );
        context.error(
            KafkaError::Global(RDKafkaErrorCode::BrokerTransportFailure),
            "connection reset",
        );

        assert!(matches!(rx.try_recv(), Ok(BrokerEvent::Disconnected(reason)) if reason == "3/3 brokers are down"));
        assert!(matches!(rx.try_recv(), Ok(BrokerEvent::Error(_))));
    }

    #[test]
    fn test_log_lines_are_forwarded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let context = KafkaConsumerContext::new(tx);

        context.log(RDKafkaLogLevel::Warning, "FAIL", "broker went away");

        match rx.try_recv() {
            Ok(BrokerEvent::Log {
                level,
                facility,
                message,
            }) => {
                assert_eq!(level, tracing::Level::WARN);
                assert_eq!(facility, "FAIL");
                assert_eq!(message, "broker went away");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_forward_after_consumer_is_gone_does_not_panic() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let context = KafkaConsumerContext::new(tx);
        context.error(KafkaError::Canceled, "shutting down");
    }
}
