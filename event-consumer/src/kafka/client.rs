use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConsumerConfig;
use crate::error::BrokerError;
use crate::event::Record;
use crate::kafka::broker::{BrokerClient, BrokerEvent, EventReceiver, EventSender};
use crate::kafka::config::ConsumerConfigBuilder;
use crate::kafka::context::KafkaConsumerContext;
use crate::kafka::types::{Partition, PartitionOffset, Watermarks};

const METADATA_TIMEOUT: Duration = Duration::from_secs(2);
const METADATA_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// `BrokerClient` backed by an rdkafka `StreamConsumer`.
///
/// Partition assignment is carried out by librdkafka's group protocol before
/// the assignment reaches the consumer, so `assign` checks the live assignment
/// and rejects signals that have gone stale. Revocations are reported before
/// librdkafka gives the partitions up.
pub struct KafkaBroker {
    consumer: Arc<StreamConsumer<KafkaConsumerContext>>,
    events: EventSender,
    max_batch_size: usize,
    connect_task: OnceLock<JoinHandle<()>>,
    poll_task: OnceLock<JoinHandle<()>>,
}

impl KafkaBroker {
    pub fn new(config: &ConsumerConfig) -> Result<(Self, EventReceiver), BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = KafkaConsumerContext::new(tx.clone());

        let client_config = ConsumerConfigBuilder::from_consumer_config(config).build();
        debug!("rdkafka configuration: {:?}", client_config);
        let consumer: StreamConsumer<KafkaConsumerContext> =
            client_config.create_with_context(context)?;

        let broker = Self {
            consumer: Arc::new(consumer),
            events: tx,
            max_batch_size: config.max_batch_size.max(1),
            connect_task: OnceLock::new(),
            poll_task: OnceLock::new(),
        };
        Ok((broker, rx))
    }

    fn assigned_partitions(&self) -> Result<Vec<Partition>, BrokerError> {
        let assignment = self.consumer.assignment()?;
        Ok(assignment
            .elements()
            .into_iter()
            .map(Partition::from)
            .collect())
    }
}

fn partition_list(partitions: &[Partition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for partition in partitions {
        tpl.add_partition(partition.topic(), partition.partition_number());
    }
    tpl
}

impl Drop for KafkaBroker {
    fn drop(&mut self) {
        for task in [self.connect_task.get(), self.poll_task.get()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    fn connect(&self) -> Result<(), BrokerError> {
        if self.connect_task.get().is_some() {
            return Ok(());
        }

        let consumer = self.consumer.clone();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            // The handshake is complete once the cluster answers a metadata request
            loop {
                let probe = consumer.clone();
                let result =
                    tokio::task::spawn_blocking(move || probe.fetch_metadata(None, METADATA_TIMEOUT))
                        .await;

                let failure = match result {
                    Ok(Ok(metadata)) => {
                        info!(
                            "Connected to kafka, {} brokers visible",
                            metadata.brokers().len()
                        );
                        if events.send(BrokerEvent::Ready).is_err() {
                            debug!("Consumer is gone before kafka became ready");
                        }
                        return;
                    }
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => e.to_string(),
                };

                if events
                    .send(BrokerEvent::Error(format!("metadata request failed: {failure}")))
                    .is_err()
                {
                    return;
                }
                tokio::time::sleep(METADATA_RETRY_INTERVAL).await;
            }
        });

        if self.connect_task.set(task).is_err() {
            warn!("Kafka connect was started twice");
        }
        Ok(())
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)?;
        info!("Subscribed to topics {:?}", topics);
        Ok(())
    }

    fn consume(&self) -> Result<(), BrokerError> {
        if self.connect_task.get().is_none() {
            return Err(BrokerError::NotConnected);
        }
        if self.poll_task.get().is_some() {
            return Ok(());
        }

        let consumer = self.consumer.clone();
        let events = self.events.clone();
        let max_batch_size = self.max_batch_size;
        // The channel is unbounded; memory is bounded by pausing partitions
        // whose worker queue is full
        let task = tokio::spawn(async move {
            let batches = consumer.stream().ready_chunks(max_batch_size);
            tokio::pin!(batches);

            while let Some(batch) = batches.next().await {
                debug!("Polled batch of {} messages", batch.len());
                for message in batch {
                    let event = match message {
                        Ok(message) => BrokerEvent::Record(Record::from_message(&message)),
                        Err(e) => BrokerEvent::Error(format!("failed to receive message: {e}")),
                    };
                    if events.send(event).is_err() {
                        info!("Consumer is gone, stopping kafka poll loop");
                        return;
                    }
                }
            }
        });

        if self.poll_task.set(task).is_err() {
            warn!("Kafka poll loop was started twice");
        }
        Ok(())
    }

    async fn commit(&self, offset: &PartitionOffset) -> Result<(), BrokerError> {
        let consumer = self.consumer.clone();
        let topic = offset.topic().to_owned();
        let partition = offset.partition_number();
        let next_offset = offset.offset();

        tokio::task::spawn_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(&topic, partition, Offset::Offset(next_offset))?;
            consumer.commit(&tpl, CommitMode::Sync)
        })
        .await??;

        Ok(())
    }

    fn assign(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        let live = self.assigned_partitions()?;
        let missing: Vec<String> = partitions
            .iter()
            .filter(|partition| !live.contains(*partition))
            .map(Partition::to_string)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::AssignmentRejected(format!(
                "no longer assigned: {}",
                missing.join(", ")
            )))
        }
    }

    fn unassign(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        // librdkafka releases revoked partitions itself once the revoke callback
        // returns. Stop fetching the ones it still holds while their queued
        // records drain.
        let live = self.assigned_partitions()?;
        let held: Vec<Partition> = partitions
            .iter()
            .filter(|partition| live.contains(*partition))
            .cloned()
            .collect();

        if held.is_empty() {
            return Ok(());
        }
        self.pause(&held)
    }

    fn pause(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        self.consumer.pause(&partition_list(partitions))?;
        debug!("Paused fetching for {:?}", partitions);
        Ok(())
    }

    fn resume(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        self.consumer.resume(&partition_list(partitions))?;
        debug!("Resumed fetching for {:?}", partitions);
        Ok(())
    }

    async fn query_watermark_offsets(
        &self,
        partition: &Partition,
        timeout: Duration,
    ) -> Result<Watermarks, BrokerError> {
        let consumer = self.consumer.clone();
        let topic = partition.topic().to_owned();
        let partition_number = partition.partition_number();

        let (low, high) = tokio::task::spawn_blocking(move || {
            consumer.fetch_watermarks(&topic, partition_number, timeout)
        })
        .await??;

        Ok(Watermarks { low, high })
    }
}
