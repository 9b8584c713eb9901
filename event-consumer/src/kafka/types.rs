use std::collections::BTreeSet;
use std::fmt;

use rdkafka::topic_partition_list::TopicPartitionListElem;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic().to_string(), elem.partition())
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

/// A commit target: the next offset to consume on a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    partition: Partition,
    offset: i64,
}

impl PartitionOffset {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

impl fmt::Display for PartitionOffset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// Lowest and highest retained offsets of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: i64,
    pub high: i64,
}

/// The set of partitions currently owned by this consumer instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionAssignment {
    partitions: BTreeSet<Partition>,
}

impl PartitionAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the owned set, returning the partitions that are no longer owned.
    pub fn replace(&mut self, partitions: &[Partition]) -> Vec<Partition> {
        let next: BTreeSet<Partition> = partitions.iter().cloned().collect();
        let released = self.partitions.difference(&next).cloned().collect();
        self.partitions = next;
        released
    }

    /// Drop ownership of the given partitions, returning the ones that were owned.
    pub fn remove(&mut self, partitions: &[Partition]) -> Vec<Partition> {
        partitions
            .iter()
            .filter(|partition| self.partitions.remove(*partition))
            .cloned()
            .collect()
    }

    pub fn contains(&self, partition: &Partition) -> bool {
        self.partitions.contains(partition)
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}
