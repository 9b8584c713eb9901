use std::fmt;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "event-consumer")]
    pub kafka_consumer_group: String,

    // Comma separated
    #[envconfig(default = "user")]
    pub kafka_consumer_topics: TopicList,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: OffsetReset,

    #[envconfig(default = "100")]
    pub kafka_consumer_max_batch_size: usize,

    #[envconfig(default = "3000")]
    pub kafka_connect_timeout_ms: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub kafka_watermark_timeout_ms: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub kafka_partition_queue_size: usize,

    #[envconfig(default = "per_record")]
    pub commit_policy: CommitPolicy,

    #[envconfig(default = "guid")]
    pub correlation_id_field: String,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            brokers: self.kafka_hosts.clone(),
            tls: self.kafka_tls,
            group_id: self.kafka_consumer_group.clone(),
            offset_reset: self.kafka_consumer_offset_reset,
            max_batch_size: self.kafka_consumer_max_batch_size.max(1),
            topics: self.kafka_consumer_topics.0.clone(),
            connect_timeout: self.kafka_connect_timeout_ms.0,
            watermark_timeout: self.kafka_watermark_timeout_ms.0,
            partition_queue_size: self.kafka_partition_queue_size.max(1),
            commit_policy: self.commit_policy,
            correlation_id_field: self.correlation_id_field.clone(),
        }
    }
}

/// Settings for one consumer instance. Built once and shared read-only.
///
/// There is deliberately no auto-commit switch: offsets are only ever
/// committed after the handler for a record succeeded.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub brokers: String,
    pub tls: bool,
    pub group_id: String,
    pub offset_reset: OffsetReset,
    pub max_batch_size: usize,
    pub topics: Vec<String>,
    pub connect_timeout: time::Duration,
    pub watermark_timeout: time::Duration,
    pub partition_queue_size: usize,
    pub commit_policy: CommitPolicy,
    pub correlation_id_field: String,
}

impl ConsumerConfig {
    pub fn new(brokers: &str, group_id: &str, topics: Vec<String>) -> Self {
        Self {
            brokers: brokers.to_owned(),
            tls: false,
            group_id: group_id.to_owned(),
            offset_reset: OffsetReset::Earliest,
            max_batch_size: 100,
            topics,
            connect_timeout: time::Duration::from_millis(3000),
            watermark_timeout: time::Duration::from_millis(5000),
            partition_queue_size: 1000,
            commit_policy: CommitPolicy::PerRecord,
            correlation_id_field: "guid".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicList(pub Vec<String>);

#[derive(Debug, PartialEq, Eq)]
pub struct EmptyTopicListError;

impl FromStr for TopicList {
    type Err = EmptyTopicListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let topics: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .map(str::to_owned)
            .collect();

        if topics.is_empty() {
            Err(EmptyTopicListError)
        } else {
            Ok(TopicList(topics))
        }
    }
}

/// Where to start reading when the group has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseOffsetResetError(String);

impl FromStr for OffsetReset {
    type Err = ParseOffsetResetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_ref() {
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            invalid => Err(ParseOffsetResetError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a successfully handled record's offset may be committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Commit `offset + 1` after every successful record.
    PerRecord,
    /// Stop committing on a partition after its first failed record, so the
    /// failed record is redelivered after a restart.
    Contiguous,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseCommitPolicyError(String);

impl FromStr for CommitPolicy {
    type Err = ParseCommitPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_ref() {
            "per_record" => Ok(CommitPolicy::PerRecord),
            "contiguous" => Ok(CommitPolicy::Contiguous),
            invalid => Err(ParseCommitPolicyError(invalid.to_owned())),
        }
    }
}
