use rdkafka::Message;
use serde_json::Value;

use crate::error::DeserializeError;
use crate::kafka::types::Partition;

/// One record as delivered by the broker, before any decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub size: usize,
}

impl Record {
    pub fn new(topic: &str, partition: i32, offset: i64, payload: Option<Vec<u8>>) -> Self {
        let size = payload.as_ref().map(|p| p.len()).unwrap_or(0);
        Self {
            topic: topic.to_owned(),
            partition,
            offset,
            key: None,
            payload,
            size,
        }
    }

    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.size += key.len();
        self.key = Some(key);
        self
    }

    pub fn from_message<M: Message>(message: &M) -> Self {
        let key = message.key().map(|k| k.to_vec());
        let payload = message.payload().map(|p| p.to_vec());
        let size = key.as_ref().map(|k| k.len()).unwrap_or(0)
            + payload.as_ref().map(|p| p.len()).unwrap_or(0);

        Self {
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            key,
            payload,
            size,
        }
    }

    pub fn partition_id(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition)
    }
}

/// A deserialized record handed to the application's `EventHandler`.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Value,
    pub size: usize,
    correlation_id: String,
}

impl Event {
    /// Decode a record's JSON payload, pulling the correlation id out of
    /// `correlation_field`. Strings and numbers are accepted as ids; anything
    /// else leaves the id empty.
    pub fn from_record(record: &Record, correlation_field: &str) -> Result<Self, DeserializeError> {
        let Some(payload) = record.payload.as_deref() else {
            return Err(DeserializeError::Empty);
        };
        if payload.is_empty() {
            return Err(DeserializeError::Empty);
        }

        let value: Value = serde_json::from_slice(payload)?;
        let correlation_id = match value.get(correlation_field) {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => String::new(),
        };

        Ok(Self {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            key: record.key.clone(),
            value,
            size: record.size,
            correlation_id,
        })
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}
