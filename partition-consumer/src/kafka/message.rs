use bytes::Bytes;
use rdkafka::message::{Headers, Message};

use crate::kafka::types::PartitionId;

/// A single message header. Kafka allows null header values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    key: String,
    value: Option<Bytes>,
}

impl MessageHeader {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }
}

/// An owned, immutable copy of a message read from the broker.
///
/// Handlers see the partition, key, payload and headers. Topic and offset are kept
/// so the message can be committed when it never reaches a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    topic: String,
    partition: PartitionId,
    offset: i64,
    key: Option<Bytes>,
    payload: Option<Bytes>,
    headers: Vec<MessageHeader>,
    timestamp_ms: Option<i64>,
}

impl MessageEnvelope {
    pub fn new(topic: impl Into<String>, partition: PartitionId, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: None,
            headers: Vec::new(),
            timestamp_ms: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push(MessageHeader {
            key: key.into(),
            value: Some(value.into()),
        });
        self
    }

    pub fn with_timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    /// Copy a message out of librdkafka's buffers.
    pub fn from_message<M: Message>(message: &M) -> Self {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| MessageHeader {
                        key: header.key.to_string(),
                        value: header.value.map(Bytes::copy_from_slice),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            topic: message.topic().to_string(),
            partition: PartitionId::new(message.partition()),
            offset: message.offset(),
            key: message.key().map(Bytes::copy_from_slice),
            payload: message.payload().map(Bytes::copy_from_slice),
            headers,
            timestamp_ms: message.timestamp().to_millis(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn headers(&self) -> &[MessageHeader] {
        &self.headers
    }

    pub fn timestamp_ms(&self) -> Option<i64> {
        self.timestamp_ms
    }

    /// Value of the header with this key. When a key repeats, the last one wins.
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .rev()
            .find(|header| header.key == key)
            .and_then(|header| header.value())
    }

    /// Header value as UTF-8, `None` when absent or not valid UTF-8
    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.header(key)
            .and_then(|value| std::str::from_utf8(value).ok())
    }
}
