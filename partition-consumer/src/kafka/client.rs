use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::{KafkaError, KafkaResult};

use crate::kafka::message::MessageEnvelope;
use crate::kafka::types::PartitionId;

/// What a single poll of the broker client produced.
#[derive(Debug)]
pub enum BrokerEvent {
    /// A data message for one partition
    Message(MessageEnvelope),
    /// The consumer group handed these partitions to this consumer
    Assigned(Vec<PartitionId>),
    /// The consumer group is taking these partitions away
    Revoked(Vec<PartitionId>),
    /// The consumer caught up with the end of a partition
    PartitionEof(PartitionId),
    /// A broker or client error, classified by the dispatch loop
    Error(KafkaError),
}

/// The broker capabilities the dispatch loop and rebalance coordinator rely on.
///
/// `assign` and `unassign` acknowledge a rebalance previously reported through
/// [`BrokerEvent::Assigned`] / [`BrokerEvent::Revoked`]. Outside of a pending
/// rebalance they change the assignment directly.
#[async_trait]
pub trait BrokerClient: Send {
    fn subscribe(&mut self, topic: &str) -> KafkaResult<()>;

    /// Wait up to `timeout` for the next event. `None` means nothing happened.
    async fn poll(&mut self, timeout: Duration) -> Option<BrokerEvent>;

    fn assign(&mut self, partitions: &[PartitionId]) -> KafkaResult<()>;

    fn unassign(&mut self) -> KafkaResult<()>;

    fn commit(&mut self, message: &MessageEnvelope) -> KafkaResult<()>;

    /// Release the connection. Later calls are no-ops.
    async fn close(&mut self);
}
