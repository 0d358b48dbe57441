use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::{Offset, TopicPartitionList};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::kafka::client::{BrokerClient, BrokerEvent};
use crate::kafka::config::uses_cooperative_rebalance;
use crate::kafka::errors::ConsumerError;
use crate::kafka::message::MessageEnvelope;
use crate::kafka::rebalance_context::{
    ContextEvent, ContextEventReceiver, RebalanceForwardingContext, RebalanceKind,
    RebalanceRequest,
};
use crate::kafka::types::PartitionId;

type ForwardingConsumer = BaseConsumer<RebalanceForwardingContext>;

struct PendingRebalance {
    kind: RebalanceKind,
    ack: SyncSender<()>,
}

enum PollReady {
    Context(Option<ContextEvent>),
    Polled(Result<Option<BrokerEvent>, JoinError>),
}

/// [`BrokerClient`] backed by an rdkafka `BaseConsumer`.
///
/// librdkafka's poll blocks, so each poll runs on the blocking pool. While a poll is
/// parked inside a rebalance callback, the callback's request is surfaced as
/// [`BrokerEvent::Assigned`] / [`BrokerEvent::Revoked`]; the parked poll is resumed
/// on the next call once `assign` / `unassign` has released the callback.
pub struct KafkaBrokerClient {
    consumer: Option<Arc<ForwardingConsumer>>,
    topic: String,
    events: ContextEventReceiver,
    pending_rebalance: Option<PendingRebalance>,
    in_flight_poll: Option<JoinHandle<Option<BrokerEvent>>>,
    closing: Arc<AtomicBool>,
    cooperative: bool,
}

impl KafkaBrokerClient {
    pub fn new(
        config: &ClientConfig,
        rebalance_ack_timeout: Duration,
    ) -> Result<Self, ConsumerError> {
        let closing = Arc::new(AtomicBool::new(false));
        let (context, events) =
            RebalanceForwardingContext::new(closing.clone(), rebalance_ack_timeout);

        let consumer: ForwardingConsumer = config
            .create_with_context(context)
            .map_err(ConsumerError::Create)?;

        Ok(Self {
            consumer: Some(Arc::new(consumer)),
            topic: String::new(),
            events,
            pending_rebalance: None,
            in_flight_poll: None,
            closing,
            cooperative: uses_cooperative_rebalance(config),
        })
    }

    fn consumer(&self) -> KafkaResult<&Arc<ForwardingConsumer>> {
        self.consumer.as_ref().ok_or(KafkaError::Canceled)
    }

    fn partition_list(&self, partitions: &[PartitionId]) -> TopicPartitionList {
        let mut list = TopicPartitionList::new();
        for partition in partitions {
            list.add_partition(&self.topic, partition.partition_number());
        }
        list
    }

    /// Release a parked rebalance callback of the given kind. Returns false when there
    /// was nothing to release.
    fn release_pending(&mut self, kind: RebalanceKind) -> bool {
        match self.pending_rebalance.take() {
            Some(pending) if pending.kind == kind => {
                if pending.ack.send(()).is_err() {
                    warn!("Rebalance callback stopped waiting before {kind:?} was acknowledged");
                }
                true
            }
            other => {
                self.pending_rebalance = other;
                false
            }
        }
    }

    fn accept_context_event(&mut self, event: ContextEvent) -> BrokerEvent {
        match event {
            ContextEvent::Rebalance(RebalanceRequest {
                kind,
                partitions,
                ack,
            }) => {
                if self.pending_rebalance.is_some() {
                    warn!("New {kind:?} rebalance while a previous one is unacknowledged");
                }
                self.pending_rebalance = Some(PendingRebalance { kind, ack });
                match kind {
                    RebalanceKind::Assign => BrokerEvent::Assigned(partitions),
                    RebalanceKind::Revoke => BrokerEvent::Revoked(partitions),
                }
            }
            ContextEvent::Error(e) => BrokerEvent::Error(e),
        }
    }
}

fn poll_once(consumer: &ForwardingConsumer, timeout: Duration) -> Option<BrokerEvent> {
    match consumer.poll(timeout)? {
        Ok(message) => Some(BrokerEvent::Message(MessageEnvelope::from_message(
            &message,
        ))),
        Err(KafkaError::PartitionEOF(partition)) => {
            Some(BrokerEvent::PartitionEof(PartitionId::new(partition)))
        }
        Err(e) => Some(BrokerEvent::Error(e)),
    }
}

#[async_trait]
impl BrokerClient for KafkaBrokerClient {
    fn subscribe(&mut self, topic: &str) -> KafkaResult<()> {
        self.consumer()?.subscribe(&[topic])?;
        self.topic = topic.to_string();
        info!("Subscribed to topic {topic}");
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Option<BrokerEvent> {
        if self.in_flight_poll.is_none() {
            let consumer = match self.consumer() {
                Ok(consumer) => consumer.clone(),
                Err(e) => return Some(BrokerEvent::Error(e)),
            };
            if self.pending_rebalance.is_some() {
                warn!("Polling while a rebalance acknowledgement is outstanding");
            }
            self.in_flight_poll = Some(tokio::task::spawn_blocking(move || {
                poll_once(&consumer, timeout)
            }));
        }

        // The poll task stays stored on self, so a caller dropping this future does
        // not lose whatever the blocking poll returns.
        let ready = {
            let poll_task = self.in_flight_poll.as_mut()?;
            tokio::select! {
                biased;
                event = self.events.recv() => PollReady::Context(event),
                joined = poll_task => PollReady::Polled(joined),
            }
        };

        match ready {
            PollReady::Context(event) => event.map(|event| self.accept_context_event(event)),
            PollReady::Polled(joined) => {
                self.in_flight_poll = None;
                match joined {
                    Ok(event) => event,
                    Err(e) => {
                        error!(error = ?e, "Kafka poll task failed");
                        None
                    }
                }
            }
        }
    }

    fn assign(&mut self, partitions: &[PartitionId]) -> KafkaResult<()> {
        if self.release_pending(RebalanceKind::Assign) {
            return Ok(());
        }
        let list = self.partition_list(partitions);
        let consumer = self.consumer()?;
        if self.cooperative {
            // Cooperative groups reject a full assign outside the rebalance callback
            consumer.incremental_assign(&list)
        } else {
            consumer.assign(&list)
        }
    }

    fn unassign(&mut self) -> KafkaResult<()> {
        if self.release_pending(RebalanceKind::Revoke) {
            return Ok(());
        }
        // A full unassign is accepted under both rebalance protocols
        self.consumer()?.unassign()
    }

    fn commit(&mut self, message: &MessageEnvelope) -> KafkaResult<()> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(
            message.topic(),
            message.partition().partition_number(),
            Offset::Offset(message.offset() + 1),
        )?;
        self.consumer()?.commit(&list, CommitMode::Async)
    }

    async fn close(&mut self) {
        let Some(consumer) = self.consumer.take() else {
            debug!("Kafka consumer already closed");
            return;
        };

        // From here on rebalance callbacks run without coordination and never block
        self.closing.store(true, Ordering::SeqCst);
        self.pending_rebalance = None;
        self.events.close();
        // Buffered requests hold ack senders; dropping them unblocks their callbacks
        while self.events.try_recv().is_ok() {}

        if let Some(poll_task) = self.in_flight_poll.take() {
            if let Err(e) = poll_task.await {
                warn!(error = ?e, "In-flight poll failed during close");
            }
        }

        // Dropping the last reference runs librdkafka's blocking consumer close
        let closed = tokio::task::spawn_blocking(move || {
            consumer.unsubscribe();
            drop(consumer);
        })
        .await;
        match closed {
            Ok(()) => info!("Kafka consumer closed"),
            Err(e) => error!(error = ?e, "Kafka consumer close failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::config::ConsumerConfigBuilder;

    fn client() -> KafkaBrokerClient {
        let config = ConsumerConfigBuilder::new("localhost:9092", "test-group").build();
        KafkaBrokerClient::new(&config, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_rebalance_protocol_follows_assignment_strategy() {
        assert!(!client().cooperative);

        let sticky = ConsumerConfigBuilder::new("localhost:9092", "test-group")
            .with_sticky_partition_assignment(Some("test-client"))
            .build();
        let client = KafkaBrokerClient::new(&sticky, Duration::from_secs(1)).unwrap();
        assert!(client.cooperative);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut client = client();

        client.close().await;
        client.close().await;

        assert!(client.consumer.is_none());
        assert!(client.closing.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_calls_after_close_fail() {
        let mut client = client();
        client.close().await;

        assert!(matches!(
            client.assign(&[PartitionId::new(0)]),
            Err(KafkaError::Canceled)
        ));
        assert!(matches!(client.unassign(), Err(KafkaError::Canceled)));
        assert!(matches!(
            client.poll(Duration::from_millis(10)).await,
            Some(BrokerEvent::Error(KafkaError::Canceled))
        ));
    }

    #[tokio::test]
    async fn test_acknowledgement_releases_pending_rebalance() {
        let mut client = client();
        let (ack, ack_rx) = std::sync::mpsc::sync_channel(1);

        let event = client.accept_context_event(ContextEvent::Rebalance(RebalanceRequest {
            kind: RebalanceKind::Revoke,
            partitions: vec![PartitionId::new(3)],
            ack,
        }));
        assert!(matches!(event, BrokerEvent::Revoked(ref p) if p == &[PartitionId::new(3)]));

        // an assign does not release a pending revoke
        assert!(!client.release_pending(RebalanceKind::Assign));
        assert!(ack_rx.try_recv().is_err());

        client.unassign().unwrap();
        assert!(ack_rx.try_recv().is_ok());
        assert!(client.pending_rebalance.is_none());

        client.close().await;
    }
}
