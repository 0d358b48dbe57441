use std::sync::Arc;
use std::time::{Duration, Instant};

use rdkafka::error::{KafkaError, KafkaResult};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::handler::MessageHandler;
use crate::kafka::client::{BrokerClient, BrokerEvent};
use crate::kafka::errors::{classify, error_label, ConsumerError, ErrorSeverity};
use crate::kafka::message::MessageEnvelope;
use crate::kafka::rebalance_coordinator::RebalanceCoordinator;
use crate::kafka::worker_pool::WorkerPool;
use crate::metrics_consts::{
    BROKER_ERRORS, HANDOFF_WAIT_MS, MESSAGES_RECEIVED, MESSAGES_SKIPPED, PARTITION_EOF,
    REBALANCE_ACK_FAILURES,
};

/// Tuning for the dispatch loop
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Upper bound for a single broker poll
    pub poll_timeout: Duration,
    /// How long a revocation waits for a worker to drain. `None` waits forever.
    pub worker_drain_timeout: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            worker_drain_timeout: None,
        }
    }
}

/// Consumes one topic, fanning messages out to one worker per assigned partition.
///
/// `run` owns the dispatch loop: it polls the broker client, hands messages to the
/// worker of their partition and lets the [`RebalanceCoordinator`] follow assignment
/// changes. The session ends on a fatal broker error or when the shutdown token is
/// cancelled, and always finishes with a full drain of the workers.
pub struct PartitionConsumer<C: BrokerClient> {
    client: C,
    topic: String,
    pool: Arc<WorkerPool>,
    coordinator: RebalanceCoordinator,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    poll_timeout: Duration,
}

impl<C: BrokerClient> PartitionConsumer<C> {
    /// Subscribe `client` to the handler's topic. Nothing is spawned until `run`.
    pub fn new(
        mut client: C,
        handler: Arc<dyn MessageHandler>,
        config: DispatchConfig,
    ) -> Result<Self, ConsumerError> {
        let topic = handler.topic().to_string();
        client
            .subscribe(&topic)
            .map_err(|source| ConsumerError::Subscribe {
                topic: topic.clone(),
                source,
            })?;

        let pool = Arc::new(WorkerPool::new());
        let tracker = TaskTracker::new();
        let coordinator = RebalanceCoordinator::new(
            topic.clone(),
            pool.clone(),
            handler,
            tracker.clone(),
            config.worker_drain_timeout,
        );

        Ok(Self {
            client,
            topic,
            pool,
            coordinator,
            tracker,
            shutdown: CancellationToken::new(),
            poll_timeout: config.poll_timeout,
        })
    }

    /// Cancelling this token ends `run` with a graceful shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn pool(&self) -> Arc<WorkerPool> {
        self.pool.clone()
    }

    /// Run the dispatch loop until shutdown is requested or the broker fails fatally.
    pub async fn run(mut self) -> Result<(), ConsumerError> {
        info!(topic = %self.topic, "Starting partition consumer");

        let outcome = loop {
            let polled = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                event = self.client.poll(self.poll_timeout) => Some(event),
            };

            let event = match polled {
                None => {
                    info!("Shutdown requested, stopping dispatch loop");
                    break Ok(());
                }
                Some(None) => continue,
                Some(Some(event)) => event,
            };

            if let Err(e) = self.dispatch(event).await {
                break Err(ConsumerError::Fatal(e));
            }
        };

        self.shutdown().await;
        outcome
    }

    /// Act on one polled event. An error means the session must end.
    async fn dispatch(&mut self, event: BrokerEvent) -> Result<(), KafkaError> {
        match event {
            BrokerEvent::Message(envelope) => {
                self.route(envelope).await;
                Ok(())
            }
            BrokerEvent::PartitionEof(partition) => {
                metrics::counter!(PARTITION_EOF).increment(1);
                debug!(%partition, "Reached end of partition");
                Ok(())
            }
            BrokerEvent::Assigned(partitions) => {
                let result = self
                    .coordinator
                    .assign(&mut self.client, &partitions)
                    .await;
                check_acknowledgement("assign", result)
            }
            BrokerEvent::Revoked(partitions) => {
                let result = self
                    .coordinator
                    .revoke(&mut self.client, &partitions)
                    .await;
                check_acknowledgement("revoke", result)
            }
            BrokerEvent::Error(e) => handle_broker_error(e),
        }
    }

    async fn route(&mut self, envelope: MessageEnvelope) {
        metrics::counter!(MESSAGES_RECEIVED).increment(1);
        let partition = envelope.partition();
        let envelope = Arc::new(envelope);

        // The inbox is cloned out of the pool, no guard is held while we wait
        let Some(inbox) = self.pool.inbox(partition) else {
            self.skip(&envelope, "no_worker");
            return;
        };

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            result = inbox.hand_off(envelope.clone()) => result,
            _ = self.shutdown.cancelled() => {
                debug!(%partition, offset = envelope.offset(), "Shutdown requested during handoff");
                return;
            }
        };
        metrics::histogram!(HANDOFF_WAIT_MS).record(started.elapsed().as_millis() as f64);

        if let Err(e) = result {
            warn!(error = ?e, "Worker did not accept message");
            self.skip(&envelope, "worker_stopped");
        }
    }

    /// Commit a message that will never reach a handler
    fn skip(&mut self, envelope: &MessageEnvelope, reason: &'static str) {
        metrics::counter!(MESSAGES_SKIPPED, "reason" => reason).increment(1);
        warn!(
            partition = %envelope.partition(),
            offset = envelope.offset(),
            reason,
            "Message not processed, committing without handling"
        );

        if let Err(e) = self.client.commit(envelope) {
            error!(
                partition = %envelope.partition(),
                offset = envelope.offset(),
                error = ?e,
                "Failed to commit skipped message"
            );
        }
    }

    /// Stop and drain every worker, release the assignment, wait for every worker
    /// task, then close the client.
    async fn shutdown(&mut self) {
        info!("Shutting down partition consumer");

        let stopped = self.coordinator.stop_all().await;

        if let Err(e) = self.client.unassign() {
            warn!(error = ?e, "Failed to unassign partitions during shutdown");
        }

        self.tracker.close();
        self.tracker.wait().await;

        self.client.close().await;
        info!(
            workers = stopped.len(),
            "Partition consumer shut down gracefully"
        );
    }
}

fn check_acknowledgement(
    event_type: &'static str,
    result: KafkaResult<()>,
) -> Result<(), KafkaError> {
    let Err(e) = result else {
        return Ok(());
    };

    metrics::counter!(REBALANCE_ACK_FAILURES, "event_type" => event_type).increment(1);
    match classify(&e) {
        ErrorSeverity::Fatal => {
            error!(event_type, error = ?e, "Rebalance acknowledgement failed fatally");
            Err(e)
        }
        ErrorSeverity::Transient => {
            warn!(event_type, error = ?e, "Rebalance acknowledgement failed");
            Ok(())
        }
    }
}

fn handle_broker_error(e: KafkaError) -> Result<(), KafkaError> {
    let severity = classify(&e);
    metrics::counter!(
        BROKER_ERRORS,
        &[("level", severity.as_str()), ("error", error_label(&e))]
    )
    .increment(1);

    match severity {
        ErrorSeverity::Fatal => {
            error!(error = ?e, "Fatal broker error, shutting down");
            Err(e)
        }
        ErrorSeverity::Transient => {
            warn!(error = ?e, "Broker error, continuing to poll");
            Ok(())
        }
    }
}
