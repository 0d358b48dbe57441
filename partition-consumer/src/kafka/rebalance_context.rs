use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaError;
use rdkafka::ClientContext;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::kafka::errors::{classify, ErrorSeverity};
use crate::kafka::types::{format_partitions, PartitionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceKind {
    Assign,
    Revoke,
}

/// A rebalance the librdkafka callback is blocked on until `ack` fires.
#[derive(Debug)]
pub struct RebalanceRequest {
    pub kind: RebalanceKind,
    pub partitions: Vec<PartitionId>,
    pub ack: SyncSender<()>,
}

/// Events raised inside librdkafka callbacks for the polling side to pick up
#[derive(Debug)]
pub enum ContextEvent {
    Rebalance(RebalanceRequest),
    Error(KafkaError),
}

pub type ContextEventReceiver = mpsc::UnboundedReceiver<ContextEvent>;

/// Consumer context that hands rebalances to the application instead of letting
/// librdkafka apply them immediately.
///
/// librdkafka invokes `pre_rebalance` on the thread that is polling, before it changes
/// the assignment. The context forwards the partitions and blocks that thread until the
/// rebalance coordinator acknowledges (workers started, or workers drained), so the
/// broker never delivers to a partition without a worker and never hands a partition to
/// another consumer while it is still being processed here.
pub struct RebalanceForwardingContext {
    events: mpsc::UnboundedSender<ContextEvent>,
    closing: Arc<AtomicBool>,
    ack_timeout: Duration,
}

impl RebalanceForwardingContext {
    pub fn new(
        closing: Arc<AtomicBool>,
        ack_timeout: Duration,
    ) -> (Self, ContextEventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                events,
                closing,
                ack_timeout,
            },
            rx,
        )
    }

    fn forward_rebalance(&self, kind: RebalanceKind, partitions: Vec<PartitionId>) {
        let description = format_partitions(&partitions);
        let (ack, ack_rx) = sync_channel(1);
        let request = RebalanceRequest {
            kind,
            partitions,
            ack,
        };

        if self.events.send(ContextEvent::Rebalance(request)).is_err() {
            warn!("Rebalance {kind:?} {description} not forwarded, consumer is shutting down");
            return;
        }

        match ack_rx.recv_timeout(self.ack_timeout) {
            Ok(()) => debug!("Rebalance {kind:?} {description} acknowledged"),
            Err(RecvTimeoutError::Timeout) => error!(
                "Rebalance {kind:?} {description} not acknowledged within {:?}, letting librdkafka proceed",
                self.ack_timeout
            ),
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Rebalance {kind:?} {description} dropped without acknowledgement")
            }
        }
    }
}

impl ClientContext for RebalanceForwardingContext {
    fn error(&self, error: KafkaError, reason: &str) {
        match classify(&error) {
            ErrorSeverity::Fatal => {
                error!(error = ?error, reason, "Fatal librdkafka error");
                if self.events.send(ContextEvent::Error(error)).is_err() {
                    debug!("Fatal error not forwarded, consumer is shutting down");
                }
            }
            ErrorSeverity::Transient => {
                warn!(error = ?error, reason, "librdkafka error");
            }
        }
    }
}

impl ConsumerContext for RebalanceForwardingContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if self.closing.load(Ordering::SeqCst) {
            debug!("Consumer closing, applying rebalance without coordination");
            return;
        }

        let (kind, partitions) = match rebalance {
            Rebalance::Assign(partitions) => (RebalanceKind::Assign, *partitions),
            Rebalance::Revoke(partitions) => (RebalanceKind::Revoke, *partitions),
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
                return;
            }
        };

        // Cooperative-sticky triggers rebalances that move nothing
        if partitions.count() == 0 {
            debug!("Skipping empty {kind:?} rebalance");
            return;
        }

        let partitions: Vec<PartitionId> = partitions
            .elements()
            .into_iter()
            .map(PartitionId::from)
            .collect();

        info!(
            "Rebalance {kind:?} for {} partitions, waiting for coordinator",
            partitions.len()
        );
        self.forward_rebalance(kind, partitions);
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        debug!("Post-rebalance event: {:?}", rebalance);
    }
}
