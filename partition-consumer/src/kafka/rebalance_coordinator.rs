//! Rebalance Coordinator - keeps the worker pool in step with the partition assignment
//!
//! The coordinator is the only writer of the [`WorkerPool`]. An assignment is
//! acknowledged to the broker only after every new worker is running, and a
//! revocation only after every revoked worker has drained and stopped.
//!
//! A worker that outlives the drain timeout is kept aside until it stops. If its
//! partition comes back, the new worker starts only once the old one is gone, so a
//! partition never has two live workers.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use rdkafka::error::KafkaResult;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::handler::MessageHandler;
use crate::kafka::client::BrokerClient;
use crate::kafka::partition_worker::{PartitionWorker, WorkerControl, WorkerState};
use crate::kafka::types::{format_partitions, PartitionId};
use crate::kafka::worker_pool::WorkerPool;
use crate::metrics_consts::{REBALANCE_EVENTS, WORKER_DRAIN_TIMEOUTS};

pub struct RebalanceCoordinator {
    topic: String,
    pool: Arc<WorkerPool>,
    handler: Arc<dyn MessageHandler>,
    tracker: TaskTracker,
    drain_timeout: Option<Duration>,
    /// Workers revoked past the drain timeout that have not stopped yet
    lingering: DashMap<PartitionId, WorkerControl>,
}

impl RebalanceCoordinator {
    pub fn new(
        topic: impl Into<String>,
        pool: Arc<WorkerPool>,
        handler: Arc<dyn MessageHandler>,
        tracker: TaskTracker,
        drain_timeout: Option<Duration>,
    ) -> Self {
        Self {
            topic: topic.into(),
            pool,
            handler,
            tracker,
            drain_timeout,
            lingering: DashMap::new(),
        }
    }

    /// Start a worker for every newly assigned partition, then acknowledge the
    /// assignment. Partitions that already have a worker keep it. A partition whose
    /// previous worker is still draining waits for that worker to stop first.
    pub async fn assign<C: BrokerClient + ?Sized>(
        &self,
        client: &mut C,
        partitions: &[PartitionId],
    ) -> KafkaResult<()> {
        metrics::counter!(REBALANCE_EVENTS, "event_type" => "assign").increment(1);
        info!(
            "Partitions assigned: {}, starting workers",
            format_partitions(partitions)
        );

        for &partition in partitions {
            if self.pool.contains(partition) {
                info!(%partition, "Worker already running for assigned partition, keeping it");
                continue;
            }
            self.await_lingering(partition).await;

            let mut worker =
                PartitionWorker::new(self.topic.clone(), partition, self.handler.clone());
            worker.start(&self.tracker);
            if let Err(duplicate) = self.pool.insert(worker) {
                warn!(%partition, "Partition registered concurrently, stopping duplicate worker");
                duplicate.stop();
            }
        }

        client.assign(partitions)
    }

    /// Stop the workers of the revoked partitions, wait for them to drain, drop them
    /// from the pool, then acknowledge the revocation.
    pub async fn revoke<C: BrokerClient + ?Sized>(
        &self,
        client: &mut C,
        partitions: &[PartitionId],
    ) -> KafkaResult<()> {
        metrics::counter!(REBALANCE_EVENTS, "event_type" => "revoke").increment(1);
        info!(
            "Partitions revoked: {}, stopping workers",
            format_partitions(partitions)
        );

        let controls: Vec<WorkerControl> = partitions
            .iter()
            .filter_map(|&partition| {
                let control = self.pool.control(partition);
                if control.is_none() {
                    info!(%partition, "No worker for revoked partition, nothing to stop");
                }
                control
            })
            .collect();

        self.stop_and_remove(controls).await;
        client.unassign()
    }

    /// Stop every live worker and wait for all of them. Returns the partitions that
    /// had a worker.
    pub async fn stop_all(&self) -> Vec<PartitionId> {
        let controls = self.pool.controls();
        let mut stopped: Vec<PartitionId> = controls.iter().map(|c| c.partition()).collect();
        stopped.sort();

        if !controls.is_empty() {
            info!(
                "Stopping all partition workers: {}",
                format_partitions(&stopped)
            );
        }
        self.stop_and_remove(controls).await;
        stopped
    }

    async fn stop_and_remove(&self, controls: Vec<WorkerControl>) {
        // Signal everyone first so the workers drain in parallel
        for control in &controls {
            control.stop();
        }

        join_all(controls.iter().map(|control| self.await_stopped(control))).await;

        for control in &controls {
            self.pool.remove(control.partition());
        }
    }

    async fn await_lingering(&self, partition: PartitionId) {
        let Some((_, previous)) = self.lingering.remove(&partition) else {
            return;
        };
        if previous.state() != WorkerState::Stopped {
            info!(%partition, "Waiting for the previous worker of the partition to stop");
            previous.stopped().await;
        }
    }

    async fn await_stopped(&self, control: &WorkerControl) {
        let Some(limit) = self.drain_timeout else {
            control.stopped().await;
            return;
        };

        if tokio::time::timeout(limit, control.stopped()).await.is_err() {
            metrics::counter!(WORKER_DRAIN_TIMEOUTS).increment(1);
            warn!(
                partition = %control.partition(),
                "Worker did not drain within {:?}, proceeding without it",
                limit
            );
            self.lingering.insert(control.partition(), control.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::test_utils::{
        envelope, partitions, Journal, JournalEntry, MockBrokerClient, RecordingHandler,
    };
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    fn coordinator(
        pool: Arc<WorkerPool>,
        handler: RecordingHandler,
        drain_timeout: Option<Duration>,
    ) -> RebalanceCoordinator {
        RebalanceCoordinator::new(
            "users",
            pool,
            Arc::new(handler),
            TaskTracker::new(),
            drain_timeout,
        )
    }

    #[tokio::test]
    async fn test_assign_starts_workers_then_acknowledges() {
        let journal = Arc::new(Journal::new());
        let pool = Arc::new(WorkerPool::new());
        let coordinator = coordinator(pool.clone(), RecordingHandler::new(journal.clone()), None);
        let mut client = MockBrokerClient::new(journal.clone());

        coordinator
            .assign(&mut client, &partitions(&[0, 1]))
            .await
            .unwrap();

        assert_eq!(pool.partitions(), partitions(&[0, 1]));
        assert_eq!(pool.state(PartitionId::new(0)), Some(WorkerState::Running));
        assert_eq!(pool.state(PartitionId::new(1)), Some(WorkerState::Running));
        assert!(journal.contains(&JournalEntry::Assigned(partitions(&[0, 1]))));

        coordinator.stop_all().await;
    }

    #[tokio::test]
    async fn test_reassign_keeps_existing_worker() {
        let journal = Arc::new(Journal::new());
        let pool = Arc::new(WorkerPool::new());
        let coordinator = coordinator(pool.clone(), RecordingHandler::new(journal.clone()), None);
        let mut client = MockBrokerClient::new(journal.clone());

        coordinator.assign(&mut client, &partitions(&[0])).await.unwrap();
        let inbox = pool.inbox(PartitionId::new(0)).unwrap();
        coordinator
            .assign(&mut client, &partitions(&[0, 2]))
            .await
            .unwrap();

        assert_eq!(pool.len(), 2);
        // the first worker still accepts messages
        inbox.hand_off(Arc::new(envelope(0, 5))).await.unwrap();
        assert_eq!(
            journal.count(|e| matches!(e, JournalEntry::Assigned(_))),
            2
        );

        coordinator.stop_all().await;
        assert_eq!(journal.handled_offsets(PartitionId::new(0)), vec![5]);
    }

    #[tokio::test]
    async fn test_revoke_stops_workers_before_acknowledging() {
        let journal = Arc::new(Journal::new());
        let pool = Arc::new(WorkerPool::new());
        let coordinator = coordinator(pool.clone(), RecordingHandler::new(journal.clone()), None);

        let observed = Arc::new(Mutex::new(None));
        let mut client = {
            let pool = pool.clone();
            let observed = observed.clone();
            MockBrokerClient::new(journal.clone()).on_unassign(move || {
                *observed.lock().unwrap() = Some(pool.partitions());
            })
        };

        coordinator
            .assign(&mut client, &partitions(&[0, 1]))
            .await
            .unwrap();
        let control = pool.control(PartitionId::new(1)).unwrap();

        coordinator
            .revoke(&mut client, &partitions(&[1]))
            .await
            .unwrap();

        assert_eq!(control.state(), WorkerState::Stopped);
        assert_eq!(*observed.lock().unwrap(), Some(partitions(&[0])));
        assert_eq!(pool.partitions(), partitions(&[0]));
        assert!(journal.contains(&JournalEntry::Unassigned));

        coordinator.stop_all().await;
    }

    #[tokio::test]
    async fn test_revoke_unknown_partition_still_acknowledges() {
        let journal = Arc::new(Journal::new());
        let pool = Arc::new(WorkerPool::new());
        let coordinator = coordinator(pool.clone(), RecordingHandler::new(journal.clone()), None);
        let mut client = MockBrokerClient::new(journal.clone());

        coordinator
            .revoke(&mut client, &partitions(&[7]))
            .await
            .unwrap();

        assert!(pool.is_empty());
        assert_eq!(journal.entries(), vec![JournalEntry::Unassigned]);
    }

    #[tokio::test]
    async fn test_revoke_waits_for_in_flight_message() {
        let journal = Arc::new(Journal::new());
        let pool = Arc::new(WorkerPool::new());
        let gate = Arc::new(Semaphore::new(0));
        let handler = RecordingHandler::new(journal.clone()).with_gate(gate.clone());
        let coordinator = coordinator(pool.clone(), handler, None);
        let mut client = MockBrokerClient::new(journal.clone());

        coordinator.assign(&mut client, &partitions(&[1])).await.unwrap();
        pool.inbox(PartitionId::new(1))
            .unwrap()
            .hand_off(Arc::new(envelope(1, 3)))
            .await
            .unwrap();

        gate.add_permits(1);
        coordinator
            .revoke(&mut client, &partitions(&[1]))
            .await
            .unwrap();

        let handled = journal
            .position(&JournalEntry::Handled {
                partition: PartitionId::new(1),
                offset: 3,
            })
            .unwrap();
        let unassigned = journal.position(&JournalEntry::Unassigned).unwrap();
        assert!(handled < unassigned);
    }

    #[tokio::test]
    async fn test_revoke_gives_up_on_hung_worker_after_drain_timeout() {
        let journal = Arc::new(Journal::new());
        let pool = Arc::new(WorkerPool::new());
        let gate = Arc::new(Semaphore::new(0));
        let handler = RecordingHandler::new(journal.clone()).with_gate(gate.clone());
        let coordinator = coordinator(
            pool.clone(),
            handler,
            Some(Duration::from_millis(50)),
        );
        let mut client = MockBrokerClient::new(journal.clone());

        coordinator.assign(&mut client, &partitions(&[0])).await.unwrap();
        let control = pool.control(PartitionId::new(0)).unwrap();
        pool.inbox(PartitionId::new(0))
            .unwrap()
            .hand_off(Arc::new(envelope(0, 1)))
            .await
            .unwrap();

        // never released: the handler hangs
        coordinator
            .revoke(&mut client, &partitions(&[0]))
            .await
            .unwrap();

        assert_eq!(control.state(), WorkerState::Draining);
        assert!(pool.is_empty());
        assert!(journal.contains(&JournalEntry::Unassigned));

        gate.add_permits(1);
        control.stopped().await;
    }

    #[tokio::test]
    async fn test_stop_all_tolerates_already_stopped_workers() {
        let journal = Arc::new(Journal::new());
        let pool = Arc::new(WorkerPool::new());
        let coordinator = coordinator(pool.clone(), RecordingHandler::new(journal.clone()), None);
        let mut client = MockBrokerClient::new(journal);

        coordinator
            .assign(&mut client, &partitions(&[0, 1, 2]))
            .await
            .unwrap();
        let control = pool.control(PartitionId::new(2)).unwrap();
        control.stop();
        control.stopped().await;

        let stopped = coordinator.stop_all().await;

        assert_eq!(stopped, partitions(&[0, 1, 2]));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_reassign_waits_for_worker_past_drain_timeout() {
        let journal = Arc::new(Journal::new());
        let pool = Arc::new(WorkerPool::new());
        let gate = Arc::new(Semaphore::new(0));
        let handler = RecordingHandler::new(journal.clone()).with_gate(gate.clone());
        let coordinator = coordinator(
            pool.clone(),
            handler,
            Some(Duration::from_millis(20)),
        );
        let mut client = MockBrokerClient::new(journal.clone());

        coordinator
            .assign(&mut client, &partitions(&[0]))
            .await
            .unwrap();
        let previous = pool.control(PartitionId::new(0)).unwrap();
        pool.inbox(PartitionId::new(0))
            .unwrap()
            .hand_off(Arc::new(envelope(0, 1)))
            .await
            .unwrap();
        coordinator
            .revoke(&mut client, &partitions(&[0]))
            .await
            .unwrap();
        assert_eq!(previous.state(), WorkerState::Draining);

        let release = {
            let gate = gate.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                gate.add_permits(1);
            })
        };
        coordinator
            .assign(&mut client, &partitions(&[0]))
            .await
            .unwrap();
        release.await.unwrap();

        assert_eq!(previous.state(), WorkerState::Stopped);
        assert_eq!(pool.state(PartitionId::new(0)), Some(WorkerState::Running));
        let handled = journal
            .position(&JournalEntry::Handled {
                partition: PartitionId::new(0),
                offset: 1,
            })
            .unwrap();
        let reassigned = journal
            .entries()
            .iter()
            .rposition(|e| matches!(e, JournalEntry::Assigned(_)))
            .unwrap();
        assert!(handled < reassigned);

        coordinator.stop_all().await;
    }
}
