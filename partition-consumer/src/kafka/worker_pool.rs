//! Worker Pool - registry of the live partition workers
//!
//! Only the rebalance coordinator mutates the pool. The dispatch loop reads it and
//! clones what it needs out of the DashMap guard before awaiting anything, so one
//! slow partition never blocks access to the others.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::kafka::partition_worker::{PartitionWorker, WorkerControl, WorkerInbox, WorkerState};
use crate::kafka::types::PartitionId;
use crate::metrics_consts::ACTIVE_WORKERS;

#[derive(Default)]
pub struct WorkerPool {
    workers: DashMap<PartitionId, PartitionWorker>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, partition: PartitionId) -> bool {
        self.workers.contains_key(&partition)
    }

    /// Register a worker. Keeps the existing one and returns the new worker back when
    /// the partition already has a worker.
    pub fn insert(&self, worker: PartitionWorker) -> Result<(), PartitionWorker> {
        let partition = worker.partition();
        match self.workers.entry(partition) {
            Entry::Occupied(_) => Err(worker),
            Entry::Vacant(entry) => {
                entry.insert(worker);
                info!(%partition, "Registered partition worker");
                self.record_size();
                Ok(())
            }
        }
    }

    pub fn remove(&self, partition: PartitionId) -> Option<PartitionWorker> {
        let removed = self.workers.remove(&partition).map(|(_, worker)| worker);
        if removed.is_some() {
            info!(%partition, "Removed partition worker");
            self.record_size();
        }
        removed
    }

    /// The worker's inbox, with the DashMap guard already released
    pub fn inbox(&self, partition: PartitionId) -> Option<WorkerInbox> {
        self.workers.get(&partition).map(|worker| worker.inbox())
    }

    pub fn control(&self, partition: PartitionId) -> Option<WorkerControl> {
        self.workers.get(&partition).map(|worker| worker.control())
    }

    /// Controls of every registered worker
    pub fn controls(&self) -> Vec<WorkerControl> {
        self.workers
            .iter()
            .map(|entry| entry.value().control())
            .collect()
    }

    /// Registered partitions, sorted
    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> =
            self.workers.iter().map(|entry| *entry.key()).collect();
        partitions.sort();
        partitions
    }

    pub fn state(&self, partition: PartitionId) -> Option<WorkerState> {
        self.workers.get(&partition).map(|worker| worker.state())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    fn record_size(&self) {
        metrics::gauge!(ACTIVE_WORKERS).set(self.workers.len() as f64);
    }
}
