//! Partition Worker - dedicated task processing the messages of a single partition
//!
//! Each assigned partition gets its own worker, fed through a rendezvous handoff:
//! 1. Ordering is preserved within the partition (one task, one queue)
//! 2. Partitions are processed in parallel, with no ordering across them
//! 3. The dispatch loop cannot run ahead of a slow worker

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::handler::MessageHandler;
use crate::kafka::message::MessageEnvelope;
use crate::kafka::types::PartitionId;
use crate::metrics_consts::{HANDLER_DURATION_MS, MESSAGES_HANDLED};

/// Lifecycle of a worker. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Constructed, task not spawned yet
    Idle,
    /// Accepting and processing messages
    Running,
    /// Stop requested, finishing messages already queued
    Draining,
    /// Task finished (or never started)
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Running => "running",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A message on its way to a worker, with the signal the worker fires once it has
/// taken the message off its queue.
pub struct Handoff {
    envelope: Arc<MessageEnvelope>,
    accepted: oneshot::Sender<()>,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffError {
    #[error("worker for partition {0} no longer accepts messages")]
    Closed(PartitionId),
    #[error("worker for partition {0} stopped before accepting the message")]
    Stopped(PartitionId),
}

/// Sending side of a worker's queue.
///
/// Cheap to clone so the dispatch loop can take it out of the pool and release the
/// pool's guard before awaiting the handoff.
#[derive(Clone)]
pub struct WorkerInbox {
    partition: PartitionId,
    sender: mpsc::Sender<Handoff>,
    state: watch::Receiver<WorkerState>,
}

impl WorkerInbox {
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Hand a message to the worker and wait until the worker has accepted it.
    ///
    /// Completes with an error instead of waiting forever when the worker reaches
    /// Stopped without taking the message.
    pub async fn hand_off(&self, envelope: Arc<MessageEnvelope>) -> Result<(), HandoffError> {
        let partition = self.partition;
        let (accepted, accepted_rx) = oneshot::channel();
        let mut state = self.state.clone();

        let handoff = async {
            self.sender
                .send(Handoff { envelope, accepted })
                .await
                .map_err(|_| HandoffError::Closed(partition))?;
            accepted_rx
                .await
                .map_err(|_| HandoffError::Stopped(partition))
        };
        let stopped = async {
            state
                .wait_for(|state| *state == WorkerState::Stopped)
                .await
                .map(|_| ())
        };

        tokio::select! {
            biased;
            result = handoff => result,
            _ = stopped => Err(HandoffError::Stopped(partition)),
        }
    }
}

/// Stop/await side of a worker, cloneable so the coordinator can stop many workers
/// and wait for them without holding the pool.
#[derive(Clone)]
pub struct WorkerControl {
    partition: PartitionId,
    stop: CancellationToken,
    state: Arc<watch::Sender<WorkerState>>,
}

impl WorkerControl {
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Ask the worker to stop. Idle workers stop immediately, running workers drain
    /// their queue first. Calling this again, or on a stopped worker, does nothing.
    pub fn stop(&self) {
        let changed = self.state.send_if_modified(|state| match *state {
            WorkerState::Idle => {
                *state = WorkerState::Stopped;
                true
            }
            WorkerState::Running => {
                *state = WorkerState::Draining;
                true
            }
            WorkerState::Draining | WorkerState::Stopped => false,
        });
        self.stop.cancel();

        if changed {
            debug!(partition = %self.partition, "Stop requested for partition worker");
        }
    }

    /// Wait until the worker is Stopped. Returns immediately if it already is.
    pub async fn stopped(&self) {
        let mut state = self.state.subscribe();
        let result = state
            .wait_for(|state| *state == WorkerState::Stopped)
            .await
            .map(|_| ());
        if result.is_err() {
            warn!(partition = %self.partition, "Worker state channel closed before Stopped");
        }
    }
}

/// Marks the worker Stopped when the task ends, including by panic or abort.
struct StoppedOnDrop {
    partition: PartitionId,
    state: Arc<watch::Sender<WorkerState>>,
    finished: bool,
}

impl Drop for StoppedOnDrop {
    fn drop(&mut self) {
        if !self.finished {
            error!(partition = %self.partition, "Partition worker task ended abnormally");
        }
        self.state.send_replace(WorkerState::Stopped);
    }
}

/// A worker that processes the messages of a single partition, in order
pub struct PartitionWorker {
    topic: String,
    partition: PartitionId,
    handler: Arc<dyn MessageHandler>,
    inbox: WorkerInbox,
    control: WorkerControl,
    receiver: Option<mpsc::Receiver<Handoff>>,
}

impl PartitionWorker {
    /// Create an Idle worker. Nothing runs until [`PartitionWorker::start`].
    pub fn new(
        topic: impl Into<String>,
        partition: PartitionId,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        // Capacity 1 plus the acceptance signal gives a rendezvous handoff
        let (sender, receiver) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(WorkerState::Idle);

        Self {
            topic: topic.into(),
            partition,
            handler,
            inbox: WorkerInbox {
                partition,
                sender,
                state: state_rx,
            },
            control: WorkerControl {
                partition,
                stop: CancellationToken::new(),
                state: Arc::new(state_tx),
            },
            receiver: Some(receiver),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn state(&self) -> WorkerState {
        self.control.state()
    }

    pub fn inbox(&self) -> WorkerInbox {
        self.inbox.clone()
    }

    pub fn control(&self) -> WorkerControl {
        self.control.clone()
    }

    /// Spawn the worker task on `tracker`. Only an Idle worker starts.
    pub fn start(&mut self, tracker: &TaskTracker) {
        let Some(receiver) = self.receiver.take() else {
            debug!(partition = %self.partition, "Partition worker already started");
            return;
        };

        let started = self.control.state.send_if_modified(|state| {
            if *state == WorkerState::Idle {
                *state = WorkerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            debug!(
                partition = %self.partition,
                state = %self.state(),
                "Partition worker not idle, not starting"
            );
            return;
        }

        let span = info_span!(
            "partition_worker",
            topic = %self.topic,
            partition = self.partition.partition_number()
        );
        tracker.spawn(
            run_worker(
                self.partition,
                receiver,
                self.handler.clone(),
                self.control.clone(),
            )
            .instrument(span),
        );
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    pub async fn stopped(&self) {
        self.control.stopped().await;
    }
}

/// The main worker loop
async fn run_worker(
    partition: PartitionId,
    mut receiver: mpsc::Receiver<Handoff>,
    handler: Arc<dyn MessageHandler>,
    control: WorkerControl,
) {
    let mut stopped = StoppedOnDrop {
        partition,
        state: control.state.clone(),
        finished: false,
    };
    info!("Starting partition worker");

    loop {
        tokio::select! {
            biased;
            _ = control.stop.cancelled() => break,
            handoff = receiver.recv() => match handoff {
                Some(handoff) => process(handler.as_ref(), handoff).await,
                None => break,
            },
        }
    }

    control.state.send_if_modified(|state| {
        if *state == WorkerState::Running {
            *state = WorkerState::Draining;
            true
        } else {
            false
        }
    });

    // Refuse new handoffs, finish the ones already queued
    receiver.close();
    let mut drained = 0usize;
    while let Some(handoff) = receiver.recv().await {
        process(handler.as_ref(), handoff).await;
        drained += 1;
    }

    info!(drained, "Partition worker shutting down");
    stopped.finished = true;
}

async fn process(handler: &dyn MessageHandler, handoff: Handoff) {
    let Handoff { envelope, accepted } = handoff;
    if accepted.send(()).is_err() {
        debug!(
            offset = envelope.offset(),
            "Dispatcher stopped waiting for acceptance, processing anyway"
        );
    }

    let started = Instant::now();
    let result = AssertUnwindSafe(handler.handle_message(&envelope))
        .catch_unwind()
        .await;
    metrics::histogram!(HANDLER_DURATION_MS).record(started.elapsed().as_millis() as f64);

    // The worker keeps going after a failure or a panic, the message is not retried
    match result {
        Ok(Ok(())) => {
            metrics::counter!(MESSAGES_HANDLED, "outcome" => "success").increment(1);
            debug!(offset = envelope.offset(), "Message handled");
        }
        Ok(Err(e)) => {
            metrics::counter!(MESSAGES_HANDLED, "outcome" => "error").increment(1);
            error!(
                offset = envelope.offset(),
                error = ?e,
                "Handler failed, continuing with next message"
            );
        }
        Err(panic) => {
            metrics::counter!(MESSAGES_HANDLED, "outcome" => "panic").increment(1);
            error!(
                offset = envelope.offset(),
                panic = panic_message(panic.as_ref()),
                "Handler panicked, continuing with next message"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::test_utils::{Journal, JournalEntry, RecordingHandler};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn envelope(partition: i32, offset: i64) -> Arc<MessageEnvelope> {
        Arc::new(MessageEnvelope::new(
            "users",
            PartitionId::new(partition),
            offset,
        ))
    }

    fn worker(handler: RecordingHandler) -> PartitionWorker {
        PartitionWorker::new("users", PartitionId::new(0), Arc::new(handler))
    }

    #[tokio::test]
    async fn test_messages_handled_in_order() {
        let journal = Arc::new(Journal::new());
        let tracker = TaskTracker::new();
        let mut worker = worker(RecordingHandler::new(journal.clone()));
        worker.start(&tracker);
        assert_eq!(worker.state(), WorkerState::Running);

        let inbox = worker.inbox();
        for offset in 0..5 {
            inbox.hand_off(envelope(0, offset)).await.unwrap();
        }

        worker.stop();
        worker.stopped().await;

        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(
            journal.handled_offsets(PartitionId::new(0)),
            vec![0, 1, 2, 3, 4]
        );
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_stop_worker() {
        let journal = Arc::new(Journal::new());
        let tracker = TaskTracker::new();
        let handler = RecordingHandler::new(journal.clone()).fail_on(PartitionId::new(0), 1);
        let mut worker = worker(handler);
        worker.start(&tracker);

        let inbox = worker.inbox();
        for offset in 1..=3 {
            inbox.hand_off(envelope(0, offset)).await.unwrap();
        }
        worker.stop();
        worker.stopped().await;

        assert!(journal.contains(&JournalEntry::HandlerFailed {
            partition: PartitionId::new(0),
            offset: 1,
        }));
        assert_eq!(journal.handled_offsets(PartitionId::new(0)), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_stop_twice_is_noop() {
        let journal = Arc::new(Journal::new());
        let tracker = TaskTracker::new();
        let mut worker = worker(RecordingHandler::new(journal));
        worker.start(&tracker);

        worker.stop();
        worker.stop();
        worker.stopped().await;
        worker.stop();
        worker.stopped().await;

        assert_eq!(worker.state(), WorkerState::Stopped);
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_stop_idle_worker() {
        let journal = Arc::new(Journal::new());
        let tracker = TaskTracker::new();
        let mut worker = worker(RecordingHandler::new(journal));

        worker.stop();
        assert_eq!(worker.state(), WorkerState::Stopped);
        worker.stopped().await;

        // a stopped worker never starts
        worker.start(&tracker);
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_spawns_once() {
        let journal = Arc::new(Journal::new());
        let tracker = TaskTracker::new();
        let mut worker = worker(RecordingHandler::new(journal));

        worker.start(&tracker);
        worker.start(&tracker);
        assert_eq!(tracker.len(), 1);

        worker.stop();
        worker.stopped().await;
    }

    #[tokio::test]
    async fn test_stop_drains_queued_message() {
        let journal = Arc::new(Journal::new());
        let tracker = TaskTracker::new();
        let gate = Arc::new(Semaphore::new(0));
        let handler = RecordingHandler::new(journal.clone()).with_gate(gate.clone());
        let mut worker = worker(handler);
        worker.start(&tracker);

        let inbox = worker.inbox();
        // accepted, then blocked in the handler on the gate
        inbox.hand_off(envelope(0, 10)).await.unwrap();

        // sits in the queue until the worker is free
        let queued = {
            let inbox = inbox.clone();
            tokio::spawn(async move { inbox.hand_off(envelope(0, 11)).await })
        };
        while inbox.sender.capacity() > 0 {
            tokio::task::yield_now().await;
        }

        worker.stop();
        assert_eq!(worker.state(), WorkerState::Draining);

        gate.add_permits(2);
        worker.stopped().await;

        assert_eq!(queued.await.unwrap(), Ok(()));
        assert_eq!(journal.handled_offsets(PartitionId::new(0)), vec![10, 11]);
    }

    #[tokio::test]
    async fn test_handoff_rejected_after_stop() {
        let journal = Arc::new(Journal::new());
        let tracker = TaskTracker::new();
        let mut worker = worker(RecordingHandler::new(journal.clone()));
        worker.start(&tracker);
        let inbox = worker.inbox();

        worker.stop();
        worker.stopped().await;

        let result = tokio::time::timeout(Duration::from_secs(1), inbox.hand_off(envelope(0, 1)))
            .await
            .expect("handoff must not block on a stopped worker");
        assert!(matches!(
            result,
            Err(HandoffError::Closed(_)) | Err(HandoffError::Stopped(_))
        ));
        assert!(journal.handled_offsets(PartitionId::new(0)).is_empty());
    }

    #[tokio::test]
    async fn test_handoff_to_stopped_idle_worker_does_not_block() {
        let journal = Arc::new(Journal::new());
        let worker = worker(RecordingHandler::new(journal));
        let inbox = worker.inbox();
        worker.stop();

        let result = tokio::time::timeout(Duration::from_secs(1), inbox.hand_off(envelope(0, 1)))
            .await
            .expect("handoff must not block on a stopped worker");
        assert_eq!(result, Err(HandoffError::Stopped(PartitionId::new(0))));
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_worker() {
        let journal = Arc::new(Journal::new());
        let tracker = TaskTracker::new();
        let handler = RecordingHandler::new(journal.clone()).panic_on(PartitionId::new(0), 7);
        let mut worker = worker(handler);
        worker.start(&tracker);

        let inbox = worker.inbox();
        for offset in 7..=9 {
            inbox.hand_off(envelope(0, offset)).await.unwrap();
        }
        assert_eq!(worker.state(), WorkerState::Running);

        worker.stop();
        worker.stopped().await;

        assert_eq!(journal.handled_offsets(PartitionId::new(0)), vec![8, 9]);
    }

    #[test]
    fn test_panic_message() {
        let text: Box<dyn Any + Send> = Box::new("boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        let other: Box<dyn Any + Send> = Box::new(42u8);

        assert_eq!(panic_message(text.as_ref()), "boom");
        assert_eq!(panic_message(owned.as_ref()), "owned boom");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
