//! Test utilities for the consumer, used by unit tests and the tests/ directory

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rdkafka::error::{KafkaError, KafkaResult};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::handler::MessageHandler;
use crate::kafka::client::{BrokerClient, BrokerEvent};
use crate::kafka::message::MessageEnvelope;
use crate::kafka::types::PartitionId;

pub const TEST_TOPIC: &str = "users";

pub fn envelope(partition: i32, offset: i64) -> MessageEnvelope {
    MessageEnvelope::new(TEST_TOPIC, PartitionId::new(partition), offset)
}

pub fn message(partition: i32, offset: i64) -> BrokerEvent {
    BrokerEvent::Message(envelope(partition, offset))
}

pub fn partitions(numbers: &[i32]) -> Vec<PartitionId> {
    numbers.iter().copied().map(PartitionId::new).collect()
}

/// Something a mock collaborator observed, in the order it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Subscribed(String),
    Assigned(Vec<PartitionId>),
    Unassigned,
    Committed { partition: PartitionId, offset: i64 },
    Handled { partition: PartitionId, offset: i64 },
    HandlerFailed { partition: PartitionId, offset: i64 },
    Closed,
}

/// Shared, ordered log of what the mock client and handler saw
#[derive(Debug, Default)]
pub struct Journal {
    entries: Mutex<Vec<JournalEntry>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<JournalEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, entry: JournalEntry) {
        self.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.lock().clone()
    }

    pub fn contains(&self, entry: &JournalEntry) -> bool {
        self.lock().contains(entry)
    }

    pub fn position(&self, entry: &JournalEntry) -> Option<usize> {
        self.lock().iter().position(|e| e == entry)
    }

    pub fn count(&self, predicate: impl Fn(&JournalEntry) -> bool) -> usize {
        self.lock().iter().filter(|e| predicate(e)).count()
    }

    /// Offsets the handler completed successfully for one partition, in order
    pub fn handled_offsets(&self, partition: PartitionId) -> Vec<i64> {
        self.lock()
            .iter()
            .filter_map(|entry| match entry {
                JournalEntry::Handled {
                    partition: p,
                    offset,
                } if *p == partition => Some(*offset),
                _ => None,
            })
            .collect()
    }

    /// Poll the journal until `predicate` holds. Returns false after `timeout`.
    pub async fn wait_until(
        &self,
        timeout: Duration,
        predicate: impl Fn(&[JournalEntry]) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(self.lock().as_slice()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

type JournalPredicate = Box<dyn Fn(&[JournalEntry]) -> bool + Send>;
type UnassignHook = Box<dyn FnMut() + Send>;

enum ScriptStep {
    Event(BrokerEvent),
    WaitUntil(JournalPredicate),
}

/// Broker client that replays a script of events and journals every call.
///
/// Once the script runs out, polls sleep for the poll timeout and return nothing.
pub struct MockBrokerClient {
    journal: Arc<Journal>,
    script: VecDeque<ScriptStep>,
    subscribe_error: Option<KafkaError>,
    assign_error: Option<KafkaError>,
    unassign_error: Option<KafkaError>,
    on_unassign: Option<UnassignHook>,
}

impl MockBrokerClient {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self {
            journal,
            script: VecDeque::new(),
            subscribe_error: None,
            assign_error: None,
            unassign_error: None,
            on_unassign: None,
        }
    }

    /// Deliver `event` on a later poll
    pub fn then(mut self, event: BrokerEvent) -> Self {
        self.script.push_back(ScriptStep::Event(event));
        self
    }

    /// Hold back the rest of the script until the journal satisfies `predicate`
    pub fn then_wait_until(
        mut self,
        predicate: impl Fn(&[JournalEntry]) -> bool + Send + 'static,
    ) -> Self {
        self.script
            .push_back(ScriptStep::WaitUntil(Box::new(predicate)));
        self
    }

    pub fn fail_subscribe(mut self, error: KafkaError) -> Self {
        self.subscribe_error = Some(error);
        self
    }

    pub fn fail_assign(mut self, error: KafkaError) -> Self {
        self.assign_error = Some(error);
        self
    }

    pub fn fail_unassign(mut self, error: KafkaError) -> Self {
        self.unassign_error = Some(error);
        self
    }

    /// Run `hook` inside `unassign`, before it is journaled
    pub fn on_unassign(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.on_unassign = Some(Box::new(hook));
        self
    }
}

#[async_trait]
impl BrokerClient for MockBrokerClient {
    fn subscribe(&mut self, topic: &str) -> KafkaResult<()> {
        if let Some(error) = self.subscribe_error.take() {
            return Err(error);
        }
        self.journal
            .record(JournalEntry::Subscribed(topic.to_string()));
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Option<BrokerEvent> {
        match self.script.pop_front() {
            Some(ScriptStep::Event(event)) => Some(event),
            Some(ScriptStep::WaitUntil(predicate)) => {
                if !predicate(self.journal.entries().as_slice()) {
                    self.script.push_front(ScriptStep::WaitUntil(predicate));
                    tokio::time::sleep(timeout.min(Duration::from_millis(5))).await;
                }
                None
            }
            None => {
                tokio::time::sleep(timeout).await;
                None
            }
        }
    }

    fn assign(&mut self, partitions: &[PartitionId]) -> KafkaResult<()> {
        if let Some(error) = self.assign_error.take() {
            return Err(error);
        }
        self.journal
            .record(JournalEntry::Assigned(partitions.to_vec()));
        Ok(())
    }

    fn unassign(&mut self) -> KafkaResult<()> {
        if let Some(hook) = self.on_unassign.as_mut() {
            hook();
        }
        if let Some(error) = self.unassign_error.take() {
            return Err(error);
        }
        self.journal.record(JournalEntry::Unassigned);
        Ok(())
    }

    fn commit(&mut self, message: &MessageEnvelope) -> KafkaResult<()> {
        self.journal.record(JournalEntry::Committed {
            partition: message.partition(),
            offset: message.offset(),
        });
        Ok(())
    }

    async fn close(&mut self) {
        self.journal.record(JournalEntry::Closed);
    }
}

/// Handler that journals every message, with scriptable failures, panics and a
/// gate to hold messages inside the handler.
pub struct RecordingHandler {
    topic: String,
    journal: Arc<Journal>,
    failures: HashSet<(PartitionId, i64)>,
    panics: HashSet<(PartitionId, i64)>,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
}

impl RecordingHandler {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self {
            topic: TEST_TOPIC.to_string(),
            journal,
            failures: HashSet::new(),
            panics: HashSet::new(),
            delay: None,
            gate: None,
        }
    }

    pub fn fail_on(mut self, partition: PartitionId, offset: i64) -> Self {
        self.failures.insert((partition, offset));
        self
    }

    pub fn panic_on(mut self, partition: PartitionId, offset: i64) -> Self {
        self.panics.insert((partition, offset));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every message waits for one permit of `gate` before it is handled
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn handle_message(&self, message: &MessageEnvelope) -> Result<()> {
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let key = (message.partition(), message.offset());
        if self.panics.contains(&key) {
            panic!("simulated handler panic at {}:{}", key.0, key.1);
        }
        if self.failures.contains(&key) {
            self.journal.record(JournalEntry::HandlerFailed {
                partition: key.0,
                offset: key.1,
            });
            return Err(anyhow!("simulated handler failure at {}:{}", key.0, key.1));
        }

        self.journal.record(JournalEntry::Handled {
            partition: key.0,
            offset: key.1,
        });
        Ok(())
    }
}
