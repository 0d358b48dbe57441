// Kafka module - partitioned consumption with one worker per assigned partition
pub mod client;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod kafka_client;
pub mod message;
pub mod partition_worker;
pub mod rebalance_context;
pub mod rebalance_coordinator;
pub mod types;
pub mod worker_pool;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

// Public API
pub use client::{BrokerClient, BrokerEvent};
pub use config::ConsumerConfigBuilder;
pub use consumer::{DispatchConfig, PartitionConsumer};
pub use errors::ConsumerError;
pub use kafka_client::KafkaBrokerClient;
pub use message::{MessageEnvelope, MessageHeader};
pub use partition_worker::{PartitionWorker, WorkerState};
pub use rebalance_coordinator::RebalanceCoordinator;
pub use types::PartitionId;
pub use worker_pool::WorkerPool;
