//! Partitioned Kafka consumer that fans messages out to one worker task per
//! assigned partition and follows consumer-group rebalances.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types with a cause chain, use formats that
//! include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}` gives the full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e` gives the full chain with `Caused by:` sections (Debug).
//!
//! Avoid `{}` / `%e` (Display) for errors, they only show the top-level message.

pub mod config;
pub mod folders;
pub mod handler;
pub mod handlers;
pub mod kafka;
pub mod metrics_consts;
pub mod server;

pub use handler::MessageHandler;
pub use kafka::{BrokerClient, BrokerEvent, MessageEnvelope, PartitionConsumer, PartitionId};
