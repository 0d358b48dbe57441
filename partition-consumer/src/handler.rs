use async_trait::async_trait;

use crate::kafka::message::MessageEnvelope;

/// Application logic invoked once per message by a partition worker.
///
/// Calls for one partition never overlap and arrive in partition order. Different
/// partitions call concurrently, so implementations must be `Send + Sync`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Topic this handler consumes
    fn topic(&self) -> &str;

    /// Process one message. An error is logged and counted by the worker, which
    /// then moves on to the next message; the message is not retried.
    async fn handle_message(&self, message: &MessageEnvelope) -> anyhow::Result<()>;
}
