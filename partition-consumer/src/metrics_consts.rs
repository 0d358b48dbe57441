// ==== Dispatch loop ====
/// Counter for messages read from the broker, before routing
pub const MESSAGES_RECEIVED: &str = "partition_consumer_messages_received_total";

/// Counter for messages committed without reaching a handler (label: reason)
pub const MESSAGES_SKIPPED: &str = "partition_consumer_messages_skipped_total";

/// Histogram for the time the dispatch loop waited for a worker to accept a message (ms)
pub const HANDOFF_WAIT_MS: &str = "partition_consumer_handoff_wait_ms";

/// Counter for broker errors seen by the dispatch loop (labels: level, error)
pub const BROKER_ERRORS: &str = "partition_consumer_broker_errors_total";

/// Counter for end-of-partition markers
pub const PARTITION_EOF: &str = "partition_consumer_partition_eof_total";

// ==== Rebalance ====
/// Counter for rebalance notifications handled (label: event_type)
pub const REBALANCE_EVENTS: &str = "partition_consumer_rebalance_events_total";

/// Counter for rebalance acknowledgements the broker client rejected (label: event_type)
pub const REBALANCE_ACK_FAILURES: &str = "partition_consumer_rebalance_ack_failures_total";

/// Counter for workers that did not drain within the configured timeout
pub const WORKER_DRAIN_TIMEOUTS: &str = "partition_consumer_worker_drain_timeouts_total";

/// Gauge for the number of live partition workers
pub const ACTIVE_WORKERS: &str = "partition_consumer_active_workers";

// ==== Workers ====
/// Counter for handler invocations (label: outcome)
pub const MESSAGES_HANDLED: &str = "partition_consumer_messages_handled_total";

/// Histogram for handler call duration (ms)
pub const HANDLER_DURATION_MS: &str = "partition_consumer_handler_duration_ms";
