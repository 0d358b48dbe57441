use rdkafka::ClientConfig;

const ASSIGNMENT_STRATEGY: &str = "partition.assignment.strategy";
const COOPERATIVE_STICKY: &str = "cooperative-sticky";

/// Whether the group rebalances incrementally, which changes how a client may edit
/// its assignment outside a rebalance callback.
pub fn uses_cooperative_rebalance(config: &ClientConfig) -> bool {
    config.get(ASSIGNMENT_STRATEGY) == Some(COOPERATIVE_STICKY)
}

/// Kafka consumer configuration builder for the partition consumer.
///
/// Offsets are committed by librdkafka's auto-commit as messages are polled, so a
/// message counts as delivered once the dispatch loop has read it. The only explicit
/// commits are for messages that never reach a worker.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Create a config builder for a group consumer with the service defaults.
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "true")
            .set("auto.commit.interval.ms", "5000")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "45000")
            .set("heartbeat.interval.ms", "3000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Override offset reset policy
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Report end-of-partition markers to the dispatch loop
    pub fn with_partition_eof(mut self, enabled: bool) -> Self {
        self.config
            .set("enable.partition.eof", if enabled { "true" } else { "false" });
        self
    }

    /// Use cooperative-sticky assignment. When a client id is given it also becomes the
    /// static group member id, so restarts keep their partitions.
    pub fn with_sticky_partition_assignment(mut self, client_id: Option<&str>) -> Self {
        if let Some(found_client_id) = client_id {
            self.config
                .set(ASSIGNMENT_STRATEGY, COOPERATIVE_STICKY)
                .set("client.id", found_client_id)
                .set("group.instance.id", found_client_id);
        }
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_defaults() {
        let config = ConsumerConfigBuilder::new("kafka:9092", "file-service").build();

        assert_eq!(config.get("bootstrap.servers"), Some("kafka:9092"));
        assert_eq!(config.get("group.id"), Some("file-service"));
        assert_eq!(config.get("enable.auto.commit"), Some("true"));
        assert_eq!(config.get("enable.partition.eof"), Some("false"));
        assert_eq!(config.get("partition.assignment.strategy"), None);
    }

    #[test]
    fn test_sticky_assignment_sets_static_membership() {
        let config = ConsumerConfigBuilder::new("kafka:9092", "file-service")
            .with_sticky_partition_assignment(Some("file-service-0"))
            .build();

        assert_eq!(
            config.get("partition.assignment.strategy"),
            Some("cooperative-sticky")
        );
        assert_eq!(config.get("group.instance.id"), Some("file-service-0"));
        assert!(uses_cooperative_rebalance(&config));
    }

    #[test]
    fn test_eager_assignment_without_client_id() {
        let config = ConsumerConfigBuilder::new("kafka:9092", "file-service")
            .with_sticky_partition_assignment(None)
            .build();

        assert!(!uses_cooperative_rebalance(&config));
    }

    #[test]
    fn test_overrides() {
        let config = ConsumerConfigBuilder::new("kafka:9092", "file-service")
            .with_offset_reset("latest")
            .with_partition_eof(true)
            .with_tls(true)
            .set("fetch.min.bytes", "1024")
            .build();

        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("enable.partition.eof"), Some("true"));
        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("fetch.min.bytes"), Some("1024"));
    }
}
