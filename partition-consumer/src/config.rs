use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::kafka::config::ConsumerConfigBuilder;
use crate::kafka::consumer::DispatchConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "file-service")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "users")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Report end-of-partition markers to the dispatch loop
    #[envconfig(default = "false")]
    pub kafka_partition_eof: bool,

    // Enables cooperative-sticky assignment and static membership when set
    pub kafka_client_id: Option<String>,

    // Dispatch loop configuration
    #[envconfig(default = "100")]
    pub poll_timeout_ms: EnvMsDuration,

    // How long a librdkafka rebalance callback waits for the coordinator
    #[envconfig(default = "60000")]
    pub rebalance_ack_timeout_ms: EnvMsDuration,

    // Unset means revocation waits for workers to drain without a bound. When set,
    // a worker still draining after it is kept aside, and a reassignment of its
    // partition waits for it to stop before starting a new worker.
    pub worker_drain_timeout_ms: Option<EnvMsDuration>,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(default = "plain")]
    pub log_format: LogFormat,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout_ms.0
    }

    pub fn rebalance_ack_timeout(&self) -> Duration {
        self.rebalance_ack_timeout_ms.0
    }

    pub fn worker_drain_timeout(&self) -> Option<Duration> {
        self.worker_drain_timeout_ms.map(|d| d.0)
    }

    /// Build the rdkafka client configuration for the group consumer
    pub fn to_client_config(&self) -> ClientConfig {
        ConsumerConfigBuilder::new(&self.kafka_hosts, &self.kafka_consumer_group)
            .with_offset_reset(&self.kafka_consumer_offset_reset)
            .with_tls(self.kafka_tls)
            .with_partition_eof(self.kafka_partition_eof)
            .with_sticky_partition_assignment(self.kafka_client_id.as_deref())
            .build()
    }

    pub fn to_dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            poll_timeout: self.poll_timeout(),
            worker_drain_timeout: self.worker_drain_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseLogFormatError(String);

impl FromStr for LogFormat {
    type Err = ParseLogFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" | "text" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            other => Err(ParseLogFormatError(other.to_string())),
        }
    }
}
