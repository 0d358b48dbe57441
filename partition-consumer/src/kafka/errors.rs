use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

/// Errors that end (or prevent) a consumer session.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("failed to create kafka consumer")]
    Create(#[source] KafkaError),
    #[error("failed to subscribe to topic {topic}")]
    Subscribe {
        topic: String,
        #[source]
        source: KafkaError,
    },
    #[error("fatal kafka error, consumer session ended")]
    Fatal(#[source] KafkaError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Logged, the dispatch loop keeps polling
    Transient,
    /// Ends the session with a full shutdown
    Fatal,
}

/// Decide whether a broker error ends the session.
///
/// Losing every broker, failing authentication, and librdkafka's own fatal errors end
/// the session; everything else is retried by polling again.
pub fn classify(error: &KafkaError) -> ErrorSeverity {
    match error {
        KafkaError::MessageConsumptionFatal(_) | KafkaError::Canceled => ErrorSeverity::Fatal,
        KafkaError::Global(code) | KafkaError::MessageConsumption(code) => match code {
            RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::Fatal => ErrorSeverity::Fatal,
            _ => ErrorSeverity::Transient,
        },
        _ => ErrorSeverity::Transient,
    }
}

/// Short label for the `error` metric dimension
pub fn error_label(error: &KafkaError) -> &'static str {
    match error {
        KafkaError::Global(RDKafkaErrorCode::AllBrokersDown) => "all_brokers_down",
        KafkaError::Global(RDKafkaErrorCode::BrokerTransportFailure) => "broker_transport",
        KafkaError::Global(RDKafkaErrorCode::Authentication) => "authentication",
        KafkaError::Global(_) => "global",
        KafkaError::MessageConsumption(RDKafkaErrorCode::OperationTimedOut) => "op_timed_out",
        KafkaError::MessageConsumption(RDKafkaErrorCode::OffsetOutOfRange) => {
            "offset_out_of_range"
        }
        KafkaError::MessageConsumption(_) => "consumer",
        KafkaError::MessageConsumptionFatal(_) => "consumer_fatal",
        KafkaError::Canceled => "canceled",
        _ => "unexpected",
    }
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Transient => "warn",
            ErrorSeverity::Fatal => "fatal",
        }
    }
}
