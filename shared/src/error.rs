use std::time::Duration;

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Transport-level failures. Any of these sends a consumer loop back to
/// `Disconnected`; none of them is ever reported to an end caller verbatim.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

impl BrokerError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        BrokerError::Unavailable(reason.into())
    }
}

/// Caller-side failures of a correlated request/reply exchange.
#[derive(Debug, Error)]
pub enum RpcError {
    /// No reply arrived in time. The request may still be processed by the
    /// server, so callers must treat this as "unknown", not "failed".
    #[error("no reply within {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode reply: {0}")]
    Decode(#[source] serde_json::Error),
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::TimedOut(_))
    }
}
