use std::sync::Arc;
use std::time::Duration;

use clap::Args;

use crate::broker::{Broker, KafkaBroker, KafkaConfig};
use crate::consumer::ConsumerSettings;

/// Broker and consumer options shared by every binary; flattened into each
/// service's `Args`.
#[derive(Debug, Clone, Args)]
pub struct BrokerArgs {
    #[arg(long, env = "KAFKA_BROKERS", default_value = "localhost:9092")]
    pub kafka_brokers: String,

    /// Defaults to the service name.
    #[arg(long, env = "CONSUMER_GROUP")]
    pub consumer_group: Option<String>,

    #[arg(long, env = "PREFETCH", default_value_t = 1)]
    pub prefetch: u16,

    #[arg(long, default_value_t = 5)]
    pub reconnect_backoff_secs: u64,

    #[arg(long, default_value_t = 30)]
    pub handler_timeout_secs: u64,

    #[arg(long, env = "RPC_TIMEOUT_SECS", default_value_t = 10)]
    pub rpc_timeout_secs: u64,
}

impl BrokerArgs {
    pub fn broker(&self, service: &str) -> Arc<dyn Broker> {
        let group = self
            .consumer_group
            .clone()
            .unwrap_or_else(|| service.to_string());
        Arc::new(KafkaBroker::new(KafkaConfig::new(&self.kafka_brokers, group)))
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            prefetch: self.prefetch,
            reconnect_backoff: Duration::from_secs(self.reconnect_backoff_secs),
            handler_timeout: Duration::from_secs(self.handler_timeout_secs),
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestArgs {
        #[command(flatten)]
        broker: BrokerArgs,
    }

    #[test]
    fn test_defaults() {
        let args = TestArgs::parse_from(["test"]);
        let settings = args.broker.consumer_settings();
        assert_eq!(settings.prefetch, 1);
        assert_eq!(settings.reconnect_backoff, Duration::from_secs(5));
        assert_eq!(settings.handler_timeout, Duration::from_secs(30));
        assert_eq!(args.broker.rpc_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_overrides() {
        let args = TestArgs::parse_from([
            "test",
            "--prefetch",
            "8",
            "--reconnect-backoff-secs",
            "1",
            "--consumer-group",
            "orders-blue",
        ]);
        assert_eq!(args.broker.prefetch, 8);
        assert_eq!(
            args.broker.consumer_settings().reconnect_backoff,
            Duration::from_secs(1)
        );
        assert_eq!(args.broker.consumer_group.as_deref(), Some("orders-blue"));
    }
}
