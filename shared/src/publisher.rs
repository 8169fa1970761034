use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

use crate::broker::{Broker, Connection, Properties};
use crate::error::BrokerError;

/// Fire-and-forget publisher with its own connection. Declares each target
/// queue once per connection and drops the connection after a failure so the
/// next publish reconnects.
pub struct Publisher {
    broker: Arc<dyn Broker>,
    connection: Mutex<Option<(Arc<dyn Connection>, HashSet<String>)>>,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            connection: Mutex::new(None),
        }
    }

    pub async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError> {
        let mut slot = self.connection.lock().await;
        if slot.is_none() {
            *slot = Some((self.broker.connect().await?, HashSet::new()));
        }
        let Some((connection, declared)) = slot.as_mut() else {
            return Err(BrokerError::unavailable("publisher has no connection"));
        };

        let result = async {
            if !declared.contains(queue) {
                connection.declare_durable_queue(queue).await?;
                declared.insert(queue.to_string());
            }
            connection.publish(queue, body, Properties::default()).await
        }
        .await;

        if let Err(e) = &result {
            warn!(queue, error = %e, "Publish failed, dropping connection");
            *slot = None;
        }
        result
    }

    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        payload: &T,
    ) -> anyhow::Result<()> {
        let body = serde_json::to_vec(payload)?;
        self.publish(queue, &body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    #[tokio::test]
    async fn test_publish_declares_and_survives_outage() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = Publisher::new(broker.clone());

        publisher.publish("order_created", b"first").await.unwrap();
        assert_eq!(broker.ready_count("order_created"), 1);

        broker.set_available(false);
        assert!(publisher.publish("order_created", b"lost").await.is_err());

        broker.set_available(true);
        publisher.publish("order_created", b"second").await.unwrap();
        assert_eq!(broker.ready_count("order_created"), 2);
    }
}
