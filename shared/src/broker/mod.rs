//! Broker abstraction shared by every service.
//!
//! A [`Broker`] hands out [`Connection`]s. A connection declares queues,
//! publishes fire-and-forget messages and opens consumers. Each consumer
//! yields [`Delivery`] values that must be settled exactly once with an
//! [`Outcome`]; at most `prefetch` deliveries are unsettled at any time.

mod kafka;
mod memory;

pub use kafka::{KafkaBroker, KafkaConfig};
pub use memory::MemoryBroker;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use crate::error::BrokerError;

/// Suffix of the queue that receives messages nacked without requeue.
pub const DEAD_LETTER_SUFFIX: &str = ".dead_letter";

pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_SUFFIX}")
}

/// Consumer-local token identifying one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable message as handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub delivery_tag: DeliveryTag,
    /// Set when the broker hands the message out again after the consumer
    /// that held it went away without settling it.
    pub redelivered: bool,
}

/// Optional routing properties attached at publish time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl Properties {
    pub fn request(correlation_id: impl Into<String>, reply_to: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: Some(reply_to.into()),
        }
    }

    pub fn reply(correlation_id: Option<String>) -> Self {
        Self {
            correlation_id,
            reply_to: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    /// `requeue: false` dead-letters the message.
    Nack { requeue: bool },
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    /// Idempotent.
    async fn declare_durable_queue(&self, name: &str) -> Result<(), BrokerError>;

    /// Creates an exclusive, transient queue owned by this connection and
    /// returns its generated name. The queue disappears with the connection.
    async fn declare_reply_queue(&self) -> Result<String, BrokerError>;

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError>;

    /// Fire-and-forget. Returns once the broker client accepted the message,
    /// without waiting for a delivery confirmation.
    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: Properties,
    ) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Deliveries, BrokerError>;
}

/// Settles deliveries on behalf of the consumer that produced them.
#[async_trait]
pub(crate) trait Settle: Send + Sync {
    async fn settle(&self, message: &Message, outcome: Outcome) -> Result<(), BrokerError>;
}

/// One unsettled message. Dropping it without settling leaves the message
/// unacknowledged until its connection goes away.
pub struct Delivery {
    message: Message,
    settler: Arc<dyn Settle>,
    _permit: OwnedSemaphorePermit,
}

impl Delivery {
    pub(crate) fn new(
        message: Message,
        settler: Arc<dyn Settle>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            message,
            settler,
            _permit: permit,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.settle(Outcome::Ack).await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(Outcome::Nack { requeue }).await
    }

    /// The prefetch slot is released once this returns.
    pub async fn settle(self, outcome: Outcome) -> Result<(), BrokerError> {
        self.settler.settle(&self.message, outcome).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from one consumer. An `Err` item means the
/// connection is gone; nothing follows it.
pub struct Deliveries {
    rx: mpsc::Receiver<Result<Delivery, BrokerError>>,
}

impl Deliveries {
    pub(crate) fn channel() -> (mpsc::Sender<Result<Delivery, BrokerError>>, Self) {
        let (tx, rx) = mpsc::channel(1);
        (tx, Self { rx })
    }

    pub async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        self.rx.recv().await
    }
}

pub(crate) fn prefetch_window(prefetch: u16) -> Arc<Semaphore> {
    Arc::new(Semaphore::new(usize::from(prefetch.max(1))))
}
