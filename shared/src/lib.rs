//! Messaging substrate shared by the gateway and the services: a broker
//! abstraction with Kafka and in-memory backends, a reconnecting consumer
//! loop, and correlated request/reply on top of both.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod messages;
pub mod publisher;
pub mod rpc;
pub mod telemetry;

pub use broker::{Broker, Connection, Delivery, DeliveryTag, MemoryBroker, Message, Outcome, Properties};
pub use config::BrokerArgs;
pub use consumer::{ConsumerLoop, ConsumerSettings, LoopState, MessageHandler};
pub use error::{BrokerError, RpcError};
pub use messages::*;
pub use publisher::Publisher;
pub use rpc::{respond, RpcClient, SharedRpcClient};
