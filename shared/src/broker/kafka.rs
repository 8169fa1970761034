//! Kafka-backed broker.
//!
//! Queues map to single-partition topics. `correlation_id` and `reply_to`
//! travel as record headers. Acknowledgement commits the lowest offset that
//! is still unsettled, so a delivery settled out of order never causes an
//! earlier one to be skipped after a restart. Reply queues are uniquely
//! named topics created through the admin client and deleted with their
//! connection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use rdkafka::{Message as _, Offset, TopicPartitionList};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    dead_letter_queue, prefetch_window, Broker, Connection, Deliveries, Delivery, DeliveryTag,
    Message, Outcome, Properties, Settle,
};
use crate::error::BrokerError;

const CORRELATION_ID_HEADER: &str = "correlation_id";
const REPLY_TO_HEADER: &str = "reply_to";
const REPLY_QUEUE_PREFIX: &str = "rpc.reply.";

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    /// Consumer group shared by every instance of one service.
    pub group_id: String,
    pub replication: i32,
    pub operation_timeout: Duration,
}

impl KafkaConfig {
    pub fn new(brokers: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            group_id: group_id.into(),
            replication: 1,
            operation_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KafkaBroker {
    config: KafkaConfig,
}

impl KafkaBroker {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .create()?;

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .create()?;

        // librdkafka connects lazily; fetch metadata so an unreachable cluster shows up
        // here instead of as silently buffered publishes.
        let metadata_producer = producer.clone();
        let timeout = self.config.operation_timeout;
        tokio::task::spawn_blocking(move || metadata_producer.client().fetch_metadata(None, timeout))
            .await
            .map_err(|e| BrokerError::unavailable(format!("metadata fetch aborted: {e}")))??;

        info!(brokers = %self.config.brokers, "Connected to Kafka");
        Ok(Arc::new(KafkaConnection {
            config: self.config.clone(),
            producer,
            admin: Arc::new(admin),
            reply_queues: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        }))
    }
}

struct KafkaConnection {
    config: KafkaConfig,
    producer: FutureProducer,
    admin: Arc<AdminClient<DefaultClientContext>>,
    reply_queues: Mutex<Vec<String>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl KafkaConnection {
    fn admin_options(&self) -> AdminOptions {
        AdminOptions::new().operation_timeout(Some(self.config.operation_timeout))
    }

    async fn create_topic(&self, topic: NewTopic<'_>) -> Result<(), BrokerError> {
        let results = self
            .admin
            .create_topics(&[topic], &self.admin_options())
            .await?;
        for result in results {
            match result {
                Ok(_) | Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((name, code)) => {
                    return Err(BrokerError::unavailable(format!(
                        "failed to create topic {name}: {code}"
                    )))
                }
            }
        }
        Ok(())
    }

    fn is_reply_queue(&self, queue: &str) -> bool {
        lock(&self.reply_queues).iter().any(|name| name == queue)
    }
}

#[async_trait]
impl Connection for KafkaConnection {
    async fn declare_durable_queue(&self, name: &str) -> Result<(), BrokerError> {
        let topic = NewTopic::new(name, 1, TopicReplication::Fixed(self.config.replication));
        self.create_topic(topic).await
    }

    async fn declare_reply_queue(&self) -> Result<String, BrokerError> {
        let name = format!("{REPLY_QUEUE_PREFIX}{}", Uuid::new_v4().simple());
        let topic = NewTopic::new(&name, 1, TopicReplication::Fixed(1)).set("retention.ms", "600000");
        self.create_topic(topic).await?;
        lock(&self.reply_queues).push(name.clone());
        Ok(name)
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        let results = self
            .admin
            .delete_topics(&[name], &self.admin_options())
            .await?;
        for result in results {
            if let Err((topic, code)) = result {
                if code != RDKafkaErrorCode::UnknownTopicOrPartition {
                    return Err(BrokerError::unavailable(format!(
                        "failed to delete topic {topic}: {code}"
                    )));
                }
            }
        }
        lock(&self.reply_queues).retain(|queue| queue != name);
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: Properties,
    ) -> Result<(), BrokerError> {
        let record = FutureRecord::<(), [u8]>::to(queue)
            .payload(body)
            .headers(headers_for(&properties));

        // Fire-and-forget: the delivery report future is dropped.
        match self.producer.send_result(record) {
            Ok(_delivery) => Ok(()),
            Err((e, _)) => Err(BrokerError::Kafka(e)),
        }
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Deliveries, BrokerError> {
        // Reply queues get a private group so every client sees its own replies.
        let group_id = if self.is_reply_queue(queue) {
            format!("{}-{}", self.config.group_id, Uuid::new_v4().simple())
        } else {
            self.config.group_id.clone()
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &group_id)
            .set("bootstrap.servers", &self.config.brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;
        consumer.subscribe(&[queue])?;

        let settler = Arc::new(KafkaSettler {
            queue: queue.to_string(),
            consumer: Arc::new(consumer),
            producer: self.producer.clone(),
            send_timeout: self.config.operation_timeout,
            offsets: Mutex::new(OffsetTracker::default()),
        });
        let (tx, deliveries) = Deliveries::channel();
        let handle = tokio::spawn(pump(settler, prefetch_window(prefetch), tx));
        lock(&self.consumers).push(handle);

        debug!(queue, group_id, prefetch, "Subscribed");
        Ok(deliveries)
    }
}

impl Drop for KafkaConnection {
    fn drop(&mut self) {
        for handle in lock(&self.consumers).drain(..) {
            handle.abort();
        }

        let leftover: Vec<String> = lock(&self.reply_queues).drain(..).collect();
        if leftover.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(?leftover, "No runtime to delete reply topics");
            return;
        };
        let admin = self.admin.clone();
        let options = self.admin_options();
        runtime.spawn(async move {
            let names: Vec<&str> = leftover.iter().map(String::as_str).collect();
            if let Err(e) = admin.delete_topics(&names, &options).await {
                warn!(error = %e, "Failed to delete reply topics");
            }
        });
    }
}

fn headers_for(properties: &Properties) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new();
    if let Some(id) = &properties.correlation_id {
        headers = headers.insert(Header {
            key: CORRELATION_ID_HEADER,
            value: Some(id.as_str()),
        });
    }
    if let Some(reply_to) = &properties.reply_to {
        headers = headers.insert(Header {
            key: REPLY_TO_HEADER,
            value: Some(reply_to.as_str()),
        });
    }
    headers
}

fn header_value(message: &BorrowedMessage<'_>, key: &str) -> Option<String> {
    message.headers().and_then(|headers| {
        headers
            .iter()
            .find(|header| header.key == key)
            .and_then(|header| header.value)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    })
}

/// Tracks unsettled offsets per partition and yields the next offset that is
/// safe to commit.
#[derive(Debug, Default)]
struct OffsetTracker {
    next_tag: u64,
    tags: HashMap<DeliveryTag, (i32, i64)>,
    in_flight: BTreeMap<i32, BTreeSet<i64>>,
    highest_settled: BTreeMap<i32, i64>,
    committed: BTreeMap<i32, i64>,
}

impl OffsetTracker {
    fn track(&mut self, partition: i32, offset: i64) -> DeliveryTag {
        self.next_tag += 1;
        let tag = DeliveryTag(self.next_tag);
        self.tags.insert(tag, (partition, offset));
        self.in_flight.entry(partition).or_default().insert(offset);
        tag
    }

    /// Returns `(partition, offset)` to commit when the commit point advanced.
    fn settle(&mut self, tag: DeliveryTag) -> Option<(i32, i64)> {
        let (partition, offset) = self.tags.remove(&tag)?;
        let pending = self.in_flight.entry(partition).or_default();
        pending.remove(&offset);

        let highest = self.highest_settled.entry(partition).or_insert(offset);
        *highest = (*highest).max(offset);

        let commit_to = match pending.first() {
            Some(lowest) => *lowest,
            None => *highest + 1,
        };
        let committed = self.committed.entry(partition).or_insert(-1);
        if commit_to > *committed {
            *committed = commit_to;
            Some((partition, commit_to))
        } else {
            None
        }
    }
}

struct KafkaSettler {
    queue: String,
    consumer: Arc<StreamConsumer>,
    producer: FutureProducer,
    send_timeout: Duration,
    offsets: Mutex<OffsetTracker>,
}

impl KafkaSettler {
    /// Copies `message` onto `topic` and waits for the delivery report, so
    /// the source offset is only committed once the copy is durable.
    async fn republish(&self, topic: &str, message: &Message) -> Result<(), BrokerError> {
        let properties = Properties {
            correlation_id: message.correlation_id.clone(),
            reply_to: message.reply_to.clone(),
        };
        let record = FutureRecord::<(), [u8]>::to(topic)
            .payload(&message.body)
            .headers(headers_for(&properties));
        self.producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _)| BrokerError::Kafka(e))
    }
}

#[async_trait]
impl Settle for KafkaSettler {
    async fn settle(&self, message: &Message, outcome: Outcome) -> Result<(), BrokerError> {
        match outcome {
            Outcome::Ack => {}
            Outcome::Nack { requeue: true } => self.republish(&self.queue, message).await?,
            Outcome::Nack { requeue: false } => {
                self.republish(&dead_letter_queue(&self.queue), message)
                    .await?
            }
        }

        let commit = lock(&self.offsets).settle(message.delivery_tag);
        if let Some((partition, offset)) = commit {
            let mut list = TopicPartitionList::new();
            list.add_partition_offset(&self.queue, partition, Offset::Offset(offset))?;
            self.consumer.commit(&list, CommitMode::Async)?;
        }
        Ok(())
    }
}

async fn pump(
    settler: Arc<KafkaSettler>,
    window: Arc<Semaphore>,
    tx: mpsc::Sender<Result<Delivery, BrokerError>>,
) {
    static CONSUMERS: AtomicU64 = AtomicU64::new(0);
    let consumer_id = CONSUMERS.fetch_add(1, Ordering::Relaxed);

    loop {
        let permit = tokio::select! {
            permit = window.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = tx.closed() => return,
        };

        let received = tokio::select! {
            received = settler.consumer.recv() => received,
            _ = tx.closed() => return,
        };

        let message = match received {
            Ok(record) => {
                let tag = lock(&settler.offsets).track(record.partition(), record.offset());
                Message {
                    body: record.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    correlation_id: header_value(&record, CORRELATION_ID_HEADER),
                    reply_to: header_value(&record, REPLY_TO_HEADER),
                    delivery_tag: tag,
                    redelivered: false,
                }
            }
            Err(e) => {
                warn!(consumer_id, queue = %settler.queue, error = %e, "Kafka consumer failed");
                let _ = tx.send(Err(BrokerError::Kafka(e))).await;
                return;
            }
        };

        let delivery = Delivery::new(message, settler.clone(), permit);
        if tx.send(Ok(delivery)).await.is_err() {
            return;
        }
    }
}
