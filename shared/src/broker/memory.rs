//! In-process broker used by the test suites and for single-process runs.
//!
//! Follows the queue semantics the services depend on: durable queues
//! survive an outage, reply queues are exclusive to the connection that
//! declared them and vanish with it, unsettled messages go back to the head
//! of their queue (flagged as redelivered) when their connection dies, and
//! `Nack { requeue: false }` moves a message to `<queue>.dead_letter`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use super::{
    dead_letter_queue, prefetch_window, Broker, Connection, Deliveries, Delivery, DeliveryTag,
    Message, Outcome, Properties, Settle,
};
use crate::error::BrokerError;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    down: bool,
    /// Bumped on every outage; connections from an older epoch are dead.
    epoch: u64,
    next_connection: u64,
    next_tag: u64,
    queues: HashMap<String, Queue>,
}

struct Queue {
    durable: bool,
    owner: Option<u64>,
    ready: VecDeque<Stored>,
    unacked: BTreeMap<DeliveryTag, (u64, Stored)>,
    notify: Arc<Notify>,
}

#[derive(Clone)]
struct Stored {
    body: Vec<u8>,
    properties: Properties,
    redelivered: bool,
}

impl Queue {
    fn new(durable: bool, owner: Option<u64>) -> Self {
        Self {
            durable,
            owner,
            ready: VecDeque::new(),
            unacked: BTreeMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn requeue_where(&mut self, mut held_by: impl FnMut(u64) -> bool) {
        let tags: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, (holder, _))| held_by(*holder))
            .map(|(tag, _)| *tag)
            .collect();
        // Reverse so the oldest delivery ends up at the very front.
        for tag in tags.into_iter().rev() {
            if let Some((_, mut stored)) = self.unacked.remove(&tag) {
                stored.redelivered = true;
                self.ready.push_front(stored);
            }
        }
        self.notify.notify_waiters();
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing (`false`) or restoring (`true`) the broker. Losing
    /// it kills every live connection, returns unsettled messages to their
    /// queues and drops transient queues.
    pub fn set_available(&self, available: bool) {
        let mut state = self.lock();
        if available {
            state.down = false;
            return;
        }
        state.down = true;
        state.epoch += 1;
        for queue in state.queues.values_mut() {
            queue.requeue_where(|_| true);
        }
        state.queues.retain(|_, queue| queue.durable);
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Messages waiting to be delivered.
    pub fn ready_count(&self, name: &str) -> usize {
        self.lock()
            .queues
            .get(name)
            .map_or(0, |queue| queue.ready.len())
    }

    pub fn unacked_count(&self, name: &str) -> usize {
        self.lock()
            .queues
            .get(name)
            .map_or(0, |queue| queue.unacked.len())
    }

    /// Bodies dead-lettered from `queue`, oldest first.
    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(&dead_letter_queue(queue))
            .map(|queue| queue.ready.iter().map(|stored| stored.body.clone()).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live<'a>(state: &'a mut State, epoch: u64) -> Result<&'a mut State, BrokerError> {
        if state.down || state.epoch != epoch {
            return Err(BrokerError::unavailable("connection lost"));
        }
        Ok(state)
    }

    fn release_connection(&self, connection: u64) {
        let mut state = self.lock();
        for queue in state.queues.values_mut() {
            queue.requeue_where(|holder| holder == connection);
        }
        state.queues.retain(|_, queue| {
            let owned = queue.owner == Some(connection);
            if owned {
                queue.notify.notify_waiters();
            }
            !owned
        });
    }

    fn waiter(&self, queue: &str, epoch: u64) -> Result<Arc<Notify>, BrokerError> {
        let mut guard = self.lock();
        let state = Self::live(&mut guard, epoch)?;
        state
            .queues
            .get(queue)
            .map(|queue| queue.notify.clone())
            .ok_or_else(|| BrokerError::unavailable(format!("queue {queue} no longer exists")))
    }

    fn take(
        &self,
        queue: &str,
        connection: u64,
        epoch: u64,
    ) -> Result<Option<Message>, BrokerError> {
        let mut guard = self.lock();
        let state = Self::live(&mut guard, epoch)?;
        state.next_tag += 1;
        let tag = DeliveryTag(state.next_tag);
        let queue = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::unavailable(format!("queue {queue} no longer exists")))?;
        let Some(stored) = queue.ready.pop_front() else {
            return Ok(None);
        };
        let message = Message {
            body: stored.body.clone(),
            correlation_id: stored.properties.correlation_id.clone(),
            reply_to: stored.properties.reply_to.clone(),
            delivery_tag: tag,
            redelivered: stored.redelivered,
        };
        queue.unacked.insert(tag, (connection, stored));
        Ok(Some(message))
    }

    fn settle(
        &self,
        queue: &str,
        epoch: u64,
        tag: DeliveryTag,
        outcome: Outcome,
    ) -> Result<(), BrokerError> {
        let mut guard = self.lock();
        let state = Self::live(&mut guard, epoch)?;
        let stored = state
            .queues
            .get_mut(queue)
            .and_then(|queue| queue.unacked.remove(&tag))
            .map(|(_, stored)| stored)
            .ok_or_else(|| BrokerError::unavailable(format!("unknown delivery tag {tag}")))?;

        match outcome {
            Outcome::Ack => {}
            Outcome::Nack { requeue: true } => {
                if let Some(queue) = state.queues.get_mut(queue) {
                    let mut stored = stored;
                    stored.redelivered = true;
                    queue.ready.push_front(stored);
                    queue.notify.notify_waiters();
                }
            }
            Outcome::Nack { requeue: false } => {
                let dead = state
                    .queues
                    .entry(dead_letter_queue(queue))
                    .or_insert_with(|| Queue::new(true, None));
                dead.ready.push_back(stored);
                dead.notify.notify_waiters();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        let mut state = self.lock();
        if state.down {
            return Err(BrokerError::unavailable("broker is down"));
        }
        state.next_connection += 1;
        Ok(Arc::new(MemoryConnection {
            id: state.next_connection,
            epoch: state.epoch,
            broker: self.clone(),
            pumps: Mutex::new(Vec::new()),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    epoch: u64,
    broker: MemoryBroker,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl MemoryConnection {
    fn declare(&self, name: &str, durable: bool, owner: Option<u64>) -> Result<(), BrokerError> {
        let mut guard = self.broker.lock();
        let state = MemoryBroker::live(&mut guard, self.epoch)?;
        state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Queue::new(durable, owner));
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn declare_durable_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.declare(name, true, None)
    }

    async fn declare_reply_queue(&self) -> Result<String, BrokerError> {
        let name = format!("amq.gen-{}", Uuid::new_v4().simple());
        self.declare(&name, false, Some(self.id))?;
        Ok(name)
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        let mut guard = self.broker.lock();
        let state = MemoryBroker::live(&mut guard, self.epoch)?;
        if let Some(queue) = state.queues.remove(name) {
            queue.notify.notify_waiters();
        }
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: Properties,
    ) -> Result<(), BrokerError> {
        let mut guard = self.broker.lock();
        let state = MemoryBroker::live(&mut guard, self.epoch)?;
        match state.queues.get_mut(queue) {
            Some(target) => {
                target.ready.push_back(Stored {
                    body: body.to_vec(),
                    properties,
                    redelivered: false,
                });
                target.notify.notify_waiters();
            }
            // Unroutable messages are dropped, as with a default exchange.
            None => debug!(queue, "dropping message published to an undeclared queue"),
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Deliveries, BrokerError> {
        {
            let mut guard = self.broker.lock();
            let state = MemoryBroker::live(&mut guard, self.epoch)?;
            let target = state
                .queues
                .get(queue)
                .ok_or_else(|| BrokerError::unavailable(format!("queue {queue} not declared")))?;
            if target.owner.is_some_and(|owner| owner != self.id) {
                return Err(BrokerError::unavailable(format!(
                    "queue {queue} is exclusive to another connection"
                )));
            }
        }

        let (tx, deliveries) = Deliveries::channel();
        let settler: Arc<dyn Settle> = Arc::new(MemorySettler {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            epoch: self.epoch,
        });
        let pump = tokio::spawn(pump(
            self.broker.clone(),
            queue.to_string(),
            self.id,
            self.epoch,
            prefetch_window(prefetch),
            settler,
            tx,
        ));
        self.pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pump);
        Ok(deliveries)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        for pump in self
            .pumps
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            pump.abort();
        }
        self.broker.release_connection(self.id);
    }
}

async fn pump(
    broker: MemoryBroker,
    queue: String,
    connection: u64,
    epoch: u64,
    window: Arc<Semaphore>,
    settler: Arc<dyn Settle>,
    tx: mpsc::Sender<Result<Delivery, BrokerError>>,
) {
    loop {
        let permit = tokio::select! {
            permit = window.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = tx.closed() => return,
        };

        let message = loop {
            let notify = match broker.waiter(&queue, epoch) {
                Ok(notify) => notify,
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match broker.take(&queue, connection, epoch) {
                Ok(Some(message)) => break message,
                Ok(None) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tx.closed() => return,
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        };

        let delivery = Delivery::new(message, settler.clone(), permit);
        if tx.send(Ok(delivery)).await.is_err() {
            return;
        }
    }
}

struct MemorySettler {
    broker: MemoryBroker,
    queue: String,
    epoch: u64,
}

#[async_trait]
impl Settle for MemorySettler {
    async fn settle(&self, message: &Message, outcome: Outcome) -> Result<(), BrokerError> {
        self.broker
            .settle(&self.queue, self.epoch, message.delivery_tag, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next_delivery(deliveries: &mut Deliveries) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), deliveries.next())
            .await
            .expect("delivery in time")
            .expect("stream open")
            .expect("healthy delivery")
    }

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        conn.declare_durable_queue("jobs").await.unwrap();
        conn.declare_durable_queue("jobs").await.unwrap();
        conn.publish("jobs", b"one", Properties::request("c-1", "replies"))
            .await
            .unwrap();

        let mut deliveries = conn.consume("jobs", 1).await.unwrap();
        let delivery = next_delivery(&mut deliveries).await;
        assert_eq!(delivery.message().body, b"one");
        assert_eq!(delivery.message().correlation_id.as_deref(), Some("c-1"));
        assert_eq!(delivery.message().reply_to.as_deref(), Some("replies"));
        assert!(!delivery.message().redelivered);
        assert_eq!(broker.unacked_count("jobs"), 1);

        delivery.ack().await.unwrap();
        assert_eq!(broker.unacked_count("jobs"), 0);
        assert_eq!(broker.ready_count("jobs"), 0);
    }

    #[tokio::test]
    async fn test_prefetch_bounds_unsettled_deliveries() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        conn.declare_durable_queue("jobs").await.unwrap();
        for body in [b"a", b"b", b"c"] {
            conn.publish("jobs", body, Properties::default()).await.unwrap();
        }

        let mut deliveries = conn.consume("jobs", 2).await.unwrap();
        let first = next_delivery(&mut deliveries).await;
        let _second = next_delivery(&mut deliveries).await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), deliveries.next()).await;
        assert!(blocked.is_err(), "third delivery must wait for a free slot");

        first.ack().await.unwrap();
        let third = next_delivery(&mut deliveries).await;
        assert_eq!(third.message().body, b"c");
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        conn.declare_durable_queue("jobs").await.unwrap();
        conn.publish("jobs", b"poison", Properties::default()).await.unwrap();

        let mut deliveries = conn.consume("jobs", 1).await.unwrap();
        next_delivery(&mut deliveries).await.nack(false).await.unwrap();

        assert_eq!(broker.dead_letters("jobs"), vec![b"poison".to_vec()]);
        assert_eq!(broker.ready_count("jobs"), 0);
    }

    #[tokio::test]
    async fn test_nack_with_requeue_redelivers() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        conn.declare_durable_queue("jobs").await.unwrap();
        conn.publish("jobs", b"again", Properties::default()).await.unwrap();

        let mut deliveries = conn.consume("jobs", 1).await.unwrap();
        next_delivery(&mut deliveries).await.nack(true).await.unwrap();

        let again = next_delivery(&mut deliveries).await;
        assert_eq!(again.message().body, b"again");
        assert!(again.message().redelivered);
    }

    #[tokio::test]
    async fn test_outage_requeues_unacked_and_kills_connections() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        conn.declare_durable_queue("jobs").await.unwrap();
        conn.publish("jobs", b"held", Properties::default()).await.unwrap();
        let mut deliveries = conn.consume("jobs", 1).await.unwrap();
        let held = next_delivery(&mut deliveries).await;

        broker.set_available(false);
        assert!(held.ack().await.is_err());
        assert!(matches!(deliveries.next().await, Some(Err(_)) | None));
        assert!(broker.connect().await.is_err());

        broker.set_available(true);
        let conn = broker.connect().await.unwrap();
        let mut deliveries = conn.consume("jobs", 1).await.unwrap();
        let again = next_delivery(&mut deliveries).await;
        assert_eq!(again.message().body, b"held");
        assert!(again.message().redelivered);
    }

    #[tokio::test]
    async fn test_reply_queue_is_exclusive_and_transient() {
        let broker = MemoryBroker::new();
        let owner = broker.connect().await.unwrap();
        let other = broker.connect().await.unwrap();
        let reply_to = owner.declare_reply_queue().await.unwrap();

        assert!(other.consume(&reply_to, 1).await.is_err());
        other
            .publish(&reply_to, b"reply", Properties::reply(Some("c-9".into())))
            .await
            .unwrap();
        assert_eq!(broker.ready_count(&reply_to), 1);

        drop(owner);
        assert!(!broker.queue_exists(&reply_to));
    }

    #[tokio::test]
    async fn test_dropped_connection_returns_unacked_messages() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        conn.declare_durable_queue("jobs").await.unwrap();
        conn.publish("jobs", b"orphan", Properties::default()).await.unwrap();
        let mut deliveries = conn.consume("jobs", 1).await.unwrap();
        let orphan = next_delivery(&mut deliveries).await;

        drop(orphan);
        drop(deliveries);
        drop(conn);

        assert_eq!(broker.ready_count("jobs"), 1);
        assert_eq!(broker.unacked_count("jobs"), 0);
    }
}
