//! Correlated request/reply over the broker.
//!
//! Each [`RpcClient`] owns one connection, one exclusive reply queue and a
//! registry of pending calls keyed by correlation id. A dispatcher task
//! consumes the reply queue and completes the matching call; replies nobody
//! is waiting for are dropped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{Broker, Connection, Deliveries, Message, Properties};
use crate::error::{BrokerError, RpcError};

/// Replies are tiny and acked right away, so the window can be wide.
const REPLY_PREFETCH: u16 = 64;

type Waiters = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

fn waiters(registry: &Waiters) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Message>>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registration of one in-flight call; removed from the registry on drop,
/// whether the call completed, timed out or was cancelled.
struct PendingCall {
    correlation_id: String,
    registry: Waiters,
}

impl PendingCall {
    fn register(registry: &Waiters) -> (Self, oneshot::Receiver<Message>) {
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        waiters(registry).insert(correlation_id.clone(), tx);
        let call = Self {
            correlation_id,
            registry: registry.clone(),
        };
        (call, rx)
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        waiters(&self.registry).remove(&self.correlation_id);
    }
}

pub struct RpcClient {
    connection: Arc<dyn Connection>,
    reply_to: String,
    pending: Waiters,
    declared: Mutex<HashSet<String>>,
    closed: Arc<AtomicBool>,
    dispatcher: JoinHandle<()>,
}

impl RpcClient {
    pub async fn connect(broker: &dyn Broker) -> Result<Self, BrokerError> {
        let connection = broker.connect().await?;
        let reply_to = connection.declare_reply_queue().await?;
        let replies = connection.consume(&reply_to, REPLY_PREFETCH).await?;

        let pending = Waiters::default();
        let closed = Arc::new(AtomicBool::new(false));
        let dispatcher = tokio::spawn(dispatch_replies(replies, pending.clone(), closed.clone()));
        debug!(reply_to, "RPC client ready");

        Ok(Self {
            connection,
            reply_to,
            pending,
            declared: Mutex::new(HashSet::new()),
            closed,
            dispatcher,
        })
    }

    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// True once the reply dispatcher lost its connection; every later call
    /// fails and the client should be replaced.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn pending_calls(&self) -> usize {
        waiters(&self.pending).len()
    }

    pub async fn call(
        &self,
        queue: &str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError> {
        if self.is_closed() {
            return Err(BrokerError::unavailable("rpc client connection closed").into());
        }
        self.ensure_declared(queue).await?;

        // Registered before publishing so a fast reply cannot slip past.
        let (call, reply) = PendingCall::register(&self.pending);
        let properties = Properties::request(call.correlation_id.clone(), self.reply_to.clone());
        self.connection.publish(queue, body, properties).await?;

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(message)) => Ok(message.body),
            Ok(Err(_)) => Err(BrokerError::unavailable("reply dispatcher stopped").into()),
            Err(_) => {
                debug!(queue, correlation_id = %call.correlation_id, "RPC call timed out");
                Err(RpcError::TimedOut(timeout))
            }
        }
    }

    pub async fn call_json<Req, Resp>(
        &self,
        queue: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request).map_err(RpcError::Encode)?;
        let reply = self.call(queue, &body, timeout).await?;
        serde_json::from_slice(&reply).map_err(RpcError::Decode)
    }

    /// Stops the dispatcher, fails every in-flight call and deletes the
    /// reply queue.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.dispatcher.abort();
        self.closed.store(true, Ordering::Release);
        waiters(&self.pending).clear();
        self.connection.delete_queue(&self.reply_to).await
    }

    async fn ensure_declared(&self, queue: &str) -> Result<(), BrokerError> {
        if self.lock_declared().contains(queue) {
            return Ok(());
        }
        self.connection.declare_durable_queue(queue).await?;
        self.lock_declared().insert(queue.to_string());
        Ok(())
    }

    fn lock_declared(&self) -> MutexGuard<'_, HashSet<String>> {
        self.declared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch_replies(mut replies: Deliveries, pending: Waiters, closed: Arc<AtomicBool>) {
    while let Some(next) = replies.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(error = %e, "Reply consumer lost its connection");
                break;
            }
        };

        let message = delivery.message().clone();
        let waiter = message
            .correlation_id
            .as_deref()
            .and_then(|id| waiters(&pending).remove(id));
        match waiter {
            Some(tx) => {
                if tx.send(message).is_err() {
                    debug!("Caller stopped waiting before the reply arrived");
                }
            }
            None => debug!(
                correlation_id = ?message.correlation_id,
                "Discarding reply with no pending call"
            ),
        }

        if let Err(e) = delivery.ack().await {
            warn!(error = %e, "Failed to ack reply");
            break;
        }
    }

    closed.store(true, Ordering::Release);
    // Dropping the senders wakes every waiter with an error.
    waiters(&pending).clear();
}

/// Publishes `reply` to the request's reply address, carrying its
/// correlation id. Returns `false` when the request had no reply address.
pub async fn respond<T: Serialize + ?Sized>(
    channel: &dyn Connection,
    request: &Message,
    reply: &T,
) -> Result<bool, RpcError> {
    let Some(reply_to) = request.reply_to.as_deref() else {
        return Ok(false);
    };
    let body = serde_json::to_vec(reply).map_err(RpcError::Encode)?;
    channel
        .publish(reply_to, &body, Properties::reply(request.correlation_id.clone()))
        .await?;
    Ok(true)
}

/// An [`RpcClient`] that reconnects lazily: once the current client closes,
/// the next call builds a fresh one with a new reply queue.
pub struct SharedRpcClient {
    broker: Arc<dyn Broker>,
    client: tokio::sync::Mutex<Option<Arc<RpcClient>>>,
}

impl SharedRpcClient {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            client: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn get(&self) -> Result<Arc<RpcClient>, BrokerError> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref().filter(|client| !client.is_closed()) {
            return Ok(client.clone());
        }
        let client = Arc::new(RpcClient::connect(self.broker.as_ref()).await?);
        *slot = Some(client.clone());
        Ok(client)
    }

    pub async fn call_json<Req, Resp>(
        &self,
        queue: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.get().await?.call_json(queue, request, timeout).await
    }

    /// Closes the current client, if any. A later call connects again.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let client = self.client.lock().await.take();
        match client {
            Some(client) => client.close().await,
            None => Ok(()),
        }
    }
}
