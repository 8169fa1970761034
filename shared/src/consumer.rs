//! Reconnecting consumer loop.
//!
//! `Disconnected -> Connecting -> Consuming -> (I/O error) -> Disconnected`,
//! until the shutdown signal flips. Each delivery runs on its own task under
//! a timeout; success acks, any failure nacks without requeue so the message
//! lands in the dead-letter queue instead of being retried forever.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{dead_letter_queue, Broker, Connection, Delivery, Message, Outcome};
use crate::error::BrokerError;

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// `channel` is the connection the message arrived on; replies should be
    /// published through it.
    async fn handle(&self, message: Message, channel: Arc<dyn Connection>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub prefetch: u16,
    pub reconnect_backoff: Duration,
    pub handler_timeout: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            prefetch: 1,
            reconnect_backoff: Duration::from_secs(5),
            handler_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Disconnected,
    Connecting,
    Consuming,
    Stopped,
}

/// How one dispatch ended; anything but `Handled` is a `HandlerFailed`.
#[derive(Debug)]
pub enum Dispatch {
    Handled,
    Failed(anyhow::Error),
    Panicked(String),
    TimedOut(Duration),
}

impl Dispatch {
    pub fn outcome(&self) -> Outcome {
        match self {
            Dispatch::Handled => Outcome::Ack,
            _ => Outcome::Nack { requeue: false },
        }
    }
}

pub struct ConsumerLoop<H> {
    broker: Arc<dyn Broker>,
    queue: String,
    handler: Arc<H>,
    settings: ConsumerSettings,
    state: watch::Sender<LoopState>,
}

impl<H: MessageHandler> ConsumerLoop<H> {
    pub fn new(
        broker: Arc<dyn Broker>,
        queue: impl Into<String>,
        handler: H,
        settings: ConsumerSettings,
    ) -> Self {
        let (state, _) = watch::channel(LoopState::Disconnected);
        Self {
            broker,
            queue: queue.into(),
            handler: Arc::new(handler),
            settings,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            self.state.send_replace(LoopState::Connecting);
            match self.consume(&mut shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    self.state.send_replace(LoopState::Disconnected);
                    warn!(
                        queue = %self.queue,
                        error = %e,
                        "Consumer disconnected, reconnecting in {:?}",
                        self.settings.reconnect_backoff
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.reconnect_backoff) => {}
                        _ = stop_requested(&mut shutdown) => break,
                    }
                }
            }
        }
        self.state.send_replace(LoopState::Stopped);
        info!(queue = %self.queue, "Consumer stopped");
    }

    /// Returns `Ok` only on shutdown.
    async fn consume(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), BrokerError> {
        let connection = self.broker.connect().await?;
        connection.declare_durable_queue(&self.queue).await?;
        connection
            .declare_durable_queue(&dead_letter_queue(&self.queue))
            .await?;
        let mut deliveries = connection
            .consume(&self.queue, self.settings.prefetch)
            .await?;

        self.state.send_replace(LoopState::Consuming);
        info!(queue = %self.queue, prefetch = self.settings.prefetch, "Consuming");

        loop {
            tokio::select! {
                _ = stop_requested(shutdown) => return Ok(()),
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        tokio::spawn(process(
                            self.handler.clone(),
                            delivery,
                            connection.clone(),
                            self.settings.handler_timeout,
                        ));
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(BrokerError::unavailable("delivery stream ended")),
                },
            }
        }
    }
}

async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender counts as a shutdown request.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn process<H: MessageHandler>(
    handler: Arc<H>,
    delivery: Delivery,
    channel: Arc<dyn Connection>,
    timeout: Duration,
) {
    let message = delivery.message().clone();
    let tag = message.delivery_tag;
    if message.redelivered {
        debug!(delivery_tag = %tag, "Processing redelivered message");
    }

    let dispatch = run_handler(handler, message, channel, timeout).await;
    match &dispatch {
        Dispatch::Handled => debug!(delivery_tag = %tag, "Message handled"),
        Dispatch::Failed(e) => error!(delivery_tag = %tag, "Handler failed: {:#}", e),
        Dispatch::Panicked(reason) => error!(delivery_tag = %tag, "Handler panicked: {}", reason),
        Dispatch::TimedOut(limit) => error!(delivery_tag = %tag, "Handler exceeded {:?}", limit),
    }

    // If settling fails the connection is gone and the broker redelivers.
    if let Err(e) = delivery.settle(dispatch.outcome()).await {
        warn!(delivery_tag = %tag, error = %e, "Failed to settle delivery");
    }
}

/// Runs the handler on its own task so a panic or a stuck handler cannot take
/// the delivery loop down with it.
pub async fn run_handler<H: MessageHandler>(
    handler: Arc<H>,
    message: Message,
    channel: Arc<dyn Connection>,
    timeout: Duration,
) -> Dispatch {
    let mut job = tokio::spawn(async move { handler.handle(message, channel).await });
    match tokio::time::timeout(timeout, &mut job).await {
        Ok(Ok(Ok(()))) => Dispatch::Handled,
        Ok(Ok(Err(e))) => Dispatch::Failed(e),
        Ok(Err(e)) => Dispatch::Panicked(e.to_string()),
        Err(_) => {
            job.abort();
            Dispatch::TimedOut(timeout)
        }
    }
}
