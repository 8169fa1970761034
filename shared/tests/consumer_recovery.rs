//! Consumer loop behaviour across broker outages.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use shared::broker::Properties;
use shared::{
    Broker, Connection, ConsumerLoop, ConsumerSettings, LoopState, MemoryBroker, Message,
    MessageHandler,
};
use tokio::sync::watch;

#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn count(&self, body: &str) -> usize {
        self.seen.lock().unwrap().iter().filter(|b| *b == body).count()
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, message: Message, _channel: Arc<dyn Connection>) -> anyhow::Result<()> {
        let body = String::from_utf8(message.body)?;
        if body.starts_with("slow") {
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        if body == "bad" {
            anyhow::bail!("cannot process {body}");
        }
        self.seen.lock().unwrap().push(body);
        Ok(())
    }
}

fn settings() -> ConsumerSettings {
    ConsumerSettings {
        prefetch: 1,
        reconnect_backoff: Duration::from_millis(50),
        handler_timeout: Duration::from_secs(2),
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn publish(broker: &MemoryBroker, queue: &str, body: &str) {
    let conn = broker.connect().await.unwrap();
    conn.declare_durable_queue(queue).await.unwrap();
    conn.publish(queue, body.as_bytes(), Properties::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_resumes_after_outage_without_losing_messages() {
    let broker = Arc::new(MemoryBroker::new());
    let recorder = Recorder::default();
    let consumer = ConsumerLoop::new(broker.clone(), "order_created", recorder.clone(), settings());
    let mut state = consumer.state();
    let (_stop, shutdown) = watch::channel(false);
    consumer.spawn(shutdown);

    state.wait_for(|s| *s == LoopState::Consuming).await.unwrap();
    publish(&broker, "order_created", "first").await;
    eventually(|| recorder.count("first") == 1).await;

    broker.set_available(false);
    state
        .wait_for(|s| *s == LoopState::Disconnected)
        .await
        .unwrap();

    // Give the loop a few failed reconnect attempts while the broker is down.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_ne!(*state.borrow(), LoopState::Consuming);

    broker.set_available(true);
    publish(&broker, "order_created", "second").await;
    state.wait_for(|s| *s == LoopState::Consuming).await.unwrap();

    eventually(|| recorder.count("second") == 1).await;
    eventually(|| broker.unacked_count("order_created") == 0).await;
    assert_eq!(recorder.count("first"), 1);
    assert_eq!(broker.ready_count("order_created"), 0);
}

#[tokio::test]
async fn test_message_in_flight_during_outage_is_redelivered() {
    let broker = Arc::new(MemoryBroker::new());
    let recorder = Recorder::default();
    let consumer = ConsumerLoop::new(broker.clone(), "order_created", recorder.clone(), settings());
    let mut state = consumer.state();
    let (_stop, shutdown) = watch::channel(false);
    consumer.spawn(shutdown);

    state.wait_for(|s| *s == LoopState::Consuming).await.unwrap();
    publish(&broker, "order_created", "slow-1").await;
    eventually(|| broker.unacked_count("order_created") == 1).await;

    // Drop the connection while the handler is still running.
    broker.set_available(false);
    broker.set_available(true);

    // The first attempt finishes but cannot ack; the broker hands the
    // message out again after the loop reconnects.
    eventually(|| recorder.count("slow-1") == 2).await;
    eventually(|| broker.unacked_count("order_created") == 0).await;
    assert_eq!(broker.ready_count("order_created"), 0);
    assert!(broker.dead_letters("order_created").is_empty());
}

#[tokio::test]
async fn test_failed_messages_are_dead_lettered_and_loop_continues() {
    let broker = Arc::new(MemoryBroker::new());
    let recorder = Recorder::default();
    let consumer = ConsumerLoop::new(broker.clone(), "user_register", recorder.clone(), settings());
    let mut state = consumer.state();
    let (_stop, shutdown) = watch::channel(false);
    consumer.spawn(shutdown);

    state.wait_for(|s| *s == LoopState::Consuming).await.unwrap();
    publish(&broker, "user_register", "bad").await;
    publish(&broker, "user_register", "good").await;

    eventually(|| recorder.count("good") == 1).await;
    eventually(|| broker.dead_letters("user_register").len() == 1).await;
    assert_eq!(broker.dead_letters("user_register"), vec![b"bad".to_vec()]);
    assert_eq!(*state.borrow(), LoopState::Consuming);
}
