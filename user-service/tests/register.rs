use std::sync::Arc;
use std::time::Duration;

use shared::{
    queues, ConsumerLoop, ConsumerSettings, MemoryBroker, Query, RpcClient, UserRegister,
    UserRegisterReply, UserSummary,
};
use tokio::sync::watch;
use user_service::{InMemoryUserStore, RegisterUserHandler, UserQueryHandler};

const TIMEOUT: Duration = Duration::from_secs(5);

fn settings() -> ConsumerSettings {
    ConsumerSettings {
        reconnect_backoff: Duration::from_millis(50),
        ..ConsumerSettings::default()
    }
}

fn serve(broker: &MemoryBroker, store: &InMemoryUserStore) -> watch::Sender<bool> {
    let (stop, shutdown) = watch::channel(false);
    ConsumerLoop::new(
        Arc::new(broker.clone()),
        queues::USER_REGISTER,
        RegisterUserHandler::new(Arc::new(store.clone())),
        settings(),
    )
    .spawn(shutdown.clone());
    ConsumerLoop::new(
        Arc::new(broker.clone()),
        queues::USER_QUERY,
        UserQueryHandler::new(Arc::new(store.clone())),
        settings(),
    )
    .spawn(shutdown);
    stop
}

fn ada() -> UserRegister {
    UserRegister {
        username: "ada".into(),
        email: "ada@example.com".into(),
        password: "analytical-engine".into(),
    }
}

#[tokio::test]
async fn test_register_then_duplicate() {
    let broker = MemoryBroker::new();
    let store = InMemoryUserStore::new();
    let _server = serve(&broker, &store);
    let client = RpcClient::connect(&broker).await.unwrap();

    let first: UserRegisterReply = client
        .call_json(queues::USER_REGISTER, &ada(), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(first, UserRegisterReply::registered(1));

    let second: UserRegisterReply = client
        .call_json(queues::USER_REGISTER, &ada(), TIMEOUT)
        .await
        .unwrap();
    assert!(!second.success);
    assert!(second.conflict);
    assert_eq!(second.error.as_deref(), Some("Email already exists"));
    assert_eq!(store.count().await, 1);
}

#[tokio::test]
async fn test_invalid_email_is_not_a_conflict() {
    let broker = MemoryBroker::new();
    let store = InMemoryUserStore::new();
    let _server = serve(&broker, &store);
    let client = RpcClient::connect(&broker).await.unwrap();

    let mut request = ada();
    request.email = "not-an-email".into();
    let reply: UserRegisterReply = client
        .call_json(queues::USER_REGISTER, &request, TIMEOUT)
        .await
        .unwrap();
    assert!(!reply.success);
    assert!(!reply.conflict);
    assert_eq!(reply.error.as_deref(), Some("Email is not valid"));
    assert_eq!(store.count().await, 0);
}

#[tokio::test]
async fn test_query_users_without_password_hash() {
    let broker = MemoryBroker::new();
    let store = InMemoryUserStore::new();
    let _server = serve(&broker, &store);
    let client = RpcClient::connect(&broker).await.unwrap();

    let _: UserRegisterReply = client
        .call_json(queues::USER_REGISTER, &ada(), TIMEOUT)
        .await
        .unwrap();

    let found: Option<UserSummary> = client
        .call_json(queues::USER_QUERY, &Query::Get { id: 1 }, TIMEOUT)
        .await
        .unwrap();
    let found = found.expect("registered user");
    assert_eq!(found.email, "ada@example.com");

    let raw: serde_json::Value = client
        .call_json(queues::USER_QUERY, &Query::Get { id: 1 }, TIMEOUT)
        .await
        .unwrap();
    assert!(raw.get("password_hash").is_none());

    let missing: Option<UserSummary> = client
        .call_json(queues::USER_QUERY, &Query::Get { id: 2 }, TIMEOUT)
        .await
        .unwrap();
    assert!(missing.is_none());

    let all: Vec<UserSummary> = client
        .call_json(queues::USER_QUERY, &Query::List { limit: None }, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(all, vec![found]);
}

#[tokio::test]
async fn test_concurrent_registrations_keep_email_unique() {
    let broker = MemoryBroker::new();
    let store = InMemoryUserStore::new();
    let _server = serve(&broker, &store);
    let client = Arc::new(RpcClient::connect(&broker).await.unwrap());

    let calls: Vec<_> = (0..5)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call_json::<_, UserRegisterReply>(queues::USER_REGISTER, &ada(), TIMEOUT)
                    .await
                    .unwrap()
            })
        })
        .collect();
    let mut registered = 0;
    for call in calls {
        if call.await.unwrap().success {
            registered += 1;
        }
    }
    assert_eq!(registered, 1);
    assert_eq!(store.count().await, 1);
}
