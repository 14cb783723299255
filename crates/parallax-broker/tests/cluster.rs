//! Two-broker end-to-end tests.
//!
//! These need a local Valkey/Redis instance and are ignored by default:
//!
//! ```text
//! cargo test -p parallax-broker -- --ignored
//! ```
//!
//! Each test run uses its own key namespace, so no cleanup is required.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use parallax_broker::{
    AskError, Broker, BrokerConfig, BrokerError, BrokerState, CreateCause, CreateInfo,
    CreateOptions, DestroyInfo, DestroyMode, RegistryConfig, Worker, WorkerAttributes,
    WorkerClass, WorkerContext,
};

type EventLog = Arc<Mutex<Vec<String>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Echo {
    log: EventLog,
}

#[async_trait]
impl Worker for Echo {
    async fn on_create(
        &self,
        ctx: &WorkerContext,
        info: CreateInfo,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let cause = match info.cause {
            CreateCause::New => "new",
            CreateCause::Recovery => "recovery",
        };
        self.log.lock().push(format!("create:{}:{cause}", ctx.id()));
        Ok(())
    }

    async fn on_destroy(
        &self,
        ctx: &WorkerContext,
        _info: DestroyInfo,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.log.lock().push(format!("destroy:{}", ctx.id()));
        Ok(())
    }

    async fn on_ask(
        &self,
        _ctx: &WorkerContext,
        method: &str,
        data: Value,
    ) -> Result<Value, AskError> {
        match method {
            "echo" => Ok(data),
            "fail" => Err(AskError::new("EchoError", "told to fail")),
            other => Err(AskError::new("NotImplemented", format!("no method {other}"))),
        }
    }

    async fn on_tell(
        &self,
        ctx: &WorkerContext,
        method: &str,
        _data: Value,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.log.lock().push(format!("tell:{}:{method}", ctx.id()));
        Ok(())
    }
}

fn config(ns: &str, broker_id: &str) -> BrokerConfig {
    BrokerConfig {
        broker_id: Some(broker_id.to_owned()),
        registry: RegistryConfig {
            url: "redis://127.0.0.1:6379".to_owned(),
            ns: ns.to_owned(),
            ..RegistryConfig::default()
        },
        ..BrokerConfig::default()
    }
}

async fn make_broker(ns: &str, broker_id: &str, log: EventLog) -> Broker {
    let class = WorkerClass::new("Echo", move || {
        Arc::new(Echo { log: log.clone() }) as Arc<dyn Worker>
    });
    Broker::builder(config(ns, broker_id))
        .register(class)
        .build()
        .await
        .expect("Failed to connect to Valkey")
}

fn unique_ns() -> String {
    format!("e2e:{}", uuid::Uuid::new_v4().simple())
}

async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..50 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
#[ignore = "requires Valkey/Redis instance at 127.0.0.1:6379"]
async fn create_ask_tell_across_brokers() {
    init_tracing();
    let ns = unique_ns();
    let log_a: EventLog = Arc::default();
    let log_b: EventLog = Arc::default();

    let broker_a = make_broker(&ns, "br-a", log_a.clone()).await;
    let broker_b = make_broker(&ns, "br-b", log_b.clone()).await;
    broker_a.start().await.unwrap();
    broker_b.start().await.unwrap();

    let agent = broker_a
        .create("Echo", CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(agent.name(), "Echo");
    assert_eq!(agent.worker_id(), "Echo#1");

    // Location transparency: both brokers reach the worker, wherever the
    // placement put it.
    let reply = agent.ask("echo", json!({"n": 7})).await.unwrap();
    assert_eq!(reply, json!({"n": 7}));

    let found = broker_b.find("Echo#1").await.unwrap().expect("worker findable");
    let reply = found.ask("echo", json!("ping")).await.unwrap();
    assert_eq!(reply, json!("ping"));

    // Application errors travel with name and message intact.
    let error = found.ask("fail", json!(null)).await.unwrap_err();
    match error {
        BrokerError::Application { name, message } => {
            assert_eq!(name, "EchoError");
            assert_eq!(message, "told to fail");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // Tell is fire-and-forget; the handler still runs.
    found.tell("note", json!(1)).await.unwrap();
    let saw_tell = eventually(|| {
        let logs = log_a.lock().clone();
        let logs_b = log_b.lock().clone();
        logs.iter().chain(logs_b.iter()).any(|e| e == "tell:Echo#1:note")
    })
    .await;
    assert!(saw_tell, "tell handler never ran");

    // Unknown workers surface as NotFound.
    assert!(broker_b.find("Echo#999").await.unwrap().is_none());
    assert!(matches!(
        broker_a.ask("Echo#999", "echo", json!(null)).await,
        Err(BrokerError::NotFound(_))
    ));

    broker_a.destroy(DestroyMode::NoRecover).await.unwrap();
    broker_b.destroy(DestroyMode::NoRecover).await.unwrap();
}

#[tokio::test]
#[ignore = "requires Valkey/Redis instance at 127.0.0.1:6379"]
async fn recoverable_worker_moves_to_surviving_broker() {
    init_tracing();
    let ns = unique_ns();
    let log_a: EventLog = Arc::default();
    let log_b: EventLog = Arc::default();

    // Start A alone so the worker is placed there.
    let broker_a = make_broker(&ns, "br-a", log_a.clone()).await;
    broker_a.start().await.unwrap();

    let agent = broker_a
        .create(
            "Echo",
            CreateOptions {
                worker_id: None,
                attributes: WorkerAttributes::recoverable(),
            },
        )
        .await
        .unwrap();
    let worker_id = agent.worker_id().to_owned();
    assert!(eventually(|| log_a.lock().iter().any(|e| e.starts_with("create:"))).await);

    let broker_b = make_broker(&ns, "br-b", log_b.clone()).await;
    broker_b.start().await.unwrap();

    // A leaves, parking its recoverable worker; B picks it up from the
    // recovery broadcast.
    broker_a.destroy(DestroyMode::Recover).await.unwrap();
    assert_eq!(broker_a.state(), BrokerState::Destroyed);

    let recovered = eventually(|| {
        log_b
            .lock()
            .iter()
            .any(|e| e == &format!("create:{worker_id}:recovery"))
    })
    .await;
    assert!(recovered, "worker was not recovered on the survivor");

    let found = broker_b.find(&worker_id).await.unwrap().expect("recovered worker findable");
    let reply = found.ask("echo", json!("back")).await.unwrap();
    assert_eq!(reply, json!("back"));

    // The destroyed broker rejects further operations.
    assert!(matches!(
        agent.ask("echo", json!(null)).await,
        Err(BrokerError::InvalidState(_))
    ));
    assert!(matches!(
        broker_a.create("Echo", CreateOptions::default()).await,
        Err(BrokerError::InvalidState(_))
    ));

    broker_b.destroy(DestroyMode::NoRecover).await.unwrap();
}

#[tokio::test]
#[ignore = "requires Valkey/Redis instance at 127.0.0.1:6379"]
async fn static_workers_use_their_class_name() {
    let ns = unique_ns();
    let log: EventLog = Arc::default();

    let broker = make_broker(&ns, "br-a", log.clone()).await;
    broker.start().await.unwrap();

    let agent = broker
        .create(
            "Echo",
            CreateOptions {
                worker_id: None,
                attributes: WorkerAttributes::static_worker(),
            },
        )
        .await
        .unwrap();
    assert_eq!(agent.worker_id(), "Echo");

    // Creating the same static worker again finds the existing one.
    let again = broker
        .create(
            "Echo",
            CreateOptions {
                worker_id: None,
                attributes: WorkerAttributes::static_worker(),
            },
        )
        .await
        .unwrap();
    assert_eq!(again.worker_id(), "Echo");
    assert_eq!(
        log.lock().iter().filter(|e| e.starts_with("create:")).count(),
        1,
        "static worker constructed more than once"
    );

    broker.destroy(DestroyMode::NoRecover).await.unwrap();
}

#[tokio::test]
#[ignore = "requires Valkey/Redis instance at 127.0.0.1:6379"]
async fn lifecycle_transitions_are_enforced() {
    let ns = unique_ns();
    let log: EventLog = Arc::default();
    let broker = make_broker(&ns, "br-a", log).await;

    // Not started yet.
    assert_eq!(broker.state(), BrokerState::Inactive);
    assert!(matches!(
        broker.create("Echo", CreateOptions::default()).await,
        Err(BrokerError::InvalidState(_))
    ));
    assert!(matches!(
        broker.destroy(DestroyMode::NoRecover).await,
        Err(BrokerError::InvalidState(_))
    ));

    broker.start().await.unwrap();
    assert_eq!(broker.state(), BrokerState::Active);

    // Double start is rejected.
    assert!(matches!(
        broker.start().await,
        Err(BrokerError::InvalidState(_))
    ));

    broker.destroy(DestroyMode::NoRecover).await.unwrap();
    assert_eq!(broker.state(), BrokerState::Destroyed);
    assert!(matches!(
        broker.destroy(DestroyMode::NoRecover).await,
        Err(BrokerError::InvalidState(_))
    ));

    // A destroyed broker may start again.
    broker.start().await.unwrap();
    assert_eq!(broker.state(), BrokerState::Active);
    broker.destroy(DestroyMode::NoRecover).await.unwrap();
}
