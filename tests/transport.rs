// tests/transport.rs

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::{sleep, timeout, Duration};

use mom_messaging::{
    // ---
    broker::{
        memory::{MemoryBroker, MemoryConnector},
        reply_code,
    },
    util::FailureCallback,
    BinaryMessage,
    BrokerTransport,
    Destination,
    EndpointUsage,
    Error,
    MessagingConfig,
    RetryConfiguration,
    SessionOptions,
    Transport,
    TransportInfo,
};

fn config() -> MessagingConfig {
    MessagingConfig::default()
        .with_initial_connection_retry(RetryConfiguration::from_millis(&[1, 1]))
        .with_regular_retry(RetryConfiguration::from_millis(&[1, 1]))
        .with_shuffle_brokers(false)
}

fn counter() -> (Arc<AtomicUsize>, FailureCallback) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    (
        count,
        Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }),
    )
}

fn transport(connector: Arc<MemoryConnector>, brokers: &str, on_failure: FailureCallback) -> BrokerTransport {
    // ---
    common::init_logging();
    let info = TransportInfo::new(brokers, "guest", "guest").expect("valid info");
    BrokerTransport::new(
        connector,
        &info,
        &config(),
        on_failure,
        &mut StdRng::seed_from_u64(1),
    )
    .expect("valid broker list")
}

#[tokio::test]
async fn fails_over_to_the_next_broker() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new("b2");
    let connector = Arc::new(MemoryConnector::new().with_broker("b2:5672", broker.clone()));
    let (failures, on_failure) = counter();
    let transport = transport(connector.clone(), "b1:5672,b2:5672", on_failure);

    // ---
    // Act
    // ---
    let session = transport
        .create_session(SessionOptions::new("failover"), None)
        .await
        .expect("second broker accepts");

    // ---
    // Assert
    // ---
    assert_eq!(
        connector.attempts(),
        vec!["b1:5672", "b1:5672", "b1:5672", "b2:5672"]
    );
    assert_eq!(broker.connection_names(), vec!["failover".to_string()]);
    assert_eq!(session.display_name(), "failover");
    assert_eq!(failures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn connection_is_opened_once_and_shared() {
    // ---
    let broker = MemoryBroker::new("shared");
    let connector = Arc::new(MemoryConnector::any_address(broker.clone()));
    let (_failures, on_failure) = counter();
    let transport = transport(connector, "localhost", on_failure);

    for name in ["a", "b", "c"] {
        transport
            .create_session(SessionOptions::new(name), None)
            .await
            .expect("session");
    }

    assert_eq!(broker.connections_opened(), 1);
    assert_eq!(transport.session_count(), 3);
}

#[tokio::test]
async fn refused_attempts_are_retried_on_the_same_broker() {
    // ---
    let broker = MemoryBroker::new("flaky");
    broker.refuse_connections(2);
    let connector = Arc::new(MemoryConnector::any_address(broker.clone()));
    let (_failures, on_failure) = counter();
    let transport = transport(connector.clone(), "flaky:5672", on_failure);

    transport
        .create_session(SessionOptions::new("flaky"), None)
        .await
        .expect("third attempt succeeds");

    assert_eq!(connector.attempts().len(), 3);
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test]
async fn every_broker_unreachable_is_a_connection_error() {
    // ---
    let connector = Arc::new(MemoryConnector::new());
    let (failures, on_failure) = counter();
    let transport = transport(connector.clone(), "a,b", on_failure);

    let err = transport
        .create_session(SessionOptions::new("nowhere"), None)
        .await
        .expect_err("nothing is listening");

    match err {
        Error::Connection {
            source: Some(source),
            ..
        } => assert!(matches!(*source, Error::RetriesExhausted { attempts: 2, .. })),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(connector.attempts().len(), 6);
    assert_eq!(failures.load(Ordering::SeqCst), 0);
}

#[test]
fn seeded_shuffle_is_deterministic() {
    // ---
    let info = TransportInfo::new("a,b,c,d,e,f", "guest", "guest").expect("valid info");
    let config = config().with_shuffle_brokers(true);
    let build = |seed| {
        BrokerTransport::new(
            Arc::new(MemoryConnector::new()),
            &info,
            &config,
            Arc::new(|| {}),
            &mut StdRng::seed_from_u64(seed),
        )
        .expect("valid broker list")
    };

    let first = build(99);
    let second = build(99);
    assert_eq!(first.brokers(), second.brokers());

    let mut sorted = first.brokers().to_vec();
    sorted.sort();
    assert_eq!(sorted, vec!["a", "b", "c", "d", "e", "f"]);

    let unshuffled = BrokerTransport::new(
        Arc::new(MemoryConnector::new()),
        &info,
        &config.clone().with_shuffle_brokers(false),
        Arc::new(|| {}),
        &mut StdRng::seed_from_u64(99),
    )
    .expect("valid broker list");
    assert_eq!(unshuffled.brokers(), ["a", "b", "c", "d", "e", "f"]);
}

#[tokio::test]
async fn broker_side_shutdown_is_reported_once() {
    // ---
    let broker = MemoryBroker::new("killed");
    let connector = Arc::new(MemoryConnector::any_address(broker.clone()));
    let (failures, on_failure) = counter();
    let transport = transport(connector, "killed", on_failure);

    transport
        .create_session(SessionOptions::new("victim"), None)
        .await
        .expect("session");

    broker.kill_connections(reply_code::CONNECTION_FORCED, "CONNECTION_FORCED - broker going down");

    timeout(Duration::from_secs(2), async {
        while failures.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("failure not reported");

    sleep(Duration::from_millis(20)).await;
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dispose_is_clean_and_final() {
    // ---
    let broker = MemoryBroker::new("disposed");
    let connector = Arc::new(MemoryConnector::any_address(broker.clone()));
    let (failures, on_failure) = counter();
    let transport = transport(connector, "disposed", on_failure);

    let session = transport
        .create_session(SessionOptions::new("s"), None)
        .await
        .expect("session");

    transport.dispose().await;
    transport.dispose().await;
    sleep(Duration::from_millis(20)).await;

    assert!(transport.is_disposed());
    assert!(session.is_disposed());
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(failures.load(Ordering::SeqCst), 0);

    let err = transport
        .create_session(SessionOptions::new("late"), None)
        .await
        .expect_err("disposed transport");
    assert!(matches!(err, Error::Disposed(_)));
}

#[tokio::test]
async fn verify_configures_exchange_queue_and_binding() {
    // ---
    let broker = MemoryBroker::new("verify");
    let connector = Arc::new(MemoryConnector::any_address(broker.clone()));
    let (_failures, on_failure) = counter();
    let transport = transport(connector, "verify", on_failure);

    let destination = Destination::new("topic://orders/orders.*", "orders.audit").expect("valid");

    let passive = transport
        .verify_destination(&destination, EndpointUsage::BOTH, false)
        .await
        .expect("verification ran");
    let reason = passive.expect_err("nothing is declared yet");
    assert!(reason.contains("404"), "unexpected reason: {reason}");

    transport
        .verify_destination(&destination, EndpointUsage::BOTH, true)
        .await
        .expect("verification ran")
        .expect("configured");
    assert!(broker.exchange_exists("orders"));
    assert!(broker.queue_exists("orders.audit"));

    let session = transport
        .create_session(SessionOptions::new("publisher"), None)
        .await
        .expect("session");
    let created = Destination::from("topic://orders/orders.created");
    session
        .send(&created, &BinaryMessage::new("x"), None)
        .await
        .expect("send failed");
    assert_eq!(broker.message_count("orders.audit"), 1);

    transport
        .verify_destination(&destination, EndpointUsage::BOTH, false)
        .await
        .expect("verification ran")
        .expect("everything exists now");
}

#[tokio::test]
async fn verify_binds_plain_exchange_names_with_wildcard() {
    // ---
    let broker = MemoryBroker::new("wildcard");
    let connector = Arc::new(MemoryConnector::any_address(broker.clone()));
    let (_failures, on_failure) = counter();
    let transport = transport(connector, "wildcard", on_failure);

    let destination = Destination::new("audit", "audit.all").expect("valid");
    transport
        .verify_destination(&destination, EndpointUsage::SUBSCRIBE, true)
        .await
        .expect("verification ran")
        .expect("configured");

    let session = transport
        .create_session(SessionOptions::new("publisher"), None)
        .await
        .expect("session");
    session
        .send(&Destination::from("topic://audit/any.key.at.all"), &BinaryMessage::new("x"), None)
        .await
        .expect("send failed");
    assert_eq!(broker.message_count("audit.all"), 1);
}

#[tokio::test]
async fn verify_skips_reserved_queues_and_default_exchange() {
    // ---
    let broker = MemoryBroker::new("reserved");
    let connector = Arc::new(MemoryConnector::any_address(broker.clone()));
    let (_failures, on_failure) = counter();
    let transport = transport(connector, "reserved", on_failure);

    let destination = Destination::new("direct:///amq.gen-x", "amq.gen-x").expect("valid");
    transport
        .verify_destination(&destination, EndpointUsage::BOTH, true)
        .await
        .expect("verification ran")
        .expect("nothing to check");
    assert!(!broker.queue_exists("amq.gen-x"));
}
