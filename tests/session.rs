// tests/session.rs

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

use mom_messaging::{
    // ---
    broker::{
        memory::{BrokerOperation, MemoryBroker, MemoryConnection},
        reply_code,
        BrokerConnection,
        BrokerError,
    },
    util::FailureCallback,
    Acknowledger,
    BinaryMessage,
    Destination,
    Error,
    RetryConfiguration,
    RetryPolicyProvider,
    Session,
    SessionOptions,
};

const WAIT: Duration = Duration::from_secs(2);

fn queue(name: &str) -> Destination {
    Destination::new(format!("direct:///{name}"), name).expect("valid destination")
}

fn open_session(broker: &Arc<MemoryBroker>, options: SessionOptions, on_failure: Option<FailureCallback>) -> Session {
    // ---
    common::init_logging();
    let connection: Arc<dyn BrokerConnection> = Arc::new(
        MemoryConnection::open(broker.clone(), "memory", &options.display_name).expect("connect"),
    );
    let retry = RetryPolicyProvider::from_configurations(
        &RetryConfiguration::from_millis(&[1]),
        &RetryConfiguration::from_millis(&[1, 1, 1]),
    );
    Session::new(connection, retry, options, on_failure)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
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

#[tokio::test]
async fn send_delivers_with_type_headers_and_initial_route() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new("send");
    broker.declare_queue("orders");
    let session = open_session(&broker, SessionOptions::new("send"), None);

    let (tx, mut rx) = mpsc::unbounded_channel();
    session
        .subscribe(
            &queue("orders"),
            move |message, ack| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message);
                    let _ = ack.ack().await;
                }
            },
            None,
        )
        .await
        .expect("subscribe failed");

    // ---
    // Act
    // ---
    let message = BinaryMessage::new("order-1")
        .with_type("OrderPlaced")
        .with_header("tenant", "eu");
    session
        .send(&queue("orders"), &message, None)
        .await
        .expect("send failed");

    // ---
    // Assert
    // ---
    let received = timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed");

    assert_eq!(&received.bytes[..], b"order-1");
    assert_eq!(received.message_type.as_deref(), Some("OrderPlaced"));
    assert_eq!(received.header("tenant"), Some("eu"));
    assert_eq!(received.header("initialRoute"), Some("direct:///orders"));

    eventually(|| broker.unacked_count() == 0).await;
    assert_eq!(broker.message_count("orders"), 0);
}

#[tokio::test]
async fn nack_requeues_and_redelivers() {
    // ---
    let broker = MemoryBroker::new("nack");
    broker.declare_queue("jobs");
    let session = open_session(&broker, SessionOptions::new("nack"), None);

    let (tx, mut rx) = mpsc::unbounded_channel();
    session
        .subscribe(
            &queue("jobs"),
            move |_message, ack| {
                let tx = tx.clone();
                async move {
                    let redelivered = ack.redelivered();
                    let _ = tx.send(redelivered);
                    let _ = ack.acknowledge(redelivered).await;
                }
            },
            None,
        )
        .await
        .expect("subscribe failed");

    session
        .send(&queue("jobs"), &BinaryMessage::new("job"), None)
        .await
        .expect("send failed");

    assert_eq!(timeout(WAIT, rx.recv()).await.expect("first delivery"), Some(false));
    assert_eq!(timeout(WAIT, rx.recv()).await.expect("redelivery"), Some(true));

    eventually(|| broker.unacked_count() == 0).await;
    assert_eq!(broker.message_count("jobs"), 0);
}

#[tokio::test]
async fn typed_subscriptions_share_one_consumer() {
    // ---
    let broker = MemoryBroker::new("shared");
    broker.declare_queue("events");
    let session = open_session(&broker, SessionOptions::new("shared"), None);

    let (tx, mut rx) = mpsc::unbounded_channel();
    for message_type in ["Created", "Deleted"] {
        let tx = tx.clone();
        session
            .subscribe(
                &queue("events"),
                move |message, ack| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send((message_type, message.bytes));
                        let _ = ack.ack().await;
                    }
                },
                Some(message_type),
            )
            .await
            .expect("typed subscribe failed");
    }

    assert_eq!(broker.consumer_count("events"), 1);
    assert_eq!(broker.consumers_started(), 1);

    for (message_type, body) in [("Deleted", "d1"), ("Created", "c1")] {
        let message = BinaryMessage::new(body).with_type(message_type);
        session
            .send(&queue("events"), &message, None)
            .await
            .expect("send failed");
    }

    let first = timeout(WAIT, rx.recv()).await.expect("first").expect("open");
    let second = timeout(WAIT, rx.recv()).await.expect("second").expect("open");
    assert_eq!(first.0, "Deleted");
    assert_eq!(&first.1[..], b"d1");
    assert_eq!(second.0, "Created");
    assert_eq!(&second.1[..], b"c1");
}

#[tokio::test]
async fn mixing_subscription_kinds_is_rejected() {
    // ---
    let broker = MemoryBroker::new("mixing");
    broker.declare_queue("typed");
    broker.declare_queue("plain");
    let session = open_session(&broker, SessionOptions::new("mixing"), None);

    let ignore = |_message: BinaryMessage, _ack: Acknowledger| async {};

    session
        .subscribe(&queue("typed"), ignore, Some("A"))
        .await
        .expect("typed subscribe failed");
    let untyped = session.subscribe(&queue("typed"), ignore, None).await;
    assert!(matches!(untyped, Err(Error::InvalidOperation(_))));
    let duplicate = session.subscribe(&queue("typed"), ignore, Some("A")).await;
    assert!(matches!(duplicate, Err(Error::InvalidOperation(_))));

    session
        .subscribe(&queue("plain"), ignore, None)
        .await
        .expect("untyped subscribe failed");
    let again = session.subscribe(&queue("plain"), ignore, None).await;
    assert!(matches!(again, Err(Error::InvalidOperation(_))));
    let typed = session.subscribe(&queue("plain"), ignore, Some("A")).await;
    assert!(matches!(typed, Err(Error::InvalidOperation(_))));

    assert_eq!(broker.consumers_started(), 2);
}

#[tokio::test]
async fn unregistered_type_blocks_the_queue_until_registered() {
    // ---
    let broker = MemoryBroker::new("blocking");
    broker.declare_queue("events");
    let session = open_session(&broker, SessionOptions::new("blocking"), None);

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    session
        .subscribe(
            &queue("events"),
            move |message, ack| {
                let tx = tx_a.clone();
                async move {
                    let _ = tx.send(message.bytes);
                    let _ = ack.ack().await;
                }
            },
            Some("A"),
        )
        .await
        .expect("subscribe A failed");

    session
        .send(&queue("events"), &BinaryMessage::new("b1").with_type("B"), None)
        .await
        .expect("send B failed");
    session
        .send(&queue("events"), &BinaryMessage::new("a1").with_type("A"), None)
        .await
        .expect("send A failed");

    // A is queued behind the unroutable B.
    assert!(timeout(Duration::from_millis(100), rx_a.recv()).await.is_err());

    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    session
        .subscribe(
            &queue("events"),
            move |message, ack| {
                let tx = tx_b.clone();
                async move {
                    let _ = tx.send(message.bytes);
                    let _ = ack.ack().await;
                }
            },
            Some("B"),
        )
        .await
        .expect("subscribe B failed");

    let b = timeout(WAIT, rx_b.recv()).await.expect("B delivered").expect("open");
    let a = timeout(WAIT, rx_a.recv()).await.expect("A delivered").expect("open");
    assert_eq!(&b[..], b"b1");
    assert_eq!(&a[..], b"a1");
}

#[tokio::test]
async fn unsubscribe_requeues_unsettled_messages() {
    // ---
    let broker = MemoryBroker::new("unsubscribe");
    broker.declare_queue("work");
    let session = open_session(&broker, SessionOptions::new("unsubscribe"), None);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = session
        .subscribe(
            &queue("work"),
            move |message, _ack| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message.bytes);
                }
            },
            None,
        )
        .await
        .expect("subscribe failed");

    session
        .send(&queue("work"), &BinaryMessage::new("w1"), None)
        .await
        .expect("send failed");
    timeout(WAIT, rx.recv()).await.expect("delivered");
    assert_eq!(broker.unacked_count(), 1);

    subscription.unsubscribe().await.expect("unsubscribe failed");
    subscription.unsubscribe().await.expect("second unsubscribe is a no-op");
    assert!(!subscription.is_active());

    assert_eq!(broker.consumer_count("work"), 0);
    assert_eq!(broker.message_count("work"), 1);
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn last_typed_unsubscribe_cancels_shared_consumer() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new("shared-unsubscribe");
    broker.declare_queue("events");
    let session = open_session(&broker, SessionOptions::new("shared-unsubscribe"), None);

    let (calls, _) = counter();
    let seen = calls.clone();
    let subscription = session
        .subscribe(
            &queue("events"),
            move |_message, ack| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    let _ = ack.ack().await;
                }
            },
            Some("A"),
        )
        .await
        .expect("subscribe failed");
    assert_eq!(broker.consumer_count("events"), 1);

    // ---
    // Act
    // ---
    subscription.unsubscribe().await.expect("unsubscribe failed");
    session
        .send(&queue("events"), &BinaryMessage::new("a1").with_type("A"), None)
        .await
        .expect("send failed");

    // ---
    // Assert
    // ---
    assert_eq!(broker.consumer_count("events"), 0);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(broker.message_count("events"), 1);
}

#[tokio::test]
async fn request_reply_round_trip() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new("rpc");
    broker.declare_queue("rpc.requests");
    let server = open_session(&broker, SessionOptions::new("server"), None);
    let client = open_session(&broker, SessionOptions::new("client"), None);

    server
        .register_handler(
            &queue("rpc.requests"),
            |request: BinaryMessage| async move {
                let mut body = b"pong:".to_vec();
                body.extend_from_slice(&request.bytes);
                Ok::<_, Error>(BinaryMessage::new(body).with_type("Pong"))
            },
            None,
        )
        .await
        .expect("register handler failed");

    // ---
    // Act
    // ---
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = client
        .send_request(
            &queue("rpc.requests"),
            &BinaryMessage::new("ping").with_type("Ping"),
            move |reply| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(reply);
                }
            },
        )
        .await
        .expect("send_request failed");

    // ---
    // Assert
    // ---
    let reply = timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for reply")
        .expect("channel closed");
    assert_eq!(&reply.bytes[..], b"pong:ping");
    assert_eq!(reply.message_type.as_deref(), Some("Pong"));

    let reply_queue = handle.reply_to().subscribe().to_string();
    assert!(reply_queue.starts_with("amq.gen-"));
    assert_eq!(handle.reply_to().publish(), format!("direct:///{reply_queue}"));

    eventually(|| broker.unacked_count() == 0).await;

    handle.release().await.expect("release failed");
    handle.release().await.expect("second release is a no-op");
    assert!(handle.is_released());
    assert!(!broker.queue_exists(&reply_queue));
}

#[tokio::test]
async fn failed_reply_subscription_deletes_the_reply_queue() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new("rpc-cleanup");
    broker.declare_queue("rpc.requests");
    let client = open_session(&broker, SessionOptions::new("client"), None);
    broker.inject_failure(
        BrokerOperation::Consume,
        BrokerError::interrupted(reply_code::ACCESS_REFUSED, "ACCESS_REFUSED"),
    );

    // ---
    // Act
    // ---
    let err = client
        .send_request(
            &queue("rpc.requests"),
            &BinaryMessage::new("ping"),
            |_reply| async {},
        )
        .await
        .expect_err("reply subscription refused");

    // ---
    // Assert
    // ---
    assert!(matches!(err, Error::Protocol(_)));
    assert_eq!(broker.queue_names(), vec!["rpc.requests".to_string()]);
    assert_eq!(broker.message_count("rpc.requests"), 0);
}

#[tokio::test]
async fn failing_handler_leaves_request_unacknowledged() {
    // ---
    let broker = MemoryBroker::new("failing-handler");
    broker.declare_queue("rpc");
    let server = open_session(&broker, SessionOptions::new("server"), None);
    let client = open_session(&broker, SessionOptions::new("client"), None);

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    server
        .register_handler(
            &queue("rpc"),
            move |_request: BinaryMessage| {
                seen.fetch_add(1, Ordering::SeqCst);
                async move { Err::<BinaryMessage, _>(Error::InvalidOperation("bad request".into())) }
            },
            None,
        )
        .await
        .expect("register handler failed");

    let _handle = client
        .send_request(&queue("rpc"), &BinaryMessage::new("x"), |_reply| async {})
        .await
        .expect("send_request failed");

    eventually(|| calls.load(Ordering::SeqCst) == 1).await;
    sleep(Duration::from_millis(20)).await;
    assert_eq!(broker.unacked_count(), 1);
}

#[tokio::test]
async fn protocol_error_discards_channel_and_next_call_recovers() {
    // ---
    let broker = MemoryBroker::new("recovery");
    broker.declare_queue("orders");
    let (failures, on_failure) = counter();
    let session = open_session(&broker, SessionOptions::new("recovery"), Some(on_failure));

    let missing = Destination::new("direct://missing-exchange/key", "orders").expect("valid");
    let err = session
        .send(&missing, &BinaryMessage::new("x"), None)
        .await
        .expect_err("publish to a missing exchange must fail");

    assert!(matches!(err, Error::Protocol(_)));
    assert_eq!(err.broker_error().and_then(BrokerError::reply_code), Some(reply_code::NOT_FOUND));
    assert_eq!(broker.open_channels(), 0);

    session
        .send(&queue("orders"), &BinaryMessage::new("y"), None)
        .await
        .expect("send on a fresh channel failed");
    assert_eq!(broker.channels_opened(), 2);
    assert_eq!(broker.message_count("orders"), 1);
    assert_eq!(failures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn discarded_channel_closes_subscriptions_and_reports_failure() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new("discard");
    broker.declare_queue("work");
    broker.declare_queue("events");
    let (failures, on_failure) = counter();
    let session = open_session(&broker, SessionOptions::new("discard"), Some(on_failure));
    let publisher = open_session(&broker, SessionOptions::new("publisher"), None);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let forward = move |message: BinaryMessage, ack: Acknowledger| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message.bytes);
            let _ = ack.ack().await;
        }
    };
    let untyped = session
        .subscribe(&queue("work"), forward.clone(), None)
        .await
        .expect("subscribe failed");
    let typed = session
        .subscribe(&queue("events"), forward.clone(), Some("A"))
        .await
        .expect("typed subscribe failed");

    // ---
    // Act
    // ---
    let missing = Destination::new("direct://missing-exchange/key", "work").expect("valid");
    session
        .send(&missing, &BinaryMessage::new("x"), None)
        .await
        .expect_err("publish to a missing exchange must fail");

    // ---
    // Assert
    // ---
    eventually(|| !untyped.is_active() && !typed.is_active()).await;
    eventually(|| failures.load(Ordering::SeqCst) == 1).await;
    assert_eq!(broker.consumer_count("work"), 0);
    assert_eq!(broker.consumer_count("events"), 0);

    publisher
        .send(&queue("work"), &BinaryMessage::new("w1"), None)
        .await
        .expect("send failed");
    assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    assert_eq!(broker.message_count("work"), 1);

    // The queue is free again and picks up where it left off.
    session
        .subscribe(&queue("work"), forward, None)
        .await
        .expect("resubscribe failed");
    let received = timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed");
    assert_eq!(&received[..], b"w1");

    sleep(Duration::from_millis(20)).await;
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn subscribing_to_a_missing_queue_fails_then_recovers() {
    // ---
    let broker = MemoryBroker::new("missing-queue");
    let session = open_session(&broker, SessionOptions::new("missing-queue"), None);

    let err = session
        .subscribe(&queue("later"), |_message, _ack| async {}, None)
        .await
        .expect_err("queue does not exist yet");
    assert!(matches!(err, Error::Protocol(_)));

    broker.declare_queue("later");
    session
        .subscribe(&queue("later"), |_message, _ack| async {}, None)
        .await
        .expect("subscribe after declare failed");
    assert_eq!(broker.consumer_count("later"), 1);
}

#[tokio::test]
async fn internal_error_is_retried_transparently() {
    // ---
    let broker = MemoryBroker::new("retry");
    broker.declare_queue("orders");
    let (failures, on_failure) = counter();
    let session = open_session(&broker, SessionOptions::new("retry"), Some(on_failure));

    broker.inject_failure(
        BrokerOperation::Publish,
        BrokerError::interrupted(reply_code::INTERNAL_ERROR, "INTERNAL_ERROR"),
    );

    session
        .send(&queue("orders"), &BinaryMessage::new("x"), None)
        .await
        .expect("retried send failed");

    assert_eq!(broker.message_count("orders"), 1);
    assert_eq!(broker.channels_opened(), 2);
    assert_eq!(failures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn exhausted_retries_report_failure_once() {
    // ---
    let broker = MemoryBroker::new("exhausted");
    broker.declare_queue("orders");
    let (failures, on_failure) = counter();
    let session = open_session(&broker, SessionOptions::new("exhausted"), Some(on_failure));

    for round in 0..2 {
        for _ in 0..4 {
            broker.inject_failure(
                BrokerOperation::Publish,
                BrokerError::interrupted(reply_code::INTERNAL_ERROR, "INTERNAL_ERROR"),
            );
        }

        let err = session
            .send(&queue("orders"), &BinaryMessage::new("x"), None)
            .await
            .expect_err("every attempt fails");

        match err {
            Error::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, Error::Recoverable(_)));
            }
            other => panic!("round {round}: unexpected error {other:?}"),
        }
    }

    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(broker.message_count("orders"), 0);
}

#[tokio::test]
async fn publisher_confirms_surface_nacks() {
    // ---
    let broker = MemoryBroker::new("confirms");
    broker.declare_queue("orders");
    broker.set_nack_publishes(true);

    let confirmed = open_session(
        &broker,
        SessionOptions::new("confirmed").with_publisher_confirms(true),
        None,
    );
    let err = confirmed
        .send(&queue("orders"), &BinaryMessage::new("x"), None)
        .await
        .expect_err("nacked publish must fail");
    assert!(matches!(err, Error::Protocol(BrokerError::Nacked)));

    let unconfirmed = open_session(&broker, SessionOptions::new("unconfirmed"), None);
    unconfirmed
        .send(&queue("orders"), &BinaryMessage::new("y"), None)
        .await
        .expect("without confirms the publish is fire and forget");
    assert_eq!(broker.message_count("orders"), 0);
}

#[tokio::test]
async fn ttl_becomes_expiration() {
    // ---
    let broker = MemoryBroker::new("ttl");
    broker.declare_queue("orders");
    let session = open_session(&broker, SessionOptions::new("ttl"), None);

    session
        .send(&queue("orders"), &BinaryMessage::new("x"), Some(Duration::from_millis(1500)))
        .await
        .expect("send failed");
    session
        .send(&queue("orders"), &BinaryMessage::new("y"), Some(Duration::ZERO))
        .await
        .expect("send failed");

    let ready = broker.ready_messages("orders");
    assert_eq!(ready.len(), 2);
    assert_eq!(ready[0].0.expiration.as_deref(), Some("1500"));
    assert_eq!(ready[0].0.delivery_mode, Some(2));
    assert_eq!(ready[1].0.expiration, None);
}

#[tokio::test]
async fn temporary_destination_routes_through_default_exchange() {
    // ---
    let broker = MemoryBroker::new("temporary");
    let session = open_session(&broker, SessionOptions::new("temporary"), None);

    let destination = session
        .create_temporary_destination()
        .await
        .expect("declare failed");
    let queue_name = destination.subscribe().to_string();
    assert!(broker.queue_exists(&queue_name));

    session
        .send(&destination, &BinaryMessage::new("x"), None)
        .await
        .expect("send failed");
    assert_eq!(broker.message_count(&queue_name), 1);
}

#[tokio::test]
async fn dispose_cancels_consumers_and_rejects_further_use() {
    // ---
    let broker = MemoryBroker::new("dispose");
    broker.declare_queue("orders");
    let session = open_session(&broker, SessionOptions::new("dispose"), None);

    let subscription = session
        .subscribe(&queue("orders"), |_message, _ack| async {}, None)
        .await
        .expect("subscribe failed");
    assert_eq!(broker.consumer_count("orders"), 1);

    session.dispose().await;
    session.dispose().await;

    assert!(session.is_disposed());
    assert_eq!(broker.consumer_count("orders"), 0);
    assert_eq!(broker.open_channels(), 0);

    let err = session
        .send(&queue("orders"), &BinaryMessage::new("x"), None)
        .await
        .expect_err("disposed session");
    assert!(matches!(err, Error::Disposed(_)));
    subscription.unsubscribe().await.expect("unsubscribe after dispose is a no-op");
}
