// src/session/consumer.rs

//! Physical consumers and the shared-consumer demultiplexer.
//!
//! Every physical consumer owns one task that drains its delivery inbox and
//! runs callbacks one at a time, so deliveries on a queue are handled in the
//! order the broker sent them.
//!
//! A [`SharedConsumer`] serves several message types from one queue. Each
//! delivery is routed by its type tag. When no callback is registered for the
//! tag, the task neither acks nor skips the message: it waits until a
//! callback for that type arrives or the consumer is cancelled. Everything
//! behind the message waits too. Cancelling leaves the message unsettled and
//! the broker puts it back at the head of the queue.
//!
//! An inbox that ends without a cancel means the channel under the consumer
//! went away. The consumer then marks itself closed and runs its
//! [`ClosedHook`] so the session can drop it and report the failure.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_lite::FutureExt;
use tokio::sync::{mpsc, Notify};

use crate::{
    // ---
    broker::{ConsumerHandle, Delivery, DeliveryAcker, MessageProperties},
    log_debug,
    log_error,
    log_warn,
    util::{lock_ignore_poison, BoxFuture},
    Error,
    Result,
};

/// Type-erased delivery callback.
pub(crate) type DeliveryCallback =
    Arc<dyn Fn(MessageProperties, Bytes, Acknowledger) -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs once when a consumer's delivery stream ends without a cancel.
pub(crate) type ClosedHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Box a closure as a [`DeliveryCallback`].
pub(crate) fn delivery_callback<F>(callback: F) -> DeliveryCallback
where
    F: Fn(MessageProperties, Bytes, Acknowledger) -> BoxFuture<'static, ()> + Send + Sync + 'static,
{
    Arc::new(callback)
}

/// Settles one delivery. Consumed by the first settle call.
pub struct Acknowledger {
    delivery_tag: u64,
    redelivered: bool,
    acker: Box<dyn DeliveryAcker>,
}

impl Acknowledger {
    pub(crate) fn new(delivery_tag: u64, redelivered: bool, acker: Box<dyn DeliveryAcker>) -> Self {
        Self {
            delivery_tag,
            redelivered,
            acker,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the broker delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Positive acknowledgement: the broker forgets the message.
    pub async fn ack(self) -> Result<()> {
        log_debug!("ack delivery {}", self.delivery_tag);
        self.acker.ack().await.map_err(Error::Protocol)
    }

    /// Negative acknowledgement: the broker requeues the message at the
    /// head of its queue.
    pub async fn nack(self) -> Result<()> {
        log_debug!("nack delivery {}", self.delivery_tag);
        self.acker.nack(true).await.map_err(Error::Protocol)
    }

    /// Ack on `success`, nack otherwise.
    pub async fn acknowledge(self, success: bool) -> Result<()> {
        if success {
            self.ack().await
        } else {
            self.nack().await
        }
    }
}

/// Run one callback, containing panics.
async fn dispatch(queue: &str, callback: &DeliveryCallback, delivery: Delivery) {
    // ---
    let Delivery {
        delivery_tag,
        redelivered,
        properties,
        body,
        acker,
    } = delivery;
    let acknowledger = Acknowledger::new(delivery_tag, redelivered, acker);

    let invocation = async { callback(properties, body, acknowledger).await };
    if AssertUnwindSafe(invocation).catch_unwind().await.is_err() {
        log_error!("callback for delivery {delivery_tag} on {queue} panicked");
    }
}

/// Consumer bookkeeping shared by both consumer kinds.
pub(crate) struct ConsumerInfo {
    pub id: u64,
    pub queue: String,
    pub consumer_tag: String,
    /// Channel generation the consumer was started on.
    pub generation: u64,
    /// Set once the consumer stops for good, cancelled or lost.
    pub closed: Arc<AtomicBool>,
}

impl ConsumerInfo {
    fn new(id: u64, queue: &str, consumer_tag: String, generation: u64) -> Self {
        Self {
            id,
            queue: queue.to_string(),
            consumer_tag,
            generation,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Mark a stream that ended on its own as closed and run the hook.
async fn stream_ended(queue: &str, cancelled: bool, closed: &AtomicBool, on_closed: ClosedHook) {
    // ---
    if cancelled {
        log_debug!("consumer on {queue} stopped");
        return;
    }
    closed.store(true, Ordering::Release);
    log_warn!("consumer on {queue} lost its channel");
    on_closed().await;
}

/// A physical consumer feeding a single callback.
pub(crate) struct Consumer {
    info: ConsumerInfo,
    cancelled: Arc<AtomicBool>,
}

impl Consumer {
    pub fn start(
        id: u64,
        queue: &str,
        generation: u64,
        handle: ConsumerHandle,
        callback: DeliveryCallback,
        on_closed: ClosedHook,
    ) -> Arc<Self> {
        // ---
        let info = ConsumerInfo::new(id, queue, handle.consumer_tag, generation);
        let cancelled = Arc::new(AtomicBool::new(false));
        tokio::spawn(Self::run(
            queue.to_string(),
            handle.inbox,
            cancelled.clone(),
            info.closed.clone(),
            callback,
            on_closed,
        ));

        Arc::new(Self { info, cancelled })
    }

    async fn run(
        queue: String,
        mut inbox: mpsc::UnboundedReceiver<Delivery>,
        cancelled: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
        callback: DeliveryCallback,
        on_closed: ClosedHook,
    ) {
        // ---
        while let Some(delivery) = inbox.recv().await {
            if cancelled.load(Ordering::Acquire) {
                break;
            }
            dispatch(&queue, &callback, delivery).await;
        }
        stream_ended(&queue, cancelled.load(Ordering::Acquire), &closed, on_closed).await;
    }

    pub fn info(&self) -> &ConsumerInfo {
        &self.info
    }

    /// Stop invoking the callback. A callback already running completes.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.info.closed.store(true, Ordering::Release);
    }
}

struct SharedState {
    // ---
    callbacks: Mutex<HashMap<String, DeliveryCallback>>,
    cancelled: AtomicBool,
    changed: Notify,
}

impl SharedState {
    /// Wait until a callback for `message_type` is registered. `None` once
    /// the consumer is cancelled.
    async fn wait_for_callback(&self, queue: &str, message_type: &str) -> Option<DeliveryCallback> {
        // ---
        let mut warned = false;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.cancelled.load(Ordering::Acquire) {
                return None;
            }
            if let Some(callback) = lock_ignore_poison(&self.callbacks).get(message_type).cloned() {
                return Some(callback);
            }
            if !warned {
                log_warn!(
                    "no handler for message type '{message_type}' on {queue}; \
                     holding delivery until one is registered"
                );
                warned = true;
            }

            notified.await;
        }
    }
}

/// One physical consumer demultiplexed by message type.
pub(crate) struct SharedConsumer {
    info: ConsumerInfo,
    state: Arc<SharedState>,
}

impl SharedConsumer {
    /// Start consuming with a first callback already registered.
    pub fn start(
        id: u64,
        queue: &str,
        generation: u64,
        handle: ConsumerHandle,
        message_type: &str,
        callback: DeliveryCallback,
        on_closed: ClosedHook,
    ) -> Arc<Self> {
        // ---
        let info = ConsumerInfo::new(id, queue, handle.consumer_tag, generation);
        let state = Arc::new(SharedState {
            callbacks: Mutex::new(HashMap::from([(message_type.to_string(), callback)])),
            cancelled: AtomicBool::new(false),
            changed: Notify::new(),
        });
        tokio::spawn(Self::run(
            queue.to_string(),
            handle.inbox,
            state.clone(),
            info.closed.clone(),
            on_closed,
        ));

        Arc::new(Self { info, state })
    }

    async fn run(
        queue: String,
        mut inbox: mpsc::UnboundedReceiver<Delivery>,
        state: Arc<SharedState>,
        closed: Arc<AtomicBool>,
        on_closed: ClosedHook,
    ) {
        // ---
        while let Some(delivery) = inbox.recv().await {
            let message_type = delivery.properties.message_type.clone().unwrap_or_default();

            let Some(callback) = state.wait_for_callback(&queue, &message_type).await else {
                break;
            };
            dispatch(&queue, &callback, delivery).await;
        }
        let cancelled = state.cancelled.load(Ordering::Acquire);
        stream_ended(&queue, cancelled, &closed, on_closed).await;
    }

    pub fn info(&self) -> &ConsumerInfo {
        &self.info
    }

    /// Register `callback` for `message_type`. Fails if the type already
    /// has one.
    pub fn add_callback(&self, message_type: &str, callback: DeliveryCallback) -> Result<()> {
        // ---
        {
            let mut callbacks = lock_ignore_poison(&self.state.callbacks);
            if callbacks.contains_key(message_type) {
                return Err(Error::InvalidOperation(format!(
                    "message type '{message_type}' is already subscribed on {}",
                    self.info.queue
                )));
            }
            callbacks.insert(message_type.to_string(), callback);
        }
        self.state.changed.notify_waiters();
        Ok(())
    }

    /// Remove the callback for `message_type`. Returns whether no callback
    /// is left.
    pub fn remove_callback(&self, message_type: &str) -> bool {
        let mut callbacks = lock_ignore_poison(&self.state.callbacks);
        callbacks.remove(message_type);
        callbacks.is_empty()
    }

    pub fn message_types(&self) -> Vec<String> {
        lock_ignore_poison(&self.state.callbacks)
            .keys()
            .cloned()
            .collect()
    }

    /// Stop dispatching and release a delivery held for a missing type.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        self.info.closed.store(true, Ordering::Release);
        self.state.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::broker::BrokerResult;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedSender;
    use tokio::time::timeout;

    #[derive(Clone, Default)]
    struct Settlements(Arc<Mutex<Vec<(u64, &'static str)>>>);

    struct TestAcker {
        tag: u64,
        log: Settlements,
    }

    #[async_trait]
    impl DeliveryAcker for TestAcker {
        async fn ack(&self) -> BrokerResult<()> {
            self.log.0.lock().unwrap().push((self.tag, "ack"));
            Ok(())
        }

        async fn nack(&self, _requeue: bool) -> BrokerResult<()> {
            self.log.0.lock().unwrap().push((self.tag, "nack"));
            Ok(())
        }
    }

    fn delivery(tag: u64, message_type: &str, log: &Settlements) -> Delivery {
        Delivery {
            delivery_tag: tag,
            redelivered: false,
            properties: MessageProperties {
                message_type: Some(message_type.to_string()),
                ..MessageProperties::default()
            },
            body: Bytes::from(format!("m{tag}")),
            acker: Box::new(TestAcker {
                tag,
                log: log.clone(),
            }),
        }
    }

    fn recording(seen: mpsc::UnboundedSender<String>) -> DeliveryCallback {
        delivery_callback(move |_properties, body, ack| {
            let seen = seen.clone();
            Box::pin(async move {
                let _ = seen.send(String::from_utf8_lossy(&body).into_owned());
                let _ = ack.ack().await;
            })
        })
    }

    fn no_hook() -> ClosedHook {
        Box::new(|| Box::pin(async {}))
    }

    fn counting_hook(count: &Arc<AtomicUsize>) -> ClosedHook {
        let count = count.clone();
        Box::new(move || {
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    fn handle() -> (UnboundedSender<Delivery>, ConsumerHandle) {
        let (tx, inbox) = mpsc::unbounded_channel();
        (
            tx,
            ConsumerHandle {
                consumer_tag: "ctag".into(),
                inbox,
            },
        )
    }

    #[tokio::test]
    async fn routes_by_type() {
        // ---
        let log = Settlements::default();
        let (tx, handle) = handle();
        let (seen_a, mut rx_a) = mpsc::unbounded_channel();
        let (seen_b, mut rx_b) = mpsc::unbounded_channel();

        let shared = SharedConsumer::start(1, "q", 1, handle, "A", recording(seen_a), no_hook());
        shared.add_callback("B", recording(seen_b)).unwrap();

        tx.send(delivery(1, "B", &log)).unwrap();
        tx.send(delivery(2, "A", &log)).unwrap();

        assert_eq!(rx_b.recv().await.unwrap(), "m1");
        assert_eq!(rx_a.recv().await.unwrap(), "m2");
        assert_eq!(shared.message_types().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_type_is_rejected() {
        // ---
        let (_tx, handle) = handle();
        let (seen, _rx) = mpsc::unbounded_channel();
        let shared = SharedConsumer::start(1, "q", 1, handle, "A", recording(seen.clone()), no_hook());

        let err = shared.add_callback("A", recording(seen)).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn unknown_type_blocks_until_registered() {
        // ---
        let log = Settlements::default();
        let (tx, handle) = handle();
        let (seen_a, mut rx_a) = mpsc::unbounded_channel();
        let (seen_b, mut rx_b) = mpsc::unbounded_channel();

        let shared = SharedConsumer::start(1, "q", 1, handle, "A", recording(seen_a), no_hook());
        tx.send(delivery(1, "B", &log)).unwrap();
        tx.send(delivery(2, "A", &log)).unwrap();

        // The A message is stuck behind the unhandled B message.
        assert!(timeout(Duration::from_millis(100), rx_a.recv()).await.is_err());
        assert!(log.0.lock().unwrap().is_empty());

        shared.add_callback("B", recording(seen_b)).unwrap();
        assert_eq!(rx_b.recv().await.unwrap(), "m1");
        assert_eq!(rx_a.recv().await.unwrap(), "m2");
        assert_eq!(*log.0.lock().unwrap(), vec![(1, "ack"), (2, "ack")]);
    }

    #[tokio::test]
    async fn cancel_releases_held_delivery_unsettled() {
        // ---
        let log = Settlements::default();
        let (tx, handle) = handle();
        let (seen, mut rx) = mpsc::unbounded_channel();

        let shared = SharedConsumer::start(1, "q", 1, handle, "A", recording(seen), no_hook());
        tx.send(delivery(1, "B", &log)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        shared.cancel();
        tx.send(delivery(2, "A", &log)).unwrap();

        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
        assert!(log.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn removing_last_callback_reports_empty() {
        // ---
        let (_tx, handle) = handle();
        let (seen, _rx) = mpsc::unbounded_channel();
        let shared = SharedConsumer::start(1, "q", 1, handle, "A", recording(seen.clone()), no_hook());
        shared.add_callback("B", recording(seen)).unwrap();

        assert!(!shared.remove_callback("A"));
        assert!(shared.remove_callback("B"));
    }

    #[tokio::test]
    async fn panicking_callback_does_not_stop_consumer() {
        // ---
        let log = Settlements::default();
        let (tx, handle) = handle();
        let (seen, mut rx) = mpsc::unbounded_channel::<String>();

        let callback = delivery_callback(move |_properties, body, ack| {
            let seen = seen.clone();
            Box::pin(async move {
                if body.as_ref() == b"m1" {
                    panic!("boom");
                }
                let _ = seen.send(String::from_utf8_lossy(&body).into_owned());
                let _ = ack.ack().await;
            })
        });
        let _consumer = Consumer::start(1, "q", 1, handle, callback, no_hook());

        tx.send(delivery(1, "", &log)).unwrap();
        tx.send(delivery(2, "", &log)).unwrap();

        assert_eq!(rx.recv().await.unwrap(), "m2");
    }

    #[tokio::test]
    async fn cancelled_consumer_stops_dispatching() {
        // ---
        let log = Settlements::default();
        let (tx, handle) = handle();
        let (seen, mut rx) = mpsc::unbounded_channel();

        let consumer = Consumer::start(1, "q", 1, handle, recording(seen), no_hook());
        tx.send(delivery(1, "", &log)).unwrap();
        assert_eq!(rx.recv().await.unwrap(), "m1");

        consumer.cancel();
        tx.send(delivery(2, "", &log)).unwrap();
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
        assert_eq!(*log.0.lock().unwrap(), vec![(1, "ack")]);
    }

    #[tokio::test]
    async fn dropped_inbox_closes_consumer_and_runs_hook() {
        // ---
        let (tx, handle) = handle();
        let (seen, _rx) = mpsc::unbounded_channel();
        let hooks = Arc::new(AtomicUsize::new(0));

        let shared = SharedConsumer::start(1, "q", 1, handle, "A", recording(seen), counting_hook(&hooks));
        assert!(!shared.info().is_closed());

        drop(tx);
        timeout(Duration::from_secs(1), async {
            while hooks.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("hook not run");

        assert!(shared.info().is_closed());
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_consumer_skips_hook() {
        // ---
        let (tx, handle) = handle();
        let (seen, _rx) = mpsc::unbounded_channel();
        let hooks = Arc::new(AtomicUsize::new(0));

        let consumer = Consumer::start(1, "q", 1, handle, recording(seen), counting_hook(&hooks));
        consumer.cancel();
        assert!(consumer.info().is_closed());

        drop(tx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hooks.load(Ordering::SeqCst), 0);
    }
}
