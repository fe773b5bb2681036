// src/session/mod.rs

//! Sessions.
//!
//! A [`Session`] owns one broker channel on a shared connection and runs
//! every protocol operation through the same pipeline:
//!
//! 1. take the channel lock; open the channel if there is none or the
//!    current one died (create, confirm mode if configured, listener,
//!    prefetch of [`PREFETCH_COUNT`]);
//! 2. run the operation while holding the lock;
//! 3. on failure, classify the broker error. A decision that includes
//!    closing the channel discards it; the next attempt opens a new one.
//!    Retry decisions surface as [`Error::Recoverable`] and are repeated by
//!    the regular retry policy; anything else propagates.
//!
//! The session reports failure once through its failure callback, either
//! when the regular policy gives up or when a consumer loses its channel.
//!
//! Consumers run on their own tasks. Subscriptions with a message type share
//! one physical consumer per queue (see [`consumer`]); untyped subscriptions
//! own their consumer. Consumers are not moved to a replacement channel: a
//! consumer whose channel is discarded is dropped from the session and its
//! subscriptions turn inactive. The consumer map is always locked before the
//! channel.

mod consumer;
mod subscription;

pub use consumer::Acknowledger;
pub use subscription::{RequestHandle, Subscription};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;

use consumer::{delivery_callback, ClosedHook, Consumer, ConsumerInfo, DeliveryCallback, SharedConsumer};

use crate::{
    // ---
    broker::{
        reply_code,
        BrokerChannel,
        BrokerConnection,
        BrokerError,
        BrokerResult,
        ChannelListener,
        MessageProperties,
        PERSISTENT_DELIVERY_MODE,
    },
    failure::{decide_on_failure_actions, FailureActions},
    log_debug,
    log_error,
    log_warn,
    retry::RetryPolicyProvider,
    util::{lock_ignore_poison, FailureCallback},
    BinaryMessage,
    CorrelationId,
    Destination,
    Error,
    PublicationAddress,
    Result,
};

/// Prefetch applied to every session channel.
pub const PREFETCH_COUNT: u16 = 300;

/// Header carrying the destination a message was originally sent to.
pub const INITIAL_ROUTE_HEADER: &str = "initialRoute";

/// Per-session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Name used in logs and as the session's cache key.
    pub display_name: String,
    /// Wait for a broker confirm after every publish.
    pub publisher_confirms: bool,
}

impl SessionOptions {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            publisher_confirms: false,
        }
    }

    pub fn with_publisher_confirms(mut self, enabled: bool) -> Self {
        self.publisher_confirms = enabled;
        self
    }
}

enum ChannelState {
    Unopened,
    Open {
        channel: Arc<dyn BrokerChannel>,
        generation: u64,
    },
    Closed,
}

enum ConsumerEntry {
    Exclusive(Arc<Consumer>),
    Shared(Arc<SharedConsumer>),
}

impl ConsumerEntry {
    fn info(&self) -> &ConsumerInfo {
        match self {
            ConsumerEntry::Exclusive(consumer) => consumer.info(),
            ConsumerEntry::Shared(shared) => shared.info(),
        }
    }

    fn cancel(&self) {
        match self {
            ConsumerEntry::Exclusive(consumer) => consumer.cancel(),
            ConsumerEntry::Shared(shared) => shared.cancel(),
        }
    }
}

struct SessionListener {
    session: String,
}

impl ChannelListener for SessionListener {
    fn on_return(&self, reply_code: u16, reply_text: &str, exchange: &str, routing_key: &str) {
        log_error!(
            "session {}: message to exchange '{exchange}' with routing key '{routing_key}' \
             was returned: {reply_code} {reply_text}",
            self.session
        );
    }

    fn on_ack(&self, delivery_tag: u64) {
        log_debug!("session {}: publish {delivery_tag} confirmed", self.session);
    }

    fn on_nack(&self, delivery_tag: u64) {
        log_warn!("session {}: publish {delivery_tag} rejected", self.session);
    }

    fn on_shutdown(&self, code: u16, reply_text: &str) {
        if code == reply_code::REPLY_SUCCESS {
            log_debug!("session {}: channel closed", self.session);
        } else {
            log_error!(
                "session {}: channel closed by broker: {code} {reply_text}",
                self.session
            );
        }
    }
}

fn classify(err: BrokerError) -> Error {
    decide_on_failure_actions(&err).into_error(err)
}

fn inbound_message(properties: &MessageProperties, body: Bytes) -> BinaryMessage {
    BinaryMessage {
        bytes: body,
        message_type: properties.message_type.clone(),
        headers: properties.headers.clone(),
    }
}

fn publish_properties(
    message: &BinaryMessage,
    initial_route: &str,
    ttl: Option<Duration>,
) -> MessageProperties {
    // ---
    let mut headers = message.headers.clone();
    headers.insert(INITIAL_ROUTE_HEADER.to_string(), initial_route.to_string());

    MessageProperties {
        message_type: message.message_type.clone(),
        headers,
        delivery_mode: Some(PERSISTENT_DELIVERY_MODE),
        expiration: ttl
            .filter(|ttl| !ttl.is_zero())
            .map(|ttl| ttl.as_millis().to_string()),
        reply_to: None,
        correlation_id: None,
    }
}

/// Publish side of a `Send`: unparseable addresses name a direct exchange.
fn exchange_address(raw: &str) -> PublicationAddress {
    PublicationAddress::new("direct", raw, "")
}

fn temporary_destination(queue: &str) -> Result<Destination> {
    Destination::new(PublicationAddress::default_exchange(queue).to_string(), queue)
}

struct SessionInner {
    // ---
    connection: Arc<dyn BrokerConnection>,
    retry: RetryPolicyProvider,
    options: SessionOptions,
    channel: AsyncMutex<ChannelState>,
    consumers: AsyncMutex<HashMap<String, ConsumerEntry>>,
    requests: Mutex<HashMap<u64, Subscription>>,
    next_generation: AtomicU64,
    next_consumer_id: AtomicU64,
    disposed: AtomicBool,
    failure_reported: AtomicBool,
    listener: Arc<dyn ChannelListener>,
    on_failure: Option<FailureCallback>,
}

impl SessionInner {
    fn ensure_active(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(Error::Disposed("session"))
        } else {
            Ok(())
        }
    }

    fn report_failure(&self) {
        // ---
        if self.failure_reported.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(on_failure) = &self.on_failure {
            on_failure();
        }
    }

    async fn initialize_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        // ---
        let channel = self.connection.create_channel().await.map_err(classify)?;

        let configured: BrokerResult<()> = async {
            if self.options.publisher_confirms {
                channel.confirm_select().await?;
            }
            channel.set_listener(Some(self.listener.clone()));
            channel.basic_qos(PREFETCH_COUNT).await
        }
        .await;

        if let Err(err) = configured {
            channel.set_listener(None);
            if let Err(close_err) = channel.close().await {
                log_debug!("session {}: closing half-open channel: {close_err}", self.options.display_name);
            }
            return Err(classify(err));
        }
        Ok(channel)
    }

    /// The current channel, opened if missing or dead.
    async fn acquire_channel(
        &self,
        state: &mut ChannelState,
    ) -> Result<(Arc<dyn BrokerChannel>, u64)> {
        // ---
        match state {
            ChannelState::Closed => return Err(Error::Disposed("session")),
            ChannelState::Open {
                channel,
                generation,
            } if channel.is_open() => return Ok((channel.clone(), *generation)),
            ChannelState::Open { channel, .. } => {
                log_debug!(
                    "session {}: channel {} is closed, reopening",
                    self.options.display_name,
                    channel.channel_id()
                );
                channel.set_listener(None);
            }
            ChannelState::Unopened => {}
        }
        *state = ChannelState::Unopened;

        let channel = self.initialize_channel().await?;
        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel) + 1;
        log_debug!(
            "session {}: opened channel {} on {}",
            self.options.display_name,
            channel.channel_id(),
            self.connection.endpoint()
        );

        *state = ChannelState::Open {
            channel: channel.clone(),
            generation,
        };
        Ok((channel, generation))
    }

    /// Apply the failure decision for `err` and turn it into the error to
    /// raise.
    async fn handle_channel_failure(
        &self,
        state: &mut ChannelState,
        channel: &Arc<dyn BrokerChannel>,
        err: BrokerError,
    ) -> Error {
        // ---
        let actions = decide_on_failure_actions(&err);
        log_debug!(
            "session {}: operation on channel {} failed: {err}; actions: {actions:?}",
            self.options.display_name,
            channel.channel_id()
        );

        if actions.contains(FailureActions::CLOSE_CHANNEL) {
            channel.set_listener(None);
            if let Err(close_err) = channel.close().await {
                log_debug!("session {}: discarding channel: {close_err}", self.options.display_name);
            }
            *state = ChannelState::Unopened;
        }
        actions.into_error(err)
    }

    /// One attempt of `operation` under the channel lock. Returns the
    /// generation of the channel it ran on.
    async fn execute_channel_operation<T, F, Fut>(&self, operation: &F) -> Result<(T, u64)>
    where
        F: Fn(Arc<dyn BrokerChannel>) -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        // ---
        let mut state = self.channel.lock().await;
        let (channel, generation) = self.acquire_channel(&mut state).await?;

        match operation(channel.clone()).await {
            Ok(value) => Ok((value, generation)),
            Err(err) => Err(self.handle_channel_failure(&mut state, &channel, err).await),
        }
    }

    async fn execute_with_retry_tracked<T, F, Fut>(&self, operation: F) -> Result<(T, u64)>
    where
        F: Fn(Arc<dyn BrokerChannel>) -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        // ---
        self.ensure_active()?;

        let result = self
            .retry
            .regular()
            .execute(|| self.execute_channel_operation(&operation))
            .await;

        if let Err(err) = &result {
            if matches!(err, Error::RetriesExhausted { .. }) {
                log_error!("session {}: giving up: {err}", self.options.display_name);
                self.report_failure();
            }
        }
        result
    }

    async fn execute_with_retry<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn(Arc<dyn BrokerChannel>) -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        self.execute_with_retry_tracked(operation)
            .await
            .map(|(value, _)| value)
    }

    async fn publish(
        &self,
        address: &PublicationAddress,
        properties: MessageProperties,
        body: Bytes,
    ) -> Result<()> {
        // ---
        let confirms = self.options.publisher_confirms;
        let exchange = address.exchange_name.as_str();
        let routing_key = address.routing_key.as_str();
        let properties = &properties;
        let body = &body;

        self.execute_with_retry(move |channel| {
            let properties = properties.clone();
            let body = body.clone();
            async move {
                channel
                    .basic_publish(exchange, routing_key, true, properties, body)
                    .await?;
                if confirms {
                    channel.wait_for_confirms().await?;
                }
                Ok(())
            }
        })
        .await
    }

    async fn declare_temporary_queue(&self) -> Result<String> {
        self.execute_with_retry(|channel| async move { channel.queue_declare_temporary().await })
            .await
    }

    /// One attempt at removing a temporary queue nobody consumes from. On
    /// failure the queue lives until the connection closes.
    async fn delete_temporary_queue(&self, queue: &str) {
        // ---
        let deleted = self
            .execute_channel_operation(&|channel: Arc<dyn BrokerChannel>| async move {
                channel.queue_delete(queue).await
            })
            .await;
        if let Err(err) = deleted {
            log_warn!("session {}: deleting reply queue {queue}: {err}", self.options.display_name);
        }
    }

    async fn subscribe_queue(
        self: &Arc<Self>,
        queue: &str,
        message_type: Option<&str>,
        callback: DeliveryCallback,
    ) -> Result<Subscription> {
        // ---
        let mut consumers = self.consumers.lock().await;
        self.ensure_active()?;

        // A consumer may be gone before its own task got to remove it.
        let lost = consumers
            .get(queue)
            .filter(|entry| entry.info().is_closed())
            .map(|entry| entry.info().id);
        if let Some(lost) = lost {
            self.forget_lost_consumer(&mut consumers, queue, lost);
        }

        match (message_type, consumers.get(queue)) {
            (None, Some(ConsumerEntry::Shared(_))) => {
                return Err(Error::InvalidOperation(format!(
                    "{queue} has typed subscriptions; an untyped subscription is not allowed"
                )));
            }
            (None, Some(ConsumerEntry::Exclusive(_))) => {
                return Err(Error::InvalidOperation(format!(
                    "{queue} is already subscribed"
                )));
            }
            (Some(message_type), Some(ConsumerEntry::Exclusive(_))) => {
                return Err(Error::InvalidOperation(format!(
                    "{queue} has an untyped subscription; cannot add message type '{message_type}'"
                )));
            }
            (Some(message_type), Some(ConsumerEntry::Shared(shared))) => {
                shared.add_callback(message_type, callback)?;
                return Ok(Subscription::new(
                    Arc::downgrade(self),
                    queue,
                    Some(message_type),
                    shared.info().id,
                    shared.info().closed.clone(),
                ));
            }
            (_, None) => {}
        }

        let (handle, generation) = self
            .execute_with_retry_tracked(|channel| async move { channel.basic_consume(queue).await })
            .await?;
        let id = self.next_consumer_id.fetch_add(1, Ordering::AcqRel) + 1;

        let session = Arc::downgrade(self);
        let lost_queue = queue.to_string();
        let on_closed: ClosedHook = Box::new(move || {
            Box::pin(async move {
                if let Some(session) = session.upgrade() {
                    session.consumer_lost(&lost_queue, id).await;
                }
            })
        });

        let entry = match message_type {
            None => ConsumerEntry::Exclusive(Consumer::start(
                id,
                queue,
                generation,
                handle,
                callback,
                on_closed,
            )),
            Some(message_type) => ConsumerEntry::Shared(SharedConsumer::start(
                id,
                queue,
                generation,
                handle,
                message_type,
                callback,
                on_closed,
            )),
        };
        log_debug!(
            "session {}: consuming {queue} as {}",
            self.options.display_name,
            entry.info().consumer_tag
        );
        let closed = entry.info().closed.clone();
        consumers.insert(queue.to_string(), entry);

        Ok(Subscription::new(Arc::downgrade(self), queue, message_type, id, closed))
    }

    /// A consumer's delivery stream ended without a cancel: its channel is
    /// gone. Forget the consumer so the queue can be subscribed again, and
    /// report the session failure.
    async fn consumer_lost(&self, queue: &str, consumer_id: u64) {
        // ---
        let mut consumers = self.consumers.lock().await;
        self.forget_lost_consumer(&mut consumers, queue, consumer_id);
    }

    /// Drop a consumer whose channel went away and report the session failed.
    fn forget_lost_consumer(&self, consumers: &mut HashMap<String, ConsumerEntry>, queue: &str, consumer_id: u64) {
        // ---
        let removed = match consumers.get(queue) {
            Some(entry) if entry.info().id == consumer_id => consumers.remove(queue),
            _ => None,
        };
        if removed.is_none() || self.disposed.load(Ordering::Acquire) {
            return;
        }

        if let Some(request) = lock_ignore_poison(&self.requests).remove(&consumer_id) {
            request.mark_released();
        }
        log_error!(
            "session {}: consumer on {queue} lost with its channel",
            self.options.display_name
        );
        self.report_failure();
    }

    async fn unsubscribe(&self, queue: &str, message_type: Option<&str>, consumer_id: u64) -> Result<()> {
        // ---
        let mut consumers = self.consumers.lock().await;

        let last = match (consumers.get(queue), message_type) {
            (Some(ConsumerEntry::Exclusive(consumer)), None) => consumer.info().id == consumer_id,
            (Some(ConsumerEntry::Shared(shared)), Some(message_type)) => {
                shared.info().id == consumer_id && shared.remove_callback(message_type)
            }
            _ => false,
        };
        if !last {
            return Ok(());
        }

        let Some(entry) = consumers.remove(queue) else {
            return Ok(());
        };
        entry.cancel();
        self.cancel_consumer(entry.info()).await
    }

    async fn cancel_consumer(&self, info: &ConsumerInfo) -> Result<()> {
        // ---
        let mut state = self.channel.lock().await;
        let channel = match &*state {
            ChannelState::Open {
                channel,
                generation,
            } if *generation == info.generation && channel.is_open() => channel.clone(),
            _ => {
                log_debug!("consumer {} on {} went away with its channel", info.consumer_tag, info.queue);
                return Ok(());
            }
        };

        match channel.basic_cancel(&info.consumer_tag).await {
            Ok(()) => {
                log_debug!("cancelled consumer {} on {}", info.consumer_tag, info.queue);
                Ok(())
            }
            Err(err) => Err(self.handle_channel_failure(&mut state, &channel, err).await),
        }
    }

    fn forget_request(&self, consumer_id: u64) {
        lock_ignore_poison(&self.requests).remove(&consumer_id);
    }

    async fn dispose(&self) {
        // ---
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let requests: Vec<Subscription> = lock_ignore_poison(&self.requests)
            .drain()
            .map(|(_, request)| request)
            .collect();
        for request in &requests {
            request.mark_released();
        }

        let mut consumers = self.consumers.lock().await;
        let entries: Vec<ConsumerEntry> = consumers.drain().map(|(_, entry)| entry).collect();
        for entry in &entries {
            entry.cancel();
        }

        let mut state = self.channel.lock().await;
        if let ChannelState::Open {
            channel,
            generation,
        } = std::mem::replace(&mut *state, ChannelState::Closed)
        {
            if channel.is_open() {
                for info in entries.iter().map(ConsumerEntry::info) {
                    if info.generation != generation {
                        continue;
                    }
                    if let Err(err) = channel.basic_cancel(&info.consumer_tag).await {
                        log_debug!("cancelling {} during dispose: {err}", info.consumer_tag);
                    }
                }
            }
            channel.set_listener(None);
            if let Err(err) = channel.close().await {
                log_debug!("closing channel during dispose: {err}");
            }
        }

        log_debug!("session {} disposed", self.options.display_name);
    }
}

/// A logical session: one channel, its consumers and outstanding requests.
///
/// Cloning is cheap and shares the session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session on `connection`. The channel is opened on first use.
    ///
    /// `on_failure` is called once when the regular retry policy gives up.
    pub fn new(
        connection: Arc<dyn BrokerConnection>,
        retry: RetryPolicyProvider,
        options: SessionOptions,
        on_failure: Option<FailureCallback>,
    ) -> Self {
        // ---
        let listener: Arc<dyn ChannelListener> = Arc::new(SessionListener {
            session: options.display_name.clone(),
        });

        Self {
            inner: Arc::new(SessionInner {
                connection,
                retry,
                options,
                channel: AsyncMutex::new(ChannelState::Unopened),
                consumers: AsyncMutex::new(HashMap::new()),
                requests: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                next_consumer_id: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
                failure_reported: AtomicBool::new(false),
                listener,
                on_failure,
            }),
        }
    }

    pub fn display_name(&self) -> &str {
        &self.inner.options.display_name
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Publish `message` to the publish side of `destination`.
    ///
    /// The address is read as `type://exchange/routingKey`; anything else is
    /// taken as the name of a direct exchange with an empty routing key.
    /// A `ttl` above zero becomes the message expiration.
    pub async fn send(
        &self,
        destination: &Destination,
        message: &BinaryMessage,
        ttl: Option<Duration>,
    ) -> Result<()> {
        // ---
        let address = PublicationAddress::parse_or(destination.publish(), exchange_address);
        let properties = publish_properties(message, destination.publish(), ttl);
        self.inner
            .publish(&address, properties, message.bytes.clone())
            .await
    }

    /// Send a request and deliver replies to `on_response`.
    ///
    /// Replies arrive on a temporary queue consumed before the request is
    /// published. Release the returned handle when no more replies are
    /// expected.
    pub async fn send_request<F, Fut>(
        &self,
        destination: &Destination,
        message: &BinaryMessage,
        on_response: F,
    ) -> Result<RequestHandle>
    where
        F: Fn(BinaryMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // ---
        let inner = &self.inner;
        let queue = inner.declare_temporary_queue().await?;
        let reply_to = temporary_destination(&queue)?;

        let callback = delivery_callback(move |properties, body, ack| {
            let response = on_response(inbound_message(&properties, body));
            Box::pin(async move {
                response.await;
                if let Err(err) = ack.ack().await {
                    log_warn!("acknowledging reply failed: {err}");
                }
            })
        });
        let subscription = match inner.subscribe_queue(&queue, None, callback).await {
            Ok(subscription) => subscription,
            Err(err) => {
                inner.delete_temporary_queue(&queue).await;
                return Err(err);
            }
        };

        let correlation_id = CorrelationId::generate();
        let address = PublicationAddress::parse_or(destination.publish(), exchange_address);
        let mut properties = publish_properties(message, destination.publish(), None);
        properties.reply_to = Some(reply_to.publish().to_string());
        properties.correlation_id = Some(correlation_id.to_string());

        if let Err(err) = inner
            .publish(&address, properties, message.bytes.clone())
            .await
        {
            if let Err(release_err) = subscription.unsubscribe().await {
                log_warn!("releasing reply queue {queue}: {release_err}");
            }
            return Err(err);
        }

        lock_ignore_poison(&inner.requests).insert(subscription.consumer_id(), subscription.clone());
        Ok(RequestHandle::new(subscription, correlation_id, reply_to))
    }

    /// Serve requests arriving on `destination` with `handler`.
    ///
    /// The handler's result is published to the request's reply-to address
    /// with the request's correlation id, and only then is the request
    /// acked. A request without reply-to, a failing handler or a failed
    /// reply leaves the request unacknowledged.
    pub async fn register_handler<F, Fut>(
        &self,
        destination: &Destination,
        handler: F,
        message_type: Option<&str>,
    ) -> Result<Subscription>
    where
        F: Fn(BinaryMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<BinaryMessage>> + Send + 'static,
    {
        // ---
        let session = Arc::downgrade(&self.inner);

        let callback = delivery_callback(move |properties, body, ack| {
            let session = session.clone();
            let reply = handler(inbound_message(&properties, body));
            Box::pin(async move {
                let response = match reply.await {
                    Ok(response) => response,
                    Err(err) => {
                        log_error!("request handler failed, request left unacknowledged: {err}");
                        return;
                    }
                };
                let Some(reply_to) = properties.reply_to else {
                    log_error!("request has no reply-to address, left unacknowledged");
                    return;
                };
                let Some(session) = session.upgrade() else {
                    return;
                };

                let address = PublicationAddress::parse_or(&reply_to, |raw: &str| {
                    PublicationAddress::default_exchange(raw)
                });
                let mut reply_properties = publish_properties(&response, &reply_to, None);
                reply_properties.correlation_id = properties.correlation_id;

                if let Err(err) = session
                    .publish(&address, reply_properties, response.bytes.clone())
                    .await
                {
                    log_error!("reply to {reply_to} failed, request left unacknowledged: {err}");
                    return;
                }
                if let Err(err) = ack.ack().await {
                    log_warn!("acknowledging request failed: {err}");
                }
            })
        });

        self.inner
            .subscribe_queue(destination.subscribe(), message_type, callback)
            .await
    }

    /// Consume from the subscribe side of `destination`.
    ///
    /// Without a message type the subscription owns the queue's consumer.
    /// With one, it joins the queue's shared consumer and only sees messages
    /// of that type. The two kinds cannot be mixed on one queue.
    pub async fn subscribe<F, Fut>(
        &self,
        destination: &Destination,
        callback: F,
        message_type: Option<&str>,
    ) -> Result<Subscription>
    where
        F: Fn(BinaryMessage, Acknowledger) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // ---
        let callback = delivery_callback(move |properties, body, ack| {
            Box::pin(callback(inbound_message(&properties, body), ack))
        });
        self.inner
            .subscribe_queue(destination.subscribe(), message_type, callback)
            .await
    }

    /// Declare a broker-named, exclusive, auto-delete queue.
    ///
    /// The destination publishes through the default exchange
    /// (`direct:///<queue>`) and subscribes to the queue.
    pub async fn create_temporary_destination(&self) -> Result<Destination> {
        let queue = self.inner.declare_temporary_queue().await?;
        temporary_destination(&queue)
    }

    /// Cancel every consumer, release outstanding requests and close the
    /// channel. Idempotent.
    pub async fn dispose(&self) {
        self.inner.dispose().await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("display_name", &self.inner.options.display_name)
            .field("endpoint", &self.inner.connection.endpoint())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
