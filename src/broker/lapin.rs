// src/broker/lapin.rs

//! AMQP 0-9-1 broker client backed by `lapin`.
//!
//! Maps the broker protocol boundary onto a real AMQP connection.
//!
//! ## Error mapping
//!
//! - protocol errors (`channel.close` / `connection.close` from the broker)
//!   become [`BrokerError::OperationInterrupted`] with the broker's reply code;
//! - socket errors become [`BrokerError::Unreachable`];
//! - using a channel or connection that is no longer open maps to reply
//!   code 320 (connection forced), which the session retries after reopening
//!   the channel.
//!
//! ## Limitations
//!
//! lapin has no transparent connection recovery. A connection error is
//! published as a `Library`-initiated shutdown, which the transport reports
//! as an unrecoverable failure; the transport manager then rebuilds the
//! transport on next use.
//!
//! lapin hands returned (unroutable mandatory) messages back only through
//! publisher confirms. With confirms off it drops them, so `on_return` is
//! never called and an unroutable publish succeeds silently. Sessions that
//! need to see returns must enable publisher confirms.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_lite::stream::StreamExt;
use lapin::{
    // ---
    message::Delivery as LapinDelivery,
    options::{
        BasicAckOptions,
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        BasicQosOptions,
        ConfirmSelectOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
        QueueDeleteOptions,
    },
    publisher_confirm::{Confirmation, PublisherConfirm},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    acker::Acker,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    ExchangeKind,
};
use tokio::sync::{mpsc, watch};

use crate::{
    // ---
    broker::{
        reply_code,
        BrokerChannel,
        BrokerConnection,
        BrokerError,
        BrokerResult,
        ChannelListener,
        ConnectOptions,
        Connector,
        ConsumerHandle,
        Delivery,
        DeliveryAcker,
        MessageProperties,
        ShutdownInitiator,
        ShutdownReason,
    },
    log_debug,
    log_error,
    log_info,
    util::lock_ignore_poison,
};

fn broker_error(err: lapin::Error) -> BrokerError {
    // ---
    match err {
        lapin::Error::ProtocolError(amqp) => {
            BrokerError::interrupted(amqp.get_id(), amqp.get_message().as_str())
        }
        lapin::Error::IOError(io) => BrokerError::Unreachable(io.to_string()),
        lapin::Error::InvalidChannelState(state) => BrokerError::interrupted(
            reply_code::CONNECTION_FORCED,
            format!("channel is {state:?}"),
        ),
        lapin::Error::InvalidConnectionState(state) => BrokerError::interrupted(
            reply_code::CONNECTION_FORCED,
            format!("connection is {state:?}"),
        ),
        other => BrokerError::Other(other.to_string()),
    }
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind.to_ascii_lowercase().as_str() {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "topic" => ExchangeKind::Topic,
        _ => ExchangeKind::Custom(kind.to_string()),
    }
}

fn to_basic_properties(properties: MessageProperties) -> BasicProperties {
    // ---
    let mut headers = FieldTable::default();
    for (name, value) in properties.headers {
        headers.insert(
            ShortString::from(name),
            AMQPValue::LongString(LongString::from(value)),
        );
    }

    let mut basic = BasicProperties::default().with_headers(headers);
    if let Some(mode) = properties.delivery_mode {
        basic = basic.with_delivery_mode(mode);
    }
    if let Some(kind) = properties.message_type {
        basic = basic.with_kind(ShortString::from(kind));
    }
    if let Some(expiration) = properties.expiration {
        basic = basic.with_expiration(ShortString::from(expiration));
    }
    if let Some(reply_to) = properties.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to));
    }
    if let Some(correlation_id) = properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id));
    }
    basic
}

fn header_value(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        AMQPValue::ShortString(s) => s.as_str().to_string(),
        other => format!("{other:?}"),
    }
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    // ---
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());

    MessageProperties {
        message_type: text(basic.kind()),
        headers: basic
            .headers()
            .as_ref()
            .map(|table| {
                table
                    .inner()
                    .iter()
                    .map(|(name, value)| (name.as_str().to_string(), header_value(value)))
                    .collect()
            })
            .unwrap_or_default(),
        delivery_mode: *basic.delivery_mode(),
        expiration: text(basic.expiration()),
        reply_to: text(basic.reply_to()),
        correlation_id: text(basic.correlation_id()),
    }
}

/// Opens lapin connections.
#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

impl LapinConnector {
    pub fn new() -> Self {
        Self
    }

    fn uri(options: &ConnectOptions) -> String {
        if options.address.contains("://") {
            options.address.clone()
        } else {
            format!(
                "amqp://{}:{}@{}/%2f",
                options.login, options.password, options.address
            )
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, options: &ConnectOptions) -> BrokerResult<Arc<dyn BrokerConnection>> {
        // ---
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(options.display_name.clone()));

        let connection = Connection::connect(&Self::uri(options), properties)
            .await
            .map_err(broker_error)?;
        log_info!("connected to AMQP broker {}", options.address);

        let (shutdown, shutdown_rx) = watch::channel(None);
        let shutdown = Arc::new(shutdown);
        {
            let shutdown = shutdown.clone();
            let address = options.address.clone();
            connection.on_error(move |err| {
                let (reply_code, reply_text) = match &err {
                    lapin::Error::ProtocolError(amqp) => {
                        (amqp.get_id(), amqp.get_message().as_str().to_string())
                    }
                    other => (reply_code::CONNECTION_FORCED, other.to_string()),
                };
                log_error!("AMQP connection to {address} failed: {err}");
                shutdown.send_replace(Some(ShutdownReason {
                    initiator: ShutdownInitiator::Library,
                    reply_code,
                    reply_text,
                }));
            });
        }

        Ok(Arc::new(LapinConnection {
            connection,
            endpoint: options.address.clone(),
            shutdown,
            shutdown_rx,
        }))
    }
}

struct LapinConnection {
    connection: Connection,
    endpoint: String,
    shutdown: Arc<watch::Sender<Option<ShutdownReason>>>,
    shutdown_rx: watch::Receiver<Option<ShutdownReason>>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_open(&self) -> bool {
        self.shutdown_rx.borrow().is_none() && self.connection.status().connected()
    }

    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        // ---
        let channel = self.connection.create_channel().await.map_err(broker_error)?;
        Ok(Arc::new(LapinChannel {
            channel,
            listener: Mutex::new(None),
            confirms: Mutex::new(Vec::new()),
            confirm_mode: Mutex::new(false),
        }))
    }

    fn shutdown_signal(&self) -> watch::Receiver<Option<ShutdownReason>> {
        self.shutdown_rx.clone()
    }

    async fn close(&self) -> BrokerResult<()> {
        // ---
        let result = self
            .connection
            .close(reply_code::REPLY_SUCCESS, "Normal shutdown".into())
            .await
            .map_err(broker_error);
        self.shutdown
            .send_replace(Some(ShutdownReason::application()));
        result
    }
}

struct LapinChannel {
    channel: Channel,
    listener: Mutex<Option<Arc<dyn ChannelListener>>>,
    confirms: Mutex<Vec<PublisherConfirm>>,
    confirm_mode: Mutex<bool>,
}

impl LapinChannel {
    fn listener(&self) -> Option<Arc<dyn ChannelListener>> {
        lock_ignore_poison(&self.listener).clone()
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn channel_id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    fn set_listener(&self, listener: Option<Arc<dyn ChannelListener>>) {
        *lock_ignore_poison(&self.listener) = listener;
    }

    async fn basic_qos(&self, prefetch_count: u16) -> BrokerResult<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(broker_error)
    }

    async fn confirm_select(&self) -> BrokerResult<()> {
        // ---
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(broker_error)?;
        *lock_ignore_poison(&self.confirm_mode) = true;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        body: Bytes,
    ) -> BrokerResult<()> {
        // ---
        let confirm = self
            .channel
            .basic_publish(
                exchange.into(),
                routing_key.into(),
                BasicPublishOptions {
                    mandatory,
                    ..BasicPublishOptions::default()
                },
                &body,
                to_basic_properties(properties),
            )
            .await
            .map_err(broker_error)?;

        // Returns ride on the confirm; without confirm mode they are lost.
        if *lock_ignore_poison(&self.confirm_mode) {
            lock_ignore_poison(&self.confirms).push(confirm);
        }
        Ok(())
    }

    async fn wait_for_confirms(&self) -> BrokerResult<()> {
        // ---
        let pending = std::mem::take(&mut *lock_ignore_poison(&self.confirms));
        let mut nacked = false;

        for confirm in pending {
            match confirm.await.map_err(broker_error)? {
                Confirmation::Nack(_) => {
                    nacked = true;
                    if let Some(listener) = self.listener() {
                        listener.on_nack(0);
                    }
                }
                Confirmation::Ack(returned) => {
                    if let Some(listener) = self.listener() {
                        if let Some(message) = returned {
                            listener.on_return(
                                message.reply_code,
                                message.reply_text.as_str(),
                                message.delivery.exchange.as_str(),
                                message.delivery.routing_key.as_str(),
                            );
                        }
                        listener.on_ack(0);
                    }
                }
                Confirmation::NotRequested => {}
            }
        }

        if nacked {
            Err(BrokerError::Nacked)
        } else {
            Ok(())
        }
    }

    async fn basic_consume(&self, queue: &str) -> BrokerResult<ConsumerHandle> {
        // ---
        let mut consumer = self
            .channel
            .basic_consume(
                queue.into(),
                "".into(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)?;
        let consumer_tag = consumer.tag().as_str().to_string();

        let (tx, inbox) = mpsc::unbounded_channel();
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        if tx.send(into_delivery(delivery)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        log_error!("consumer on {queue} failed: {err}");
                        break;
                    }
                }
            }
            log_debug!("consumer stream for {queue} ended");
        });

        Ok(ConsumerHandle {
            consumer_tag,
            inbox,
        })
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.channel
            .basic_cancel(consumer_tag.into(), BasicCancelOptions::default())
            .await
            .map_err(broker_error)
    }

    async fn queue_declare_temporary(&self) -> BrokerResult<String> {
        // ---
        let queue = self
            .channel
            .queue_declare(
                "".into(),
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn queue_declare(&self, queue: &str, passive: bool) -> BrokerResult<()> {
        // ---
        self.channel
            .queue_declare(
                queue.into(),
                QueueDeclareOptions {
                    passive,
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(broker_error)
    }

    async fn queue_delete(&self, queue: &str) -> BrokerResult<()> {
        self.channel
            .queue_delete(queue.into(), QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(broker_error)
    }

    async fn exchange_declare(&self, exchange: &str, kind: &str, passive: bool) -> BrokerResult<()> {
        // ---
        self.channel
            .exchange_declare(
                exchange.into(),
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    passive,
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        self.channel
            .queue_bind(
                queue.into(),
                exchange.into(),
                routing_key.into(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)
    }

    async fn close(&self) -> BrokerResult<()> {
        // ---
        let result = self
            .channel
            .close(reply_code::REPLY_SUCCESS, "Normal shutdown".into())
            .await
            .map_err(broker_error);
        if let Some(listener) = self.listener() {
            listener.on_shutdown(reply_code::REPLY_SUCCESS, "Normal shutdown");
        }
        result
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(broker_error)
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(broker_error)
    }
}

fn into_delivery(delivery: LapinDelivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        properties: from_basic_properties(&delivery.properties),
        body: Bytes::from(delivery.data),
        acker: Box::new(LapinAcker(delivery.acker)),
    }
}
