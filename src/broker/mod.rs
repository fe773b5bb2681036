// src/broker/mod.rs

//! Broker protocol boundary.
//!
//! Sessions and transports never talk to a client library directly. They
//! speak to the traits in this module, which model the small slice of an
//! AMQP 0-9-1 broker the messaging core relies on:
//!
//! - a [`Connector`] opens a [`BrokerConnection`] to one broker address;
//! - a connection opens [`BrokerChannel`]s and publishes its shutdown reason;
//! - a channel declares exchanges and queues, publishes, consumes and cancels.
//!
//! Two implementations exist:
//!
//! - [`memory`]: an in-process broker with fault injection. Always built;
//!   it backs the `InMemory` transport kind and the test-suite.
//! - `lapin`: a real AMQP client, behind the `transport_lapin` feature.
//!
//! Channels are not safe for pipelined use by several callers. The session
//! serializes every call on a channel; an implementation that detects
//! overlapping calls reports [`BrokerError::ConcurrentChannelUse`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

#[cfg(feature = "transport_lapin")]
pub mod lapin;
pub mod memory;

/// AMQP reply codes the messaging core reacts to.
pub mod reply_code {
    pub const REPLY_SUCCESS: u16 = 200;
    pub const NO_ROUTE: u16 = 312;
    pub const CONNECTION_FORCED: u16 = 320;
    pub const ACCESS_REFUSED: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const RESOURCE_LOCKED: u16 = 405;
    pub const PRECONDITION_FAILED: u16 = 406;
    pub const CHANNEL_ERROR: u16 = 504;
    pub const NOT_IMPLEMENTED: u16 = 540;
    pub const INTERNAL_ERROR: u16 = 541;
}

/// Persistent delivery mode.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Errors reported by a broker or a broker client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker closed the channel or connection with a reply code.
    #[error("operation interrupted ({reply_code}): {reply_text}")]
    OperationInterrupted { reply_code: u16, reply_text: String },

    /// No broker was listening at the address.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// Several callers pipelined requests on one channel.
    #[error("channel used concurrently: {0}")]
    ConcurrentChannelUse(String),

    /// The client library does not support the requested operation.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A publish was negatively acknowledged in confirm mode.
    #[error("publish was not confirmed by the broker")]
    Nacked,

    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    pub fn interrupted(reply_code: u16, reply_text: impl Into<String>) -> Self {
        BrokerError::OperationInterrupted {
            reply_code,
            reply_text: reply_text.into(),
        }
    }

    pub fn reply_code(&self) -> Option<u16> {
        match self {
            BrokerError::OperationInterrupted { reply_code, .. } => Some(*reply_code),
            _ => None,
        }
    }
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Message properties the core sets or reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    // ---
    pub message_type: Option<String>,
    pub headers: HashMap<String, String>,
    pub delivery_mode: Option<u8>,
    /// Time-to-live in milliseconds, as the decimal string the wire carries.
    pub expiration: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
}

/// Settles one delivery.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> BrokerResult<()>;

    async fn nack(&self, requeue: bool) -> BrokerResult<()>;
}

/// A message handed to a consumer.
pub struct Delivery {
    // ---
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Bytes,
    pub acker: Box<dyn DeliveryAcker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// A started consumer: its tag and the stream of deliveries.
///
/// The inbox closes when the consumer is cancelled or its channel closes.
pub struct ConsumerHandle {
    pub consumer_tag: String,
    pub inbox: mpsc::UnboundedReceiver<Delivery>,
}

/// Channel-level notifications.
pub trait ChannelListener: Send + Sync {
    /// A mandatory publish could not be routed and came back.
    fn on_return(&self, reply_code: u16, reply_text: &str, exchange: &str, routing_key: &str);

    /// Publisher confirm received.
    fn on_ack(&self, delivery_tag: u64);

    /// Publisher nack received.
    fn on_nack(&self, delivery_tag: u64);

    /// The channel was closed.
    fn on_shutdown(&self, reply_code: u16, reply_text: &str);
}

/// One channel on a broker connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn channel_id(&self) -> u16;

    fn is_open(&self) -> bool;

    /// Attach (or with `None`, detach) the event listener.
    fn set_listener(&self, listener: Option<Arc<dyn ChannelListener>>);

    async fn basic_qos(&self, prefetch_count: u16) -> BrokerResult<()>;

    /// Switch the channel to publisher-confirm mode.
    async fn confirm_select(&self) -> BrokerResult<()>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        body: Bytes,
    ) -> BrokerResult<()>;

    /// Wait until every publish since the last call is confirmed. Fails with
    /// [`BrokerError::Nacked`] if any was nacked. A no-op outside confirm mode.
    async fn wait_for_confirms(&self) -> BrokerResult<()>;

    /// Start a manually acknowledged consumer on `queue`.
    async fn basic_consume(&self, queue: &str) -> BrokerResult<ConsumerHandle>;

    async fn basic_cancel(&self, consumer_tag: &str) -> BrokerResult<()>;

    /// Declare a server-named, exclusive, auto-delete queue and return its name.
    async fn queue_declare_temporary(&self) -> BrokerResult<String>;

    /// Declare a durable queue, or with `passive` only check it exists.
    async fn queue_declare(&self, queue: &str, passive: bool) -> BrokerResult<()>;

    /// Delete `queue` along with its messages and consumers.
    async fn queue_delete(&self, queue: &str) -> BrokerResult<()>;

    /// Declare a durable exchange, or with `passive` only check it exists.
    async fn exchange_declare(&self, exchange: &str, kind: &str, passive: bool)
        -> BrokerResult<()>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str)
        -> BrokerResult<()>;

    async fn close(&self) -> BrokerResult<()>;
}

/// Who closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownInitiator {
    Application,
    Peer,
    Library,
}

/// Why a connection shut down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReason {
    pub initiator: ShutdownInitiator,
    pub reply_code: u16,
    pub reply_text: String,
}

impl ShutdownReason {
    /// A normal close requested by this process.
    pub fn application() -> Self {
        Self {
            initiator: ShutdownInitiator::Application,
            reply_code: reply_code::REPLY_SUCCESS,
            reply_text: "Normal shutdown".into(),
        }
    }

    /// Anything other than an application-initiated 200 is a broken connection.
    pub fn is_clean(&self) -> bool {
        self.initiator == ShutdownInitiator::Application
            && self.reply_code == reply_code::REPLY_SUCCESS
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} closed the connection ({}): {}",
            self.initiator, self.reply_code, self.reply_text
        )
    }
}

/// An open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Address this connection was opened against.
    fn endpoint(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>>;

    /// Holds `None` while the connection is up and the shutdown reason once
    /// it is gone.
    fn shutdown_signal(&self) -> watch::Receiver<Option<ShutdownReason>>;

    async fn close(&self) -> BrokerResult<()>;
}

/// Parameters for one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    // ---
    pub address: String,
    pub login: String,
    pub password: String,
    /// Shown in the broker's management UI.
    pub display_name: String,
    pub automatic_recovery: bool,
    pub network_recovery_interval: Duration,
}

/// Opens connections to broker addresses.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> BrokerResult<Arc<dyn BrokerConnection>>;
}
