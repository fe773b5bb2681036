// src/broker/memory/channel.rs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use super::MemoryBroker;
use crate::{
    // ---
    broker::{
        BrokerChannel,
        BrokerConnection,
        BrokerError,
        BrokerResult,
        ChannelListener,
        ConnectOptions,
        Connector,
        ConsumerHandle,
        MessageProperties,
        ShutdownReason,
    },
    util::lock_ignore_poison,
};

/// Connects broker addresses to in-process brokers.
///
/// Addresses without a registered broker are unreachable, unless a
/// catch-all broker was given.
#[derive(Default)]
pub struct MemoryConnector {
    brokers: HashMap<String, Arc<MemoryBroker>>,
    fallback: Option<Arc<MemoryBroker>>,
    attempts: Mutex<Vec<String>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve every address from `broker`.
    pub fn any_address(broker: Arc<MemoryBroker>) -> Self {
        Self {
            fallback: Some(broker),
            ..Self::default()
        }
    }

    /// Serve `address` from `broker`.
    pub fn with_broker(mut self, address: impl Into<String>, broker: Arc<MemoryBroker>) -> Self {
        self.brokers.insert(address.into(), broker);
        self
    }

    /// Addresses of every connection attempt, in order.
    pub fn attempts(&self) -> Vec<String> {
        lock_ignore_poison(&self.attempts).clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, options: &ConnectOptions) -> BrokerResult<Arc<dyn BrokerConnection>> {
        // ---
        lock_ignore_poison(&self.attempts).push(options.address.clone());

        let broker = self
            .brokers
            .get(&options.address)
            .or(self.fallback.as_ref())
            .ok_or_else(|| {
                BrokerError::Unreachable(format!("no broker listening at {}", options.address))
            })?;

        let connection =
            MemoryConnection::open(broker.clone(), &options.address, &options.display_name)?;
        Ok(Arc::new(connection))
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    broker: Arc<MemoryBroker>,
    id: u64,
    endpoint: String,
    shutdown: watch::Receiver<Option<ShutdownReason>>,
}

impl MemoryConnection {
    pub fn open(broker: Arc<MemoryBroker>, address: &str, display_name: &str) -> BrokerResult<Self> {
        // ---
        let (id, shutdown) = broker.connect(display_name)?;
        Ok(Self {
            broker,
            id,
            endpoint: address.to_string(),
            shutdown,
        })
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_open(&self) -> bool {
        self.shutdown.borrow().is_none()
    }

    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        // ---
        let (key, number) = self.broker.open_channel(self.id)?;
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            key,
            number,
            busy: AtomicBool::new(false),
        }))
    }

    fn shutdown_signal(&self) -> watch::Receiver<Option<ShutdownReason>> {
        self.shutdown.clone()
    }

    async fn close(&self) -> BrokerResult<()> {
        self.broker
            .close_connection(self.id, ShutdownReason::application());
        Ok(())
    }
}

/// A channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    broker: Arc<MemoryBroker>,
    key: u64,
    number: u16,
    busy: AtomicBool,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl MemoryChannel {
    /// Flag the channel as in use for the duration of one call.
    fn enter(&self) -> BrokerResult<BusyGuard<'_>> {
        // ---
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BrokerError::ConcurrentChannelUse(format!(
                "pipelining of requests forbidden on channel {}",
                self.number
            )));
        }
        Ok(BusyGuard(&self.busy))
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn channel_id(&self) -> u16 {
        self.number
    }

    fn is_open(&self) -> bool {
        self.broker.is_channel_open(self.key)
    }

    fn set_listener(&self, listener: Option<Arc<dyn ChannelListener>>) {
        self.broker.set_listener(self.key, listener);
    }

    async fn basic_qos(&self, prefetch_count: u16) -> BrokerResult<()> {
        let _busy = self.enter()?;
        self.broker.basic_qos(self.key, prefetch_count)
    }

    async fn confirm_select(&self) -> BrokerResult<()> {
        let _busy = self.enter()?;
        self.broker.confirm_select(self.key)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        body: Bytes,
    ) -> BrokerResult<()> {
        let _busy = self.enter()?;
        self.broker
            .basic_publish(self.key, exchange, routing_key, mandatory, properties, body)
    }

    async fn wait_for_confirms(&self) -> BrokerResult<()> {
        let _busy = self.enter()?;
        self.broker.wait_for_confirms(self.key)
    }

    async fn basic_consume(&self, queue: &str) -> BrokerResult<ConsumerHandle> {
        let _busy = self.enter()?;
        self.broker.basic_consume(self.key, queue)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        let _busy = self.enter()?;
        self.broker.basic_cancel(self.key, consumer_tag)
    }

    async fn queue_declare_temporary(&self) -> BrokerResult<String> {
        let _busy = self.enter()?;
        self.broker.queue_declare_temporary(self.key)
    }

    async fn queue_declare(&self, queue: &str, passive: bool) -> BrokerResult<()> {
        let _busy = self.enter()?;
        self.broker.queue_declare(self.key, queue, passive)
    }

    async fn queue_delete(&self, queue: &str) -> BrokerResult<()> {
        let _busy = self.enter()?;
        self.broker.queue_delete(self.key, queue)
    }

    async fn exchange_declare(&self, exchange: &str, kind: &str, passive: bool) -> BrokerResult<()> {
        let _busy = self.enter()?;
        self.broker.exchange_declare(self.key, exchange, kind, passive)
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        let _busy = self.enter()?;
        self.broker.queue_bind(self.key, queue, exchange, routing_key)
    }

    async fn close(&self) -> BrokerResult<()> {
        self.broker.close_channel(self.key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::time::Duration;

    fn options(address: &str) -> ConnectOptions {
        ConnectOptions {
            address: address.into(),
            login: "guest".into(),
            password: "guest".into(),
            display_name: "test".into(),
            automatic_recovery: true,
            network_recovery_interval: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn unknown_address_is_unreachable() {
        // ---
        let connector = MemoryConnector::new().with_broker("a", MemoryBroker::new("a"));

        let err = connector.connect(&options("b")).await.err().unwrap();
        assert!(matches!(err, BrokerError::Unreachable(_)));
        assert!(connector.connect(&options("a")).await.is_ok());
        assert_eq!(connector.attempts(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn refused_connections_are_unreachable() {
        // ---
        let broker = MemoryBroker::new("refusing");
        broker.refuse_connections(2);
        let connector = MemoryConnector::any_address(broker.clone());

        assert!(connector.connect(&options("x")).await.is_err());
        assert!(connector.connect(&options("x")).await.is_err());
        assert!(connector.connect(&options("x")).await.is_ok());
        assert_eq!(broker.connections_opened(), 1);
    }

    #[tokio::test]
    async fn overlapping_calls_are_rejected() {
        // ---
        let broker = MemoryBroker::new("busy");
        let connection = MemoryConnection::open(broker, "busy", "test").unwrap();
        let channel = connection.create_channel().await.unwrap();

        let held = MemoryChannel {
            broker: MemoryBroker::new("other"),
            key: 0,
            number: 9,
            busy: AtomicBool::new(true),
        };
        assert!(matches!(
            held.basic_qos(1).await,
            Err(BrokerError::ConcurrentChannelUse(_))
        ));
        assert!(channel.basic_qos(1).await.is_ok());
    }
}
