// src/transport/factory.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{BrokerTransport, TransportFactory, TransportPtr};
use crate::{
    // ---
    broker::{
        memory::{MemoryBroker, MemoryConnector},
        Connector,
    },
    config::MessagingConfig,
    log_debug,
    util::{lock_ignore_poison, FailureCallback},
    Result,
    TransportInfo,
    DEFAULT_MESSAGING,
};

/// Creates a [`BrokerTransport`] per request, all sharing one connector.
pub struct BrokerTransportFactory {
    // ---
    name: String,
    connector: Arc<dyn Connector>,
    config: MessagingConfig,
    rng: Mutex<StdRng>,
}

impl BrokerTransportFactory {
    pub fn new(name: impl Into<String>, connector: Arc<dyn Connector>, config: MessagingConfig) -> Self {
        Self {
            name: name.into(),
            connector,
            config,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Factory for AMQP brokers reached through `lapin`, named `"RabbitMq"`.
    #[cfg(feature = "transport_lapin")]
    pub fn rabbit_mq(config: MessagingConfig) -> Self {
        Self::new(
            "RabbitMq",
            Arc::new(crate::broker::lapin::LapinConnector::new()),
            config,
        )
    }

    /// Replace the random source used to shuffle broker lists.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }
}

#[async_trait]
impl TransportFactory for BrokerTransportFactory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, info: &TransportInfo, on_failure: FailureCallback) -> Result<TransportPtr> {
        // ---
        let transport = {
            let mut rng = lock_ignore_poison(&self.rng);
            BrokerTransport::new(
                self.connector.clone(),
                info,
                &self.config,
                on_failure,
                &mut *rng,
            )?
        };
        log_debug!("{} transport created for {info}: brokers {:?}", self.name, transport.brokers());
        Ok(Arc::new(transport))
    }
}

/// The `InMemory` transport kind.
///
/// Every distinct [`TransportInfo`] gets its own [`MemoryBroker`], kept for
/// the factory's lifetime so queued messages survive transport re-creation.
pub struct MemoryTransportFactory {
    config: MessagingConfig,
    brokers: Mutex<HashMap<TransportInfo, Arc<MemoryBroker>>>,
}

impl Default for MemoryTransportFactory {
    fn default() -> Self {
        Self::new(MessagingConfig::default())
    }
}

impl MemoryTransportFactory {
    pub fn new(config: MessagingConfig) -> Self {
        Self {
            config,
            brokers: Mutex::new(HashMap::new()),
        }
    }

    /// The broker behind `info`, created on first request.
    pub fn broker(&self, info: &TransportInfo) -> Arc<MemoryBroker> {
        lock_ignore_poison(&self.brokers)
            .entry(info.clone())
            .or_insert_with(|| MemoryBroker::new(info.broker()))
            .clone()
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    fn name(&self) -> &str {
        DEFAULT_MESSAGING
    }

    async fn create(&self, info: &TransportInfo, on_failure: FailureCallback) -> Result<TransportPtr> {
        // ---
        let connector = Arc::new(MemoryConnector::any_address(self.broker(info)));
        let transport = BrokerTransport::new(
            connector,
            info,
            &self.config,
            on_failure,
            &mut StdRng::from_entropy(),
        )?;
        Ok(Arc::new(transport))
    }
}
