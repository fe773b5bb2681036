// src/manager/builder.rs

//! Fluent construction of a [`TransportManager`].

use std::collections::HashMap;
use std::sync::Arc;

use super::{TransportInfoResolver, TransportManager, TransportResolver};
use crate::{
    // ---
    config::MessagingConfig,
    transport::{MemoryTransportFactory, TransportFactoryPtr},
    Error,
    Result,
    TransportInfo,
    DEFAULT_MESSAGING,
};

/// Builder for [`TransportManager`].
///
/// Exactly one of [`resolver`](Self::resolver) or
/// [`transports`](Self::transports) is required. The in-memory factory is
/// always appended after the registered ones, so a custom `"InMemory"`
/// factory takes precedence.
///
/// # Example
///
/// ```
/// use std::collections::HashMap;
/// use mom_messaging::{TransportInfo, TransportManager};
///
/// # fn example() -> mom_messaging::Result<()> {
/// let manager = TransportManager::builder()
///     .transports(HashMap::from([(
///         "main".to_string(),
///         TransportInfo::new("localhost", "guest", "guest")?,
///     )]))
///     .build()?;
/// assert_eq!(manager.resolved_count(), 0);
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
#[derive(Default)]
pub struct TransportManagerBuilder {
    resolver: Option<Arc<dyn TransportInfoResolver>>,
    transports: Option<HashMap<String, TransportInfo>>,
    jail_strategies: Vec<String>,
    factories: Vec<TransportFactoryPtr>,
    config: Option<MessagingConfig>,

    #[cfg(feature = "transport_lapin")]
    called_rabbit_mq: bool,
}

impl TransportManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve transport ids with a custom resolver.
    pub fn resolver(mut self, resolver: Arc<dyn TransportInfoResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Resolve transport ids from a fixed map, validated at `build()`.
    pub fn transports(mut self, transports: HashMap<String, TransportInfo>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Accept a custom jail strategy name in the map given to
    /// [`transports`](Self::transports).
    pub fn jail_strategy(mut self, name: impl Into<String>) -> Self {
        self.jail_strategies.push(name.into());
        self
    }

    /// Register a transport factory. Earlier registrations win on name clashes.
    pub fn factory(mut self, factory: TransportFactoryPtr) -> Self {
        self.factories.push(factory);
        self
    }

    /// Settings for factories created by the builder.
    pub fn config(mut self, config: MessagingConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Register the `"RabbitMq"` factory, using the builder's config.
    #[cfg(feature = "transport_lapin")]
    pub fn rabbit_mq(mut self) -> Self {
        self.called_rabbit_mq = true;
        self
    }

    /// Build the manager (consumes self).
    ///
    /// # Errors
    ///
    /// - [`Error::MissingConfig`] without a resolver or transport map
    /// - [`Error::Configuration`] when both are given, or the map fails
    ///   validation
    pub fn build(self) -> Result<TransportManager> {
        // ---
        let resolver: Arc<dyn TransportInfoResolver> = match (self.resolver, self.transports) {
            (Some(_), Some(_)) => {
                return Err(Error::Configuration(
                    "cannot use both a custom resolver and a transport map".into(),
                ));
            }
            (Some(resolver), None) => {
                if !self.jail_strategies.is_empty() {
                    return Err(Error::Configuration(
                        "jail strategies only apply to a transport map".into(),
                    ));
                }
                resolver
            }
            (None, Some(transports)) => Arc::new(TransportResolver::with_jail_strategies(
                transports,
                self.jail_strategies,
            )?),
            (None, None) => {
                return Err(Error::MissingConfig("resolver or transports".into()));
            }
        };

        let config = self.config.unwrap_or_default();
        let mut factories = self.factories;

        #[cfg(feature = "transport_lapin")]
        {
            if self.called_rabbit_mq {
                factories.push(Arc::new(
                    crate::transport::BrokerTransportFactory::rabbit_mq(config.clone()),
                ));
            }
        }

        if !factories.iter().any(|factory| factory.name() == DEFAULT_MESSAGING) {
            factories.push(Arc::new(MemoryTransportFactory::new(config)));
        }

        Ok(TransportManager::new(resolver, factories))
    }
}
