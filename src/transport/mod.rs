// src/transport/mod.rs

//! Transports.
//!
//! A transport owns the physical connection to one broker (or broker
//! cluster) and hands out [`Session`]s on it. It is created by a
//! [`TransportFactory`] from a [`TransportInfo`] and reports unrecoverable
//! connection loss through the failure callback it was created with.
//!
//! Two factories ship with the crate:
//!
//! - [`MemoryTransportFactory`] (`"InMemory"`), always available, serving
//!   every transport from an in-process broker;
//! - [`BrokerTransportFactory`], generic over a broker
//!   [`Connector`](crate::broker::Connector). With the `transport_lapin`
//!   feature, `BrokerTransportFactory::rabbit_mq` registers as `"RabbitMq"`.

mod broker;
mod factory;

pub use broker::BrokerTransport;
pub use factory::{BrokerTransportFactory, MemoryTransportFactory};

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    // ---
    session::{Session, SessionOptions},
    util::FailureCallback,
    Destination,
    EndpointUsage,
    Result,
    TransportInfo,
};

/// Outcome of a destination check: `Err` carries the broker's reason.
pub type VerificationResult = std::result::Result<(), String>;

/// Connection to one broker configuration.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create a session on this transport's connection, connecting first if
    /// needed. `on_failure` is called once if the session gives up retrying.
    async fn create_session(
        &self,
        options: SessionOptions,
        on_failure: Option<FailureCallback>,
    ) -> Result<Session>;

    /// Check (or with `configure_if_required`, create) the broker objects
    /// behind `destination`.
    ///
    /// Broker refusals are returned as `Ok(Err(reason))`.
    async fn verify_destination(
        &self,
        destination: &Destination,
        usage: EndpointUsage,
        configure_if_required: bool,
    ) -> Result<VerificationResult>;

    /// Dispose every session, then close the connection. Idempotent.
    async fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

/// Shared transport pointer.
pub type TransportPtr = Arc<dyn Transport>;

/// Creates transports of one kind.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Kind name matched against [`TransportInfo::messaging`].
    fn name(&self) -> &str;

    async fn create(&self, info: &TransportInfo, on_failure: FailureCallback) -> Result<TransportPtr>;
}

/// Shared factory pointer.
pub type TransportFactoryPtr = Arc<dyn TransportFactory>;
