//! Transport-agnostic messaging over message brokers.
//!
//! Publish, subscribe, request/reply and destination verification with the
//! same semantics on every broker backend. Broker failures are classified
//! and retried where that is safe, channels are rebuilt transparently, and
//! clustered brokers are failed over at connection time.
//!
//! Entry points:
//!
//! - [`TransportManager`] resolves logical transport ids to named sessions,
//!   keeping one physical connection per broker configuration and
//!   broadcasting failures;
//! - [`Session`] runs protocol operations on one broker channel;
//! - [`broker::memory::MemoryBroker`] is an in-process broker used by the
//!   `"InMemory"` transport kind and by tests.
//!
//! ```
//! use std::collections::HashMap;
//! use mom_messaging::{BinaryMessage, Destination, Endpoint, TransportInfo, TransportManager};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> mom_messaging::Result<()> {
//! let manager = TransportManager::builder()
//!     .transports(HashMap::from([(
//!         "main".to_string(),
//!         TransportInfo::new("localhost", "guest", "guest")?,
//!     )]))
//!     .build()?;
//!
//! let endpoint = Endpoint::new("main", "direct:///orders")?;
//! let session = manager.get_messaging_session(&endpoint, "orders", None).await?;
//! let temp = session.create_temporary_destination().await?;
//! session.send(&temp, &BinaryMessage::new("hello"), None).await?;
//!
//! manager.dispose().await;
//! # Ok(())
//! # }
//! ```

// Import all sub modules once...
mod macros;
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

mod correlation;
mod domain;
mod error;

pub mod broker;
pub mod config;
pub mod failure;
pub mod manager;
pub mod retry;
pub mod serialization;
pub mod session;
pub mod transport;
pub mod util;

// --- public re-exports
pub use config::MessagingConfig;
pub use correlation::CorrelationId;
pub use error::{Error, Result};
pub use retry::{RetryConfiguration, RetryPolicy, RetryPolicyProvider};

pub use domain::{
    //
    BinaryMessage,
    Destination,
    Endpoint,
    EndpointUsage,
    PublicationAddress,
    SerializationFormat,
    TransportEvent,
    TransportEventNotification,
    TransportInfo,
    DEFAULT_MESSAGING,
};

pub use manager::{
    //
    MessagingSessionWrapper,
    TransportInfoResolver,
    TransportManager,
    TransportManagerBuilder,
    TransportResolver,
};

pub use session::{
    //
    Acknowledger,
    RequestHandle,
    Session,
    SessionOptions,
    Subscription,
};

pub use transport::{
    //
    BrokerTransport,
    BrokerTransportFactory,
    MemoryTransportFactory,
    Transport,
    TransportFactory,
    TransportFactoryPtr,
    TransportPtr,
    VerificationResult,
};
