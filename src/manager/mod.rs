// src/manager/mod.rs

//! Transport resolution.
//!
//! The [`TransportManager`] turns logical transport ids into named sessions.
//! Ids are resolved to [`TransportInfo`] values; every distinct value gets
//! one [`ResolvedTransport`](resolved::ResolvedTransport) and with it one
//! physical transport, no matter how many ids point at it or how many tasks
//! ask at once.
//!
//! When a physical transport fails, its entry is evicted (the next request
//! builds a fresh one) and a [`TransportEvent::Failure`] is broadcast for
//! every id that ever resolved to it.

mod builder;
mod resolved;
mod resolver;
mod session_wrapper;

pub use builder::TransportManagerBuilder;
pub use resolver::{TransportInfoResolver, TransportResolver, BUILTIN_JAIL_STRATEGIES};
pub use session_wrapper::MessagingSessionWrapper;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use resolved::ResolvedTransport;

use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    transport::{TransportFactoryPtr, VerificationResult},
    util::{lock_ignore_poison, FailureCallback},
    Destination,
    Endpoint,
    EndpointUsage,
    Error,
    Result,
    TransportEvent,
    TransportEventNotification,
    TransportInfo,
};

/// Capacity of the transport event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

struct ManagerInner {
    // ---
    resolver: Arc<dyn TransportInfoResolver>,
    factories: Vec<TransportFactoryPtr>,
    transports: Mutex<HashMap<TransportInfo, Arc<ResolvedTransport>>>,
    events: broadcast::Sender<TransportEventNotification>,
    disposed: AtomicBool,
}

impl ManagerInner {
    fn resolve(self: &Arc<Self>, transport_id: &str) -> Result<Arc<ResolvedTransport>> {
        // ---
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed("transport manager"));
        }

        let info = self
            .resolver
            .resolve(transport_id)
            .ok_or_else(|| Error::Transport(format!("transport '{transport_id}' is not resolvable")))?;

        let factory = self
            .factories
            .iter()
            .find(|factory| factory.name() == info.messaging())
            .cloned()
            .ok_or_else(|| {
                Error::Transport(format!(
                    "cannot create transport '{transport_id}': {} messaging is not supported",
                    info.messaging()
                ))
            })?;

        let mut transports = lock_ignore_poison(&self.transports);
        if let Some(resolved) = transports.get(&info) {
            return Ok(resolved.clone());
        }

        let manager = Arc::downgrade(self);
        let resolved = ResolvedTransport::new(
            info.clone(),
            factory,
            Box::new(move |failed| {
                if let Some(manager) = manager.upgrade() {
                    manager.process_transport_failure(failed);
                }
            }),
        );
        transports.insert(info, resolved.clone());
        Ok(resolved)
    }

    fn process_transport_failure(&self, failed: &Arc<ResolvedTransport>) {
        // ---
        let evicted = {
            let mut transports = lock_ignore_poison(&self.transports);
            match transports.get(failed.info()) {
                Some(current) if Arc::ptr_eq(current, failed) => transports.remove(failed.info()).is_some(),
                _ => false,
            }
        };
        if !evicted {
            return;
        }

        for transport_id in failed.known_ids() {
            log_warn!("transport '{transport_id}' failed");
            let notification = TransportEventNotification {
                transport_id,
                event: TransportEvent::Failure,
            };
            if self.events.send(notification).is_err() {
                log_debug!("no transport event subscribers");
            }
        }
    }
}

/// Registry of logical transports.
///
/// Cloning is cheap and shares the registry.
#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<ManagerInner>,
}

impl TransportManager {
    pub fn builder() -> TransportManagerBuilder {
        TransportManagerBuilder::new()
    }

    pub(crate) fn new(resolver: Arc<dyn TransportInfoResolver>, factories: Vec<TransportFactoryPtr>) -> Self {
        // ---
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                resolver,
                factories,
                transports: Mutex::new(HashMap::new()),
                events,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// The named session `name` on the endpoint's transport.
    ///
    /// Asking again for the same transport id and name returns the same
    /// session; `on_failure` is registered on it each time.
    pub async fn get_messaging_session(
        &self,
        endpoint: &Endpoint,
        name: &str,
        on_failure: Option<FailureCallback>,
    ) -> Result<Arc<MessagingSessionWrapper>> {
        // ---
        let transport_id = endpoint.transport_id();
        let resolved = self.inner.resolve(transport_id)?;

        resolved
            .get_session(transport_id, name, on_failure)
            .await
            .map_err(|err| Error::Session {
                name: name.to_string(),
                transport_id: transport_id.to_string(),
                source: Box::new(err),
            })
    }

    /// Check one destination on a transport without creating a session.
    pub async fn verify_destination(
        &self,
        transport_id: &str,
        destination: &Destination,
        usage: EndpointUsage,
        configure_if_required: bool,
    ) -> Result<VerificationResult> {
        // ---
        let resolved = self.inner.resolve(transport_id)?;
        resolved
            .verify_destination(destination, usage, configure_if_required)
            .await
    }

    /// Check every endpoint's destination, in order, on one transport.
    pub async fn verify_destinations(
        &self,
        transport_id: &str,
        endpoints: &[Endpoint],
        usage: EndpointUsage,
        configure_if_required: bool,
    ) -> Result<Vec<(Endpoint, VerificationResult)>> {
        // ---
        let resolved = self.inner.resolve(transport_id)?;

        let mut results = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let outcome = resolved
                .verify_destination(endpoint.destination(), usage, configure_if_required)
                .await?;
            results.push((endpoint.clone(), outcome));
        }
        Ok(results)
    }

    /// Receive a notification for every logical transport id whose physical
    /// transport fails from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<TransportEventNotification> {
        self.inner.events.subscribe()
    }

    /// Number of broker configurations currently resolved.
    pub fn resolved_count(&self) -> usize {
        lock_ignore_poison(&self.inner.transports).len()
    }

    /// Number of named sessions living on the transport behind `transport_id`.
    pub fn session_count(&self, transport_id: &str) -> usize {
        // ---
        let Some(info) = self.inner.resolver.resolve(transport_id) else {
            return 0;
        };
        lock_ignore_poison(&self.inner.transports)
            .get(&info)
            .map_or(0, |resolved| resolved.session_count())
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Dispose every resolved transport. Later resolutions fail with
    /// [`Error::Disposed`].
    pub async fn dispose(&self) {
        // ---
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let resolved: Vec<_> = lock_ignore_poison(&self.inner.transports)
            .drain()
            .map(|(_, resolved)| resolved)
            .collect();
        for transport in resolved {
            transport.dispose().await;
        }
        log_info!("transport manager disposed");
    }
}

impl fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let factories: Vec<&str> = self.inner.factories.iter().map(|f| f.name()).collect();
        f.debug_struct("TransportManager")
            .field("factories", &factories)
            .field("resolved", &self.resolved_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
