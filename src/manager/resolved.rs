// src/manager/resolved.rs

use std::sync::{Arc, Mutex, Weak};

use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;

use super::MessagingSessionWrapper;
use crate::{
    // ---
    log_debug,
    log_warn,
    session::SessionOptions,
    transport::{TransportFactoryPtr, TransportPtr, VerificationResult},
    util::{lock_ignore_poison, CallOnce, FailureCallback},
    Destination,
    EndpointUsage,
    Result,
    TransportInfo,
};

/// Called once the physical transport behind a [`ResolvedTransport`] fails.
pub(crate) type TransportFailureHandler = Box<dyn Fn(&Arc<ResolvedTransport>) + Send + Sync>;

/// One broker configuration as seen by the manager: the lazily created
/// physical transport plus the named sessions living on it.
pub(crate) struct ResolvedTransport {
    // ---
    info: TransportInfo,
    factory: TransportFactoryPtr,
    on_failure: TransportFailureHandler,
    transport: AsyncMutex<Option<TransportPtr>>,
    sessions: Mutex<Vec<Arc<MessagingSessionWrapper>>>,
    known_ids: Mutex<Vec<String>>,
    this: Weak<ResolvedTransport>,
}

impl ResolvedTransport {
    pub(crate) fn new(
        info: TransportInfo,
        factory: TransportFactoryPtr,
        on_failure: TransportFailureHandler,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            info,
            factory,
            on_failure,
            transport: AsyncMutex::new(None),
            sessions: Mutex::new(Vec::new()),
            known_ids: Mutex::new(Vec::new()),
            this: this.clone(),
        })
    }

    pub(crate) fn info(&self) -> &TransportInfo {
        &self.info
    }

    /// Every logical transport id that resolved to this configuration.
    pub(crate) fn known_ids(&self) -> Vec<String> {
        lock_ignore_poison(&self.known_ids).clone()
    }

    pub(crate) fn session_count(&self) -> usize {
        lock_ignore_poison(&self.sessions).len()
    }

    fn add_id(&self, transport_id: &str) {
        let mut ids = lock_ignore_poison(&self.known_ids);
        if !ids.iter().any(|id| id == transport_id) {
            ids.push(transport_id.to_string());
        }
    }

    /// The physical transport, created through the factory on first use.
    async fn ensure_transport(&self, slot: &mut Option<TransportPtr>) -> Result<TransportPtr> {
        // ---
        if let Some(transport) = slot.as_ref() {
            return Ok(transport.clone());
        }

        let this = self.this.clone();
        let on_failure = CallOnce::new(move || {
            if let Some(resolved) = this.upgrade() {
                resolved.process_transport_failure();
            }
        })
        .into_callback();

        let transport = self.factory.create(&self.info, on_failure).await?;
        log_debug!("created {} transport for {}", self.factory.name(), self.info);
        *slot = Some(transport.clone());
        Ok(transport)
    }

    /// The wrapper for `(transport_id, name)`, created with a new physical
    /// session if there is none yet. `on_failure` is added to the wrapper's
    /// callbacks either way.
    pub(crate) async fn get_session(
        &self,
        transport_id: &str,
        name: &str,
        on_failure: Option<FailureCallback>,
    ) -> Result<Arc<MessagingSessionWrapper>> {
        // ---
        self.add_id(transport_id);

        let mut slot = self.transport.lock().await;
        let transport = self.ensure_transport(&mut slot).await?;

        let existing = lock_ignore_poison(&self.sessions)
            .iter()
            .find(|wrapper| wrapper.transport_id() == transport_id && wrapper.name() == name)
            .cloned();

        let wrapper = match existing {
            Some(wrapper) => wrapper,
            None => {
                let wrapper = Arc::new(MessagingSessionWrapper::new(transport_id, name));

                let this = self.this.clone();
                let failed = Arc::downgrade(&wrapper);
                let on_session_failure = CallOnce::new(move || {
                    if let (Some(resolved), Some(wrapper)) = (this.upgrade(), failed.upgrade()) {
                        resolved.process_session_failure(&wrapper);
                    }
                })
                .into_callback();

                let session = transport
                    .create_session(SessionOptions::new(name), Some(on_session_failure))
                    .await?;
                wrapper.set_session(session);
                lock_ignore_poison(&self.sessions).push(wrapper.clone());
                wrapper
            }
        };

        if let Some(on_failure) = on_failure {
            wrapper.on_failure(on_failure);
        }
        Ok(wrapper)
    }

    pub(crate) async fn verify_destination(
        &self,
        destination: &Destination,
        usage: EndpointUsage,
        configure_if_required: bool,
    ) -> Result<VerificationResult> {
        // ---
        let mut slot = self.transport.lock().await;
        let transport = self.ensure_transport(&mut slot).await?;
        drop(slot);

        transport
            .verify_destination(destination, usage, configure_if_required)
            .await
    }

    fn process_session_failure(&self, wrapper: &Arc<MessagingSessionWrapper>) {
        // ---
        let removed = {
            let mut sessions = lock_ignore_poison(&self.sessions);
            let before = sessions.len();
            sessions.retain(|existing| !Arc::ptr_eq(existing, wrapper));
            sessions.len() != before
        };
        // Each wrapper is reported once.
        if !removed {
            return;
        }
        log_warn!(
            "session '{}' on transport {} failed",
            wrapper.name(),
            wrapper.transport_id()
        );
        wrapper.report_failure();
    }

    fn process_transport_failure(&self) {
        // ---
        log_warn!("transport for {} failed", self.info);

        let wrappers: Vec<_> = lock_ignore_poison(&self.sessions).clone();
        for wrapper in &wrappers {
            self.process_session_failure(wrapper);
        }

        if let Some(this) = self.this.upgrade() {
            (self.on_failure)(&this);
            self.dispose_failed_transport(this);
        }
    }

    fn dispose_failed_transport(&self, this: Arc<ResolvedTransport>) {
        // ---
        let Ok(runtime) = Handle::try_current() else {
            log_warn!("no runtime to dispose the failed transport for {}", self.info);
            return;
        };
        runtime.spawn(async move {
            let failed = this.transport.lock().await.take();
            if let Some(transport) = failed {
                transport.dispose().await;
            }
        });
    }

    /// Dispose every named session, then the transport. Idempotent.
    pub(crate) async fn dispose(&self) {
        // ---
        let mut slot = self.transport.lock().await;

        let wrappers: Vec<_> = std::mem::take(&mut *lock_ignore_poison(&self.sessions));
        for wrapper in wrappers {
            wrapper.dispose().await;
        }

        if let Some(transport) = slot.take() {
            transport.dispose().await;
        }
    }
}
