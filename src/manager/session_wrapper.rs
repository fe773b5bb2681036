// src/manager/session_wrapper.rs

use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use crate::{
    // ---
    session::{Acknowledger, RequestHandle, Session, Subscription},
    util::{lock_ignore_poison, CallbackId, FailureCallback, FailureCallbacks},
    BinaryMessage,
    Destination,
    Error,
    Result,
};

/// A named session handed out by the transport manager.
///
/// Forwards every operation to the physical [`Session`] it was bound to and
/// carries the failure callbacks registered by everyone who asked for the
/// same `(transport id, name)` pair.
pub struct MessagingSessionWrapper {
    // ---
    transport_id: String,
    name: String,
    session: Mutex<Option<Session>>,
    callbacks: FailureCallbacks,
}

impl MessagingSessionWrapper {
    pub(crate) fn new(transport_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            transport_id: transport_id.into(),
            name: name.into(),
            session: Mutex::new(None),
            callbacks: FailureCallbacks::new(),
        }
    }

    pub(crate) fn set_session(&self, session: Session) {
        *lock_ignore_poison(&self.session) = Some(session);
    }

    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a callback run when this session or its transport fails.
    pub fn on_failure(&self, callback: FailureCallback) -> CallbackId {
        self.callbacks.register(callback)
    }

    pub fn remove_failure_callback(&self, id: CallbackId) -> bool {
        self.callbacks.remove(id)
    }

    /// Run every failure callback; a panicking one does not stop the rest.
    pub(crate) fn report_failure(&self) {
        self.callbacks.invoke_all();
    }

    fn session(&self) -> Result<Session> {
        lock_ignore_poison(&self.session)
            .clone()
            .ok_or(Error::Disposed("messaging session"))
    }

    pub async fn send(
        &self,
        destination: &Destination,
        message: &BinaryMessage,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.session()?.send(destination, message, ttl).await
    }

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
        self.session()?
            .send_request(destination, message, on_response)
            .await
    }

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
        self.session()?
            .register_handler(destination, handler, message_type)
            .await
    }

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
        self.session()?
            .subscribe(destination, callback, message_type)
            .await
    }

    pub async fn create_temporary_destination(&self) -> Result<Destination> {
        self.session()?.create_temporary_destination().await
    }

    /// Dispose the underlying session. Later calls are no-ops and every
    /// delegated operation fails with [`Error::Disposed`].
    pub async fn dispose(&self) {
        // ---
        let session = lock_ignore_poison(&self.session).take();
        if let Some(session) = session {
            session.dispose().await;
        }
    }

    pub fn is_disposed(&self) -> bool {
        lock_ignore_poison(&self.session)
            .as_ref()
            .map_or(true, Session::is_disposed)
    }
}

impl fmt::Debug for MessagingSessionWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagingSessionWrapper")
            .field("transport_id", &self.transport_id)
            .field("name", &self.name)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}
