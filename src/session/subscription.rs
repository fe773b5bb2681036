// src/session/subscription.rs

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::SessionInner;
use crate::{CorrelationId, Destination, Result};

struct SubscriptionState {
    // ---
    session: Weak<SessionInner>,
    queue: String,
    message_type: Option<String>,
    consumer_id: u64,
    released: AtomicBool,
    consumer_closed: Arc<AtomicBool>,
}

/// Handle on one subscription or registered handler.
///
/// Cloning shares the handle; the first `unsubscribe` on any clone wins.
#[derive(Clone)]
pub struct Subscription {
    state: Arc<SubscriptionState>,
}

impl Subscription {
    pub(super) fn new(
        session: Weak<SessionInner>,
        queue: &str,
        message_type: Option<&str>,
        consumer_id: u64,
        consumer_closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            state: Arc::new(SubscriptionState {
                session,
                queue: queue.to_string(),
                message_type: message_type.map(str::to_string),
                consumer_id,
                released: AtomicBool::new(false),
                consumer_closed,
            }),
        }
    }

    /// Queue the subscription consumes from.
    pub fn queue(&self) -> &str {
        &self.state.queue
    }

    pub fn message_type(&self) -> Option<&str> {
        self.state.message_type.as_deref()
    }

    /// False once unsubscribed, or once the consumer behind it is gone
    /// (session disposed or channel lost).
    pub fn is_active(&self) -> bool {
        !self.state.released.load(Ordering::Acquire) && !self.state.consumer_closed.load(Ordering::Acquire)
    }

    pub(super) fn consumer_id(&self) -> u64 {
        self.state.consumer_id
    }

    /// Mark released without touching the broker. Used when the session
    /// tears all consumers down itself.
    pub(super) fn mark_released(&self) -> bool {
        !self.state.released.swap(true, Ordering::AcqRel)
    }

    /// Stop receiving. Removing the last callback of a queue cancels its
    /// physical consumer; unsettled deliveries go back to the queue.
    ///
    /// Idempotent. A no-op once the session is gone.
    pub async fn unsubscribe(&self) -> Result<()> {
        // ---
        if !self.mark_released() {
            return Ok(());
        }
        let Some(session) = self.state.session.upgrade() else {
            return Ok(());
        };
        session
            .unsubscribe(
                &self.state.queue,
                self.state.message_type.as_deref(),
                self.state.consumer_id,
            )
            .await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("queue", &self.state.queue)
            .field("message_type", &self.state.message_type)
            .field("active", &self.is_active())
            .finish()
    }
}

/// One outstanding request sent with `Session::send_request`.
///
/// Owns the reply subscription on the temporary queue. Releasing it cancels
/// the consumer, after which the broker deletes the queue.
pub struct RequestHandle {
    subscription: Subscription,
    correlation_id: CorrelationId,
    reply_to: Destination,
}

impl RequestHandle {
    pub(super) fn new(
        subscription: Subscription,
        correlation_id: CorrelationId,
        reply_to: Destination,
    ) -> Self {
        Self {
            subscription,
            correlation_id,
            reply_to,
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Temporary destination replies arrive on.
    pub fn reply_to(&self) -> &Destination {
        &self.reply_to
    }

    pub fn is_released(&self) -> bool {
        !self.subscription.is_active()
    }

    /// Stop waiting for replies. Idempotent.
    pub async fn release(&self) -> Result<()> {
        // ---
        if let Some(session) = self.subscription.state.session.upgrade() {
            session.forget_request(self.subscription.consumer_id());
        }
        self.subscription.unsubscribe().await
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("released", &self.is_released())
            .finish()
    }
}
