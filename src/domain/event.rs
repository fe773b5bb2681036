// src/domain/event.rs

use std::fmt;

/// Lifecycle event of a logical transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEvent {
    /// The physical transport behind the id failed and was discarded. The
    /// next resolution creates a fresh one.
    Failure,
}

/// An event tagged with the logical transport id it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEventNotification {
    pub transport_id: String,
    pub event: TransportEvent,
}

impl fmt::Display for TransportEventNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} on transport {}", self.event, self.transport_id)
    }
}
