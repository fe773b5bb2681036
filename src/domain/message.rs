// src/domain/message.rs

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// An opaque message body plus the metadata the session understands.
///
/// The payload is never inspected. `message_type` drives shared-consumer
/// routing; `headers` travel as broker message headers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BinaryMessage {
    // ---
    pub bytes: Bytes,
    pub message_type: Option<String>,
    pub headers: HashMap<String, String>,
}

impl BinaryMessage {
    /// Create an untyped message without headers.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            message_type: None,
            headers: HashMap::new(),
        }
    }

    /// Set the message type tag.
    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn builder_sets_type_and_headers() {
        // ---
        let message = BinaryMessage::new(&b"payload"[..])
            .with_type("OrderCreated")
            .with_header("tenant", "eu");

        assert_eq!(message.bytes, Bytes::from_static(b"payload"));
        assert_eq!(message.message_type.as_deref(), Some("OrderCreated"));
        assert_eq!(message.header("tenant"), Some("eu"));
        assert_eq!(message.header("missing"), None);
    }
}
