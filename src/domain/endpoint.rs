// src/domain/endpoint.rs

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Destination, Error, Result};

/// Serialization format tag carried with an endpoint.
///
/// The core never interprets payloads; the tag only selects a serializer
/// (see [`crate::serialization`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SerializationFormat {
    #[default]
    Json,
    MessagePack,
    ProtoBuf,
}

/// A destination on a named logical transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    // ---
    transport_id: String,
    destination: Destination,
    shared_destination: bool,
    serialization_format: SerializationFormat,
}

impl Endpoint {
    /// Create an endpoint. The transport id must not be blank.
    pub fn new(transport_id: impl Into<String>, destination: impl Into<Destination>) -> Result<Self> {
        // ---
        let transport_id = transport_id.into();
        let destination = destination.into();

        if transport_id.trim().is_empty() {
            return Err(Error::Configuration(
                "endpoint transport id must not be empty".into(),
            ));
        }
        if destination.publish().trim().is_empty() || destination.subscribe().trim().is_empty() {
            return Err(Error::Configuration(
                "endpoint destination must not be empty".into(),
            ));
        }

        Ok(Self {
            transport_id,
            destination,
            shared_destination: false,
            serialization_format: SerializationFormat::default(),
        })
    }

    /// Mark the destination as shared by several message types.
    pub fn shared(mut self) -> Self {
        self.shared_destination = true;
        self
    }

    pub fn with_format(mut self, format: SerializationFormat) -> Self {
        self.serialization_format = format;
        self
    }

    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn is_shared_destination(&self) -> bool {
        self.shared_destination
    }

    pub fn serialization_format(&self) -> SerializationFormat {
        self.serialization_format
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Transport: {}, Destination: {}]",
            self.transport_id, self.destination
        )
    }
}
