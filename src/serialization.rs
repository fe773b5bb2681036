// src/serialization.rs

//! Typed payloads on top of [`BinaryMessage`].
//!
//! The messaging core only moves opaque bytes plus a type tag. A
//! [`MessageSerializer`] converts between those bytes and application types;
//! [`JsonSerializer`] is the one shipped with the crate.

use std::fmt;
use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{BinaryMessage, Error, Result, SerializationFormat};

/// Converts `T` to and from message payloads in one format.
pub trait MessageSerializer<T>: Send + Sync {
    fn format(&self) -> SerializationFormat;

    fn serialize(&self, message: &T) -> Result<Bytes>;

    fn deserialize(&self, payload: &[u8]) -> Result<T>;
}

/// JSON via `serde_json`.
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonSerializer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonSerializer")
    }
}

impl<T> MessageSerializer<T> for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn format(&self) -> SerializationFormat {
        SerializationFormat::Json
    }

    fn serialize(&self, message: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(message)?))
    }

    fn deserialize(&self, payload: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// The serializer registered for `format`.
///
/// Only JSON ships with the crate; other formats are a configuration error.
pub fn serializer_for<T>(format: SerializationFormat) -> Result<Box<dyn MessageSerializer<T>>>
where
    T: Serialize + DeserializeOwned + 'static,
{
    match format {
        SerializationFormat::Json => Ok(Box::new(JsonSerializer::<T>::new())),
        other => Err(Error::Configuration(format!(
            "no serializer registered for {other:?}"
        ))),
    }
}

/// Serialize `value` into a message tagged with `message_type`.
pub fn encode<T>(
    serializer: &dyn MessageSerializer<T>,
    value: &T,
    message_type: impl Into<String>,
) -> Result<BinaryMessage> {
    Ok(BinaryMessage::new(serializer.serialize(value)?).with_type(message_type))
}

pub fn decode<T>(serializer: &dyn MessageSerializer<T>, message: &BinaryMessage) -> Result<T> {
    serializer.deserialize(&message.bytes)
}
