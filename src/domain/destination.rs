// src/domain/destination.rs

//! Destinations and publication addresses.
//!
//! A [`Destination`] names where messages go (`publish`) and where they are
//! read from (`subscribe`). Against an AMQP-style broker the publish side is
//! usually an exchange address and the subscribe side a queue name; for
//! point-to-point setups both sides are the same string.
//!
//! The publish side may be written as a [`PublicationAddress`]:
//! `exchangeType://exchangeName/routingKey`. Strings that do not follow that
//! shape are interpreted by the caller (see [`PublicationAddress::parse_or`]).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A publish/subscribe address pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    // ---
    publish: String,
    subscribe: String,
}

impl Destination {
    /// Create a destination with distinct publish and subscribe sides.
    ///
    /// Both sides must be non-empty.
    pub fn new(publish: impl Into<String>, subscribe: impl Into<String>) -> Result<Self> {
        // ---
        let publish = publish.into();
        let subscribe = subscribe.into();

        if publish.trim().is_empty() {
            return Err(Error::Configuration(
                "destination publish address must not be empty".into(),
            ));
        }
        if subscribe.trim().is_empty() {
            return Err(Error::Configuration(
                "destination subscribe address must not be empty".into(),
            ));
        }

        Ok(Self { publish, subscribe })
    }

    /// Address messages are published to.
    pub fn publish(&self) -> &str {
        &self.publish
    }

    /// Address messages are consumed from.
    pub fn subscribe(&self) -> &str {
        &self.subscribe
    }

    /// Whether both sides are the same address.
    pub fn is_symmetric(&self) -> bool {
        self.publish == self.subscribe
    }
}

impl From<&str> for Destination {
    fn from(value: &str) -> Self {
        Self {
            publish: value.to_string(),
            subscribe: value.to_string(),
        }
    }
}

impl From<String> for Destination {
    fn from(value: String) -> Self {
        Self {
            publish: value.clone(),
            subscribe: value,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_symmetric() {
            write!(f, "[{}]", self.subscribe)
        } else {
            write!(f, "[s:{}, p:{}]", self.subscribe, self.publish)
        }
    }
}

/// How a destination is going to be used; drives destination verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EndpointUsage {
    pub publish: bool,
    pub subscribe: bool,
}

impl EndpointUsage {
    pub const NONE: EndpointUsage = EndpointUsage {
        publish: false,
        subscribe: false,
    };
    pub const PUBLISH: EndpointUsage = EndpointUsage {
        publish: true,
        subscribe: false,
    };
    pub const SUBSCRIBE: EndpointUsage = EndpointUsage {
        publish: false,
        subscribe: true,
    };
    pub const BOTH: EndpointUsage = EndpointUsage {
        publish: true,
        subscribe: true,
    };
}

/// Parsed `exchangeType://exchangeName/routingKey` publish address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicationAddress {
    pub exchange_type: String,
    pub exchange_name: String,
    pub routing_key: String,
}

impl PublicationAddress {
    pub fn new(
        exchange_type: impl Into<String>,
        exchange_name: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange_type: exchange_type.into(),
            exchange_name: exchange_name.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Address of a queue reached through the broker's default exchange.
    pub fn default_exchange(queue: impl Into<String>) -> Self {
        Self::new("direct", "", queue)
    }

    /// Parse `type://exchange/routingKey`. Returns `None` when the input does
    /// not have that shape.
    pub fn parse(address: &str) -> Option<Self> {
        // ---
        let (exchange_type, rest) = address.split_once("://")?;
        if exchange_type.is_empty() || exchange_type.contains('/') {
            return None;
        }
        let (exchange_name, routing_key) = rest.split_once('/')?;

        Some(Self::new(exchange_type, exchange_name, routing_key))
    }

    /// Parse `address`, or build a fallback from the raw string.
    pub fn parse_or(address: &str, fallback: impl FnOnce(&str) -> Self) -> Self {
        Self::parse(address).unwrap_or_else(|| fallback(address))
    }

    /// Whether this is the broker's built-in default (nameless direct) exchange.
    pub fn is_default_exchange(&self) -> bool {
        self.exchange_name.is_empty() && self.exchange_type.eq_ignore_ascii_case("direct")
    }
}

impl FromStr for PublicationAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| {
            Error::Configuration(format!(
                "'{s}' is not a publication address (expected type://exchange/routingKey)"
            ))
        })
    }
}

impl fmt::Display for PublicationAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/{}",
            self.exchange_type, self.exchange_name, self.routing_key
        )
    }
}
