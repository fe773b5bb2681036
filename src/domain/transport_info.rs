// src/domain/transport_info.rs

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Transport kind used when none is configured.
pub const DEFAULT_MESSAGING: &str = "InMemory";

fn default_messaging() -> String {
    DEFAULT_MESSAGING.to_string()
}

/// Connection settings for one broker (or broker cluster).
///
/// Two `TransportInfo` values with equal fields are the same physical
/// transport: the transport manager keeps one connection per distinct value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportInfo {
    // ---
    /// Comma-separated, ordered list of broker addresses.
    broker: String,
    login: String,
    password: String,
    #[serde(default)]
    jail_strategy: Option<String>,
    #[serde(default = "default_messaging")]
    messaging: String,
}

impl TransportInfo {
    /// Create settings for the default (`InMemory`) transport kind.
    ///
    /// Broker, login and password must all be non-empty.
    pub fn new(
        broker: impl Into<String>,
        login: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        // ---
        let info = Self {
            broker: broker.into(),
            login: login.into(),
            password: password.into(),
            jail_strategy: None,
            messaging: default_messaging(),
        };
        info.validate()?;
        Ok(info)
    }

    /// Select the transport kind (factory name), e.g. `"RabbitMq"`.
    pub fn with_messaging(mut self, messaging: impl Into<String>) -> Self {
        self.messaging = messaging.into();
        self
    }

    /// Name of the partitioning ("jail") strategy for this transport.
    pub fn with_jail_strategy(mut self, name: impl Into<String>) -> Self {
        self.jail_strategy = Some(name.into());
        self
    }

    /// Check the required fields; deserialized values skip the constructor.
    pub fn validate(&self) -> Result<()> {
        // ---
        for (field, value) in [
            ("broker", &self.broker),
            ("login", &self.login),
            ("password", &self.password),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Configuration(format!(
                    "transport {field} must not be empty"
                )));
            }
        }
        Ok(())
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn jail_strategy(&self) -> Option<&str> {
        self.jail_strategy.as_deref()
    }

    pub fn messaging(&self) -> &str {
        &self.messaging
    }

    /// Broker addresses in configured order, trimmed.
    pub fn broker_addresses(&self) -> Result<Vec<String>> {
        // ---
        let addresses: Vec<String> = self
            .broker
            .split(',')
            .map(|address| address.trim().to_string())
            .collect();

        if addresses.iter().any(String::is_empty) {
            return Err(Error::Configuration(format!(
                "malformed broker list '{}'",
                self.broker
            )));
        }
        Ok(addresses)
    }
}

impl fmt::Display for TransportInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Broker: {}, Login: {}", self.broker, self.login)
    }
}
