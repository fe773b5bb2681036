// src/manager/resolver.rs

use std::collections::{HashMap, HashSet};

use crate::{Error, Result, TransportInfo};

/// Partition strategies every [`TransportResolver`] knows about.
pub const BUILTIN_JAIL_STRATEGIES: [&str; 3] = ["None", "MachineName", "Guid"];

/// Maps logical transport ids to broker settings.
pub trait TransportInfoResolver: Send + Sync {
    /// `None` when the id is unknown.
    fn resolve(&self, transport_id: &str) -> Option<TransportInfo>;
}

/// Resolver backed by a fixed map of transports.
///
/// Construction validates every transport and checks that its jail strategy
/// (`"None"` when unset) is registered.
#[derive(Debug, Clone)]
pub struct TransportResolver {
    transports: HashMap<String, TransportInfo>,
    jail_strategies: HashSet<String>,
}

impl TransportResolver {
    pub fn new(transports: HashMap<String, TransportInfo>) -> Result<Self> {
        Self::with_jail_strategies(transports, std::iter::empty::<String>())
    }

    /// Like [`TransportResolver::new`], also accepting the given custom
    /// strategy names. Re-registering a known name is an error.
    pub fn with_jail_strategies<I, S>(transports: HashMap<String, TransportInfo>, custom: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        // ---
        let mut jail_strategies: HashSet<String> =
            BUILTIN_JAIL_STRATEGIES.iter().map(|s| s.to_string()).collect();

        for name in custom {
            let name = name.into();
            if !jail_strategies.insert(name.clone()) {
                return Err(Error::Configuration(format!(
                    "jail strategy '{name}' is already registered"
                )));
            }
        }

        for (transport_id, info) in &transports {
            info.validate()?;
            let strategy = info.jail_strategy().unwrap_or("None");
            if !jail_strategies.contains(strategy) {
                return Err(Error::Configuration(format!(
                    "transport '{transport_id}' uses unknown jail strategy '{strategy}'"
                )));
            }
        }

        Ok(Self {
            transports,
            jail_strategies,
        })
    }

    pub fn is_jail_strategy_registered(&self, name: &str) -> bool {
        self.jail_strategies.contains(name)
    }

    pub fn transport_ids(&self) -> impl Iterator<Item = &str> {
        self.transports.keys().map(String::as_str)
    }
}

impl TransportInfoResolver for TransportResolver {
    fn resolve(&self, transport_id: &str) -> Option<TransportInfo> {
        self.transports.get(transport_id).cloned()
    }
}
