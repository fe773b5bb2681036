//! Broker failure classification.
//!
//! Every error raised by a channel operation is mapped to a set of
//! [`FailureActions`] that tells the session what to do next:
//!
//! | broker error                              | actions                 |
//! |-------------------------------------------|-------------------------|
//! | 320 connection forced                     | retry                   |
//! | 403 / 404 / 405 / 406                     | close channel + throw   |
//! | 541 internal error                        | close channel + retry   |
//! | broker unreachable                        | retry                   |
//! | channel used by several callers at once   | close channel + retry   |
//! | anything else                             | throw                   |
//!
//! Retry is only ever honoured by the regular retry policy, which sees it as
//! [`Error::Recoverable`]. Closing the channel is never a complete decision on
//! its own: it must be combined with retry or throw.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::{
    // ---
    broker::{reply_code, BrokerError},
    Error,
};

/// Bit set over {retry, close channel, throw}.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FailureActions(u8);

impl FailureActions {
    pub const NONE: FailureActions = FailureActions(0);
    pub const RETRY: FailureActions = FailureActions(1);
    pub const CLOSE_CHANNEL: FailureActions = FailureActions(2);
    pub const THROW: FailureActions = FailureActions(4);

    pub const fn contains(self, other: FailureActions) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: FailureActions) -> FailureActions {
        FailureActions(self.0 | other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Turn the decision into the error the session raises.
    ///
    /// Throw wins over retry. A decision that only closes the channel is a
    /// defect in the classification table and surfaces as a configuration
    /// error instead of letting the operation silently continue.
    pub fn into_error(self, err: BrokerError) -> Error {
        // ---
        if self.contains(Self::THROW) {
            Error::Protocol(err)
        } else if self.contains(Self::RETRY) {
            Error::Recoverable(err)
        } else if self.contains(Self::CLOSE_CHANNEL) {
            Error::Configuration(format!(
                "closing the channel must be combined with retry or throw (failure: {err})"
            ))
        } else {
            Error::Configuration(format!("no action decided for broker failure: {err}"))
        }
    }
}

impl BitOr for FailureActions {
    type Output = FailureActions;

    fn bitor(self, rhs: FailureActions) -> FailureActions {
        self.union(rhs)
    }
}

impl BitOrAssign for FailureActions {
    fn bitor_assign(&mut self, rhs: FailureActions) {
        *self = self.union(rhs);
    }
}

impl fmt::Debug for FailureActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let names: Vec<&str> = [
            (Self::RETRY, "Retry"),
            (Self::CLOSE_CHANNEL, "CloseChannel"),
            (Self::THROW, "Throw"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect();

        if names.is_empty() {
            f.write_str("None")
        } else {
            f.write_str(&names.join(" | "))
        }
    }
}

/// Decide how to react to a failed channel operation.
pub fn decide_on_failure_actions(err: &BrokerError) -> FailureActions {
    // ---
    match err {
        BrokerError::OperationInterrupted {
            reply_code: code, ..
        } => match *code {
            reply_code::CONNECTION_FORCED => FailureActions::RETRY,
            reply_code::ACCESS_REFUSED
            | reply_code::NOT_FOUND
            | reply_code::RESOURCE_LOCKED
            | reply_code::PRECONDITION_FAILED => {
                FailureActions::CLOSE_CHANNEL | FailureActions::THROW
            }
            reply_code::INTERNAL_ERROR => FailureActions::CLOSE_CHANNEL | FailureActions::RETRY,
            _ => FailureActions::THROW,
        },
        BrokerError::ConcurrentChannelUse(_) => {
            FailureActions::CLOSE_CHANNEL | FailureActions::RETRY
        }
        BrokerError::Unreachable(_) => FailureActions::RETRY,
        BrokerError::NotSupported(_) | BrokerError::Nacked | BrokerError::Other(_) => {
            FailureActions::THROW
        }
    }
}
