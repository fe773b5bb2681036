// src/config.rs

use std::time::Duration;

use crate::retry::{RetryConfiguration, RetryPolicyProvider};

/// Tunables shared by every transport a manager creates.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use mom_messaging::{MessagingConfig, RetryConfiguration};
///
/// let config = MessagingConfig::default()
///     .with_regular_retry(RetryConfiguration::fixed(Duration::from_millis(100), 3))
///     .with_publisher_confirms(true);
/// assert!(config.publisher_confirms);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagingConfig {
    // ---
    /// Waits between connection attempts to one broker address.
    pub initial_connection_retry: RetryConfiguration,
    /// Waits between attempts of a failed channel operation.
    pub regular_retry: RetryConfiguration,
    /// Shuffle the broker list once per transport.
    pub shuffle_brokers: bool,
    /// Passed to the client library's automatic recovery.
    pub network_recovery_interval: Duration,
    /// Wait for broker confirms after every publish.
    pub publisher_confirms: bool,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            initial_connection_retry: RetryConfiguration::fixed(Duration::from_secs(2), 10),
            regular_retry: RetryConfiguration::exponential(10),
            shuffle_brokers: true,
            network_recovery_interval: Duration::from_secs(5),
            publisher_confirms: false,
        }
    }
}

impl MessagingConfig {
    pub fn with_initial_connection_retry(mut self, retry: RetryConfiguration) -> Self {
        self.initial_connection_retry = retry;
        self
    }

    pub fn with_regular_retry(mut self, retry: RetryConfiguration) -> Self {
        self.regular_retry = retry;
        self
    }

    pub fn with_shuffle_brokers(mut self, enabled: bool) -> Self {
        self.shuffle_brokers = enabled;
        self
    }

    pub fn with_network_recovery_interval(mut self, interval: Duration) -> Self {
        self.network_recovery_interval = interval;
        self
    }

    pub fn with_publisher_confirms(mut self, enabled: bool) -> Self {
        self.publisher_confirms = enabled;
        self
    }

    /// Retry policies built from this configuration.
    pub fn retry_policies(&self) -> RetryPolicyProvider {
        RetryPolicyProvider::from_configurations(&self.initial_connection_retry, &self.regular_retry)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn defaults_match_policy_defaults() {
        // ---
        let config = MessagingConfig::default();
        let policies = config.retry_policies();

        assert_eq!(policies.initial_connection().max_retries(), 10);
        assert_eq!(policies.regular().max_retries(), 10);
        assert_eq!(config.regular_retry.intervals()[2], Duration::from_secs(8));
        assert!(config.shuffle_brokers);
        assert!(!config.publisher_confirms);
    }
}
