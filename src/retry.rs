//! Retry policies.
//!
//! A policy retries an async operation a bounded number of times, waiting a
//! configured duration before each retry. The waits come from a
//! [`RetryConfiguration`]: its length is the maximum retry count and retry
//! *n* (1-based) waits `intervals[n - 1]`.
//!
//! # Policies
//!
//! - [`RetryPolicy::initial_connection`] retries only [`Error::Unreachable`],
//!   the failure raised while establishing a first connection to one broker
//!   address. Default: 10 retries, 2 seconds apart.
//! - [`RetryPolicy::regular`] retries only [`Error::Recoverable`], the signal
//!   a session raises when the failure classifier decided a channel
//!   operation is worth repeating. Default: 10 retries, waiting 2^n seconds.
//!
//! Any other error passes straight through. When the budget is spent the
//! last failure is wrapped in [`Error::RetriesExhausted`].
//!
//! Policies are cheap to clone and keep no state between calls.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::{
    // ---
    log_debug,
    log_warn,
    Error,
    Result,
};

/// Ordered wait durations; one entry per allowed retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfiguration {
    intervals: Vec<Duration>,
}

impl RetryConfiguration {
    pub fn new(intervals: Vec<Duration>) -> Self {
        Self { intervals }
    }

    /// `count` retries, each waiting `interval`.
    pub fn fixed(interval: Duration, count: usize) -> Self {
        Self::new(vec![interval; count])
    }

    /// `count` retries; retry *n* waits 2^n seconds.
    pub fn exponential(count: usize) -> Self {
        // ---
        let intervals = (1..=count)
            .map(|n| Duration::from_secs(2u64.saturating_pow(n.min(63) as u32)))
            .collect();
        Self::new(intervals)
    }

    pub fn from_millis(millis: &[u64]) -> Self {
        Self::new(millis.iter().copied().map(Duration::from_millis).collect())
    }

    /// Maximum number of retries.
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn intervals(&self) -> &[Duration] {
        &self.intervals
    }
}

/// Which failure a policy treats as transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOn {
    /// [`Error::Unreachable`] while connecting.
    Unreachable,
    /// [`Error::Recoverable`] from a channel operation.
    Recoverable,
}

impl RetryOn {
    fn matches(self, err: &Error) -> bool {
        matches!(
            (self, err),
            (RetryOn::Unreachable, Error::Unreachable(_))
                | (RetryOn::Recoverable, Error::Recoverable(_))
        )
    }
}

/// Called before each wait with the failure, the wait and the retry number.
pub type RetryObserver = Arc<dyn Fn(&Error, Duration, usize) + Send + Sync>;

/// A bounded retry loop over one class of transient failure.
#[derive(Clone)]
pub struct RetryPolicy {
    // ---
    name: &'static str,
    retry_on: RetryOn,
    intervals: Arc<[Duration]>,
    observer: Option<RetryObserver>,
}

impl RetryPolicy {
    /// Policy for the first connection attempt against one broker address.
    pub fn initial_connection(config: &RetryConfiguration) -> Self {
        Self::new("initial connection", RetryOn::Unreachable, config)
    }

    /// Policy for channel operations on an established connection.
    pub fn regular(config: &RetryConfiguration) -> Self {
        Self::new("regular", RetryOn::Recoverable, config)
    }

    fn new(name: &'static str, retry_on: RetryOn, config: &RetryConfiguration) -> Self {
        Self {
            name,
            retry_on,
            intervals: config.intervals.clone().into(),
            observer: None,
        }
    }

    /// Attach a callback invoked on every retry.
    pub fn with_observer(
        mut self,
        observer: impl Fn(&Error, Duration, usize) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn retry_on(&self) -> RetryOn {
        self.retry_on
    }

    pub fn max_retries(&self) -> usize {
        self.intervals.len()
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the retry budget is spent.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // ---
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if self.retry_on.matches(&err) => {
                    attempt += 1;

                    let Some(wait) = self.intervals.get(attempt - 1).copied() else {
                        log_debug!(
                            "{} policy exhausted after {} retries, last error: {}",
                            self.name,
                            self.intervals.len(),
                            err
                        );
                        return Err(Error::RetriesExhausted {
                            attempts: self.intervals.len(),
                            source: Box::new(err),
                        });
                    };

                    log_warn!(
                        "{} failed: {}; retry {}/{} in {:?}",
                        self.name,
                        err,
                        attempt,
                        self.intervals.len(),
                        wait
                    );
                    if let Some(observer) = &self.observer {
                        observer(&err, wait, attempt);
                    }

                    sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("retry_on", &self.retry_on)
            .field("intervals", &self.intervals)
            .finish()
    }
}

/// The pair of policies a transport and its sessions run under.
#[derive(Debug, Clone)]
pub struct RetryPolicyProvider {
    initial_connection: RetryPolicy,
    regular: RetryPolicy,
}

impl RetryPolicyProvider {
    pub fn new(initial_connection: RetryPolicy, regular: RetryPolicy) -> Self {
        Self {
            initial_connection,
            regular,
        }
    }

    pub fn from_configurations(initial: &RetryConfiguration, regular: &RetryConfiguration) -> Self {
        Self::new(
            RetryPolicy::initial_connection(initial),
            RetryPolicy::regular(regular),
        )
    }

    pub fn initial_connection(&self) -> &RetryPolicy {
        &self.initial_connection
    }

    pub fn regular(&self) -> &RetryPolicy {
        &self.regular
    }
}

impl Default for RetryPolicyProvider {
    /// 10 connection retries 2 s apart; 10 operation retries waiting 2^n s.
    fn default() -> Self {
        Self::from_configurations(
            &RetryConfiguration::fixed(Duration::from_secs(2), 10),
            &RetryConfiguration::exponential(10),
        )
    }
}
