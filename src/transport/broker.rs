// src/transport/broker.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{watch, Mutex as AsyncMutex};

use super::{Transport, VerificationResult};
use crate::{
    // ---
    broker::{
        BrokerChannel,
        BrokerConnection,
        BrokerError,
        BrokerResult,
        ConnectOptions,
        Connector,
        ShutdownReason,
    },
    config::MessagingConfig,
    log_debug,
    log_error,
    log_info,
    log_warn,
    retry::RetryPolicyProvider,
    session::{Session, SessionOptions, PREFETCH_COUNT},
    util::{lock_ignore_poison, FailureCallback},
    Destination,
    EndpointUsage,
    Error,
    PublicationAddress,
    Result,
    TransportInfo,
};

/// Shuffle broker addresses in place. Lists of one are left alone.
pub(crate) fn shuffle_brokers<R: Rng + ?Sized>(brokers: &mut [String], rng: &mut R) {
    if brokers.len() > 1 {
        brokers.shuffle(rng);
    }
}

fn connect_error(err: BrokerError) -> Error {
    match err {
        BrokerError::Unreachable(_) => Error::Unreachable(err),
        other => Error::Protocol(other),
    }
}

/// Transport over a broker reached through a [`Connector`].
///
/// The broker list is ordered (and optionally shuffled) once, at
/// construction. The connection is opened on first use by trying each
/// address in turn, each under the initial connection retry policy.
///
/// A connection shutdown that was not a normal close by this process is
/// reported through the failure callback.
pub struct BrokerTransport {
    // ---
    connector: Arc<dyn Connector>,
    brokers: Vec<String>,
    login: String,
    password: String,
    config: MessagingConfig,
    retry: RetryPolicyProvider,
    connection: AsyncMutex<Option<Arc<dyn BrokerConnection>>>,
    sessions: Mutex<Vec<Session>>,
    disposed: Arc<AtomicBool>,
    on_failure: FailureCallback,
}

impl BrokerTransport {
    /// Build a transport for `info`, shuffling its brokers with `rng` when
    /// the configuration asks for it.
    pub fn new<R: Rng + ?Sized>(
        connector: Arc<dyn Connector>,
        info: &TransportInfo,
        config: &MessagingConfig,
        on_failure: FailureCallback,
        rng: &mut R,
    ) -> Result<Self> {
        // ---
        let mut brokers = info.broker_addresses()?;
        if config.shuffle_brokers {
            shuffle_brokers(&mut brokers, rng);
        }

        Ok(Self {
            connector,
            brokers,
            login: info.login().to_string(),
            password: info.password().to_string(),
            config: config.clone(),
            retry: config.retry_policies(),
            connection: AsyncMutex::new(None),
            sessions: Mutex::new(Vec::new()),
            disposed: Arc::new(AtomicBool::new(false)),
            on_failure,
        })
    }

    /// Broker addresses in the order they are tried.
    pub fn brokers(&self) -> &[String] {
        &self.brokers
    }

    /// Number of sessions created and not yet disposed with the transport.
    pub fn session_count(&self) -> usize {
        lock_ignore_poison(&self.sessions).len()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(Error::Disposed("transport"))
        } else {
            Ok(())
        }
    }

    /// The open connection, created on first call.
    async fn connection(&self, display_name: &str) -> Result<Arc<dyn BrokerConnection>> {
        // ---
        let mut current = self.connection.lock().await;
        if let Some(connection) = current.as_ref() {
            return Ok(connection.clone());
        }

        let connection = self.open_connection(display_name).await?;
        self.watch_shutdown(&connection);
        *current = Some(connection.clone());
        Ok(connection)
    }

    async fn open_connection(&self, display_name: &str) -> Result<Arc<dyn BrokerConnection>> {
        // ---
        let connector = self.connector.as_ref();
        let mut last_error = None;

        for (index, address) in self.brokers.iter().enumerate() {
            let options = ConnectOptions {
                address: address.clone(),
                login: self.login.clone(),
                password: self.password.clone(),
                display_name: display_name.to_string(),
                automatic_recovery: true,
                network_recovery_interval: self.config.network_recovery_interval,
            };

            let attempt = self
                .retry
                .initial_connection()
                .execute(|| {
                    let options = &options;
                    async move { connector.connect(options).await.map_err(connect_error) }
                })
                .await;

            match attempt {
                Ok(connection) => {
                    log_info!("connected to broker {address} as '{display_name}'");
                    return Ok(connection);
                }
                Err(err) => {
                    if index + 1 < self.brokers.len() {
                        log_error!("failed to connect to broker {address}, trying next: {err}");
                    } else {
                        log_error!("failed to connect to broker {address}: {err}");
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(Error::Connection {
            message: format!("no broker accepted a connection (tried {})", self.brokers.join(", ")),
            source: last_error.map(Box::new),
        })
    }

    fn watch_shutdown(&self, connection: &Arc<dyn BrokerConnection>) {
        // ---
        let mut signal: watch::Receiver<Option<ShutdownReason>> = connection.shutdown_signal();
        let endpoint = connection.endpoint().to_string();
        let disposed = self.disposed.clone();
        let on_failure = self.on_failure.clone();

        tokio::spawn(async move {
            let reason = loop {
                let current = signal.borrow_and_update().clone();
                if let Some(reason) = current {
                    break reason;
                }
                if signal.changed().await.is_err() {
                    return;
                }
            };

            if reason.is_clean() || disposed.load(Ordering::Acquire) {
                log_debug!("connection to {endpoint} closed: {reason}");
                return;
            }
            log_warn!("connection to {endpoint} is broken: {reason}");
            on_failure();
        });
    }
}

async fn verify_on_channel(
    channel: &dyn BrokerChannel,
    destination: &Destination,
    usage: EndpointUsage,
    configure_if_required: bool,
) -> BrokerResult<()> {
    // ---
    let publish = PublicationAddress::parse_or(destination.publish(), |raw| {
        PublicationAddress::new("topic", raw, "")
    });
    let passive = !configure_if_required;

    if !publish.is_default_exchange() {
        channel
            .exchange_declare(&publish.exchange_name, &publish.exchange_type, passive)
            .await?;
    }

    let queue = destination.subscribe();
    if usage.subscribe && !queue.to_ascii_lowercase().starts_with("amq.") {
        channel.queue_declare(queue, passive).await?;
        channel.basic_qos(PREFETCH_COUNT).await?;

        if configure_if_required && !publish.is_default_exchange() {
            let routing_key = if publish.routing_key.is_empty() {
                "#"
            } else {
                publish.routing_key.as_str()
            };
            channel
                .queue_bind(queue, &publish.exchange_name, routing_key)
                .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl Transport for BrokerTransport {
    async fn create_session(
        &self,
        options: SessionOptions,
        on_failure: Option<FailureCallback>,
    ) -> Result<Session> {
        // ---
        self.ensure_active()?;
        let connection = self.connection(&options.display_name).await?;

        let options = if self.config.publisher_confirms {
            options.with_publisher_confirms(true)
        } else {
            options
        };
        let session = Session::new(connection, self.retry.clone(), options, on_failure);
        lock_ignore_poison(&self.sessions).push(session.clone());
        Ok(session)
    }

    async fn verify_destination(
        &self,
        destination: &Destination,
        usage: EndpointUsage,
        configure_if_required: bool,
    ) -> Result<VerificationResult> {
        // ---
        self.ensure_active()?;
        let connection = self.connection("destination verification").await?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => return Ok(Err(err.to_string())),
        };
        let outcome = verify_on_channel(channel.as_ref(), destination, usage, configure_if_required).await;

        if channel.is_open() {
            if let Err(err) = channel.close().await {
                log_debug!("closing verification channel: {err}");
            }
        }

        Ok(outcome.map_err(|err| {
            log_warn!("destination {destination} failed verification: {err}");
            err.to_string()
        }))
    }

    async fn dispose(&self) {
        // ---
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let sessions = std::mem::take(&mut *lock_ignore_poison(&self.sessions));
        for session in sessions {
            session.dispose().await;
        }

        if let Some(connection) = self.connection.lock().await.take() {
            if let Err(err) = connection.close().await {
                log_warn!("closing connection to {}: {err}", connection.endpoint());
            }
            log_info!("disconnected from broker {}", connection.endpoint());
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn brokers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn single_broker_is_not_shuffled() {
        // ---
        let mut list = brokers(&["a"]);
        shuffle_brokers(&mut list, &mut StdRng::seed_from_u64(1));
        assert_eq!(list, brokers(&["a"]));
    }

    #[test]
    fn shuffle_is_a_permutation_and_seeded() {
        // ---
        let original = brokers(&["a", "b", "c", "d", "e"]);

        let mut first = original.clone();
        shuffle_brokers(&mut first, &mut StdRng::seed_from_u64(42));
        let mut second = original.clone();
        shuffle_brokers(&mut second, &mut StdRng::seed_from_u64(42));
        assert_eq!(first, second);

        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(sorted, original);
    }

    #[test]
    fn connect_errors_split_on_reachability() {
        // ---
        assert!(matches!(
            connect_error(BrokerError::Unreachable("down".into())),
            Error::Unreachable(_)
        ));
        assert!(matches!(
            connect_error(BrokerError::interrupted(403, "ACCESS_REFUSED")),
            Error::Protocol(_)
        ));
    }
}
