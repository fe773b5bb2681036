// src/broker/memory/mod.rs

//! In-process broker.
//!
//! [`MemoryBroker`] implements the AMQP semantics the messaging core depends
//! on, entirely inside the process. It backs the `InMemory` transport kind
//! and is the reference against which the session and transport behaviour
//! is tested.
//!
//! ## Reference semantics
//!
//! - Exchanges: the nameless default exchange (routes by queue name) plus
//!   declared `direct`, `topic` and `fanout` exchanges.
//! - Queues are FIFO. Ready messages are dispatched round-robin to the
//!   queue's consumers, limited by each channel's prefetch count.
//! - Every delivery must be settled. A nack with requeue, a cancelled
//!   consumer and a closed channel all put unsettled messages back at the
//!   head of their queue, flagged as redelivered, in original order.
//! - Server-named queues are exclusive to their connection and deleted when
//!   their last consumer goes away or the connection closes.
//! - Channel-level failures (403, 404, 405, 406, 503, 541) close the channel,
//!   as a real broker would.
//! - A publish with an expiration is dropped once it reaches the head of its
//!   queue after the deadline.
//!
//! ## Fault injection
//!
//! - [`MemoryBroker::inject_failure`] makes the next matching operation fail.
//! - [`MemoryBroker::set_nack_publishes`] makes the broker reject publishes.
//! - [`MemoryBroker::refuse_connections`] makes connection attempts fail as
//!   unreachable.
//! - [`MemoryBroker::kill_connections`] closes every connection from the
//!   broker side.

mod channel;

pub use channel::{MemoryChannel, MemoryConnection, MemoryConnector};

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{
    // ---
    reply_code,
    BrokerError,
    BrokerResult,
    ChannelListener,
    ConsumerHandle,
    Delivery,
    DeliveryAcker,
    MessageProperties,
    ShutdownInitiator,
    ShutdownReason,
};
use crate::{log_debug, util::lock_ignore_poison};

/// Broker operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOperation {
    CreateChannel,
    Qos,
    ConfirmSelect,
    Publish,
    Consume,
    Cancel,
    QueueDeclare,
    QueueDelete,
    ExchangeDeclare,
    QueueBind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

impl ExchangeKind {
    fn parse(kind: &str) -> Option<Self> {
        match kind.to_ascii_lowercase().as_str() {
            "direct" => Some(ExchangeKind::Direct),
            "topic" => Some(ExchangeKind::Topic),
            "fanout" => Some(ExchangeKind::Fanout),
            _ => None,
        }
    }
}

struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>,
}

#[derive(Clone)]
struct StoredMessage {
    properties: MessageProperties,
    body: Bytes,
    redelivered: bool,
    expires_at: Option<Instant>,
}

struct ConsumerSlot {
    tag: String,
    channel: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct Queue {
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    exclusive_owner: Option<u64>,
    auto_delete: bool,
    had_consumer: bool,
}

impl Queue {
    fn durable() -> Self {
        Self {
            messages: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            exclusive_owner: None,
            auto_delete: false,
            had_consumer: false,
        }
    }

    fn temporary(owner: u64) -> Self {
        Self {
            exclusive_owner: Some(owner),
            auto_delete: true,
            ..Self::durable()
        }
    }

    fn drop_expired(&mut self, now: Instant) {
        while self
            .messages
            .front()
            .and_then(|m| m.expires_at)
            .is_some_and(|deadline| deadline <= now)
        {
            self.messages.pop_front();
        }
    }
}

struct Unacked {
    channel: u64,
    consumer_tag: String,
    queue: String,
    message: StoredMessage,
}

struct ConnectionEntry {
    open: bool,
    display_name: String,
    next_channel_number: u16,
    shutdown: watch::Sender<Option<ShutdownReason>>,
}

struct ChannelEntry {
    connection: u64,
    open: bool,
    confirm: bool,
    prefetch: u16,
    unacked: usize,
    publish_seq: u64,
    pending_nack: bool,
    listener: Option<Arc<dyn ChannelListener>>,
}

#[derive(Default)]
struct Faults {
    failures: VecDeque<(BrokerOperation, BrokerError)>,
    nack_publishes: bool,
    refused_connections: usize,
}

impl Faults {
    fn take(&mut self, operation: BrokerOperation) -> Option<BrokerError> {
        let index = self.failures.iter().position(|(op, _)| *op == operation)?;
        self.failures.remove(index).map(|(_, err)| err)
    }
}

#[derive(Default)]
struct Stats {
    connections_opened: usize,
    channels_opened: usize,
    consumers_started: usize,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    unacked: BTreeMap<u64, Unacked>,
    faults: Faults,
    next_id: u64,
    next_delivery_tag: u64,
    stats: Stats,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

enum Notice {
    Return {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },
    Ack(u64),
    Nack(u64),
    Shutdown(u16, String),
}

/// Listener callbacks collected under the state lock and run after it is
/// released.
#[derive(Default)]
struct Notices(Vec<(Arc<dyn ChannelListener>, Notice)>);

impl Notices {
    fn push(&mut self, listener: Option<&Arc<dyn ChannelListener>>, notice: Notice) {
        if let Some(listener) = listener {
            self.0.push((listener.clone(), notice));
        }
    }

    fn dispatch(self) {
        for (listener, notice) in self.0 {
            match notice {
                Notice::Return {
                    reply_code,
                    reply_text,
                    exchange,
                    routing_key,
                } => listener.on_return(reply_code, &reply_text, &exchange, &routing_key),
                Notice::Ack(tag) => listener.on_ack(tag),
                Notice::Nack(tag) => listener.on_nack(tag),
                Notice::Shutdown(code, text) => listener.on_shutdown(code, &text),
            }
        }
    }
}

fn closes_channel(err: &BrokerError) -> bool {
    matches!(
        err.reply_code(),
        Some(
            reply_code::ACCESS_REFUSED
                | reply_code::NOT_FOUND
                | reply_code::RESOURCE_LOCKED
                | reply_code::PRECONDITION_FAILED
                | 503
                | reply_code::INTERNAL_ERROR
        )
    )
}

/// Match an AMQP topic pattern (`*` = one word, `#` = zero or more words).
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn go(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => go(&pattern[1..], key) || (!key.is_empty() && go(pattern, &key[1..])),
            (Some(&"*"), Some(_)) => go(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => go(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    go(&pattern, &key)
}

/// An in-process AMQP-style broker.
pub struct MemoryBroker {
    // ---
    name: String,
    me: Weak<MemoryBroker>,
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|me| Self {
            name,
            me: me.clone(),
            state: Mutex::new(BrokerState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BrokerState, &mut Notices) -> T) -> T {
        // ---
        let mut notices = Notices::default();
        let result = {
            let mut state = lock_ignore_poison(&self.state);
            f(&mut state, &mut notices)
        };
        notices.dispatch();
        result
    }

    // ---------------------------------------------------------------------
    // Fault injection
    // ---------------------------------------------------------------------

    /// Fail the next `operation` (on any channel) with `error`.
    pub fn inject_failure(&self, operation: BrokerOperation, error: BrokerError) {
        lock_ignore_poison(&self.state)
            .faults
            .failures
            .push_back((operation, error));
    }

    /// While enabled, publishes are dropped and nacked in confirm mode.
    pub fn set_nack_publishes(&self, enabled: bool) {
        lock_ignore_poison(&self.state).faults.nack_publishes = enabled;
    }

    /// Refuse the next `count` connection attempts as unreachable.
    pub fn refuse_connections(&self, count: usize) {
        lock_ignore_poison(&self.state).faults.refused_connections = count;
    }

    /// Close every open connection from the broker side.
    pub fn kill_connections(&self, reply_code: u16, reply_text: &str) {
        // ---
        self.with_state(|state, notices| {
            let open: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, c)| c.open)
                .map(|(id, _)| *id)
                .collect();
            for id in open {
                let reason = ShutdownReason {
                    initiator: ShutdownInitiator::Peer,
                    reply_code,
                    reply_text: reply_text.to_string(),
                };
                self.close_connection_locked(state, notices, id, reason);
            }
        });
    }

    // ---------------------------------------------------------------------
    // Topology helpers and inspection
    // ---------------------------------------------------------------------

    pub fn declare_queue(&self, queue: &str) {
        lock_ignore_poison(&self.state)
            .queues
            .entry(queue.to_string())
            .or_insert_with(Queue::durable);
    }

    /// Declare an exchange of kind `direct`, `topic` or `fanout`.
    pub fn declare_exchange(&self, exchange: &str, kind: &str) -> BrokerResult<()> {
        // ---
        let kind = ExchangeKind::parse(kind)
            .ok_or_else(|| BrokerError::Other(format!("unknown exchange type '{kind}'")))?;
        lock_ignore_poison(&self.state)
            .exchanges
            .entry(exchange.to_string())
            .or_insert_with(|| Exchange {
                kind,
                bindings: Vec::new(),
            });
        Ok(())
    }

    pub fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::interrupted(
                reply_code::NOT_FOUND,
                format!("NOT_FOUND - no queue '{queue}'"),
            ));
        }
        let exchange = state.exchanges.get_mut(exchange).ok_or_else(|| {
            BrokerError::interrupted(
                reply_code::NOT_FOUND,
                format!("NOT_FOUND - no exchange '{exchange}'"),
            )
        })?;
        let binding = (queue.to_string(), routing_key.to_string());
        if !exchange.bindings.contains(&binding) {
            exchange.bindings.push(binding);
        }
        Ok(())
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        lock_ignore_poison(&self.state).queues.contains_key(queue)
    }

    /// Names of every queue, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock_ignore_poison(&self.state).queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        lock_ignore_poison(&self.state)
            .exchanges
            .contains_key(exchange)
    }

    /// Messages waiting in `queue` (not yet delivered or requeued).
    pub fn message_count(&self, queue: &str) -> usize {
        lock_ignore_poison(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// Properties and bodies of the messages waiting in `queue`, head first.
    pub fn ready_messages(&self, queue: &str) -> Vec<(MessageProperties, Bytes)> {
        lock_ignore_poison(&self.state)
            .queues
            .get(queue)
            .map(|q| {
                q.messages
                    .iter()
                    .map(|m| (m.properties.clone(), m.body.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        lock_ignore_poison(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Deliveries handed out and not yet settled, across all queues.
    pub fn unacked_count(&self) -> usize {
        lock_ignore_poison(&self.state).unacked.len()
    }

    pub fn connections_opened(&self) -> usize {
        lock_ignore_poison(&self.state).stats.connections_opened
    }

    pub fn open_connections(&self) -> usize {
        lock_ignore_poison(&self.state)
            .connections
            .values()
            .filter(|c| c.open)
            .count()
    }

    /// Display names of the currently open connections.
    pub fn connection_names(&self) -> Vec<String> {
        lock_ignore_poison(&self.state)
            .connections
            .values()
            .filter(|c| c.open)
            .map(|c| c.display_name.clone())
            .collect()
    }

    pub fn channels_opened(&self) -> usize {
        lock_ignore_poison(&self.state).stats.channels_opened
    }

    pub fn open_channels(&self) -> usize {
        lock_ignore_poison(&self.state)
            .channels
            .values()
            .filter(|c| c.open)
            .count()
    }

    pub fn consumers_started(&self) -> usize {
        lock_ignore_poison(&self.state).stats.consumers_started
    }

    // ---------------------------------------------------------------------
    // Connections and channels
    // ---------------------------------------------------------------------

    pub(crate) fn connect(
        &self,
        display_name: &str,
    ) -> BrokerResult<(u64, watch::Receiver<Option<ShutdownReason>>)> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if state.faults.refused_connections > 0 {
            state.faults.refused_connections -= 1;
            return Err(BrokerError::Unreachable(format!(
                "broker {} refused the connection",
                self.name
            )));
        }

        let id = state.next_id();
        let (shutdown, shutdown_rx) = watch::channel(None);
        state.connections.insert(
            id,
            ConnectionEntry {
                open: true,
                display_name: display_name.to_string(),
                next_channel_number: 0,
                shutdown,
            },
        );
        state.stats.connections_opened += 1;
        log_debug!("memory broker {}: connection {id} opened", self.name);

        Ok((id, shutdown_rx))
    }

    pub(crate) fn close_connection(&self, connection: u64, reason: ShutdownReason) {
        self.with_state(|state, notices| {
            self.close_connection_locked(state, notices, connection, reason)
        });
    }

    fn close_connection_locked(
        &self,
        state: &mut BrokerState,
        notices: &mut Notices,
        connection: u64,
        reason: ShutdownReason,
    ) {
        // ---
        let Some(entry) = state.connections.get_mut(&connection) else {
            return;
        };
        if !entry.open {
            return;
        }
        entry.open = false;

        let channels: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection && c.open)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel_locked(
                state,
                notices,
                channel,
                reason.reply_code,
                &reason.reply_text,
            );
        }

        let exclusive: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.exclusive_owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in exclusive {
            Self::delete_queue_locked(state, &queue);
        }

        log_debug!("memory broker {}: connection {connection} closed: {reason}", self.name);
        if let Some(entry) = state.connections.get(&connection) {
            entry.shutdown.send_replace(Some(reason));
        }
    }

    pub(crate) fn open_channel(&self, connection: u64) -> BrokerResult<(u64, u16)> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        let is_open = state
            .connections
            .get(&connection)
            .is_some_and(|c| c.open);
        if !is_open {
            return Err(BrokerError::interrupted(
                reply_code::CONNECTION_FORCED,
                "connection is closed",
            ));
        }
        if let Some(err) = state.faults.take(BrokerOperation::CreateChannel) {
            return Err(err);
        }

        let id = state.next_id();
        let number = match state.connections.get_mut(&connection) {
            Some(entry) => {
                entry.next_channel_number = entry.next_channel_number.wrapping_add(1);
                entry.next_channel_number
            }
            None => 0,
        };
        state.channels.insert(
            id,
            ChannelEntry {
                connection,
                open: true,
                confirm: false,
                prefetch: 0,
                unacked: 0,
                publish_seq: 0,
                pending_nack: false,
                listener: None,
            },
        );
        state.stats.channels_opened += 1;
        Ok((id, number))
    }

    pub(crate) fn is_channel_open(&self, channel: u64) -> bool {
        lock_ignore_poison(&self.state)
            .channels
            .get(&channel)
            .is_some_and(|c| c.open)
    }

    pub(crate) fn set_listener(&self, channel: u64, listener: Option<Arc<dyn ChannelListener>>) {
        if let Some(entry) = lock_ignore_poison(&self.state).channels.get_mut(&channel) {
            entry.listener = listener;
        }
    }

    pub(crate) fn close_channel(&self, channel: u64) {
        self.with_state(|state, notices| {
            self.close_channel_locked(
                state,
                notices,
                channel,
                reply_code::REPLY_SUCCESS,
                "Normal shutdown",
            )
        });
    }

    fn close_channel_locked(
        &self,
        state: &mut BrokerState,
        notices: &mut Notices,
        channel: u64,
        reply_code: u16,
        reply_text: &str,
    ) {
        // ---
        let listener = match state.channels.get_mut(&channel) {
            Some(entry) if entry.open => {
                entry.open = false;
                entry.listener.take()
            }
            _ => return,
        };

        let mut affected = Vec::new();
        for (name, queue) in state.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel != channel);
            if queue.consumers.len() != before {
                affected.push(name.clone());
            }
        }
        affected.extend(self.requeue_unacked(state, |u| u.channel == channel));
        self.settle_queues(state, affected);

        notices.push(
            listener.as_ref(),
            Notice::Shutdown(reply_code, reply_text.to_string()),
        );
    }

    /// Begin a channel operation: the channel must be open and no failure
    /// may be queued for `operation`.
    fn begin(
        &self,
        state: &mut BrokerState,
        notices: &mut Notices,
        channel: u64,
        operation: BrokerOperation,
    ) -> BrokerResult<()> {
        // ---
        if !state.channels.get(&channel).is_some_and(|c| c.open) {
            return Err(BrokerError::interrupted(
                reply_code::CHANNEL_ERROR,
                "CHANNEL_ERROR - channel is closed",
            ));
        }
        match state.faults.take(operation) {
            Some(err) => Err(self.raise(state, notices, channel, err)),
            None => Ok(()),
        }
    }

    /// Close the channel if `err` is a channel-level exception.
    fn raise(
        &self,
        state: &mut BrokerState,
        notices: &mut Notices,
        channel: u64,
        err: BrokerError,
    ) -> BrokerError {
        // ---
        if closes_channel(&err) {
            if let BrokerError::OperationInterrupted {
                reply_code,
                reply_text,
            } = &err
            {
                self.close_channel_locked(state, notices, channel, *reply_code, reply_text);
            }
        }
        err
    }

    // ---------------------------------------------------------------------
    // Channel operations
    // ---------------------------------------------------------------------

    pub(crate) fn basic_qos(&self, channel: u64, prefetch_count: u16) -> BrokerResult<()> {
        // ---
        self.with_state(|state, notices| {
            self.begin(state, notices, channel, BrokerOperation::Qos)?;
            if let Some(entry) = state.channels.get_mut(&channel) {
                entry.prefetch = prefetch_count;
            }
            let queues: Vec<String> = state.queues.keys().cloned().collect();
            self.settle_queues(state, queues);
            Ok(())
        })
    }

    pub(crate) fn confirm_select(&self, channel: u64) -> BrokerResult<()> {
        self.with_state(|state, notices| {
            self.begin(state, notices, channel, BrokerOperation::ConfirmSelect)?;
            if let Some(entry) = state.channels.get_mut(&channel) {
                entry.confirm = true;
            }
            Ok(())
        })
    }

    pub(crate) fn basic_publish(
        &self,
        channel: u64,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        body: Bytes,
    ) -> BrokerResult<()> {
        // ---
        self.with_state(|state, notices| {
            self.begin(state, notices, channel, BrokerOperation::Publish)?;

            let nack_publishes = state.faults.nack_publishes;
            let (confirm, seq, listener) = match state.channels.get_mut(&channel) {
                Some(entry) => {
                    entry.publish_seq += 1;
                    if nack_publishes && entry.confirm {
                        entry.pending_nack = true;
                    }
                    (entry.confirm, entry.publish_seq, entry.listener.clone())
                }
                None => (false, 0, None),
            };

            if nack_publishes {
                if confirm {
                    notices.push(listener.as_ref(), Notice::Nack(seq));
                }
                return Ok(());
            }

            let targets = match self.route(state, exchange, routing_key) {
                Ok(targets) => targets,
                Err(err) => return Err(self.raise(state, notices, channel, err)),
            };

            if targets.is_empty() && mandatory {
                notices.push(
                    listener.as_ref(),
                    Notice::Return {
                        reply_code: reply_code::NO_ROUTE,
                        reply_text: "NO_ROUTE".into(),
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                    },
                );
            }

            let expires_at = properties
                .expiration
                .as_deref()
                .and_then(|ttl| ttl.parse::<u64>().ok())
                .map(|ttl| Instant::now() + Duration::from_millis(ttl));

            for target in &targets {
                if let Some(queue) = state.queues.get_mut(target) {
                    queue.messages.push_back(StoredMessage {
                        properties: properties.clone(),
                        body: body.clone(),
                        redelivered: false,
                        expires_at,
                    });
                }
            }
            self.settle_queues(state, targets);

            if confirm {
                notices.push(listener.as_ref(), Notice::Ack(seq));
            }
            Ok(())
        })
    }

    pub(crate) fn wait_for_confirms(&self, channel: u64) -> BrokerResult<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        match state.channels.get_mut(&channel) {
            Some(entry) if entry.confirm => {
                if std::mem::take(&mut entry.pending_nack) {
                    Err(BrokerError::Nacked)
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    fn route(&self, state: &BrokerState, exchange: &str, routing_key: &str) -> BrokerResult<Vec<String>> {
        // ---
        if exchange.is_empty() {
            return Ok(if state.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }

        let Some(target) = state.exchanges.get(exchange) else {
            return Err(BrokerError::interrupted(
                reply_code::NOT_FOUND,
                format!("NOT_FOUND - no exchange '{exchange}'"),
            ));
        };

        let mut seen = HashSet::new();
        Ok(target
            .bindings
            .iter()
            .filter(|(_, key)| match target.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Topic => topic_matches(key, routing_key),
            })
            .map(|(queue, _)| queue.clone())
            .filter(|queue| state.queues.contains_key(queue) && seen.insert(queue.clone()))
            .collect())
    }

    pub(crate) fn basic_consume(&self, channel: u64, queue: &str) -> BrokerResult<ConsumerHandle> {
        // ---
        self.with_state(|state, notices| {
            self.begin(state, notices, channel, BrokerOperation::Consume)?;

            let connection = state.channels.get(&channel).map(|c| c.connection);
            let owner = match state.queues.get(queue) {
                Some(q) => q.exclusive_owner,
                None => {
                    let err = BrokerError::interrupted(
                        reply_code::NOT_FOUND,
                        format!("NOT_FOUND - no queue '{queue}'"),
                    );
                    return Err(self.raise(state, notices, channel, err));
                }
            };
            if owner.is_some() && owner != connection {
                let err = BrokerError::interrupted(
                    reply_code::RESOURCE_LOCKED,
                    format!("RESOURCE_LOCKED - queue '{queue}' is exclusive to another connection"),
                );
                return Err(self.raise(state, notices, channel, err));
            }

            let consumer_tag = format!("amq.ctag-{}", state.next_id());
            let (sender, inbox) = mpsc::unbounded_channel();
            if let Some(q) = state.queues.get_mut(queue) {
                q.consumers.push(ConsumerSlot {
                    tag: consumer_tag.clone(),
                    channel,
                    sender,
                });
                q.had_consumer = true;
            }
            state.stats.consumers_started += 1;
            self.settle_queues(state, vec![queue.to_string()]);

            Ok(ConsumerHandle {
                consumer_tag,
                inbox,
            })
        })
    }

    pub(crate) fn basic_cancel(&self, channel: u64, consumer_tag: &str) -> BrokerResult<()> {
        // ---
        self.with_state(|state, notices| {
            self.begin(state, notices, channel, BrokerOperation::Cancel)?;

            let mut affected = Vec::new();
            for (name, queue) in state.queues.iter_mut() {
                if let Some(index) = queue
                    .consumers
                    .iter()
                    .position(|c| c.tag == consumer_tag && c.channel == channel)
                {
                    queue.consumers.remove(index);
                    affected.push(name.clone());
                }
            }
            affected.extend(
                self.requeue_unacked(state, |u| u.channel == channel && u.consumer_tag == consumer_tag),
            );
            self.settle_queues(state, affected);
            Ok(())
        })
    }

    pub(crate) fn queue_declare_temporary(&self, channel: u64) -> BrokerResult<String> {
        // ---
        self.with_state(|state, notices| {
            self.begin(state, notices, channel, BrokerOperation::QueueDeclare)?;
            let connection = state
                .channels
                .get(&channel)
                .map(|c| c.connection)
                .unwrap_or_default();
            let name = format!("amq.gen-{}", Uuid::new_v4().simple());
            state
                .queues
                .insert(name.clone(), Queue::temporary(connection));
            Ok(name)
        })
    }

    pub(crate) fn queue_declare(&self, channel: u64, queue: &str, passive: bool) -> BrokerResult<()> {
        // ---
        self.with_state(|state, notices| {
            self.begin(state, notices, channel, BrokerOperation::QueueDeclare)?;

            let failure = if state.queues.contains_key(queue) {
                None
            } else if passive {
                Some(BrokerError::interrupted(
                    reply_code::NOT_FOUND,
                    format!("NOT_FOUND - no queue '{queue}'"),
                ))
            } else if queue.starts_with("amq.") {
                Some(BrokerError::interrupted(
                    reply_code::ACCESS_REFUSED,
                    format!("ACCESS_REFUSED - queue name '{queue}' contains reserved prefix 'amq.'"),
                ))
            } else {
                state.queues.insert(queue.to_string(), Queue::durable());
                None
            };

            match failure {
                Some(err) => Err(self.raise(state, notices, channel, err)),
                None => Ok(()),
            }
        })
    }

    pub(crate) fn queue_delete(&self, channel: u64, queue: &str) -> BrokerResult<()> {
        // ---
        self.with_state(|state, notices| {
            self.begin(state, notices, channel, BrokerOperation::QueueDelete)?;
            Self::delete_queue_locked(state, queue);
            Ok(())
        })
    }

    pub(crate) fn exchange_declare(
        &self,
        channel: u64,
        exchange: &str,
        kind: &str,
        passive: bool,
    ) -> BrokerResult<()> {
        // ---
        self.with_state(|state, notices| {
            self.begin(state, notices, channel, BrokerOperation::ExchangeDeclare)?;
            if exchange.is_empty() {
                return Ok(());
            }

            let failure = match (state.exchanges.get(exchange), ExchangeKind::parse(kind)) {
                (Some(_), _) if passive => None,
                (None, _) if passive => Some(BrokerError::interrupted(
                    reply_code::NOT_FOUND,
                    format!("NOT_FOUND - no exchange '{exchange}'"),
                )),
                (_, None) => Some(BrokerError::interrupted(
                    503,
                    format!("COMMAND_INVALID - unknown exchange type '{kind}'"),
                )),
                (Some(existing), Some(kind)) if existing.kind != kind => {
                    Some(BrokerError::interrupted(
                        reply_code::PRECONDITION_FAILED,
                        format!("PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{exchange}'"),
                    ))
                }
                (Some(_), Some(_)) => None,
                (None, Some(kind)) => {
                    state.exchanges.insert(
                        exchange.to_string(),
                        Exchange {
                            kind,
                            bindings: Vec::new(),
                        },
                    );
                    None
                }
            };

            match failure {
                Some(err) => Err(self.raise(state, notices, channel, err)),
                None => Ok(()),
            }
        })
    }

    pub(crate) fn queue_bind(
        &self,
        channel: u64,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        // ---
        self.with_state(|state, notices| {
            self.begin(state, notices, channel, BrokerOperation::QueueBind)?;

            let failure = if exchange.is_empty() {
                Some(BrokerError::interrupted(
                    reply_code::ACCESS_REFUSED,
                    "ACCESS_REFUSED - operation not permitted on the default exchange",
                ))
            } else if !state.queues.contains_key(queue) {
                Some(BrokerError::interrupted(
                    reply_code::NOT_FOUND,
                    format!("NOT_FOUND - no queue '{queue}'"),
                ))
            } else if let Some(target) = state.exchanges.get_mut(exchange) {
                let binding = (queue.to_string(), routing_key.to_string());
                if !target.bindings.contains(&binding) {
                    target.bindings.push(binding);
                }
                None
            } else {
                Some(BrokerError::interrupted(
                    reply_code::NOT_FOUND,
                    format!("NOT_FOUND - no exchange '{exchange}'"),
                ))
            };

            match failure {
                Some(err) => Err(self.raise(state, notices, channel, err)),
                None => Ok(()),
            }
        })
    }

    // ---------------------------------------------------------------------
    // Settlement
    // ---------------------------------------------------------------------

    fn unknown_tag(delivery_tag: u64) -> BrokerError {
        BrokerError::interrupted(
            reply_code::PRECONDITION_FAILED,
            format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"),
        )
    }

    fn settle(&self, channel: u64, delivery_tag: u64, requeue: Option<bool>) -> BrokerResult<()> {
        // ---
        self.with_state(|state, _| {
            if !state.channels.get(&channel).is_some_and(|c| c.open) {
                return Err(BrokerError::interrupted(
                    reply_code::CHANNEL_ERROR,
                    "CHANNEL_ERROR - channel is closed",
                ));
            }
            if !state
                .unacked
                .get(&delivery_tag)
                .is_some_and(|u| u.channel == channel)
            {
                return Err(Self::unknown_tag(delivery_tag));
            }
            let Some(Unacked {
                queue, mut message, ..
            }) = state.unacked.remove(&delivery_tag)
            else {
                return Err(Self::unknown_tag(delivery_tag));
            };
            if let Some(entry) = state.channels.get_mut(&channel) {
                entry.unacked = entry.unacked.saturating_sub(1);
            }

            if requeue == Some(true) {
                if let Some(target) = state.queues.get_mut(&queue) {
                    message.redelivered = true;
                    target.messages.push_front(message);
                }
            }
            self.settle_queues(state, vec![queue]);
            Ok(())
        })
    }

    /// Put the matching unsettled deliveries back at the head of their
    /// queues, preserving their original order. Returns the touched queues.
    fn requeue_unacked(
        &self,
        state: &mut BrokerState,
        matches: impl Fn(&Unacked) -> bool,
    ) -> Vec<String> {
        // ---
        let tags: Vec<u64> = state
            .unacked
            .iter()
            .rev()
            .filter(|(_, u)| matches(u))
            .map(|(tag, _)| *tag)
            .collect();

        let mut touched = Vec::new();
        for tag in tags {
            let Some(Unacked {
                channel,
                queue,
                mut message,
                ..
            }) = state.unacked.remove(&tag)
            else {
                continue;
            };
            if let Some(entry) = state.channels.get_mut(&channel) {
                entry.unacked = entry.unacked.saturating_sub(1);
            }
            if let Some(target) = state.queues.get_mut(&queue) {
                message.redelivered = true;
                target.messages.push_front(message);
            }
            touched.push(queue);
        }
        touched
    }

    /// Delete auto-delete queues that lost their last consumer, then
    /// dispatch what can be dispatched.
    fn settle_queues(&self, state: &mut BrokerState, queues: Vec<String>) {
        // ---
        let mut unique: Vec<String> = Vec::new();
        for queue in queues {
            if !unique.contains(&queue) {
                unique.push(queue);
            }
        }

        for queue in &unique {
            let abandoned = state
                .queues
                .get(queue)
                .is_some_and(|q| q.auto_delete && q.had_consumer && q.consumers.is_empty());
            if abandoned {
                Self::delete_queue_locked(state, queue);
            }
        }
        for queue in &unique {
            self.dispatch(state, queue);
        }
    }

    fn delete_queue_locked(state: &mut BrokerState, queue: &str) {
        // ---
        state.queues.remove(queue);
        for exchange in state.exchanges.values_mut() {
            exchange.bindings.retain(|(bound, _)| bound != queue);
        }
        let orphaned: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.queue == queue)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in orphaned {
            if let Some(unacked) = state.unacked.remove(&tag) {
                if let Some(entry) = state.channels.get_mut(&unacked.channel) {
                    entry.unacked = entry.unacked.saturating_sub(1);
                }
            }
        }
    }

    /// Hand ready messages of `queue_name` to consumers with spare prefetch.
    fn dispatch(&self, state: &mut BrokerState, queue_name: &str) {
        // ---
        let BrokerState {
            queues,
            channels,
            unacked,
            next_delivery_tag,
            ..
        } = state;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };
        let now = Instant::now();

        loop {
            queue.drop_expired(now);
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                break;
            }

            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|index| {
                    channels
                        .get(&queue.consumers[*index].channel)
                        .is_some_and(|c| {
                            c.open && (c.prefetch == 0 || c.unacked < usize::from(c.prefetch))
                        })
                });
            let Some(index) = chosen else {
                break;
            };
            let Some(message) = queue.messages.pop_front() else {
                break;
            };

            *next_delivery_tag += 1;
            let delivery_tag = *next_delivery_tag;
            let consumer = &queue.consumers[index];
            let channel = consumer.channel;
            let consumer_tag = consumer.tag.clone();
            let delivery = Delivery {
                delivery_tag,
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                body: message.body.clone(),
                acker: Box::new(MemoryAcker {
                    broker: self.me.clone(),
                    channel,
                    delivery_tag,
                }),
            };

            if consumer.sender.send(delivery).is_err() {
                // The consumer's inbox is gone; treat it as cancelled.
                queue.messages.push_front(message);
                queue.consumers.remove(index);
                continue;
            }

            queue.next_consumer = (index + 1) % count;
            if let Some(entry) = channels.get_mut(&channel) {
                entry.unacked += 1;
            }
            unacked.insert(
                delivery_tag,
                Unacked {
                    channel,
                    consumer_tag,
                    queue: queue_name.to_string(),
                    message,
                },
            );
        }
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

struct MemoryAcker {
    broker: Weak<MemoryBroker>,
    channel: u64,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn broker(&self) -> BrokerResult<Arc<MemoryBroker>> {
        self.broker
            .upgrade()
            .ok_or_else(|| BrokerError::Other("broker is gone".into()))
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.broker()?.settle(self.channel, self.delivery_tag, None)
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.broker()?
            .settle(self.channel, self.delivery_tag, Some(requeue))
    }
}
