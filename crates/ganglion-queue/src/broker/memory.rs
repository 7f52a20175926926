//! In-process AMQP-style broker.
//!
//! Queues keep one FIFO bucket per priority level and hand messages to
//! consumers round-robin, highest bucket first, within each channel's
//! prefetch window. Closing a channel requeues what it had not acknowledged,
//! closing a connection removes its exclusive queues, and `restart` keeps only
//! durable queues with their persistent messages.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use ganglion_common::BrokerAddress;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, DeliveryStream};
use crate::model::{
    BasicProperties, Delivery, DeliveryTag, ExchangeKind, QueueDeclareOptions, QueueStatus,
};

/// Topology calls recorded by the broker, in order. Publishes and
/// acknowledgements are not recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOperation {
    ExchangeDeclare(String),
    QueueDeclare(String),
    QueueDelete(String),
    QueueBind { queue: String, exchange: String },
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    body: Bytes,
    redelivered: bool,
}

struct Consumer {
    channel: u64,
    auto_ack: bool,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    options: QueueDeclareOptions,
    owner: Option<u64>,
    buckets: Vec<VecDeque<StoredMessage>>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
    had_consumer: bool,
}

impl QueueState {
    fn new(options: QueueDeclareOptions, owner: Option<u64>) -> Self {
        let levels = options.max_priority.map(|p| p as usize + 1).unwrap_or(1);
        Self {
            options,
            owner,
            buckets: (0..levels).map(|_| VecDeque::new()).collect(),
            consumers: Vec::new(),
            next_consumer: 0,
            had_consumer: false,
        }
    }

    fn bucket(&self, properties: &BasicProperties) -> usize {
        let requested = properties.priority.unwrap_or(0) as usize;
        requested.min(self.buckets.len() - 1)
    }

    fn push_back(&mut self, message: StoredMessage) {
        let bucket = self.bucket(&message.properties);
        self.buckets[bucket].push_back(message);
    }

    fn push_front(&mut self, message: StoredMessage) {
        let bucket = self.bucket(&message.properties);
        self.buckets[bucket].push_front(message);
    }

    fn pop(&mut self) -> Option<StoredMessage> {
        self.buckets.iter_mut().rev().find_map(|b| b.pop_front())
    }

    fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    fn status(&self) -> QueueStatus {
        QueueStatus {
            message_count: self.len() as u32,
            consumer_count: self.consumers.len() as u32,
        }
    }

    fn is_locked_for(&self, connection: u64) -> bool {
        self.options.exclusive && self.owner.is_some_and(|owner| owner != connection)
    }
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct ChannelState {
    connection: u64,
    prefetch: u16,
    next_tag: DeliveryTag,
    unacked: BTreeMap<DeliveryTag, Unacked>,
}

struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, ChannelState>,
    connections: HashSet<u64>,
    journal: Vec<BrokerOperation>,
}

impl BrokerState {
    fn check_channel(&self, channel: u64) -> Result<u64, BrokerError> {
        self.channels
            .get(&channel)
            .map(|c| c.connection)
            .ok_or(BrokerError::ChannelClosed)
    }

    fn queue_for(&mut self, name: &str, connection: u64) -> Result<&mut QueueState, BrokerError> {
        let queue = self
            .queues
            .get_mut(name)
            .ok_or_else(|| BrokerError::NotFound(format!("no queue '{}'", name)))?;
        if queue.is_locked_for(connection) {
            return Err(BrokerError::ResourceLocked(format!(
                "cannot obtain exclusive access to locked queue '{}'",
                name
            )));
        }
        Ok(queue)
    }

    fn delete_queue(&mut self, name: &str) -> Option<u32> {
        let queue = self.queues.remove(name)?;
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(q, _)| q != name);
        }
        // dropping the queue drops its consumers' senders, ending their streams
        Some(queue.len() as u32)
    }

    fn remove_auto_deleted(&mut self) {
        let doomed: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.options.auto_delete && q.had_consumer && q.consumers.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        for name in doomed {
            debug!(queue = %name, "Auto-delete queue removed");
            self.delete_queue(&name);
        }
    }

    fn dispatch(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch_queue(&name);
        }
        self.remove_auto_deleted();
    }

    fn dispatch_queue(&mut self, name: &str) {
        let BrokerState {
            queues, channels, ..
        } = self;
        let Some(queue) = queues.get_mut(name) else {
            return;
        };

        loop {
            if queue.len() == 0 || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|i| (queue.next_consumer + i) % count)
                .find(|&idx| {
                    let consumer = &queue.consumers[idx];
                    consumer.auto_ack
                        || channels.get(&consumer.channel).is_some_and(|c| {
                            c.prefetch == 0 || c.unacked.len() < c.prefetch as usize
                        })
                });
            let Some(idx) = chosen else {
                return;
            };
            queue.next_consumer = idx + 1;

            let Some(message) = queue.pop() else {
                return;
            };
            let consumer = &queue.consumers[idx];
            let Some(channel) = channels.get_mut(&consumer.channel) else {
                queue.push_front(message);
                queue.consumers.remove(idx);
                continue;
            };

            let tag = channel.next_tag;
            channel.next_tag += 1;
            let delivery = Delivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            if consumer.tx.send(delivery).is_err() {
                // consumer went away without cancelling
                queue.push_front(message);
                queue.consumers.remove(idx);
                continue;
            }

            if !consumer.auto_ack {
                channel.unacked.insert(
                    tag,
                    Unacked {
                        queue: name.to_string(),
                        message,
                    },
                );
            }
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.push_front(message);
        }
    }

    fn close_channel(&mut self, channel: u64) {
        let Some(state) = self.channels.remove(&channel) else {
            return;
        };

        for (_, unacked) in state.unacked.into_iter().rev() {
            self.requeue(unacked);
        }
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != channel);
        }
        self.dispatch();
    }

    fn close_connection(&mut self, connection: u64) {
        if !self.connections.remove(&connection) {
            return;
        }

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.options.exclusive && q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.delete_queue(&name);
        }
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    next_id: AtomicU64,
    available: AtomicBool,
}

impl BrokerInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                next_id: AtomicU64::new(1),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Refuse (or accept again) new connections.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Drop every connection, then keep only durable queues and exchanges and
    /// the persistent messages in them.
    pub fn restart(&self) {
        let mut state = self.inner.state.lock();
        let connections: Vec<u64> = state.connections.iter().copied().collect();
        for connection in connections {
            state.close_connection(connection);
        }

        state.queues.retain(|_, q| q.options.durable);
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
            for bucket in queue.buckets.iter_mut() {
                bucket.retain(|m| m.properties.is_persistent());
            }
        }
        state.exchanges.retain(|_, e| e.durable);
        let BrokerState {
            exchanges, queues, ..
        } = &mut *state;
        for exchange in exchanges.values_mut() {
            exchange.bindings.retain(|(q, _)| queues.contains_key(q));
        }
        info!("In-memory broker restarted");
    }

    /// Drop every open connection as a network failure would.
    pub fn disconnect_all(&self) {
        let mut state = self.inner.state.lock();
        let connections: Vec<u64> = state.connections.iter().copied().collect();
        for connection in connections {
            state.close_connection(connection);
        }
    }

    pub fn journal(&self) -> Vec<BrokerOperation> {
        self.inner.state.lock().journal.clone()
    }

    pub fn declare_count(&self, queue: &str) -> usize {
        self.count(|op| matches!(op, BrokerOperation::QueueDeclare(q) if q == queue))
    }

    pub fn delete_count(&self, queue: &str) -> usize {
        self.count(|op| matches!(op, BrokerOperation::QueueDelete(q) if q == queue))
    }

    fn count<P: Fn(&BrokerOperation) -> bool>(&self, predicate: P) -> usize {
        self.inner
            .state
            .lock()
            .journal
            .iter()
            .filter(|op| predicate(op))
            .count()
    }

    pub fn queue_status(&self, queue: &str) -> Option<QueueStatus> {
        self.inner.state.lock().queues.get(queue).map(|q| q.status())
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.state.lock().queues.contains_key(queue)
    }

    /// Names of queues bound to `exchange`.
    pub fn bindings(&self, exchange: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.iter().map(|(q, _)| q.clone()).collect())
            .unwrap_or_default()
    }

    pub fn open_connections(&self) -> usize {
        self.inner.state.lock().connections.len()
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(
        &self,
        addresses: &[BrokerAddress],
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let Some(address) = addresses.first() else {
            return Err(BrokerError::ConnectionRefused("no broker address".to_string()));
        };
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionRefused(address.to_string()));
        }

        let id = self.inner.next_id();
        self.inner.state.lock().connections.insert(id);
        debug!(connection = id, address = %address, "Broker connection opened");

        Ok(Arc::new(InMemoryConnection {
            id,
            broker: self.inner.clone(),
        }))
    }
}

pub struct InMemoryConnection {
    id: u64,
    broker: Arc<BrokerInner>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.broker.state.lock();
        if !state.connections.contains(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }

        let id = self.broker.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                prefetch: 0,
                next_tag: 1,
                unacked: BTreeMap::new(),
            },
        );

        Ok(Arc::new(InMemoryChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    fn is_open(&self) -> bool {
        self.broker.state.lock().connections.contains(&self.id)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        if !state.connections.contains(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }
        state.close_connection(self.id);
        debug!(connection = self.id, "Broker connection closed");
        Ok(())
    }
}

pub struct InMemoryChannel {
    id: u64,
    broker: Arc<BrokerInner>,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.check_channel(self.id)?;
        state
            .journal
            .push(BrokerOperation::ExchangeDeclare(name.to_string()));

        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.durable != durable => {
                Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent arg for exchange '{}'",
                    name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
    ) -> Result<String, BrokerError> {
        let mut state = self.broker.state.lock();
        let connection = state.check_channel(self.id)?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            name.to_string()
        };
        state.journal.push(BrokerOperation::QueueDeclare(name.clone()));

        match state.queues.get(&name) {
            Some(existing) if existing.is_locked_for(connection) => {
                Err(BrokerError::ResourceLocked(format!(
                    "cannot obtain exclusive access to locked queue '{}'",
                    name
                )))
            }
            Some(existing) if existing.options != options => {
                Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent arg for queue '{}': declared {:?}, requested {:?}",
                    name, existing.options, options
                )))
            }
            Some(_) => Ok(name),
            None => {
                let owner = options.exclusive.then_some(connection);
                state
                    .queues
                    .insert(name.clone(), QueueState::new(options, owner));
                debug!(queue = %name, ?options, "Queue declared");
                Ok(name)
            }
        }
    }

    async fn queue_declare_passive(&self, name: &str) -> Result<QueueStatus, BrokerError> {
        let mut state = self.broker.state.lock();
        let connection = state.check_channel(self.id)?;
        Ok(state.queue_for(name, connection)?.status())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        let connection = state.check_channel(self.id)?;
        state.queue_for(queue, connection)?;

        let exchange_state = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::NotFound(format!("no exchange '{}'", exchange)))?;
        let binding = (queue.to_string(), routing_key.to_string());
        if !exchange_state.bindings.contains(&binding) {
            exchange_state.bindings.push(binding);
        }

        state.journal.push(BrokerOperation::QueueBind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
        });
        Ok(())
    }

    async fn queue_delete(&self, name: &str) -> Result<u32, BrokerError> {
        let mut state = self.broker.state.lock();
        let connection = state.check_channel(self.id)?;
        state.journal.push(BrokerOperation::QueueDelete(name.to_string()));

        if state
            .queues
            .get(name)
            .is_some_and(|q| q.is_locked_for(connection))
        {
            return Err(BrokerError::ResourceLocked(format!(
                "cannot obtain exclusive access to locked queue '{}'",
                name
            )));
        }
        // deleting a queue that does not exist succeeds
        Ok(state.delete_queue(name).unwrap_or(0))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Bytes,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.check_channel(self.id)?;

        let targets: Vec<String> = if exchange.is_empty() {
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let exchange_state = state
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::NotFound(format!("no exchange '{}'", exchange)))?;
            exchange_state
                .bindings
                .iter()
                .filter(|(_, key)| exchange_state.kind == ExchangeKind::Fanout || key == routing_key)
                .map(|(queue, _)| queue.clone())
                .collect()
        };

        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Unroutable message dropped");
            return Ok(());
        }

        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            body,
            redelivered: false,
        };
        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.push_back(message.clone());
            }
        }
        state.dispatch();
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.check_channel(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }
        state.dispatch();
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.broker.state.lock();
        let connection = state.check_channel(self.id)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let queue_state = state.queue_for(queue, connection)?;
        queue_state.consumers.push(Consumer {
            channel: self.id,
            auto_ack,
            tx,
        });
        queue_state.had_consumer = true;

        state.dispatch();
        Ok(rx)
    }

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.check_channel(self.id)?;
        let removed = state
            .channels
            .get_mut(&self.id)
            .and_then(|c| c.unacked.remove(&delivery_tag));
        if removed.is_none() {
            return Err(BrokerError::PreconditionFailed(format!(
                "unknown delivery tag {}",
                delivery_tag
            )));
        }
        state.dispatch();
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.check_channel(self.id)?;
        let removed = state
            .channels
            .get_mut(&self.id)
            .and_then(|c| c.unacked.remove(&delivery_tag));
        let Some(unacked) = removed else {
            return Err(BrokerError::PreconditionFailed(format!(
                "unknown delivery tag {}",
                delivery_tag
            )));
        };
        if requeue {
            state.requeue(unacked);
        }
        state.dispatch();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.state.lock().channels.contains_key(&self.id)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.check_channel(self.id)?;
        state.close_channel(self.id);
        Ok(())
    }
}
