//! Message broker boundary.
//!
//! The work queue speaks AMQP 0-9-1 semantics through these traits: a
//! connection multiplexes channels, a channel declares queues and exchanges,
//! publishes, and consumes with either automatic or manual acknowledgement.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ganglion_common::BrokerAddress;
use tokio::sync::mpsc;

use crate::model::{
    BasicProperties, Delivery, DeliveryTag, ExchangeKind, QueueDeclareOptions, QueueStatus,
};

pub use memory::{BrokerOperation, InMemoryBroker};

/// Deliveries for one consumer. Ends when the consumer is cancelled or its
/// channel goes away.
pub type DeliveryStream = mpsc::UnboundedReceiver<Delivery>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("PRECONDITION_FAILED - {0}")]
    PreconditionFailed(String),

    #[error("NOT_FOUND - {0}")]
    NotFound(String),

    #[error("RESOURCE_LOCKED - {0}")]
    ResourceLocked(String),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("connection refused by {0}")]
    ConnectionRefused(String),
}

impl BrokerError {
    /// AMQP reply code for the failure.
    pub fn reply_code(&self) -> u16 {
        match self {
            BrokerError::PreconditionFailed(_) => 406,
            BrokerError::NotFound(_) => 404,
            BrokerError::ResourceLocked(_) => 405,
            BrokerError::ChannelClosed | BrokerError::ConnectionClosed => 320,
            BrokerError::ConnectionRefused(_) => 541,
        }
    }
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connect to the first reachable address.
    async fn connect(
        &self,
        addresses: &[BrokerAddress],
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    fn is_open(&self) -> bool;

    /// Close every channel, then the connection. Exclusive queues go with it.
    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError>;

    /// Declare `name`, or a server-named queue when `name` is empty. Returns
    /// the queue name.
    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
    ) -> Result<String, BrokerError>;

    /// Status of an existing queue; `NotFound` when it does not exist.
    async fn queue_declare_passive(&self, name: &str) -> Result<QueueStatus, BrokerError>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str)
    -> Result<(), BrokerError>;

    /// Delete a queue and return how many messages it held.
    async fn queue_delete(&self, name: &str) -> Result<u32, BrokerError>;

    /// Publish to `exchange` (the default exchange when empty).
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Bytes,
    ) -> Result<(), BrokerError>;

    /// Maximum unacknowledged deliveries on this channel; 0 is unlimited.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    async fn basic_consume(&self, queue: &str, auto_ack: bool)
    -> Result<DeliveryStream, BrokerError>;

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<(), BrokerError>;

    async fn basic_nack(&self, delivery_tag: DeliveryTag, requeue: bool)
    -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;

    /// Close the channel. Unacknowledged deliveries are requeued.
    async fn close(&self) -> Result<(), BrokerError>;
}
