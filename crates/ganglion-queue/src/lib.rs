//! Ganglion Queue - work queues and broadcast notifications
//!
//! Producers push JSON work items onto durable priority queues and broadcast
//! best-effort notifications to live sessions through a fanout exchange.
//! Worker processes pull from the queues with a [`WorkerConsumer`], acking or
//! failing every delivery.

pub mod adapter;
pub mod broker;
pub mod external;
pub mod messages;
pub mod model;
pub mod service;
pub mod spout;
pub mod subscriber;

pub use adapter::{BrokerSettings, MessageBrokerAdapter};
pub use broker::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, BrokerOperation,
    InMemoryBroker,
};
pub use external::{ExternalResourceWorker, ExternalWorkerRegistry};
pub use messages::{BroadcastEnvelope, ElementRef, GraphPropertyMessage, Permissions};
pub use model::{Delivery, DeliveryMode, Priority, QueueDeclareOptions, QueueStatus, WorkQueueNames};
pub use service::WorkQueueService;
pub use spout::{WorkerConsumer, WorkerTuple};
pub use subscriber::{BroadcastConsumer, BroadcastSubscription, FnBroadcastConsumer};
