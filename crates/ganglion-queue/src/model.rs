//! Queue, message and delivery types shared by producers, consumers and the
//! broker boundary.

use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use bytes::Bytes;
use ganglion_common::Configuration;
use serde::{Deserialize, Serialize};

/// Highest broker priority a work queue accepts (`x-max-priority`).
pub const MAX_PRIORITY: u8 = 3;

/// Field injected into every work queue message.
pub const PRIORITY_FIELD: &str = "priority";

/// Work item priority. Delivered strictly in bucket order, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
        }
    }

    /// Broker-level priority for this level.
    pub fn broker_priority(&self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }

    /// Unknown names fall back to `Low`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "HIGH" => Priority::High,
            "NORMAL" => Priority::Normal,
            _ => Priority::Low,
        }
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Priority::parse(s))
    }
}

/// Persistent messages survive a broker restart on durable queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    Transient,
    #[default]
    Persistent,
}

impl DeliveryMode {
    pub fn code(&self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    pub fn from_code(code: u8) -> Self {
        if code == 1 {
            DeliveryMode::Transient
        } else {
            DeliveryMode::Persistent
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
}

/// Arguments of a queue declaration. Redeclaring a queue with different
/// arguments is refused by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueDeclareOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// `x-max-priority`
    pub max_priority: Option<u8>,
}

impl QueueDeclareOptions {
    /// Durable, shared, kept without consumers, three priority levels.
    pub fn work_queue() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            max_priority: Some(MAX_PRIORITY),
        }
    }

    /// Server-named queue private to one connection, gone with its consumer.
    pub fn broadcast_subscription() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
            max_priority: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BasicProperties {
    pub priority: Option<u8>,
    pub delivery_mode: Option<u8>,
    pub content_type: Option<String>,
}

impl BasicProperties {
    pub fn json() -> Self {
        Self {
            content_type: Some("application/json".to_string()),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = Some(mode.code());
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(DeliveryMode::Persistent.code())
    }
}

/// Per-channel identifier of one in-flight delivery.
pub type DeliveryTag = u64;

#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Names of the queues the pipeline itself owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkQueueNames {
    pub graph_property: String,
    pub long_running_process: String,
}

impl Default for WorkQueueNames {
    fn default() -> Self {
        Self {
            graph_property: ganglion_common::config::DEFAULT_GRAPH_PROPERTY_QUEUE.to_string(),
            long_running_process: ganglion_common::config::DEFAULT_LONG_RUNNING_PROCESS_QUEUE
                .to_string(),
        }
    }
}

impl WorkQueueNames {
    pub fn from_configuration(configuration: &Configuration) -> Self {
        Self {
            graph_property: configuration.graph_property_queue(),
            long_running_process: configuration.long_running_process_queue(),
        }
    }
}
