//! [`WorkQueueService`] over an AMQP-style broker.
//!
//! One adapter owns one connection. Producer calls (`push`, `broadcast`,
//! `format`) share a single publishing channel behind an async mutex, which
//! also guards the set of queues this adapter has already declared. Broadcast
//! subscriptions open their own channel on the same connection, and worker
//! consumers open their own connection.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use ganglion_common::config::{DEFAULT_BROADCAST_EXCHANGE_NAME, DEFAULT_PREFETCH_COUNT};
use ganglion_common::{BrokerAddress, Configuration, GanglionError, Result, TaskRegistry};

use crate::broker::{BrokerChannel, BrokerConnection, BrokerConnector, BrokerError};
use crate::external::ExternalWorkerRegistry;
use crate::messages::with_priority;
use crate::model::{
    BasicProperties, DeliveryMode, ExchangeKind, Priority, QueueDeclareOptions, QueueStatus,
    WorkQueueNames,
};
use crate::service::WorkQueueService;
use crate::spout::WorkerConsumer;
use crate::subscriber::{self, BroadcastConsumer, BroadcastSubscription};

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub addresses: Vec<BrokerAddress>,
    pub broadcast_exchange: String,
    pub prefetch_count: u16,
    pub delivery_mode: DeliveryMode,
    pub queue_names: WorkQueueNames,
    pub shutdown_grace: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            addresses: vec![BrokerAddress::default()],
            broadcast_exchange: DEFAULT_BROADCAST_EXCHANGE_NAME.to_string(),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            delivery_mode: DeliveryMode::Persistent,
            queue_names: WorkQueueNames::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl BrokerSettings {
    pub fn from_configuration(configuration: &Configuration) -> Result<Self> {
        Ok(Self {
            addresses: configuration.broker_addresses()?,
            broadcast_exchange: configuration.broadcast_exchange_name(),
            prefetch_count: configuration.prefetch_count(),
            delivery_mode: DeliveryMode::from_code(configuration.delivery_mode()),
            queue_names: WorkQueueNames::from_configuration(configuration),
            shutdown_grace: configuration.shutdown_grace(),
        })
    }
}

struct Publisher {
    channel: Arc<dyn BrokerChannel>,
    declared: HashSet<String>,
}

pub struct MessageBrokerAdapter {
    connector: Arc<dyn BrokerConnector>,
    settings: BrokerSettings,
    connection: Arc<dyn BrokerConnection>,
    publisher: Mutex<Publisher>,
    external_workers: ExternalWorkerRegistry,
    tasks: TaskRegistry,
}

impl MessageBrokerAdapter {
    /// Connect and declare the broadcast exchange. Fails when the broker is
    /// unreachable; nothing should start without one.
    pub async fn connect(
        connector: Arc<dyn BrokerConnector>,
        settings: BrokerSettings,
        external_workers: ExternalWorkerRegistry,
    ) -> Result<Self> {
        let connection = connector
            .connect(&settings.addresses)
            .await
            .map_err(|e| GanglionError::BrokerConnection(e.to_string()))?;
        let channel = connection
            .open_channel()
            .await
            .map_err(|e| GanglionError::BrokerConnection(e.to_string()))?;
        channel
            .exchange_declare(&settings.broadcast_exchange, ExchangeKind::Fanout, false)
            .await
            .map_err(|e| {
                GanglionError::broker(
                    format!("declare exchange '{}'", settings.broadcast_exchange),
                    e,
                )
            })?;

        info!(
            addresses = ?settings.addresses.iter().map(ToString::to_string).collect::<Vec<_>>(),
            exchange = %settings.broadcast_exchange,
            "Message broker adapter connected"
        );

        Ok(Self {
            connector,
            settings,
            connection,
            publisher: Mutex::new(Publisher {
                channel,
                declared: HashSet::new(),
            }),
            external_workers,
            tasks: TaskRegistry::new(),
        })
    }

    pub async fn from_configuration(
        configuration: &Configuration,
        connector: Arc<dyn BrokerConnector>,
        external_workers: ExternalWorkerRegistry,
    ) -> Result<Self> {
        let settings = BrokerSettings::from_configuration(configuration)?;
        Self::connect(connector, settings, external_workers).await
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn external_workers(&self) -> &ExternalWorkerRegistry {
        &self.external_workers
    }

    /// Pipeline queues followed by external resource worker queues.
    fn managed_queues(&self) -> Vec<String> {
        let mut queues = vec![
            self.settings.queue_names.graph_property.clone(),
            self.settings.queue_names.long_running_process.clone(),
        ];
        for queue in self.external_workers.queue_names() {
            if !queues.contains(&queue) {
                queues.push(queue);
            }
        }
        queues
    }
}

#[async_trait]
impl WorkQueueService for MessageBrokerAdapter {
    fn queue_names(&self) -> &WorkQueueNames {
        &self.settings.queue_names
    }

    async fn push(&self, queue: &str, priority: Priority, payload: &Value) -> Result<()> {
        let message = with_priority(payload, priority)?;
        let body = serde_json::to_vec(&message)?;
        let properties = BasicProperties::json()
            .with_priority(priority.broker_priority())
            .with_delivery_mode(self.settings.delivery_mode);

        let mut publisher = self.publisher.lock().await;
        if !publisher.declared.contains(queue) {
            publisher
                .channel
                .queue_declare(queue, QueueDeclareOptions::work_queue())
                .await
                .map_err(|e| GanglionError::broker(format!("declare queue '{}'", queue), e))?;
            publisher.declared.insert(queue.to_string());
        }

        publisher
            .channel
            .basic_publish("", queue, properties, body.into())
            .await
            .map_err(|e| GanglionError::publish(queue, e))?;
        debug!(queue = %queue, priority = %priority, "Pushed work item");
        Ok(())
    }

    async fn broadcast(&self, payload: &Value) -> Result<()> {
        let body = serde_json::to_vec(payload)?;
        let exchange = &self.settings.broadcast_exchange;

        let publisher = self.publisher.lock().await;
        publisher
            .channel
            .basic_publish(exchange, "", BasicProperties::json(), body.into())
            .await
            .map_err(|e| GanglionError::publish(exchange.as_str(), e))?;
        debug!(exchange = %exchange, "Broadcast sent");
        Ok(())
    }

    async fn subscribe_to_broadcast(
        &self,
        consumer: Arc<dyn BroadcastConsumer>,
    ) -> Result<BroadcastSubscription> {
        subscriber::subscribe(
            &self.connection,
            &self.settings.broadcast_exchange,
            consumer,
            &self.tasks,
        )
        .await
    }

    async fn format(&self) -> Result<()> {
        let publisher = self.publisher.lock().await;
        for queue in self.managed_queues() {
            let purged = publisher
                .channel
                .queue_delete(&queue)
                .await
                .map_err(|e| GanglionError::broker(format!("delete queue '{}'", queue), e))?;
            info!(queue = %queue, messages = purged, "Queue deleted");
        }
        Ok(())
    }

    async fn queues_status(&self) -> Result<BTreeMap<String, QueueStatus>> {
        // passive declares of missing queues may close the channel, so use a
        // throwaway one
        let channel = self
            .connection
            .open_channel()
            .await
            .map_err(|e| GanglionError::BrokerConnection(e.to_string()))?;

        let mut statuses = BTreeMap::new();
        let mut failure = None;
        for queue in self.managed_queues() {
            match channel.queue_declare_passive(&queue).await {
                Ok(status) => {
                    statuses.insert(queue, status);
                }
                Err(BrokerError::NotFound(_)) => {}
                Err(e) => {
                    failure = Some(GanglionError::broker(format!("status of '{}'", queue), e));
                    break;
                }
            }
        }

        if channel.is_open()
            && let Err(e) = channel.close().await
        {
            debug!(error = %e, "Failed to close status channel");
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(statuses),
        }
    }

    fn create_worker_consumer(&self, queue: &str) -> WorkerConsumer {
        WorkerConsumer::new(
            queue,
            self.connector.clone(),
            self.settings.addresses.clone(),
            self.settings.prefetch_count,
        )
    }

    async fn shutdown(&self) {
        self.tasks.shutdown(self.settings.shutdown_grace).await;

        let publisher = self.publisher.lock().await;
        if publisher.channel.is_open()
            && let Err(e) = publisher.channel.close().await
        {
            warn!(error = %e, "Failed to close publishing channel");
        }
        if self.connection.is_open()
            && let Err(e) = self.connection.close().await
        {
            warn!(error = %e, "Failed to close broker connection");
        }
        info!("Message broker adapter shut down");
    }
}
