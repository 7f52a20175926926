//! Live broadcast listener.
//!
//! Each subscription binds a private, server-named queue to the fanout
//! exchange and runs a supervised task that hands every message to a
//! [`BroadcastConsumer`]. Consumer failures are logged and skipped; the loop
//! only ends on cancellation or when the delivery stream itself goes away.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ganglion_common::{GanglionError, Result, TaskRegistry};

use crate::broker::{BrokerChannel, BrokerConnection, DeliveryStream};
use crate::model::QueueDeclareOptions;

#[async_trait]
pub trait BroadcastConsumer: Send + Sync {
    async fn broadcast_received(&self, message: Value) -> anyhow::Result<()>;
}

/// Adapts a plain closure into a [`BroadcastConsumer`].
pub struct FnBroadcastConsumer<F> {
    f: F,
}

impl<F> FnBroadcastConsumer<F>
where
    F: Fn(Value) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> BroadcastConsumer for FnBroadcastConsumer<F>
where
    F: Fn(Value) -> anyhow::Result<()> + Send + Sync,
{
    async fn broadcast_received(&self, message: Value) -> anyhow::Result<()> {
        (self.f)(message)
    }
}

/// Handle to one running subscription.
pub struct BroadcastSubscription {
    queue: String,
    stop: CancellationToken,
    ended: CancellationToken,
}

impl BroadcastSubscription {
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn is_active(&self) -> bool {
        !self.ended.is_cancelled()
    }

    /// Stop listening and wait for the loop to exit. The subscription queue
    /// is removed by the broker with its consumer.
    pub async fn close(&self) {
        self.stop.cancel();
        self.ended.cancelled().await;
    }

    /// Wait until the loop exits on its own.
    pub async fn closed(&self) {
        self.ended.cancelled().await;
    }
}

/// Declare and bind a subscription queue on a fresh channel of `connection`
/// and start listening on it.
pub(crate) async fn subscribe(
    connection: &Arc<dyn BrokerConnection>,
    exchange: &str,
    consumer: Arc<dyn BroadcastConsumer>,
    tasks: &TaskRegistry,
) -> Result<BroadcastSubscription> {
    let channel = connection
        .open_channel()
        .await
        .map_err(|e| GanglionError::BrokerConnection(e.to_string()))?;

    let queue = channel
        .queue_declare("", QueueDeclareOptions::broadcast_subscription())
        .await
        .map_err(|e| GanglionError::broker("declare broadcast subscription", e))?;
    channel
        .queue_bind(&queue, exchange, "")
        .await
        .map_err(|e| GanglionError::broker(format!("bind '{}' to '{}'", queue, exchange), e))?;
    let deliveries = channel
        .basic_consume(&queue, true)
        .await
        .map_err(|e| GanglionError::broker(format!("consume '{}'", queue), e))?;

    let stop = CancellationToken::new();
    let ended = CancellationToken::new();
    let task_stop = stop.clone();
    let task_ended = ended.clone();
    let task_queue = queue.clone();
    tasks.spawn(format!("broadcast-subscription-{}", queue), move |token| {
        listen(
            task_queue, channel, deliveries, consumer, token, task_stop, task_ended,
        )
    });

    info!(queue = %queue, exchange = %exchange, "Subscribed to broadcasts");
    Ok(BroadcastSubscription { queue, stop, ended })
}

async fn listen(
    queue: String,
    channel: Arc<dyn BrokerChannel>,
    mut deliveries: DeliveryStream,
    consumer: Arc<dyn BroadcastConsumer>,
    shutdown: CancellationToken,
    stop: CancellationToken,
    ended: CancellationToken,
) {
    let _ended = ended.drop_guard();

    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = stop.cancelled() => break,
            delivery = deliveries.recv() => delivery,
        };
        let Some(delivery) = delivery else {
            error!(queue = %queue, "Broadcast delivery stream ended");
            break;
        };

        let message: Value = match serde_json::from_slice(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(queue = %queue, error = %e, "Dropping broadcast that is not JSON");
                continue;
            }
        };

        match AssertUnwindSafe(consumer.broadcast_received(message))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(queue = %queue, error = %e, "Broadcast consumer failed"),
            Err(_) => error!(queue = %queue, "Broadcast consumer panicked"),
        }
    }

    if channel.is_open()
        && let Err(e) = channel.close().await
    {
        debug!(queue = %queue, error = %e, "Failed to close subscription channel");
    }
    debug!(queue = %queue, "Broadcast subscription stopped");
}
