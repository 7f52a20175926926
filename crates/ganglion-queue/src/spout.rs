//! Pull-based work queue consumer used by worker processes.
//!
//! A consumer owns its own connection and channel. Deliveries are consumed
//! with manual acknowledgement and at most `prefetch_count` of them are
//! outstanding at once; a worker polls with `next_tuple`, processes the tuple
//! and then either acks it or fails it. Failed tuples are dropped by the
//! broker, never requeued.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ganglion_common::{BrokerAddress, GanglionError, Result};

use crate::broker::{BrokerChannel, BrokerConnection, BrokerConnector, DeliveryStream};
use crate::model::{DeliveryTag, QueueDeclareOptions};

/// One delivery handed to a worker.
#[derive(Debug, Clone)]
pub struct WorkerTuple {
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub priority: Option<u8>,
    pub body: Bytes,
}

impl WorkerTuple {
    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

struct OpenConsumer {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    deliveries: DeliveryStream,
}

pub struct WorkerConsumer {
    queue: String,
    connector: Arc<dyn BrokerConnector>,
    addresses: Vec<BrokerAddress>,
    prefetch_count: u16,
    open: Option<OpenConsumer>,
}

impl WorkerConsumer {
    pub fn new(
        queue: impl Into<String>,
        connector: Arc<dyn BrokerConnector>,
        addresses: Vec<BrokerAddress>,
        prefetch_count: u16,
    ) -> Self {
        Self {
            queue: queue.into(),
            connector,
            addresses,
            prefetch_count,
            open: None,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch_count
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Connect, declare the queue exactly as producers do, set the prefetch
    /// window and start consuming. Reopening an open consumer closes it first.
    pub async fn open(&mut self) -> Result<()> {
        if self.open.is_some() {
            self.close().await;
        }

        let connection = self
            .connector
            .connect(&self.addresses)
            .await
            .map_err(|e| GanglionError::BrokerConnection(e.to_string()))?;

        match Self::start(&self.queue, self.prefetch_count, &connection).await {
            Ok((channel, deliveries)) => {
                info!(queue = %self.queue, prefetch = self.prefetch_count, "Worker consumer opened");
                self.open = Some(OpenConsumer {
                    connection,
                    channel,
                    deliveries,
                });
                Ok(())
            }
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "Failed to close connection after open failure");
                }
                Err(e)
            }
        }
    }

    async fn start(
        queue: &str,
        prefetch_count: u16,
        connection: &Arc<dyn BrokerConnection>,
    ) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream)> {
        let channel = connection
            .open_channel()
            .await
            .map_err(|e| GanglionError::BrokerConnection(e.to_string()))?;
        channel
            .queue_declare(queue, QueueDeclareOptions::work_queue())
            .await
            .map_err(|e| GanglionError::broker(format!("declare queue '{}'", queue), e))?;
        channel
            .basic_qos(prefetch_count)
            .await
            .map_err(|e| GanglionError::broker("basic.qos", e))?;
        let deliveries = channel
            .basic_consume(queue, false)
            .await
            .map_err(|e| GanglionError::broker(format!("consume '{}'", queue), e))?;
        Ok((channel, deliveries))
    }

    /// Wait up to `timeout` for the next delivery. `Ok(None)` means nothing
    /// arrived in time.
    pub async fn next_tuple(&mut self, timeout: Duration) -> Result<Option<WorkerTuple>> {
        let Some(open) = self.open.as_mut() else {
            return Err(GanglionError::ConsumerTransport(format!(
                "consumer for '{}' is not open",
                self.queue
            )));
        };

        match tokio::time::timeout(timeout, open.deliveries.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(delivery)) => Ok(Some(WorkerTuple {
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                priority: delivery.properties.priority,
                body: delivery.body,
            })),
            Ok(None) => Err(GanglionError::ConsumerTransport(format!(
                "delivery stream for '{}' ended",
                self.queue
            ))),
        }
    }

    /// Confirm a delivery. Failures are logged; an unconfirmed delivery is
    /// redelivered once the channel goes away.
    pub async fn ack(&self, delivery_tag: DeliveryTag) {
        let Some(open) = self.open.as_ref() else {
            warn!(queue = %self.queue, delivery_tag, "Ack on a closed consumer");
            return;
        };
        if let Err(e) = open.channel.basic_ack(delivery_tag).await {
            let err = GanglionError::AckIo {
                tag: delivery_tag,
                reason: e.to_string(),
            };
            error!(queue = %self.queue, error = %err, "Ack failed");
        }
    }

    /// Reject a delivery without requeueing it.
    pub async fn fail(&self, delivery_tag: DeliveryTag) {
        let Some(open) = self.open.as_ref() else {
            warn!(queue = %self.queue, delivery_tag, "Fail on a closed consumer");
            return;
        };
        if let Err(e) = open.channel.basic_nack(delivery_tag, false).await {
            let err = GanglionError::FailIo {
                tag: delivery_tag,
                reason: e.to_string(),
            };
            error!(queue = %self.queue, error = %err, "Fail failed");
        }
    }

    /// Release the channel and connection. Safe to call more than once.
    pub async fn close(&mut self) {
        let Some(open) = self.open.take() else {
            return;
        };
        if let Err(e) = open.channel.close().await {
            warn!(queue = %self.queue, error = %e, "Failed to close consumer channel");
        }
        if let Err(e) = open.connection.close().await {
            warn!(queue = %self.queue, error = %e, "Failed to close consumer connection");
        }
        info!(queue = %self.queue, "Worker consumer closed");
    }

    /// Poll and process until `token` is cancelled. A tuple is acked when the
    /// handler succeeds and failed when it errors or panics. Transport errors
    /// end the loop and are returned; the consumer must be reopened.
    pub async fn run_until_cancelled<F, Fut>(
        &mut self,
        token: CancellationToken,
        poll_timeout: Duration,
        mut handler: F,
    ) -> Result<()>
    where
        F: FnMut(WorkerTuple) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if !self.is_open() {
            self.open().await?;
        }

        loop {
            let tuple = tokio::select! {
                _ = token.cancelled() => break,
                next = self.next_tuple(poll_timeout) => next?,
            };
            let Some(tuple) = tuple else {
                continue;
            };

            let tag = tuple.delivery_tag;
            // the call sits inside the guarded future so a panic before the
            // handler's first await is caught as well
            let processed = AssertUnwindSafe(async { handler(tuple).await }).catch_unwind();
            match processed.await {
                Ok(Ok(())) => self.ack(tag).await,
                Ok(Err(e)) => {
                    warn!(queue = %self.queue, delivery_tag = tag, error = %e, "Tuple processing failed");
                    self.fail(tag).await;
                }
                Err(_) => {
                    error!(queue = %self.queue, delivery_tag = tag, "Tuple handler panicked");
                    self.fail(tag).await;
                }
            }
        }

        debug!(queue = %self.queue, "Worker loop cancelled");
        Ok(())
    }
}
