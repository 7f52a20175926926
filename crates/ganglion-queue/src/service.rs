//! Producer-side façade over the work queues and the broadcast exchange.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use ganglion_common::Result;

use crate::messages::{
    BROADCAST_PROPERTY_CHANGE, BroadcastEnvelope, GraphPropertyMessage, Permissions,
    vertex_ids_message,
};
use crate::model::{Priority, QueueStatus, WorkQueueNames};
use crate::spout::WorkerConsumer;
use crate::subscriber::{BroadcastConsumer, BroadcastSubscription};

#[async_trait]
pub trait WorkQueueService: Send + Sync {
    fn queue_names(&self) -> &WorkQueueNames;

    /// Publish `payload` (a JSON object) to `queue`, declaring the queue on
    /// first use.
    async fn push(&self, queue: &str, priority: Priority, payload: &Value) -> Result<()>;

    /// Publish to the fanout exchange. Lost when nothing is subscribed.
    async fn broadcast(&self, payload: &Value) -> Result<()>;

    /// Receive every broadcast published from now on until the returned
    /// subscription is closed or the service shuts down.
    async fn subscribe_to_broadcast(
        &self,
        consumer: Arc<dyn BroadcastConsumer>,
    ) -> Result<BroadcastSubscription>;

    /// Delete the pipeline queues and every external resource worker queue.
    async fn format(&self) -> Result<()>;

    async fn queues_status(&self) -> Result<BTreeMap<String, QueueStatus>>;

    /// An unopened consumer for `queue` configured like this service.
    fn create_worker_consumer(&self, queue: &str) -> WorkerConsumer;

    async fn shutdown(&self);

    async fn push_graph_property(
        &self,
        message: &GraphPropertyMessage,
        priority: Priority,
    ) -> Result<()> {
        let queue = self.queue_names().graph_property.clone();
        self.push(&queue, priority, &message.to_json()).await?;
        if priority != Priority::Low {
            let envelope =
                BroadcastEnvelope::new(BROADCAST_PROPERTY_CHANGE, message.property_change_data());
            self.broadcast(&envelope.to_json()?).await?;
        }
        Ok(())
    }

    async fn push_vertex_ids(&self, vertex_ids: &[String], priority: Priority) -> Result<()> {
        if vertex_ids.is_empty() {
            return Ok(());
        }
        let queue = self.queue_names().graph_property.clone();
        self.push(&queue, priority, &vertex_ids_message(vertex_ids))
            .await
    }

    /// Tell live sessions a vertex's text changed, unless the update is low
    /// priority.
    async fn push_text_updated(&self, vertex_id: &str, priority: Priority) -> Result<()> {
        if priority == Priority::Low {
            return Ok(());
        }
        self.broadcast(&BroadcastEnvelope::text_updated(vertex_id).to_json()?)
            .await
    }

    /// Announce the process to its owner, then queue it.
    async fn push_long_running_process(&self, process: &Value, priority: Priority) -> Result<()> {
        let envelope = BroadcastEnvelope::long_running_process_change(process)?;
        self.broadcast(&envelope.to_json()?).await?;
        let queue = self.queue_names().long_running_process.clone();
        self.push(&queue, priority, process).await
    }

    async fn broadcast_typed(
        &self,
        kind: &str,
        data: Value,
        permissions: Option<Permissions>,
    ) -> Result<()> {
        let mut envelope = BroadcastEnvelope::new(kind, data);
        envelope.permissions = permissions;
        self.broadcast(&envelope.to_json()?).await
    }

    async fn broadcast_vertices_deleted(&self, vertex_ids: &[String]) -> Result<()> {
        self.broadcast(&BroadcastEnvelope::vertices_deleted(vertex_ids).to_json()?)
            .await
    }

    async fn broadcast_edge_deletion(
        &self,
        edge_id: &str,
        out_vertex_id: &str,
        in_vertex_id: &str,
    ) -> Result<()> {
        let envelope = BroadcastEnvelope::edge_deletion(edge_id, out_vertex_id, in_vertex_id);
        self.broadcast(&envelope.to_json()?).await
    }

    /// `image_vertex_id` is `None` when the entity image was removed.
    async fn broadcast_entity_image_updated(
        &self,
        vertex_id: &str,
        image_vertex_id: Option<&str>,
    ) -> Result<()> {
        let envelope = BroadcastEnvelope::entity_image_updated(vertex_id, image_vertex_id);
        self.broadcast(&envelope.to_json()?).await
    }

    async fn broadcast_system_notification_ended(&self, notification_id: &str) -> Result<()> {
        self.broadcast(&BroadcastEnvelope::system_notification_ended(notification_id).to_json()?)
            .await
    }
}
