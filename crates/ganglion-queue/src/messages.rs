//! JSON message shapes carried by the work queues and the broadcast exchange.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use ganglion_common::{GanglionError, Result};

use crate::model::{PRIORITY_FIELD, Priority};

pub const BROADCAST_PROPERTY_CHANGE: &str = "propertyChange";
pub const BROADCAST_TEXT_UPDATED: &str = "textUpdated";
pub const BROADCAST_VERTICES_DELETED: &str = "verticesDeleted";
pub const BROADCAST_EDGE_DELETION: &str = "edgeDeletion";
pub const BROADCAST_LONG_RUNNING_PROCESS_CHANGE: &str = "longRunningProcessChange";
pub const BROADCAST_ENTITY_IMAGE_UPDATED: &str = "entityImageUpdated";
pub const BROADCAST_SYSTEM_NOTIFICATION_ENDED: &str = "systemNotificationEnded";

/// Graph element a property message refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementRef {
    Vertex(String),
    Edge(String),
}

impl ElementRef {
    pub fn id(&self) -> &str {
        match self {
            ElementRef::Vertex(id) | ElementRef::Edge(id) => id,
        }
    }

    fn id_field(&self) -> &'static str {
        match self {
            ElementRef::Vertex(_) => "graphVertexId",
            ElementRef::Edge(_) => "graphEdgeId",
        }
    }
}

/// Work item asking the graph-property workers to process one property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphPropertyMessage {
    pub element: ElementRef,
    pub property_key: String,
    pub property_name: String,
    pub workspace_id: Option<String>,
    pub visibility_source: Option<String>,
}

impl GraphPropertyMessage {
    pub fn new(
        element: ElementRef,
        property_key: impl Into<String>,
        property_name: impl Into<String>,
    ) -> Self {
        Self {
            element,
            property_key: property_key.into(),
            property_name: property_name.into(),
            workspace_id: None,
            visibility_source: None,
        }
    }

    /// Workspace and visibility are only sent for a non-empty workspace.
    pub fn in_workspace(
        mut self,
        workspace_id: impl Into<String>,
        visibility_source: impl Into<String>,
    ) -> Self {
        let workspace_id = workspace_id.into();
        if !workspace_id.is_empty() {
            self.workspace_id = Some(workspace_id);
            self.visibility_source = Some(visibility_source.into());
        }
        self
    }

    pub fn to_json(&self) -> Value {
        let mut data = Map::new();
        data.insert(self.element.id_field().to_string(), json!(self.element.id()));
        data.insert("propertyKey".to_string(), json!(self.property_key));
        data.insert("propertyName".to_string(), json!(self.property_name));
        if let Some(workspace_id) = &self.workspace_id {
            data.insert("workspaceId".to_string(), json!(workspace_id));
            data.insert(
                "visibilitySource".to_string(),
                json!(self.visibility_source.clone().unwrap_or_default()),
            );
        }
        Value::Object(data)
    }

    /// Data part of the matching `propertyChange` broadcast.
    pub fn property_change_data(&self) -> Value {
        let mut data = Map::new();
        data.insert(self.element.id_field().to_string(), json!(self.element.id()));
        if let Some(workspace_id) = &self.workspace_id {
            data.insert("workspaceId".to_string(), json!(workspace_id));
        }
        Value::Object(data)
    }
}

pub fn vertex_ids_message(vertex_ids: &[String]) -> Value {
    json!({ "graphVertexId": vertex_ids })
}

/// Users allowed to see a broadcast. Without one, every subscriber may.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
}

impl Permissions {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            users: vec![user_id.into()],
        }
    }
}

/// `{ "type": ..., "data": ..., "permissions": ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permissions>,
}

impl BroadcastEnvelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            permissions: None,
        }
    }

    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn vertices_deleted(vertex_ids: &[String]) -> Self {
        Self::new(BROADCAST_VERTICES_DELETED, json!({ "vertexIds": vertex_ids }))
    }

    pub fn edge_deletion(edge_id: &str, out_vertex_id: &str, in_vertex_id: &str) -> Self {
        Self::new(
            BROADCAST_EDGE_DELETION,
            json!({
                "edgeId": edge_id,
                "outVertexId": out_vertex_id,
                "inVertexId": in_vertex_id,
            }),
        )
    }

    pub fn text_updated(vertex_id: &str) -> Self {
        Self::new(BROADCAST_TEXT_UPDATED, json!({ "graphVertexId": vertex_id }))
    }

    pub fn entity_image_updated(vertex_id: &str, image_vertex_id: Option<&str>) -> Self {
        Self::new(
            BROADCAST_ENTITY_IMAGE_UPDATED,
            json!({ "graphVertexId": vertex_id, "graphImageVertexId": image_vertex_id }),
        )
    }

    pub fn system_notification_ended(notification_id: &str) -> Self {
        Self::new(
            BROADCAST_SYSTEM_NOTIFICATION_ENDED,
            json!({ "notificationId": notification_id }),
        )
    }

    /// Progress of a long running process, visible to its owner only. The
    /// process `results` are not broadcast.
    pub fn long_running_process_change(process: &Value) -> Result<Self> {
        let Some(item) = process.as_object() else {
            return Err(GanglionError::IllegalArgument(
                "long running process must be a JSON object".to_string(),
            ));
        };
        let user_id = item
            .get("userId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                GanglionError::IllegalArgument(
                    "long running process requires a userId".to_string(),
                )
            })?
            .to_string();

        let mut data = item.clone();
        data.remove("results");
        Ok(
            Self::new(BROADCAST_LONG_RUNNING_PROCESS_CHANGE, Value::Object(data))
                .with_permissions(Permissions::user(user_id)),
        )
    }
}

/// Copy `payload` with the priority name injected. Only JSON objects can
/// carry a priority.
pub fn with_priority(payload: &Value, priority: Priority) -> Result<Value> {
    let Some(object) = payload.as_object() else {
        return Err(GanglionError::IllegalArgument(format!(
            "work queue payload must be a JSON object, got {}",
            payload
        )));
    };
    let mut object = object.clone();
    object.insert(PRIORITY_FIELD.to_string(), json!(priority.as_str()));
    Ok(Value::Object(object))
}
