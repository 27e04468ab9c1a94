//! Message shapes shared by every transport.
//!
//! Every message carries an id, an api name, a procedure/event name, a set
//! of keyword-style arguments, and a small metadata mapping. `EventMessage`
//! additionally carries a `native_id` once the stream has assigned one.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Keyword-style call/event arguments. The core never inspects the values;
/// it only requires they round-trip through `serde_json::Value`. Turning a
/// domain type into this shape is the job of the (out of scope) user-facing
/// serialization layer.
pub type Kwargs = HashMap<String, serde_json::Value>;

/// Small free-form metadata mapping carried alongside every message.
pub type Metadata = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    pub id: Uuid,
    pub api_name: String,
    pub procedure_name: String,
    #[serde(default)]
    pub kwargs: Kwargs,
    #[serde(default)]
    pub metadata: Metadata,
}

impl RpcMessage {
    pub fn new(api_name: impl Into<String>, procedure_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            api_name: api_name.into(),
            procedure_name: procedure_name.into(),
            kwargs: Kwargs::new(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub(crate) fn queue_key(&self) -> String {
        format!("{}:rpc_queue", self.api_name)
    }

    pub(crate) fn expiry_key(&self) -> String {
        rpc_expiry_key(&self.id)
    }
}

pub(crate) fn rpc_expiry_key(id: &Uuid) -> String {
    format!("rpc_expiry_key:{id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub id: Uuid,
    pub rpc_message_id: Uuid,
    pub result: serde_json::Value,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ResultMessage {
    pub fn ok(rpc_message_id: Uuid, result: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            rpc_message_id,
            result,
            error: false,
            metadata: Metadata::new(),
        }
    }

    pub fn err(rpc_message_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            rpc_message_id,
            result: serde_json::Value::String(message.into()),
            error: true,
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: Uuid,
    pub api_name: String,
    pub event_name: String,
    #[serde(default)]
    pub kwargs: Kwargs,
    #[serde(default)]
    pub metadata: Metadata,
    /// Assigned by the stream (Redis's `ms-seq` id) once read back; absent
    /// on a freshly constructed outbound message.
    #[serde(skip)]
    pub native_id: Option<String>,
}

impl EventMessage {
    pub fn new(api_name: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            api_name: api_name.into(),
            event_name: event_name.into(),
            kwargs: Kwargs::new(),
            metadata: Metadata::new(),
            native_id: None,
        }
    }

    pub fn with_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }
}
