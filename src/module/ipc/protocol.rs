//! Wire message protocol
//!
//! Newline-delimited JSON objects over a persistent connection. Clients send
//! either command messages (`{type, id, ...fields}`) or method calls
//! (`{method, args, id}`); the server answers both with `{id, error, result}`
//! and pushes unsolicited `{type, result}` notifications for hot reload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::module::traits::{ModuleError, ModuleKind};

/// Correlation id carried by a request and its response
pub type CorrelationId = String;

/// Longest accepted frame, in bytes
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Hot reload notification type for a module becoming available
pub const NOTIFY_ADD: &str = "add";
/// Hot reload notification type for a module going away
pub const NOTIFY_REMOVE: &str = "remove";

/// Method call from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub args: Value,
    pub id: CorrelationId,
}

/// Response from server to client; `error` and `result` are always present
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub id: CorrelationId,
    pub error: Option<String>,
    pub result: Option<Value>,
}

impl ResponseMessage {
    pub fn success(id: CorrelationId, result: Value) -> Self {
        Self {
            id,
            error: None,
            result: Some(result),
        }
    }

    pub fn error(id: CorrelationId, error: impl Into<String>) -> Self {
        Self {
            id,
            error: Some(error.into()),
            result: None,
        }
    }
}

/// Unsolicited server push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub message_type: String,
    pub result: Value,
}

impl Notification {
    /// `{type, result: {<kind>: key}}`
    pub fn module(message_type: &str, kind: ModuleKind, key: &str) -> Self {
        let mut result = Map::new();
        result.insert(kind.field().to_string(), Value::String(key.to_string()));
        Self {
            message_type: message_type.to_string(),
            result: Value::Object(result),
        }
    }
}

/// Any message as seen by the client; every field is optional
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub id: Option<CorrelationId>,
    #[serde(rename = "type", default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
}

impl InboundMessage {
    /// Response/notification outcome; a non-null `error` wins over `result`
    pub fn outcome(&self) -> Result<Option<Value>, ModuleError> {
        match self.error {
            None | Some(Value::Null) => Ok(self.result.clone()),
            Some(Value::String(ref message)) => Err(ModuleError::Remote(message.clone())),
            Some(ref other) => Err(ModuleError::Remote(other.to_string())),
        }
    }
}

/// Server-side operation named by a command type or method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add(ModuleKind),
    Remove(ModuleKind),
    Request(ModuleKind),
    List(ModuleKind),
}

impl Operation {
    pub fn parse(name: &str) -> Option<Self> {
        [ModuleKind::Engine, ModuleKind::Plugin]
            .into_iter()
            .find_map(|kind| {
                let operation = match name.strip_suffix(kind.command_suffix()) {
                    Some("add") => Operation::Add(kind),
                    Some("remove") => Operation::Remove(kind),
                    _ => match name.strip_suffix(kind.method_suffix()) {
                        Some("request") => Operation::Request(kind),
                        Some("list") => Operation::List(kind),
                        _ => return None,
                    },
                };
                Some(operation)
            })
    }

    pub fn name(self) -> String {
        match self {
            Operation::Add(kind) => format!("add{}", kind.command_suffix()),
            Operation::Remove(kind) => format!("remove{}", kind.command_suffix()),
            Operation::Request(kind) => format!("request{}", kind.method_suffix()),
            Operation::List(kind) => format!("list{}", kind.method_suffix()),
        }
    }

    pub fn kind(self) -> ModuleKind {
        match self {
            Operation::Add(kind)
            | Operation::Remove(kind)
            | Operation::Request(kind)
            | Operation::List(kind) => kind,
        }
    }
}

/// A parsed client → server message
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRequest {
    pub id: CorrelationId,
    /// Command type or method name, as sent
    pub name: String,
    /// Method `args`, or the remaining fields of a command message
    pub args: Value,
}

impl ServerRequest {
    /// Parse a frame. `Ok(None)` for frames that carry no id and so cannot
    /// be answered.
    pub fn parse(frame: &str) -> Result<Option<Self>, ModuleError> {
        let value: Value = serde_json::from_str(frame)?;
        let Value::Object(mut object) = value else {
            return Ok(None);
        };

        let id = match object.remove("id") {
            Some(Value::String(id)) => id,
            _ => return Ok(None),
        };

        if let Some(Value::String(name)) = object.remove("type") {
            return Ok(Some(Self {
                id,
                name,
                args: Value::Object(object),
            }));
        }

        if let Some(Value::String(name)) = object.remove("method") {
            let args = object.remove("args").unwrap_or(Value::Null);
            return Ok(Some(Self { id, name, args }));
        }

        Err(ModuleError::Validation(format!("invalid message {}", id)))
    }
}
