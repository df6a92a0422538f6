//! JSON-RPC 2.0 envelopes and the wire types shared by the agent's methods

use crate::capabilities::ClientCapabilities;
use crate::error::{AgentError, JsonRpcError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

pub const JSONRPC_VERSION: &str = "2.0";

/// Request identifier; the agent only ever allocates numbers but accepts both
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// Any message that can travel over the channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(RequestMessage),
    Notification(NotificationMessage),
    Response(ResponseMessage),
}

impl Message {
    pub fn request(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Message::Request(RequestMessage {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params: Some(params),
        })
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Message::Notification(NotificationMessage {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: Some(params),
        })
    }

    pub fn success(id: RequestId, result: Value) -> Self {
        Message::Response(ResponseMessage {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        })
    }

    pub fn failure(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Message::Response(ResponseMessage {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        })
    }

    /// Classify a decoded JSON document as request, notification or response
    pub fn from_value(value: Value) -> crate::Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| AgentError::Protocol("Message must be a JSON object".to_string()))?;
        let has_method = object.get("method").is_some_and(Value::is_string);
        let has_id = object.get("id").is_some_and(|id| !id.is_null());

        let message = match (has_method, has_id) {
            (true, true) => Message::Request(serde_json::from_value(value)?),
            (true, false) => Message::Notification(serde_json::from_value(value)?),
            (false, _) if object.contains_key("result") || object.contains_key("error") => {
                Message::Response(serde_json::from_value(value)?)
            }
            _ => {
                return Err(AgentError::Protocol(
                    "Message is neither a request, a notification nor a response".to_string(),
                ))
            }
        };
        Ok(message)
    }

    pub fn parse(text: &str) -> crate::Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| AgentError::Parse(e.to_string()))?;
        Self::from_value(value)
    }

    /// Method name for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(request) => Some(&request.method),
            Message::Notification(notification) => Some(&notification.method),
            Message::Response(_) => None,
        }
    }
}

/// Zero-based line/character position; `character` counts UTF-16 code units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, position: Position) -> bool {
        self.start <= position && position <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

/// A single incremental edit as sent by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentChange {
    pub range: Range,
    pub text: String,
}

/// Document snapshot sent with `textDocument/*` notifications
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolTextDocument {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Range>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible_range: Option<Range>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_changes: Option<Vec<ContentChange>>,
}

impl ProtocolTextDocument {
    pub fn new(uri: impl Into<String>, content: Option<String>) -> Self {
        Self {
            uri: uri.into(),
            content,
            ..Default::default()
        }
    }
}

/// Credentials and per-session extension settings supplied by the client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionConfiguration {
    #[serde(default)]
    pub server_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autocomplete_advanced_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autocomplete_advanced_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose_debug: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codebase: Option<String>,
    /// Flat map of dotted configuration keys to values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_configuration: Option<Map<String, Value>>,
}

impl ExtensionConfiguration {
    /// Whether `other` carries different credentials than `self`
    pub fn is_auth_change(&self, other: &ExtensionConfiguration) -> bool {
        self.access_token != other.access_token || self.server_endpoint != other.server_endpoint
    }
}

/// Identity and capabilities announced by the client in `initialize`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ide_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_configuration: Option<ExtensionConfiguration>,
    #[serde(default)]
    pub capabilities: ClientCapabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub authenticated: bool,
    pub auth_status: crate::auth::AuthStatus,
}

/// `{ id }` parameters used by many panel and edit-task methods
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdParams {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteCommandParams {
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceFolderChangeParams {
    #[serde(default)]
    pub uris: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceDocumentsParams {
    #[serde(default)]
    pub uris: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceDocumentsResult {
    pub documents: Vec<ProtocolTextDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugLevel {
    Info,
    Warning,
    Error,
}

/// Operator-facing log line relayed to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugMessage {
    pub channel: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<DebugLevel>,
}
