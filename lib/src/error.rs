//! Error types for the IDE agent

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// JSON-RPC 2.0 error object as it appears on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Structured error shape with a recursive cause chain
///
/// Product logic reports failures in this shape; the agent forwards it in the
/// `data` field of the JSON-RPC error without flattening the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorData>>,
}

impl ErrorData {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: None,
            message: message.into(),
            stack: None,
            cause: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_cause(mut self, cause: ErrorData) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Number of links in the cause chain, including this one
    pub fn depth(&self) -> usize {
        1 + self.cause.as_ref().map_or(0, |cause| cause.depth())
    }
}

impl std::fmt::Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

/// Main error type for the IDE agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// The client never declared the capability an operation depends on
    #[error("Client capability '{capability}' is required for {operation}")]
    CapabilityNotSupported {
        capability: &'static str,
        operation: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyInProgress(String),

    #[error("Rate limited: {0}")]
    RateLimited(ErrorData),

    /// Error raised by product logic; forwarded unchanged
    #[error("{0}")]
    Product(ErrorData),

    /// Error response received from the remote peer
    #[error("Remote error: {0}")]
    Remote(JsonRpcError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request cancelled")]
    Cancelled,

    /// Extension activation failed; the session cannot serve any request
    #[error("Extension activation failed: {0}")]
    ActivationFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Convert agent error to JSON-RPC error code
    pub fn to_json_rpc_error(&self) -> i32 {
        match self {
            AgentError::Parse(_) => -32700,
            AgentError::Protocol(_) => -32600, // Invalid Request
            AgentError::MethodNotFound(_) => -32601,
            AgentError::InvalidParams(_) => -32602,
            AgentError::Serialization(_) => -32602,
            AgentError::CapabilityNotSupported { .. } => -32001,
            AgentError::NotFound(_) => -32002,
            AgentError::AlreadyInProgress(_) => -32003,
            AgentError::RateLimited(_) => -32004,
            AgentError::Cancelled => -32800,
            AgentError::Product(_) => -32000,
            AgentError::Remote(remote) => remote.code,
            AgentError::Auth(_) => -32000,
            AgentError::Config(_) => -32000,
            _ => -32603, // Internal error (default)
        }
    }

    /// Errors after which the session must be torn down
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::ActivationFailed(_))
    }

    /// Build the wire error object sent back to the client
    pub fn to_wire(&self) -> JsonRpcError {
        let data = match self {
            AgentError::RateLimited(data) | AgentError::Product(data) => {
                serde_json::to_value(data).ok()
            }
            AgentError::Remote(remote) => remote.data.clone(),
            AgentError::CapabilityNotSupported { capability, .. } => {
                Some(serde_json::json!({ "capability": capability }))
            }
            _ => None,
        };
        let message = match self {
            AgentError::Remote(remote) => remote.message.clone(),
            other => other.to_string(),
        };
        JsonRpcError {
            code: self.to_json_rpc_error(),
            message,
            data,
        }
    }

    pub fn capability(capability: &'static str, operation: impl Into<String>) -> Self {
        AgentError::CapabilityNotSupported {
            capability,
            operation: operation.into(),
        }
    }
}

/// Convenience type alias for Results using AgentError
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let err = AgentError::Protocol("test protocol error".to_string());
        assert_eq!(err.to_string(), "Protocol error: test protocol error");

        let err = AgentError::MethodNotFound("unknown method".to_string());
        assert_eq!(err.to_string(), "Method not found: unknown method");

        let err = AgentError::capability("editWorkspace", "workspace/edit");
        assert_eq!(
            err.to_string(),
            "Client capability 'editWorkspace' is required for workspace/edit"
        );

        let err = AgentError::AlreadyInProgress("message already in progress".to_string());
        assert_eq!(err.to_string(), "message already in progress");
    }

    #[test]
    fn test_json_rpc_error_codes() {
        assert_eq!(AgentError::Parse("x".into()).to_json_rpc_error(), -32700);
        assert_eq!(AgentError::Protocol("x".into()).to_json_rpc_error(), -32600);
        assert_eq!(
            AgentError::MethodNotFound("x".into()).to_json_rpc_error(),
            -32601
        );
        assert_eq!(
            AgentError::InvalidParams("x".into()).to_json_rpc_error(),
            -32602
        );
        assert_eq!(AgentError::Internal("x".into()).to_json_rpc_error(), -32603);
        assert_eq!(
            AgentError::capability("webview", "chat/new").to_json_rpc_error(),
            -32001
        );
        assert_eq!(AgentError::Cancelled.to_json_rpc_error(), -32800);
    }

    #[test]
    fn test_remote_error_keeps_code_and_message() {
        let remote = JsonRpcError {
            code: -32099,
            message: "client exploded".to_string(),
            data: Some(serde_json::json!({"detail": 1})),
        };
        let wire = AgentError::Remote(remote.clone()).to_wire();
        assert_eq!(wire, remote);
    }

    #[test]
    fn test_product_error_preserves_cause_chain() {
        let data = ErrorData::new("outer")
            .with_name("RateLimitError")
            .with_cause(ErrorData::new("middle").with_cause(ErrorData::new("root")));
        assert_eq!(data.depth(), 3);

        let wire = AgentError::RateLimited(data.clone()).to_wire();
        assert_eq!(wire.code, -32004);
        let round: ErrorData = serde_json::from_value(wire.data.unwrap()).unwrap();
        assert_eq!(round, data);
        assert_eq!(round.cause.unwrap().cause.unwrap().message, "root");
    }

    #[test]
    fn test_only_activation_failure_is_fatal() {
        assert!(AgentError::ActivationFailed("boom".into()).is_fatal());
        assert!(!AgentError::Internal("boom".into()).is_fatal());
        assert!(!AgentError::ConnectionClosed.is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let agent_error: AgentError = io_error.into();

        match agent_error {
            AgentError::Io(_) => {} // Expected
            _ => panic!("Expected IoError variant"),
        }
    }

    #[test]
    fn test_serde_error_conversion() {
        let json = "{invalid json";
        let serde_error = serde_json::from_str::<serde_json::Value>(json).unwrap_err();
        let agent_error: AgentError = serde_error.into();

        match agent_error {
            AgentError::Serialization(_) => {} // Expected
            _ => panic!("Expected Serialization variant"),
        }
    }
}
