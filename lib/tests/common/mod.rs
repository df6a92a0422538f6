//! In-process JSON-RPC test client
//!
//! Talks `Content-Length` framed JSON-RPC to an agent over a duplex pipe.
//! Requests from the agent to the client are answered automatically and,
//! like notifications, queued for inspection.

#![allow(dead_code)]

pub mod fixtures;

use ide_agent_lib::config::Framing;
use ide_agent_lib::transport::{MessageSink, MessageSource, StreamSink, StreamSource};
use ide_agent_lib::{AgentConfig, AgentServer, ExitReason, Extension, NoopExtension};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{DuplexStream, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const TIMEOUT: Duration = Duration::from_secs(5);
pub const ROOT_URI: &str = "file:///tmp/proj";

/// A message the agent sent to the client
#[derive(Debug, Clone)]
pub struct ServerMessage {
    pub method: String,
    pub params: Value,
    /// Set when the agent expects a response
    pub is_request: bool,
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value, Value>>>>>;
type SharedSink = Arc<tokio::sync::Mutex<StreamSink<WriteHalf<DuplexStream>>>>;

pub struct TestClient {
    sink: SharedSink,
    next_id: AtomicI64,
    pending: PendingMap,
    messages: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerMessage>>,
    server: Mutex<Option<JoinHandle<ExitReason>>>,
}

/// Configuration used by most tests
pub fn test_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.testing.deterministic = true;
    config
}

/// `initialize` parameters with every capability the tests exercise
pub fn client_info() -> Value {
    json!({
        "name": "test-client",
        "version": "1.0.0",
        "workspaceRootUri": ROOT_URI,
        "capabilities": {
            "codeActions": "enabled",
            "codeLenses": "enabled",
            "editWorkspace": "enabled",
            "progressBars": "enabled",
            "showWindowMessage": "request",
            "webview": "agentic"
        },
        "extensionConfiguration": {
            "serverEndpoint": "https://assistant.example.com",
            "accessToken": "token-1"
        }
    })
}

/// Canned answer for a request the agent sends to the client
fn answer(method: &str, params: &Value) -> Value {
    match method {
        "window/showMessage" => params
            .get("items")
            .and_then(|items| items.get(0))
            .cloned()
            .unwrap_or(Value::Null),
        "workspace/edit"
        | "textDocument/show"
        | "textDocument/openUntitledDocument"
        | "env/openExternal" => Value::Bool(true),
        _ => Value::Null,
    }
}

impl TestClient {
    pub async fn start() -> Self {
        Self::with_extension(test_config(), Arc::new(NoopExtension)).await
    }

    pub async fn with_extension(config: AgentConfig, extension: Arc<dyn Extension>) -> Self {
        let server = AgentServer::new(config, extension).expect("valid config");
        let (stream, handle) = server.spawn_in_process().expect("session starts");
        let (reader, writer) = tokio::io::split(stream);

        let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(StreamSink::new(
            writer,
            Framing::ContentLength,
        )));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();

        let mut source = StreamSource::new(reader, Framing::ContentLength);
        let reader_sink = Arc::clone(&sink);
        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Ok(Some(text)) = source.read_message().await {
                let message: Value = serde_json::from_str(&text).expect("agent sends JSON");
                let method = message.get("method").and_then(Value::as_str);
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                match (method, message.get("id")) {
                    (Some(method), Some(id)) => {
                        let reply = json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "result": answer(method, &params),
                        });
                        let _ = messages_tx.send(ServerMessage {
                            method: method.to_string(),
                            params,
                            is_request: true,
                        });
                        let _ = reader_sink
                            .lock()
                            .await
                            .write_message(&reply.to_string())
                            .await;
                    }
                    (Some(method), None) => {
                        let _ = messages_tx.send(ServerMessage {
                            method: method.to_string(),
                            params,
                            is_request: false,
                        });
                    }
                    (None, id) => {
                        let id = id.and_then(Value::as_i64).unwrap_or(-1);
                        let outcome = match message.get("error") {
                            Some(error) => Err(error.clone()),
                            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
                        };
                        if let Some(sender) = reader_pending.lock().unwrap().remove(&id) {
                            let _ = sender.send(outcome);
                        }
                    }
                }
            }
        });

        Self {
            sink,
            next_id: AtomicI64::new(1),
            pending,
            messages: tokio::sync::Mutex::new(messages_rx),
            server: Mutex::new(Some(handle)),
        }
    }

    /// Start a session and complete the `initialize` handshake
    pub async fn initialized(config: AgentConfig, extension: Arc<dyn Extension>) -> Self {
        let client = Self::with_extension(config, extension).await;
        client
            .request("initialize", client_info())
            .await
            .expect("initialize succeeds");
        client.notify("initialized", Value::Null).await;
        client
    }

    pub async fn send_raw(&self, text: &str) {
        self.sink
            .lock()
            .await
            .write_message(text)
            .await
            .expect("agent is reading");
    }

    /// Send a request; `Err` carries the JSON-RPC error object
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let message = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        self.send_raw(&message.to_string()).await;
        timeout(TIMEOUT, rx)
            .await
            .unwrap_or_else(|_| panic!("{method} timed out"))
            .expect("response delivered")
    }

    /// Send raw text and wait for the response that carries a null id
    pub async fn raw_request(&self, text: &str) -> Result<Value, Value> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(-1, tx);
        self.send_raw(text).await;
        timeout(TIMEOUT, rx)
            .await
            .expect("response to raw message")
            .expect("response delivered")
    }

    pub async fn cancel(&self, id: i64) {
        self.notify("$/cancelRequest", json!({ "id": id })).await;
    }

    /// Id the next request will use
    pub fn peek_next_id(&self) -> i64 {
        self.next_id.load(Ordering::Relaxed)
    }

    pub async fn notify(&self, method: &str, params: Value) {
        let message = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.send_raw(&message.to_string()).await;
    }

    /// Wait for the next agent message with `method`, skipping others
    pub async fn expect_message(&self, method: &str) -> ServerMessage {
        let mut messages = self.messages.lock().await;
        timeout(TIMEOUT, async {
            loop {
                let message = messages.recv().await.expect("agent still connected");
                if message.method == method {
                    return message;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {method} message arrived"))
    }

    /// Everything the agent sent that has not been consumed yet
    pub async fn drain_messages(&self) -> Vec<ServerMessage> {
        let mut messages = self.messages.lock().await;
        let mut drained = Vec::new();
        while let Ok(message) = messages.try_recv() {
            drained.push(message);
        }
        drained
    }

    /// Send `exit` and wait for the session to end
    pub async fn exit(&self) -> ExitReason {
        self.notify("exit", Value::Null).await;
        let handle = self.server.lock().unwrap().take().expect("session running");
        timeout(TIMEOUT, handle)
            .await
            .expect("session ends")
            .expect("session task completes")
    }
}
