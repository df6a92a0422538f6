//! Bidirectional JSON-RPC connection
//!
//! One [`Connection`] serves one client. Inbound requests run concurrently,
//! each with its own cancellation token wired to `$/cancelRequest`. Inbound
//! notifications are started in arrival order and their futures run one after
//! another on a single worker, so document edits for a URI are never
//! reordered. A request body starts only after every notification that
//! arrived before it has been handled. Handler functions themselves are
//! invoked synchronously on the read loop; anything a handler must observe
//! "as of arrival" is captured there.

use crate::error::{AgentError, Result};
use crate::protocol::{Message, RequestId};
use crate::recording::{Direction, TrafficRecorder};
use crate::sync::{lock, read, write};
use crate::transport::{MessageSink, MessageSource};
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type RequestHandler =
    Arc<dyn Fn(Value, CancellationToken) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
pub type NotificationHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

const CANCEL_REQUEST: &str = "$/cancelRequest";

/// Why a connection stopped serving
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The client sent `exit`
    Requested,
    /// The peer closed the stream
    StreamClosed,
    /// The session could not continue (for example, activation failed)
    Fatal(String),
}

impl ExitReason {
    /// Process exit code for this reason
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitReason::Requested => 0,
            ExitReason::StreamClosed | ExitReason::Fatal(_) => 1,
        }
    }
}

pub struct Connection {
    next_id: AtomicI64,
    outgoing: mpsc::UnboundedSender<Message>,
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Result<Value>>>>,
    request_handlers: RwLock<HashMap<String, RequestHandler>>,
    notification_handlers: RwLock<HashMap<String, NotificationHandler>>,
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
    exit_reason: Mutex<Option<ExitReason>>,
    shutdown: CancellationToken,
    recorder: RwLock<Option<Arc<dyn TrafficRecorder>>>,
}

impl Connection {
    pub fn new() -> Arc<Self> {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            next_id: AtomicI64::new(0),
            outgoing,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            pending: Mutex::new(HashMap::new()),
            request_handlers: RwLock::new(HashMap::new()),
            notification_handlers: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            exit_reason: Mutex::new(None),
            shutdown: CancellationToken::new(),
            recorder: RwLock::new(None),
        })
    }

    /// Register a request handler; registering a method again replaces it
    pub fn on_request<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Value, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |params, token| handler(params, token).boxed());
        if write(&self.request_handlers)
            .insert(method.to_string(), handler)
            .is_some()
        {
            debug!("Replaced request handler for {}", method);
        }
    }

    /// Register a notification handler; registering a method again replaces it
    pub fn on_notification<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: NotificationHandler = Arc::new(move |params| handler(params).boxed());
        if write(&self.notification_handlers)
            .insert(method.to_string(), handler)
            .is_some()
        {
            debug!("Replaced notification handler for {}", method);
        }
    }

    pub fn has_request_handler(&self, method: &str) -> bool {
        read(&self.request_handlers).contains_key(method)
    }

    pub fn set_recorder(&self, recorder: Option<Arc<dyn TrafficRecorder>>) {
        *write(&self.recorder) = recorder;
    }

    pub fn recorder(&self) -> Option<Arc<dyn TrafficRecorder>> {
        read(&self.recorder).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Send a request to the client and wait for its response
    pub async fn request<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        if self.is_closed() {
            return Err(AgentError::ConnectionClosed);
        }

        let params = serde_json::to_value(params)?;
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);

        debug!("Sending request {} method={}", id, method);
        if self
            .outgoing
            .send(Message::request(id.clone(), method, params))
            .is_err()
        {
            lock(&self.pending).remove(&id);
            return Err(AgentError::ConnectionClosed);
        }

        let value = rx.await.map_err(|_| AgentError::ConnectionClosed)??;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a notification to the client
    pub fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        let params = serde_json::to_value(params)?;
        self.outgoing
            .send(Message::notification(method, params))
            .map_err(|_| AgentError::ConnectionClosed)
    }

    /// Stop serving; only the first reason is kept
    pub fn exit(&self, reason: ExitReason) {
        {
            let mut current = lock(&self.exit_reason);
            if current.is_none() {
                info!("Connection exiting: {:?}", reason);
                *current = Some(reason);
            }
        }
        self.shutdown.cancel();
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        lock(&self.exit_reason).clone()
    }

    /// Serve the connection until the client exits or the stream closes
    pub async fn run(
        self: &Arc<Self>,
        mut source: Box<dyn MessageSource>,
        sink: Box<dyn MessageSink>,
    ) -> ExitReason {
        let Some(outgoing_rx) = lock(&self.outgoing_rx).take() else {
            return ExitReason::Fatal("Connection is already running".to_string());
        };

        let writer = tokio::spawn(Self::write_loop(
            outgoing_rx,
            sink,
            self.shutdown.clone(),
            self.recorder(),
        ));

        let (notification_tx, mut notification_rx) =
            mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        let notifications = tokio::spawn(async move {
            while let Some(work) = notification_rx.recv().await {
                work.await;
            }
        });

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = source.read_message() => next,
            };

            match next {
                Ok(Some(text)) => {
                    if let Some(recorder) = self.recorder() {
                        recorder.record(Direction::Incoming, &text);
                    }
                    self.dispatch(&text, &notification_tx);
                }
                Ok(None) => {
                    info!("Input stream closed");
                    self.exit(ExitReason::StreamClosed);
                    break;
                }
                Err(e) => {
                    error!("Failed to read message: {}", e);
                    self.exit(ExitReason::StreamClosed);
                    break;
                }
            }
        }

        // Outbound requests can no longer be answered
        lock(&self.pending).clear();
        for (_, token) in lock(&self.in_flight).drain() {
            token.cancel();
        }
        drop(notification_tx);
        notifications.abort();
        if let Err(e) = writer.await {
            warn!("Writer task ended abnormally: {}", e);
        }

        self.exit_reason().unwrap_or(ExitReason::StreamClosed)
    }

    async fn write_loop(
        outgoing_rx: mpsc::UnboundedReceiver<Message>,
        mut sink: Box<dyn MessageSink>,
        shutdown: CancellationToken,
        recorder: Option<Arc<dyn TrafficRecorder>>,
    ) {
        let mut outgoing = UnboundedReceiverStream::new(outgoing_rx);
        loop {
            let message = tokio::select! {
                biased;
                message = outgoing.next() => message,
                _ = shutdown.cancelled() => None,
            };
            let Some(message) = message else {
                break;
            };
            if let Err(e) = Self::write_one(&mut *sink, &message, recorder.as_deref()).await {
                error!("Failed to write message: {}", e);
                return;
            }
        }

        // Flush whatever was queued before the shutdown, such as the response
        // to the request that triggered it
        let mut remaining = outgoing.into_inner();
        while let Ok(message) = remaining.try_recv() {
            if let Err(e) = Self::write_one(&mut *sink, &message, recorder.as_deref()).await {
                error!("Failed to write message: {}", e);
                return;
            }
        }
        if let Err(e) = sink.close().await {
            debug!("Failed to close sink: {}", e);
        }
    }

    async fn write_one(
        sink: &mut dyn MessageSink,
        message: &Message,
        recorder: Option<&dyn TrafficRecorder>,
    ) -> Result<()> {
        let text = serde_json::to_string(message)?;
        if let Some(recorder) = recorder {
            recorder.record(Direction::Outgoing, &text);
        }
        sink.write_message(&text).await
    }

    fn send(&self, message: Message) {
        if self.outgoing.send(message).is_err() {
            warn!("Dropping message; connection writer is gone");
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        text: &str,
        notification_tx: &mpsc::UnboundedSender<BoxFuture<'static, ()>>,
    ) {
        let message = match Message::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Rejecting malformed message: {}", e);
                self.send(Message::failure(None, e.to_wire()));
                return;
            }
        };

        match message {
            Message::Request(request) => {
                info!("Handling request: method={}, id={}", request.method, request.id);
                let handler = read(&self.request_handlers).get(&request.method).cloned();
                let Some(handler) = handler else {
                    let err = AgentError::MethodNotFound(request.method.clone());
                    self.send(Message::failure(Some(request.id), err.to_wire()));
                    return;
                };

                let token = CancellationToken::new();
                lock(&self.in_flight).insert(request.id.clone(), token.clone());
                let work = handler(request.params.unwrap_or(Value::Null), token);

                let (barrier_tx, barrier_rx) = oneshot::channel::<()>();
                let barrier = async move {
                    let _ = barrier_tx.send(());
                }
                .boxed();
                if notification_tx.send(barrier).is_err() {
                    debug!("Notification worker is gone; not waiting for it");
                }

                let connection = Arc::clone(self);
                let method = request.method;
                let id = request.id;
                tokio::spawn(async move {
                    // Earlier notifications are done once the worker reaches the barrier
                    let _ = barrier_rx.await;
                    let result = match AssertUnwindSafe(work).catch_unwind().await {
                        Ok(result) => result,
                        Err(_) => Err(AgentError::Internal(format!("Handler for {method} panicked"))),
                    };
                    lock(&connection.in_flight).remove(&id);

                    match result {
                        Ok(value) => connection.send(Message::success(id, value)),
                        Err(e) => {
                            error!("Method {} failed: {}", method, e);
                            connection.send(Message::failure(Some(id), e.to_wire()));
                            if e.is_fatal() {
                                connection.exit(ExitReason::Fatal(e.to_string()));
                            }
                        }
                    }
                });
            }
            Message::Notification(notification) => {
                let params = notification.params.unwrap_or(Value::Null);
                if notification.method == CANCEL_REQUEST {
                    self.cancel_in_flight(params);
                    return;
                }

                let handler = read(&self.notification_handlers)
                    .get(&notification.method)
                    .cloned();
                let Some(handler) = handler else {
                    if !notification.method.starts_with("$/") {
                        warn!("No handler for notification {}", notification.method);
                    }
                    return;
                };

                debug!("Handling notification: method={}", notification.method);
                let work = handler(params);
                let method = notification.method;
                let ordered = async move {
                    match AssertUnwindSafe(work).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("Notification {} failed: {}", method, e),
                        Err(_) => error!("Notification handler for {} panicked", method),
                    }
                }
                .boxed();
                if notification_tx.send(ordered).is_err() {
                    warn!("Notification worker is gone");
                }
            }
            Message::Response(response) => {
                let Some(id) = response.id else {
                    warn!("Client reported an error without an id: {:?}", response.error);
                    return;
                };
                let Some(tx) = lock(&self.pending).remove(&id) else {
                    warn!("Response for unknown request id {}", id);
                    return;
                };
                let result = match response.error {
                    Some(error) => Err(AgentError::Remote(error)),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(result);
            }
        }
    }

    fn cancel_in_flight(&self, params: Value) {
        let id = params
            .get("id")
            .cloned()
            .and_then(|id| serde_json::from_value::<RequestId>(id).ok());
        match id.and_then(|id| lock(&self.in_flight).get(&id).cloned()) {
            Some(token) => {
                debug!("Cancelling in-flight request");
                token.cancel();
            }
            None => debug!("Cancel for a request that is no longer running"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Framing;
    use crate::transport::stream_transport;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::duplex;

    /// Two connections wired back to back
    fn pair() -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let server = Connection::new();
        let client = Connection::new();

        let (source, sink) = stream_transport(a_read, a_write, Framing::ContentLength);
        let running = Arc::clone(&server);
        tokio::spawn(async move { running.run(source, sink).await });

        let (source, sink) = stream_transport(b_read, b_write, Framing::ContentLength);
        let running = Arc::clone(&client);
        tokio::spawn(async move { running.run(source, sink).await });

        (server, client)
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (server, client) = pair();
        server.on_request("math/add", |params, _token| async move {
            let a = params["a"].as_i64().unwrap_or_default();
            let b = params["b"].as_i64().unwrap_or_default();
            Ok(json!(a + b))
        });

        let sum: i64 = client.request("math/add", json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(sum, 5);
    }

    #[tokio::test]
    async fn test_unknown_method_is_method_not_found() {
        let (_server, client) = pair();
        let err = client
            .request::<_, Value>("nope/missing", json!({}))
            .await
            .unwrap_err();
        match err {
            AgentError::Remote(remote) => assert_eq!(remote.code, -32601),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_response() {
        let (server, client) = pair();
        server.on_request("boom", |_params, _token| async move {
            Err::<Value, _>(AgentError::InvalidParams("bad".to_string()))
        });

        let err = client.request::<_, Value>("boom", json!(null)).await.unwrap_err();
        match err {
            AgentError::Remote(remote) => {
                assert_eq!(remote.code, -32602);
                assert!(remote.message.contains("bad"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let (server, client) = pair();
        server.on_request("which", |_p, _t| async move { Ok(json!("first")) });
        server.on_request("which", |_p, _t| async move { Ok(json!("second")) });

        let which: String = client.request("which", json!(null)).await.unwrap();
        assert_eq!(which, "second");
    }

    #[tokio::test]
    async fn test_notifications_run_in_arrival_order() {
        let (server, client) = pair();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        server.on_notification("log/append", move |params| {
            let log = Arc::clone(&log);
            async move {
                // Earlier notifications sleep longer; order must still hold
                let n = params["n"].as_u64().unwrap_or_default();
                tokio::time::sleep(Duration::from_millis(20 - n * 5)).await;
                lock(&log).push(n);
                Ok(())
            }
        });
        server.on_request("log/read", {
            let log = Arc::clone(&seen);
            move |_p, _t| {
                let log = Arc::clone(&log);
                async move {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    Ok(json!(lock(&log).clone()))
                }
            }
        });

        for n in 0..4u64 {
            client.notify("log/append", json!({"n": n})).unwrap();
        }
        let order: Vec<u64> = client.request("log/read", json!(null)).await.unwrap();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cancel_request_cancels_token() {
        let (server, client) = pair();
        server.on_request("slow", |_params, token: CancellationToken| async move {
            tokio::select! {
                _ = token.cancelled() => Ok(json!("cancelled")),
                _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(json!("finished")),
            }
        });

        let pending = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.request::<_, String>("slow", json!(null)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The client allocated id 0 for its first request
        client.notify(CANCEL_REQUEST, json!({"id": 0})).unwrap();

        let outcome = pending.await.unwrap().unwrap();
        assert_eq!(outcome, "cancelled");
    }

    #[tokio::test]
    async fn test_server_to_client_request() {
        let (server, client) = pair();
        client.on_request("window/showMessage", |params, _t| async move {
            Ok(params["items"][0].clone())
        });

        let chosen: Option<String> = server
            .request("window/showMessage", json!({"message": "hi", "items": ["Yes", "No"]}))
            .await
            .unwrap();
        assert_eq!(chosen.as_deref(), Some("Yes"));
    }

    #[tokio::test]
    async fn test_exit_is_idempotent_and_first_reason_wins() {
        let connection = Connection::new();
        connection.exit(ExitReason::Requested);
        connection.exit(ExitReason::Fatal("later".to_string()));
        assert_eq!(connection.exit_reason(), Some(ExitReason::Requested));
        assert!(connection.is_closed());
        assert!(matches!(
            connection.request::<_, Value>("x", json!(null)).await,
            Err(AgentError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_stream_close_reports_exit_code_one() {
        let (a, b) = duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        let connection = Connection::new();
        let (source, sink) = stream_transport(a_read, a_write, Framing::Newline);
        drop(b);

        let reason = connection.run(source, sink).await;
        assert_eq!(reason, ExitReason::StreamClosed);
        assert_eq!(reason.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_fatal_handler_error_terminates_after_response() {
        let (server, client) = pair();
        server.on_request("initialize", |_p, _t| async move {
            Err::<Value, _>(AgentError::ActivationFailed("no extension".to_string()))
        });

        let err = client
            .request::<_, Value>("initialize", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Remote(_)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(server.exit_reason(), Some(ExitReason::Fatal(_))));
    }
}
