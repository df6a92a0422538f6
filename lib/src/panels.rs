//! Webview panel registry
//!
//! Generic panels are emulated here: the product posts messages meant for the
//! client (`post_message`) and receives the client's messages
//! (`receive_message`), and the panel keeps the bits of UI state the
//! dispatcher needs to answer requests. Native panels are rendered by the
//! client; only their lifecycle is tracked.

use crate::client::{ClientProxy, CreateWebviewPanelParams};
use crate::error::{AgentError, Result};
use crate::events::EventEmitter;
use crate::pending::PendingTasks;
use crate::sync::{lock, read, write};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};
use ulid::Ulid;
use uuid::Uuid;

/// State learned from the product's outbound messages
#[derive(Debug, Clone, Default)]
struct PanelState {
    chat_id: Option<String>,
    transcript: Option<Value>,
    models: Option<Value>,
    remote_repos: Option<Value>,
}

enum Attribution {
    Ready(Value),
    Waiting(Vec<oneshot::Sender<Value>>),
}

/// Outcome of looking up an attribution for a snippet
pub enum AttributionLookup {
    Cached(Value),
    /// `first` is true for the caller that must start the search
    Pending {
        receiver: oneshot::Receiver<Value>,
        first: bool,
    },
}

pub struct Panel {
    id: String,
    view_type: String,
    title: RwLock<String>,
    show_options: Value,
    options: Value,
    in_progress: watch::Sender<bool>,
    state: RwLock<PanelState>,
    attributions: Mutex<HashMap<String, Attribution>>,
    disposed: AtomicBool,
    /// Product to client
    pub on_post_message: EventEmitter<Value>,
    /// Client to product
    pub on_receive_message: EventEmitter<Value>,
    /// Fires only when the in-progress flag actually changes
    pub on_did_change_in_progress: EventEmitter<bool>,
    pub on_did_dispose: EventEmitter<()>,
}

impl Panel {
    fn new(
        tasks: &Arc<PendingTasks>,
        view_type: String,
        title: String,
        show_options: Value,
        options: Value,
    ) -> Self {
        let (in_progress, _) = watch::channel(false);
        Self {
            id: Ulid::new().to_string(),
            view_type,
            title: RwLock::new(title),
            show_options,
            options,
            in_progress,
            state: RwLock::new(PanelState::default()),
            attributions: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
            on_post_message: EventEmitter::new(Arc::clone(tasks)),
            on_receive_message: EventEmitter::new(Arc::clone(tasks)),
            on_did_change_in_progress: EventEmitter::new(Arc::clone(tasks)),
            on_did_dispose: EventEmitter::new(Arc::clone(tasks)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn view_type(&self) -> &str {
        &self.view_type
    }

    pub fn title(&self) -> String {
        read(&self.title).clone()
    }

    pub fn set_title(&self, title: impl Into<String>) {
        *write(&self.title) = title.into();
    }

    pub fn show_options(&self) -> &Value {
        &self.show_options
    }

    pub fn options(&self) -> &Value {
        &self.options
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn chat_id(&self) -> Option<String> {
        read(&self.state).chat_id.clone()
    }

    pub fn transcript(&self) -> Option<Value> {
        read(&self.state).transcript.clone()
    }

    pub fn models(&self) -> Option<Value> {
        read(&self.state).models.clone()
    }

    pub fn remote_repos(&self) -> Option<Value> {
        read(&self.state).remote_repos.clone()
    }

    pub fn is_in_progress(&self) -> bool {
        *self.in_progress.borrow()
    }

    pub fn watch_in_progress(&self) -> watch::Receiver<bool> {
        self.in_progress.subscribe()
    }

    /// Update the flag; returns whether it changed
    pub fn set_in_progress(&self, value: bool) -> bool {
        let changed = self.in_progress.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
        if changed {
            self.on_did_change_in_progress.fire(value);
        }
        changed
    }

    /// Claim the panel for one message submission
    pub fn begin_submission(&self) -> Result<()> {
        if self.set_in_progress(true) {
            Ok(())
        } else {
            Err(AgentError::AlreadyInProgress(format!(
                "A message is already being submitted to panel {}",
                self.id
            )))
        }
    }

    /// Deliver a product message to the client side, tracking panel state
    pub async fn post_message(&self, message: Value) {
        self.observe_outbound(&message);
        self.on_post_message.fire_and_wait(message).await;
    }

    /// Deliver a client message to the product
    pub async fn receive_message(&self, message: Value) {
        self.on_receive_message.fire_and_wait(message).await;
    }

    fn observe_outbound(&self, message: &Value) {
        let string = |key: &str| message.get(key).and_then(Value::as_str).map(str::to_string);
        match message.get("type").and_then(Value::as_str) {
            Some("transcript") => {
                {
                    let mut state = write(&self.state);
                    if let Some(chat_id) = string("chatID") {
                        state.chat_id = Some(chat_id);
                    }
                    state.transcript = Some(message.clone());
                }
                if let Some(in_progress) = message.get("isMessageInProgress").and_then(Value::as_bool) {
                    self.set_in_progress(in_progress);
                }
            }
            Some("chatModels") => {
                write(&self.state).models = message.get("models").cloned();
            }
            Some("remoteRepos") | Some("clientConfig") if message.get("remoteRepos").is_some() => {
                write(&self.state).remote_repos = message.get("remoteRepos").cloned();
            }
            Some("attribution") => {
                if let Some(snippet) = string("snippet") {
                    self.resolve_attribution(snippet, message.clone());
                }
            }
            _ => {}
        }
    }

    /// Cached result for the snippet, or a receiver for the next one
    pub fn lookup_attribution(&self, snippet: &str) -> AttributionLookup {
        let mut attributions = lock(&self.attributions);
        match attributions.get_mut(snippet) {
            Some(Attribution::Ready(value)) => AttributionLookup::Cached(value.clone()),
            Some(Attribution::Waiting(waiters)) => {
                let (sender, receiver) = oneshot::channel();
                waiters.push(sender);
                AttributionLookup::Pending {
                    receiver,
                    first: false,
                }
            }
            None => {
                let (sender, receiver) = oneshot::channel();
                attributions.insert(snippet.to_string(), Attribution::Waiting(vec![sender]));
                AttributionLookup::Pending {
                    receiver,
                    first: true,
                }
            }
        }
    }

    fn resolve_attribution(&self, snippet: String, result: Value) {
        let previous = lock(&self.attributions).insert(snippet, Attribution::Ready(result.clone()));
        if let Some(Attribution::Waiting(waiters)) = previous {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    /// Forget an unanswered search so a later lookup starts a new one
    pub fn abandon_attribution(&self, snippet: &str) {
        let mut attributions = lock(&self.attributions);
        if matches!(attributions.get(snippet), Some(Attribution::Waiting(_))) {
            attributions.remove(snippet);
        }
    }

    /// Mark the panel disposed and release any submission waiting on it
    fn mark_disposed(&self) -> bool {
        let first = !self.disposed.swap(true, Ordering::AcqRel);
        if first {
            self.set_in_progress(false);
        }
        first
    }
}

impl std::fmt::Debug for Panel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Panel")
            .field("id", &self.id)
            .field("view_type", &self.view_type)
            .field("in_progress", &self.is_in_progress())
            .finish()
    }
}

/// Panel rendered by the client
#[derive(Debug)]
pub struct NativePanel {
    handle: String,
    view_type: String,
    title: RwLock<String>,
    client: ClientProxy,
}

impl NativePanel {
    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn view_type(&self) -> &str {
        &self.view_type
    }

    pub fn title(&self) -> String {
        read(&self.title).clone()
    }

    pub fn set_title(&self, title: &str) {
        *write(&self.title) = title.to_string();
        self.client.webview_set_title(&self.handle, title);
    }
}

pub struct PanelRegistry {
    tasks: Arc<PendingTasks>,
    panels: RwLock<HashMap<String, Arc<Panel>>>,
    native: RwLock<HashMap<String, Arc<NativePanel>>>,
}

impl PanelRegistry {
    pub fn new(tasks: Arc<PendingTasks>) -> Self {
        Self {
            tasks,
            panels: RwLock::new(HashMap::new()),
            native: RwLock::new(HashMap::new()),
        }
    }

    pub fn create_panel(
        &self,
        view_type: &str,
        title: &str,
        show_options: Value,
        options: Value,
    ) -> Arc<Panel> {
        let panel = Arc::new(Panel::new(
            &self.tasks,
            view_type.to_string(),
            title.to_string(),
            show_options,
            options,
        ));
        info!("Created panel {} ({})", panel.id(), view_type);
        write(&self.panels).insert(panel.id().to_string(), Arc::clone(&panel));
        panel
    }

    /// Allocate a handle and ask the client to render the panel
    pub fn create_native_panel(
        &self,
        client: &ClientProxy,
        view_type: &str,
        title: &str,
        show_options: Value,
        options: Value,
    ) -> Arc<NativePanel> {
        let handle = Uuid::new_v4().to_string();
        let panel = Arc::new(NativePanel {
            handle: handle.clone(),
            view_type: view_type.to_string(),
            title: RwLock::new(title.to_string()),
            client: client.clone(),
        });
        write(&self.native).insert(handle.clone(), Arc::clone(&panel));
        client.webview_create_panel(&CreateWebviewPanelParams {
            handle,
            view_type: view_type.to_string(),
            title: title.to_string(),
            show_options,
            options,
        });
        panel
    }

    pub fn get(&self, id: &str) -> Option<Arc<Panel>> {
        read(&self.panels).get(id).cloned()
    }

    pub fn get_native(&self, handle: &str) -> Option<Arc<NativePanel>> {
        read(&self.native).get(handle).cloned()
    }

    pub fn get_or_not_found(&self, id: &str) -> Result<Arc<Panel>> {
        self.get(id)
            .ok_or_else(|| AgentError::NotFound(format!("No panel with id {id}")))
    }

    /// Ids of the generic panels, oldest first
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = read(&self.panels).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        read(&self.panels).len() + read(&self.native).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a generic panel; disposing twice is a no-op
    pub fn dispose(&self, id: &str) -> Option<Arc<Panel>> {
        let panel = write(&self.panels).remove(id)?;
        if panel.mark_disposed() {
            debug!("Disposed panel {}", id);
            panel.on_did_dispose.fire(());
        }
        Some(panel)
    }

    /// Remove a native panel, telling the client when the product initiated it
    pub fn dispose_native(&self, handle: &str, notify_client: bool) -> bool {
        let Some(panel) = write(&self.native).remove(handle) else {
            return false;
        };
        if notify_client {
            panel.client.webview_dispose(handle);
        }
        debug!("Disposed native panel {}", handle);
        true
    }

    /// Drop every panel without per-panel notifications
    pub fn clear(&self) {
        let panels: Vec<_> = write(&self.panels).drain().map(|(_, panel)| panel).collect();
        for panel in &panels {
            panel.mark_disposed();
        }
        write(&self.native).clear();
        if !panels.is_empty() {
            info!("Cleared {} panels", panels.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use serde_json::json;

    fn registry() -> PanelRegistry {
        PanelRegistry::new(PendingTasks::new(true))
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let registry = registry();
        let panel = registry.create_panel("chat", "Chat", json!({}), json!({}));
        let id = panel.id().to_string();

        assert!(registry.dispose(&id).is_some());
        assert!(registry.dispose(&id).is_none());
        assert!(registry.get(&id).is_none());
        assert!(panel.is_disposed());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_submission_is_exclusive() {
        let registry = registry();
        let panel = registry.create_panel("chat", "Chat", json!({}), json!({}));

        panel.begin_submission().unwrap();
        assert!(matches!(
            panel.begin_submission(),
            Err(AgentError::AlreadyInProgress(_))
        ));
        panel.set_in_progress(false);
        assert!(panel.begin_submission().is_ok());
    }

    #[tokio::test]
    async fn test_in_progress_event_fires_on_change_only() {
        let tasks = PendingTasks::new(true);
        let registry = PanelRegistry::new(Arc::clone(&tasks));
        let panel = registry.create_panel("chat", "Chat", json!({}), json!({}));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let _subscription = panel.on_did_change_in_progress.on(move |value| {
            let log = Arc::clone(&log);
            async move { log.lock().unwrap().push(value) }
        });

        assert!(panel.set_in_progress(true));
        assert!(!panel.set_in_progress(true));
        assert!(panel.set_in_progress(false));
        tasks.settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_outbound_transcript_updates_state() {
        let registry = registry();
        let panel = registry.create_panel("chat", "Chat", json!({}), json!({}));
        panel.begin_submission().unwrap();

        panel
            .post_message(json!({
                "type": "transcript",
                "chatID": "chat-1",
                "isMessageInProgress": false,
                "messages": []
            }))
            .await;
        panel
            .post_message(json!({"type": "chatModels", "models": [{"model": "m"}]}))
            .await;

        assert_eq!(panel.chat_id().as_deref(), Some("chat-1"));
        assert!(!panel.is_in_progress());
        assert_eq!(panel.models(), Some(json!([{"model": "m"}])));
        assert_eq!(panel.transcript().unwrap()["chatID"], "chat-1");
    }

    #[tokio::test]
    async fn test_attribution_results_are_cached() {
        let registry = registry();
        let panel = registry.create_panel("chat", "Chat", json!({}), json!({}));

        let AttributionLookup::Pending { receiver, first } = panel.lookup_attribution("snippet") else {
            panic!("expected pending lookup");
        };
        assert!(first);
        let AttributionLookup::Pending { receiver: second, first } = panel.lookup_attribution("snippet") else {
            panic!("expected pending lookup");
        };
        assert!(!first);

        let result = json!({"type": "attribution", "snippet": "snippet", "repositoryNames": ["r"]});
        panel.post_message(result.clone()).await;

        assert_eq!(receiver.await.unwrap(), result);
        assert_eq!(second.await.unwrap(), result);
        assert!(matches!(
            panel.lookup_attribution("snippet"),
            AttributionLookup::Cached(value) if value == result
        ));
    }

    #[test]
    fn test_native_panel_lifecycle() {
        let registry = registry();
        let client = ClientProxy::new(Connection::new());
        let first = registry.create_native_panel(&client, "view", "One", json!({}), json!({}));
        let second = registry.create_native_panel(&client, "view", "Two", json!({}), json!({}));
        assert_ne!(first.handle(), second.handle());
        assert_eq!(registry.len(), 2);

        first.set_title("Renamed");
        assert_eq!(first.title(), "Renamed");

        assert!(registry.dispose_native(first.handle(), true));
        assert!(!registry.dispose_native(first.handle(), true));
        registry.clear();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_clear_releases_waiting_submission() {
        let registry = registry();
        let panel = registry.create_panel("chat", "Chat", json!({}), json!({}));
        panel.begin_submission().unwrap();
        let mut in_progress = panel.watch_in_progress();

        registry.clear();

        assert!(panel.is_disposed());
        assert!(!panel.is_in_progress());
        let released = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            in_progress.wait_for(|busy| !*busy),
        )
        .await;
        assert!(matches!(released, Ok(Ok(_))));
    }

    #[test]
    fn test_dispose_clears_in_progress() {
        let registry = registry();
        let panel = registry.create_panel("chat", "Chat", json!({}), json!({}));
        panel.begin_submission().unwrap();

        registry.dispose(panel.id()).unwrap();
        assert!(!panel.is_in_progress());
    }
}
