//! In-process stand-in for the editor host API
//!
//! [`HostContext`] is created once per session and handed to the extension at
//! activation. It owns every piece of mutable host state; the setters below are
//! the only way that state is replaced. The workspace and window facades live
//! in their own modules as further `impl HostContext` blocks.

pub mod commands;
pub mod diagnostics;
pub mod languages;
pub mod window;
pub mod workspace;

pub use commands::CommandRegistry;
pub use diagnostics::{Diagnostic, DiagnosticSeverity, DiagnosticsStore, ProtocolDiagnostic};
pub use languages::Languages;
pub use window::CreatedPanel;
pub use workspace::{FilePattern, FileSystem, WorkspaceFolder, WorkspaceFolders};

use crate::capabilities::ClientCapabilities;
use crate::client::ClientProxy;
use crate::configuration::ConfigurationResolver;
use crate::documents::{DocumentDivergence, DocumentManager};
use crate::edit_tasks::{EditTask, EditTaskEvent, FixupController, InMemoryFixupController};
use crate::events::EventEmitter;
use crate::panels::PanelRegistry;
use crate::pending::PendingTasks;
use crate::progress::ProgressManager;
use crate::protocol::{ClientInfo, DebugLevel, ExtensionConfiguration};
use crate::storage::{GlobalStateStore, InMemorySecretStorage, MemoryGlobalState, SecretStorage};
use crate::sync::{read, write};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Channel name used for operator-facing `debug/message` relays
pub const DEBUG_CHANNEL: &str = "Agent";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationChangeEvent {
    /// The access token or server endpoint changed
    pub auth_change: bool,
}

/// Host environment details exposed to the extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvInfo {
    pub app_name: String,
    pub session_id: String,
    pub language: String,
}

pub struct HostContext {
    client_info: RwLock<ClientInfo>,
    session_id: String,
    relay_debug: AtomicBool,
    pub client: ClientProxy,
    pub tasks: Arc<PendingTasks>,
    pub documents: DocumentManager,
    pub configuration: Arc<ConfigurationResolver>,
    pub panels: PanelRegistry,
    pub progress: ProgressManager,
    pub diagnostics: DiagnosticsStore,
    pub commands: CommandRegistry,
    pub languages: Languages,
    pub workspace_folders: WorkspaceFolders,
    pub on_did_change_configuration: EventEmitter<ConfigurationChangeEvent>,
    global_state: RwLock<Arc<dyn GlobalStateStore>>,
    secrets: RwLock<Arc<dyn SecretStorage>>,
    fixups: RwLock<Arc<dyn FixupController>>,
}

impl HostContext {
    pub fn new(client: ClientProxy, tasks: Arc<PendingTasks>, namespace: &str) -> Arc<Self> {
        let host = Arc::new(Self {
            client_info: RwLock::new(ClientInfo::default()),
            session_id: Uuid::new_v4().to_string(),
            relay_debug: AtomicBool::new(false),
            documents: DocumentManager::new(Arc::clone(&tasks)),
            configuration: Arc::new(ConfigurationResolver::new(namespace)),
            panels: PanelRegistry::new(Arc::clone(&tasks)),
            progress: ProgressManager::new(client.clone()),
            diagnostics: DiagnosticsStore::new(Arc::clone(&tasks)),
            commands: CommandRegistry::new(),
            languages: Languages::new(Arc::clone(&tasks)),
            workspace_folders: WorkspaceFolders::new(Arc::clone(&tasks)),
            on_did_change_configuration: EventEmitter::new(Arc::clone(&tasks)),
            global_state: RwLock::new(Arc::new(MemoryGlobalState::new())),
            secrets: RwLock::new(Arc::new(InMemorySecretStorage::new())),
            fixups: RwLock::new(Arc::new(InMemoryFixupController::new(Arc::clone(&tasks)))),
            client,
            tasks,
        });
        let fixups = host.fixups();
        host.forward_edit_task_events(fixups.as_ref());
        host
    }

    pub fn client_info(&self) -> ClientInfo {
        read(&self.client_info).clone()
    }

    pub fn capabilities(&self) -> ClientCapabilities {
        read(&self.client_info).capabilities.clone()
    }

    pub fn extension_configuration(&self) -> ExtensionConfiguration {
        read(&self.client_info)
            .extension_configuration
            .clone()
            .unwrap_or_default()
    }

    /// Record the client's identity; also feeds the configuration resolver
    pub fn set_client_info(&self, info: ClientInfo) {
        self.progress
            .set_enabled(info.capabilities.progress_bars.is_enabled());
        if let Some(verbose) = info
            .extension_configuration
            .as_ref()
            .and_then(|config| config.verbose_debug)
        {
            self.set_debug_relay(verbose);
        }
        self.configuration.set_client_info(info.clone());
        *write(&self.client_info) = info;
    }

    /// Replace the extension configuration; returns the previous one
    pub fn set_extension_configuration(
        &self,
        configuration: ExtensionConfiguration,
    ) -> ExtensionConfiguration {
        if let Some(verbose) = configuration.verbose_debug {
            self.set_debug_relay(verbose);
        }
        self.configuration
            .set_extension_configuration(configuration.clone());
        write(&self.client_info)
            .extension_configuration
            .replace(configuration)
            .unwrap_or_default()
    }

    pub fn env(&self) -> EnvInfo {
        EnvInfo {
            app_name: read(&self.client_info).name.clone(),
            session_id: self.session_id.clone(),
            language: "en".to_string(),
        }
    }

    pub fn global_state(&self) -> Arc<dyn GlobalStateStore> {
        Arc::clone(&read(&self.global_state))
    }

    pub fn set_global_state(&self, store: Arc<dyn GlobalStateStore>) {
        *write(&self.global_state) = store;
    }

    pub fn secrets(&self) -> Arc<dyn SecretStorage> {
        Arc::clone(&read(&self.secrets))
    }

    pub fn set_secret_storage(&self, storage: Arc<dyn SecretStorage>) {
        *write(&self.secrets) = storage;
    }

    pub fn fixups(&self) -> Arc<dyn FixupController> {
        Arc::clone(&read(&self.fixups))
    }

    /// Install the product's edit task controller
    pub fn set_fixup_controller(&self, controller: Arc<dyn FixupController>) {
        self.forward_edit_task_events(controller.as_ref());
        *write(&self.fixups) = controller;
    }

    fn forward_edit_task_events(&self, controller: &dyn FixupController) {
        let client = self.client.clone();
        let _forward = controller.events().on(move |event: EditTaskEvent| {
            let (task, deleted) = match &event {
                EditTaskEvent::Updated(task) => (task, false),
                EditTaskEvent::Deleted(task) => (task, true),
            };
            match serde_json::to_value(EditTask::from(task)) {
                Ok(wire) if deleted => client.edit_task_did_delete(&wire),
                Ok(wire) => client.edit_task_did_update(&wire),
                Err(e) => warn!("Failed to encode edit task {}: {}", task.id, e),
            }
            async {}
        });
    }

    pub fn set_debug_relay(&self, enabled: bool) {
        self.relay_debug.store(enabled, Ordering::Release);
    }

    /// Log an operator-facing message, relaying it when verbose debugging is on
    pub fn debug_log(&self, message: &str) {
        debug!("{}", message);
        if self.relay_debug.load(Ordering::Acquire) {
            self.client
                .debug_message(DEBUG_CHANNEL, message, DebugLevel::Info);
        }
    }

    /// Report client/server document divergence; the session keeps running
    pub fn report_divergence(&self, divergence: &DocumentDivergence) {
        let description = divergence.describe();
        error!("{}", description);
        eprintln!("{description}");
        self.client
            .debug_message(DEBUG_CHANNEL, &description, DebugLevel::Error);
    }

    /// Propagate a configuration change and wait for every listener
    pub async fn notify_configuration_changed(&self, auth_change: bool) {
        self.on_did_change_configuration
            .fire_and_wait(ConfigurationChangeEvent { auth_change })
            .await;
    }

    /// Clear per-session state for test isolation
    pub fn reset(&self) {
        self.documents.reset();
        self.diagnostics.clear();
        self.panels.clear();
        self.commands.clear_context();
        if let Err(e) = self.global_state().reset() {
            warn!("Failed to reset global state: {}", e);
        }
    }

    /// Current value of a context key set through `setContext`
    pub fn context_value(&self, key: &str) -> Option<Value> {
        self.commands.context_value(key)
    }
}
