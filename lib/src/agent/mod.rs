//! JSON-RPC dispatcher
//!
//! The [`Agent`] owns the session: it wires the connection to the host
//! context, runs the `initialize` handshake, and keeps the pending
//! authentication gate that authenticated requests wait on.
//!
//! Handlers are registered by method name on the connection; registering a
//! method twice keeps the last handler. Method groups live in submodules.

mod chat;
mod documents;
mod edits;
mod testing;

use crate::auth::{AuthManager, AuthProvider, AuthStatus, StaticAuthProvider};
use crate::capabilities::ClientCapabilities;
use crate::client::ClientProxy;
use crate::config::AgentConfig;
use crate::connection::{Connection, ExitReason};
use crate::error::{AgentError, Result};
use crate::extension::Extension;
use crate::host::languages::CodeAction;
use crate::host::HostContext;
use crate::pending::PendingTasks;
use crate::protocol::{ClientInfo, ExtensionConfiguration, IdParams, ServerInfo};
use crate::recording::JsonlRecorder;
use crate::storage;
use crate::sync::lock;
use crate::transport::{MessageSink, MessageSource};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SERVER_NAME: &str = "ide-agent";

/// Resolves once the latest configuration change has been applied
type AuthGate = Shared<BoxFuture<'static, AuthStatus>>;

pub struct Agent {
    config: AgentConfig,
    connection: Arc<Connection>,
    host: Arc<HostContext>,
    auth: AuthManager,
    extension: Arc<dyn Extension>,
    pending_auth: Mutex<AuthGate>,
    code_actions: Mutex<HashMap<String, CodeAction>>,
}

fn parse_params<P: DeserializeOwned>(params: Value) -> Result<P> {
    // Omitted params read as an empty object so optional fields can default
    let params = match params {
        Value::Null => Value::Object(serde_json::Map::new()),
        params => params,
    };
    serde_json::from_value(params).map_err(|e| AgentError::InvalidParams(e.to_string()))
}

impl Agent {
    pub fn new(config: AgentConfig, extension: Arc<dyn Extension>) -> Result<Arc<Self>> {
        Self::with_auth_provider(config, extension, Box::new(StaticAuthProvider))
    }

    pub fn with_auth_provider(
        config: AgentConfig,
        extension: Arc<dyn Extension>,
        provider: Box<dyn AuthProvider>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let connection = Connection::new();
        if let Some(path) = &config.record_path {
            connection.set_recorder(Some(Arc::new(JsonlRecorder::create(path)?)));
        }

        let tasks = PendingTasks::new(config.testing.deterministic);
        let host = HostContext::new(
            ClientProxy::new(Arc::clone(&connection)),
            tasks,
            &config.configuration_namespace,
        );
        host.set_debug_relay(config.server.verbose_debug);

        let agent = Arc::new(Self {
            config,
            connection,
            host,
            auth: AuthManager::new(provider),
            extension,
            pending_auth: Mutex::new(future::ready(AuthStatus::Unauthenticated).boxed().shared()),
            code_actions: Mutex::new(HashMap::new()),
        });

        agent.register_lifecycle_handlers();
        documents::register(&agent);
        chat::register(&agent);
        edits::register(&agent);
        testing::register(&agent);
        edits::forward_code_lenses(&agent.host);
        Ok(agent)
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn host(&self) -> &Arc<HostContext> {
        &self.host
    }

    pub fn auth_status(&self) -> AuthStatus {
        self.auth.status()
    }

    /// Serve until the client exits or the stream closes
    pub async fn run(
        self: &Arc<Self>,
        source: Box<dyn MessageSource>,
        sink: Box<dyn MessageSink>,
    ) -> ExitReason {
        self.connection.run(source, sink).await
    }

    /// Send a request to the client
    pub async fn request<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R> {
        self.connection.request(method, params).await
    }

    /// Send a notification to the client
    pub fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        self.connection.notify(method, params)
    }

    pub(crate) fn register_request<P, R, F, Fut>(self: &Arc<Self>, method: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(Arc<Self>, P, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let agent = Arc::downgrade(self);
        self.connection.on_request(method, move |params, token| {
            let work = match (agent.upgrade(), parse_params::<P>(params)) {
                (Some(agent), Ok(params)) => Ok(handler(agent, params, token)),
                (None, _) => Err(AgentError::ConnectionClosed),
                (_, Err(e)) => Err(e),
            };
            async move {
                let result = work?.await?;
                Ok(serde_json::to_value(result)?)
            }
        });
    }

    /// Register a request that first waits for settled authentication state
    ///
    /// The gate is captured when the request arrives, so a configuration
    /// change received just before it is always observed. Under deterministic
    /// testing the request also waits for all background work.
    pub(crate) fn register_authenticated_request<P, R, F, Fut>(
        self: &Arc<Self>,
        method: &str,
        handler: F,
    ) where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(Arc<Self>, P, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let agent = Arc::downgrade(self);
        self.connection.on_request(method, move |params, token| {
            let handler = Arc::clone(&handler);
            let agent = agent.upgrade();
            let gate = agent.as_ref().map(|agent| agent.auth_gate());
            async move {
                let agent = agent.ok_or(AgentError::ConnectionClosed)?;
                if let Some(gate) = gate {
                    gate.await;
                }
                if agent.host.tasks.is_tracking() {
                    agent.host.tasks.settle().await;
                }
                let params = parse_params::<P>(params)?;
                let result = handler(agent, params, token).await?;
                Ok(serde_json::to_value(result)?)
            }
        });
    }

    pub(crate) fn register_notification<P, F, Fut>(self: &Arc<Self>, method: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(Arc<Self>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let agent = Arc::downgrade(self);
        self.connection.on_notification(method, move |params| {
            let work = match (agent.upgrade(), parse_params::<P>(params)) {
                (Some(agent), Ok(params)) => Ok(handler(agent, params)),
                (None, _) => Err(AgentError::ConnectionClosed),
                (_, Err(e)) => Err(e),
            };
            async move { work?.await }
        });
    }

    fn auth_gate(&self) -> AuthGate {
        lock(&self.pending_auth).clone()
    }

    fn register_lifecycle_handlers(self: &Arc<Self>) {
        self.register_request("initialize", |agent, info: ClientInfo, _token| async move {
            agent.initialize(info).await
        });
        self.register_notification("initialized", |_agent, _: Value| async { Ok(()) });
        self.register_request("shutdown", |agent, _: Value, _token| {
            agent.shutdown();
            async { Ok(Value::Null) }
        });
        self.register_notification("exit", |agent, _: Value| {
            agent.connection.exit(ExitReason::Requested);
            async { Ok(()) }
        });

        self.register_notification(
            "extensionConfiguration/didChange",
            |agent, config: ExtensionConfiguration| {
                let gate = agent.begin_configuration_change(config, false);
                async move {
                    gate.await;
                    Ok(())
                }
            },
        );
        self.register_request(
            "extensionConfiguration/change",
            |agent, config: ExtensionConfiguration, _token| {
                let gate = agent.begin_configuration_change(config, false);
                async move { Ok(gate.await) }
            },
        );
        self.register_authenticated_request(
            "extensionConfiguration/status",
            |agent, _: Value, _token| async move { Ok(agent.auth.status()) },
        );

        self.register_notification("progress/cancel", |agent, params: IdParams| {
            agent.host.progress.cancel(&params.id);
            async { Ok(()) }
        });
    }

    async fn initialize(self: Arc<Self>, info: ClientInfo) -> Result<ServerInfo> {
        info!(
            "Initializing session for {} {} ({:?})",
            info.name, info.version, info.workspace_root_uri
        );
        let workspace_root = info.workspace_root_uri.clone();
        let extension_configuration = info.extension_configuration.clone();
        let capabilities = info.capabilities.clone();

        self.host.set_client_info(info);
        self.install_storage(&capabilities);
        if let Some(root) = workspace_root {
            self.host.replace_workspace_folders(&[root]).await;
        }

        self.extension
            .activate(Arc::clone(&self.host))
            .await
            .map_err(|e| match e {
                AgentError::ActivationFailed(_) => e,
                other => AgentError::ActivationFailed(other.to_string()),
            })?;

        let status = match extension_configuration {
            Some(config) => self.begin_configuration_change(config, true).await,
            None => self.auth.status(),
        };

        Ok(ServerInfo {
            name: SERVER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            authenticated: status.authenticated(),
            auth_status: status,
        })
    }

    fn install_storage(&self, capabilities: &ClientCapabilities) {
        match storage::open_global_state(&self.config.storage, capabilities.global_state) {
            Ok(store) => self.host.set_global_state(store),
            Err(e) => warn!("Global state unavailable, keeping it in memory: {}", e),
        }
        match storage::open_secret_storage(&self.config.storage) {
            Ok(secrets) => self.host.set_secret_storage(secrets),
            Err(e) => warn!("Secret storage unavailable, keeping it in memory: {}", e),
        }
    }

    fn shutdown(&self) {
        info!("Shutdown requested");
        if let Some(recorder) = self.connection.recorder() {
            recorder.stop();
        }
    }

    /// Install a new pending authentication gate for `config`
    ///
    /// Later changes replace the gate; requests already waiting on an older
    /// one finish against the state it produced.
    fn begin_configuration_change(
        self: &Arc<Self>,
        config: ExtensionConfiguration,
        force_auth: bool,
    ) -> AuthGate {
        let agent = Arc::downgrade(self);
        let gate = async move {
            match agent.upgrade() {
                Some(agent) => agent.apply_configuration(config, force_auth).await,
                None => AuthStatus::Unauthenticated,
            }
        }
        .boxed()
        .shared();
        *lock(&self.pending_auth) = gate.clone();
        gate
    }

    async fn apply_configuration(
        &self,
        config: ExtensionConfiguration,
        force_auth: bool,
    ) -> AuthStatus {
        let previous = self.host.set_extension_configuration(config.clone());
        if !force_auth && !previous.is_auth_change(&config) {
            debug!("Configuration changed without touching credentials");
            self.host.notify_configuration_changed(false).await;
            return self.auth.status();
        }

        // Chat state does not carry over to another identity
        self.host.panels.clear();
        let status = self.auth.authenticate(&config).await;
        match serde_json::to_value(&status) {
            Ok(wire) => self.host.client.auth_status_did_update(&wire),
            Err(e) => warn!("Failed to encode auth status: {}", e),
        }
        self.host.notify_configuration_changed(true).await;
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::NoopExtension;
    use crate::protocol::WorkspaceDocumentsParams;

    #[test]
    fn test_parse_params_reports_invalid_params() {
        let err = parse_params::<IdParams>(serde_json::json!({"nope": 1})).unwrap_err();
        assert_eq!(err.to_json_rpc_error(), -32602);
        let ok: IdParams = parse_params(serde_json::json!({"id": "p1"})).unwrap();
        assert_eq!(ok.id, "p1");
    }

    #[test]
    fn test_parse_params_treats_null_as_empty_object() {
        let params: WorkspaceDocumentsParams = parse_params(Value::Null).unwrap();
        assert_eq!(params, WorkspaceDocumentsParams::default());
        let err = parse_params::<IdParams>(Value::Null).unwrap_err();
        assert_eq!(err.to_json_rpc_error(), -32602);
    }

    #[test]
    fn test_new_registers_lifecycle_methods() {
        let agent = Agent::new(AgentConfig::default(), Arc::new(NoopExtension)).unwrap();
        for method in [
            "initialize",
            "shutdown",
            "extensionConfiguration/change",
            "extensionConfiguration/status",
            "chat/submitMessage",
            "editTask/accept",
            "testing/workspaceDocuments",
        ] {
            assert!(agent.connection().has_request_handler(method), "{method}");
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = AgentConfig::default();
        config.configuration_namespace = "a.b".to_string();
        assert!(Agent::new(config, Arc::new(NoopExtension)).is_err());
    }

    #[tokio::test]
    async fn test_configuration_change_clears_panels_on_auth_change() {
        let agent = Agent::new(AgentConfig::default(), Arc::new(NoopExtension)).unwrap();
        agent
            .host()
            .panels
            .create_panel("chat", "Chat", Value::Null, Value::Null);

        let status = agent
            .begin_configuration_change(
                ExtensionConfiguration {
                    server_endpoint: "https://example.com/".to_string(),
                    access_token: Some("token".to_string()),
                    ..Default::default()
                },
                false,
            )
            .await;
        assert!(status.authenticated());
        assert!(agent.host().panels.is_empty());

        // Same credentials: no re-authentication, panels survive
        agent
            .host()
            .panels
            .create_panel("chat", "Chat", Value::Null, Value::Null);
        let status = agent
            .begin_configuration_change(
                ExtensionConfiguration {
                    server_endpoint: "https://example.com/".to_string(),
                    access_token: Some("token".to_string()),
                    codebase: Some("github.com/acme/app".to_string()),
                    ..Default::default()
                },
                false,
            )
            .await;
        assert!(status.authenticated());
        assert_eq!(agent.host().panels.len(), 1);
    }
}
