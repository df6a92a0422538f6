//! Window facade: messages, documents shown to the user, webviews, progress

use super::HostContext;
use crate::capabilities::{Capability, ShowWindowMessage, Webview};
use crate::client::{
    MessageSeverity, OpenUntitledDocumentParams, ShowDocumentParams, ShowMessageParams,
};
use crate::documents::{AgentTextDocument, TextEditor};
use crate::error::{AgentError, Result};
use crate::panels::{NativePanel, Panel};
use crate::progress::{ProgressOptions, ProgressReporter};
use crate::protocol::{DebugLevel, ProtocolTextDocument, Range};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Panel handed back to the product by `create_webview_panel`
#[derive(Debug, Clone)]
pub enum CreatedPanel {
    Generic(Arc<Panel>),
    Native(Arc<NativePanel>),
}

impl CreatedPanel {
    pub fn id(&self) -> &str {
        match self {
            CreatedPanel::Generic(panel) => panel.id(),
            CreatedPanel::Native(panel) => panel.handle(),
        }
    }
}

impl HostContext {
    /// Show a message to the user
    ///
    /// Clients that answer `window/showMessage` requests get one and can pick an
    /// item; for everyone else the message is only logged and relayed.
    pub async fn show_message(
        &self,
        severity: MessageSeverity,
        message: &str,
        items: Vec<String>,
    ) -> Result<Option<String>> {
        match self.capabilities().show_window_message {
            ShowWindowMessage::Request => {
                self.client
                    .show_message(&ShowMessageParams {
                        severity,
                        message: message.to_string(),
                        options: None,
                        items,
                    })
                    .await
            }
            ShowWindowMessage::Notification => {
                let level = match severity {
                    MessageSeverity::Error => {
                        error!("{}", message);
                        DebugLevel::Error
                    }
                    MessageSeverity::Warning => {
                        warn!("{}", message);
                        DebugLevel::Warning
                    }
                    MessageSeverity::Information => {
                        info!("{}", message);
                        DebugLevel::Info
                    }
                };
                self.client.debug_message("window", message, level);
                Ok(None)
            }
        }
    }

    pub async fn show_text_document(
        &self,
        uri: &str,
        selection: Option<Range>,
        preserve_focus: bool,
    ) -> Result<bool> {
        self.capabilities()
            .require(Capability::ShowDocument, "textDocument/show")?;
        self.client
            .show_document(&ShowDocumentParams {
                uri: uri.to_string(),
                selection,
                preserve_focus,
            })
            .await
    }

    /// Ask the client to open an untitled document and track it locally
    pub async fn open_untitled_document(
        &self,
        uri: &str,
        content: Option<String>,
        language: Option<String>,
    ) -> Result<AgentTextDocument> {
        self.capabilities().require(
            Capability::UntitledDocuments,
            "textDocument/openUntitledDocument",
        )?;
        let opened = self
            .client
            .open_untitled_document(&OpenUntitledDocumentParams {
                uri: uri.to_string(),
                content: content.clone(),
                language: language.clone(),
            })
            .await?;
        if !opened {
            return Err(AgentError::NotFound(format!(
                "Client refused to open untitled document {uri}"
            )));
        }

        let mut document = ProtocolTextDocument::new(uri, Some(content.unwrap_or_default()));
        document.language_id = language;
        Ok(self.documents.load_document(&document))
    }

    pub fn active_text_editor(&self) -> Option<TextEditor> {
        self.documents.active_text_editor()
    }

    pub fn visible_text_editors(&self) -> Vec<TextEditor> {
        self.documents.visible_text_editors()
    }

    /// Create a webview panel according to the client's rendering model
    pub fn create_webview_panel(
        &self,
        view_type: &str,
        title: &str,
        show_options: Value,
        options: Value,
    ) -> Result<CreatedPanel> {
        let capabilities = self.capabilities();
        match capabilities.webview {
            Webview::None => Err(AgentError::capability(
                Capability::Webview.wire_name(),
                "webview/createWebviewPanel",
            )),
            Webview::Native => Ok(CreatedPanel::Native(self.panels.create_native_panel(
                &self.client,
                view_type,
                title,
                show_options,
                options,
            ))),
            Webview::Agentic => {
                let panel = self
                    .panels
                    .create_panel(view_type, title, show_options, options);
                let client = self.client.clone();
                let id = panel.id().to_string();
                let encoding = capabilities.webview_messages;
                let _forward = panel.on_post_message.on(move |message: Value| {
                    client.webview_post_message(&id, &message, encoding);
                    async {}
                });
                Ok(CreatedPanel::Generic(panel))
            }
        }
    }

    /// Run `task` under a progress token the client can cancel
    pub async fn with_progress<F, Fut, T>(&self, options: ProgressOptions, task: F) -> Result<T>
    where
        F: FnOnce(ProgressReporter, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.progress.with_progress(options, task).await
    }

    pub async fn open_external(&self, uri: &str) -> Result<bool> {
        debug!("Opening external URI {}", uri);
        self.client.open_external(uri).await
    }
}
