//! Typed proxy for calls from the agent to the client

use crate::capabilities::WebviewMessages;
use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::{DebugLevel, DebugMessage, Range};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSeverity {
    Error,
    Warning,
    Information,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowMessageParams {
    pub severity: MessageSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ShowMessageOptions>,
    #[serde(default)]
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowMessageOptions {
    #[serde(default)]
    pub modal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Replacement of a range inside a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextEdit {
    pub range: Range,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkspaceEditOperation {
    EditFile {
        uri: String,
        edits: Vec<TextEdit>,
    },
    #[serde(rename_all = "camelCase")]
    CreateFile {
        uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text_contents: Option<String>,
        #[serde(default)]
        overwrite: bool,
    },
    #[serde(rename_all = "camelCase")]
    RenameFile {
        old_uri: String,
        new_uri: String,
    },
    DeleteFile {
        uri: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceEditParams {
    pub operations: Vec<WorkspaceEditOperation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowDocumentParams {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Range>,
    #[serde(default)]
    pub preserve_focus: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenUntitledDocumentParams {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Parameters of `webview/createWebviewPanel` for client-rendered panels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWebviewPanelParams {
    pub handle: String,
    pub view_type: String,
    pub title: String,
    pub show_options: Value,
    pub options: Value,
}

#[derive(Clone)]
pub struct ClientProxy {
    connection: Arc<Connection>,
}

impl std::fmt::Debug for ClientProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientProxy")
            .field("closed", &self.connection.is_closed())
            .finish()
    }
}

impl ClientProxy {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    fn notify<P: Serialize>(&self, method: &str, params: P) {
        if let Err(e) = self.connection.notify(method, params) {
            warn!("Failed to send {} notification: {}", method, e);
        }
    }

    /// Ask the client to show a message; resolves to the chosen item
    pub async fn show_message(&self, params: &ShowMessageParams) -> Result<Option<String>> {
        self.connection.request("window/showMessage", params).await
    }

    pub async fn apply_workspace_edit(&self, params: &WorkspaceEditParams) -> Result<bool> {
        self.connection.request("workspace/edit", params).await
    }

    pub async fn show_document(&self, params: &ShowDocumentParams) -> Result<bool> {
        self.connection.request("textDocument/show", params).await
    }

    pub async fn open_untitled_document(&self, params: &OpenUntitledDocumentParams) -> Result<bool> {
        self.connection
            .request("textDocument/openUntitledDocument", params)
            .await
    }

    pub async fn open_external(&self, uri: &str) -> Result<bool> {
        self.connection
            .request("env/openExternal", json!({ "uri": uri }))
            .await
    }

    pub fn debug_message(&self, channel: &str, message: &str, level: DebugLevel) {
        self.notify(
            "debug/message",
            DebugMessage {
                channel: channel.to_string(),
                message: message.to_string(),
                level: Some(level),
            },
        );
    }

    pub fn progress_start(&self, id: &str, options: &Value) {
        self.notify("progress/start", json!({ "id": id, "options": options }));
    }

    pub fn progress_report(&self, id: &str, message: Option<&str>, increment: Option<f64>) {
        self.notify(
            "progress/report",
            json!({ "id": id, "message": message, "increment": increment }),
        );
    }

    pub fn progress_end(&self, id: &str) {
        self.notify("progress/end", json!({ "id": id }));
    }

    pub fn display_code_lenses(&self, params: &Value) {
        self.notify("codeLenses/display", params);
    }

    pub fn webview_post_message(&self, id: &str, message: &Value, encoding: WebviewMessages) {
        match encoding {
            WebviewMessages::ObjectEncoded => {
                self.notify("webview/postMessage", json!({ "id": id, "message": message }))
            }
            WebviewMessages::StringEncoded => self.notify(
                "webview/postMessageStringEncoded",
                json!({ "id": id, "stringEncodedMessage": message.to_string() }),
            ),
        }
    }

    pub fn webview_create_panel(&self, params: &CreateWebviewPanelParams) {
        self.notify("webview/createWebviewPanel", params);
    }

    pub fn webview_set_title(&self, handle: &str, title: &str) {
        self.notify("webview/setTitle", json!({ "handle": handle, "title": title }));
    }

    pub fn webview_dispose(&self, handle: &str) {
        self.notify("webview/dispose", json!({ "handle": handle }));
    }

    pub fn edit_task_did_update(&self, task: &Value) {
        self.notify("editTask/didUpdate", task);
    }

    pub fn edit_task_did_delete(&self, task: &Value) {
        self.notify("editTask/didDelete", task);
    }

    pub fn auth_status_did_update(&self, status: &Value) {
        self.notify("authStatus/didUpdate", status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_edit_wire_shape() {
        let edit = WorkspaceEditParams {
            operations: vec![
                WorkspaceEditOperation::EditFile {
                    uri: "file:///a.ts".to_string(),
                    edits: vec![TextEdit {
                        range: Range::default(),
                        value: "x".to_string(),
                    }],
                },
                WorkspaceEditOperation::DeleteFile {
                    uri: "file:///b.ts".to_string(),
                },
            ],
        };
        let value = serde_json::to_value(&edit).unwrap();
        assert_eq!(value["operations"][0]["type"], "edit-file");
        assert_eq!(value["operations"][1]["type"], "delete-file");
        assert_eq!(value["operations"][0]["edits"][0]["value"], "x");
    }

    #[test]
    fn test_show_message_wire_shape() {
        let params = ShowMessageParams {
            severity: MessageSeverity::Warning,
            message: "careful".to_string(),
            options: Some(ShowMessageOptions {
                modal: true,
                detail: None,
            }),
            items: vec!["OK".to_string()],
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["severity"], "warning");
        assert_eq!(value["options"]["modal"], true);
        assert_eq!(value["items"][0], "OK");
    }
}
