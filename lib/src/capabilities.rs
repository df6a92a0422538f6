//! Client capability negotiation
//!
//! Every optional behaviour of the agent is gated by a capability the client
//! declares in `initialize`. Each capability is a small enum with an explicit
//! "unsupported" variant so callers can match exhaustively instead of probing
//! an untyped map.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};

/// Simple on/off capability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Toggle {
    #[default]
    None,
    Enabled,
}

impl Toggle {
    pub fn is_enabled(self) -> bool {
        self == Toggle::Enabled
    }
}

/// How `window/showMessage` reaches the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShowWindowMessage {
    /// Only logged locally and relayed as a `debug/message`
    #[default]
    Notification,
    /// Forwarded as a request so the client can answer with a chosen item
    Request,
}

/// Webview rendering model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Webview {
    #[default]
    None,
    /// The agent emulates panels and the client renders their messages
    Agentic,
    /// The client owns rendering; the agent only tracks panel lifecycles
    Native,
}

/// Encoding of `webview/postMessage` payloads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WebviewMessages {
    #[default]
    ObjectEncoded,
    StringEncoded,
}

/// Where global state lives for the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GlobalStateMode {
    /// Discarded when the process exits
    #[default]
    Stateless,
    /// Persisted by the agent using its configured backend
    ServerManaged,
    /// Persisted by the client; not supported, treated as stateless
    ClientManaged,
}

/// Capability flags as declared on the wire
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    #[serde(default)]
    pub code_actions: Toggle,
    #[serde(default)]
    pub code_lenses: Toggle,
    #[serde(default)]
    pub ignore: Toggle,
    #[serde(default)]
    pub edit_workspace: Toggle,
    #[serde(default)]
    pub show_document: Toggle,
    #[serde(default)]
    pub untitled_documents: Toggle,
    #[serde(default)]
    pub progress_bars: Toggle,
    #[serde(default)]
    pub show_window_message: ShowWindowMessage,
    #[serde(default)]
    pub webview: Webview,
    #[serde(default)]
    pub webview_messages: WebviewMessages,
    #[serde(default)]
    pub global_state: GlobalStateMode,
}

/// Named features that can be required by an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    CodeActions,
    CodeLenses,
    Ignore,
    EditWorkspace,
    ShowDocument,
    UntitledDocuments,
    ProgressBars,
    Webview,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::CodeActions,
        Capability::CodeLenses,
        Capability::Ignore,
        Capability::EditWorkspace,
        Capability::ShowDocument,
        Capability::UntitledDocuments,
        Capability::ProgressBars,
        Capability::Webview,
    ];

    /// Wire name of the capability field
    pub fn wire_name(self) -> &'static str {
        match self {
            Capability::CodeActions => "codeActions",
            Capability::CodeLenses => "codeLenses",
            Capability::Ignore => "ignore",
            Capability::EditWorkspace => "editWorkspace",
            Capability::ShowDocument => "showDocument",
            Capability::UntitledDocuments => "untitledDocuments",
            Capability::ProgressBars => "progressBars",
            Capability::Webview => "webview",
        }
    }
}

impl ClientCapabilities {
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::CodeActions => self.code_actions.is_enabled(),
            Capability::CodeLenses => self.code_lenses.is_enabled(),
            Capability::Ignore => self.ignore.is_enabled(),
            Capability::EditWorkspace => self.edit_workspace.is_enabled(),
            Capability::ShowDocument => self.show_document.is_enabled(),
            Capability::UntitledDocuments => self.untitled_documents.is_enabled(),
            Capability::ProgressBars => self.progress_bars.is_enabled(),
            Capability::Webview => self.webview != Webview::None,
        }
    }

    /// Fail with a descriptive error naming the missing capability
    pub fn require(&self, capability: Capability, operation: &str) -> Result<()> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(AgentError::capability(capability.wire_name(), operation))
        }
    }
}
