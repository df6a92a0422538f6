//! Extension used by the integration tests
//!
//! Registers a chat panel command, commands that use host facades, and one
//! provider of each kind, and records workspace folder and configuration
//! changes.

use async_trait::async_trait;
use ide_agent_lib::client::MessageSeverity;
use ide_agent_lib::documents::AgentTextDocument;
use ide_agent_lib::host::languages::{
    CodeAction, CodeActionProvider, Command, DocumentSelector, InlineCompletionItem,
    InlineCompletionProvider, TriggerKind,
};
use ide_agent_lib::host::workspace::WorkspaceFoldersChangeEvent;
use ide_agent_lib::host::{ConfigurationChangeEvent, CreatedPanel};
use ide_agent_lib::panels::Panel;
use ide_agent_lib::progress::ProgressOptions;
use ide_agent_lib::protocol::{Position, Range};
use ide_agent_lib::{Extension, HostContext, Result};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct TestExtension {
    pub folder_events: Arc<Mutex<Vec<WorkspaceFoldersChangeEvent>>>,
    /// Configuration change listeners that ran to completion
    pub configuration_changes: Arc<AtomicUsize>,
}

struct EchoActions;

#[async_trait]
impl CodeActionProvider for EchoActions {
    async fn provide_code_actions(
        &self,
        _document: &AgentTextDocument,
        _range: Range,
        _trigger: TriggerKind,
        _token: CancellationToken,
    ) -> Result<Vec<CodeAction>> {
        Ok(vec![CodeAction {
            title: "Echo".to_string(),
            kind: Some("quickfix".to_string()),
            command: Some(Command {
                title: "Echo".to_string(),
                command: "test.echo".to_string(),
                arguments: vec![json!("hi")],
            }),
            is_preferred: true,
        }])
    }
}

struct FixedCompletion;

#[async_trait]
impl InlineCompletionProvider for FixedCompletion {
    async fn provide_inline_completions(
        &self,
        _document: &AgentTextDocument,
        position: Position,
        _trigger: TriggerKind,
        _token: CancellationToken,
    ) -> Result<Vec<InlineCompletionItem>> {
        Ok(vec![InlineCompletionItem {
            insert_text: "2;".to_string(),
            range: Some(Range::new(position, position)),
        }])
    }
}

/// Chat panel behaviour: `submit` keeps the panel busy, `finish` ends it
fn wire_chat_panel(panel: &Arc<Panel>) {
    let weak: Weak<Panel> = Arc::downgrade(panel);
    let _listener = panel.on_receive_message.on(move |message: Value| {
        let panel = weak.upgrade();
        async move {
            let Some(panel) = panel else {
                return;
            };
            match message.get("command").and_then(Value::as_str) {
                Some("submit") => {
                    panel
                        .post_message(json!({
                            "type": "transcript",
                            "chatID": "chat-1",
                            "isMessageInProgress": true,
                            "messages": [message.get("text").cloned().unwrap_or(Value::Null)],
                        }))
                        .await;
                }
                Some("finish") => {
                    panel
                        .post_message(json!({
                            "type": "transcript",
                            "chatID": "chat-1",
                            "isMessageInProgress": false,
                            "messages": ["done"],
                        }))
                        .await;
                }
                _ => {}
            }
        }
    });
}

#[async_trait]
impl Extension for TestExtension {
    async fn activate(&self, host: Arc<HostContext>) -> Result<()> {
        let weak = Arc::downgrade(&host);

        let panel_host = weak.clone();
        let _ = host.commands.register("assistant.chat.newPanel", move |_args| {
            let host = panel_host.upgrade();
            async move {
                let Some(host) = host else {
                    return Ok(Value::Null);
                };
                match host.create_webview_panel("assistant.chat", "Chat", json!({}), json!({}))? {
                    CreatedPanel::Generic(panel) => {
                        wire_chat_panel(&panel);
                        Ok(Value::String(panel.id().to_string()))
                    }
                    CreatedPanel::Native(panel) => Ok(Value::String(panel.handle().to_string())),
                }
            }
        });

        let _ = host.commands.register("test.echo", |args| async move {
            Ok(json!({ "echo": args }))
        });

        let progress_host = weak.clone();
        let _ = host.commands.register("test.progress", move |_args| {
            let host = progress_host.upgrade();
            async move {
                let Some(host) = host else {
                    return Ok(Value::Null);
                };
                let options = ProgressOptions {
                    title: Some("Working".to_string()),
                    cancellable: true,
                    location: None,
                };
                host.with_progress(options, |reporter, token| async move {
                    reporter.report(Some("halfway"), Some(50.0));
                    token.cancelled().await;
                    Ok(json!("cancelled"))
                })
                .await
            }
        });

        let ask_host = weak;
        let _ = host.commands.register("test.ask", move |_args| {
            let host = ask_host.upgrade();
            async move {
                let Some(host) = host else {
                    return Ok(Value::Null);
                };
                let choice = host
                    .show_message(
                        MessageSeverity::Information,
                        "Continue?",
                        vec!["Yes".to_string(), "No".to_string()],
                    )
                    .await?;
                Ok(json!(choice))
            }
        });

        host.languages
            .code_actions
            .register(DocumentSelector::all(), Arc::new(EchoActions));
        host.languages
            .inline_completions
            .register(DocumentSelector::all(), Arc::new(FixedCompletion));

        let events = Arc::clone(&self.folder_events);
        let _ = host
            .workspace_folders
            .on_did_change
            .on(move |event: WorkspaceFoldersChangeEvent| {
                events.lock().unwrap().push(event);
                async {}
            });

        let changes = Arc::clone(&self.configuration_changes);
        let _ = host
            .on_did_change_configuration
            .on(move |_event: ConfigurationChangeEvent| {
                let changes = Arc::clone(&changes);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    changes.fetch_add(1, Ordering::SeqCst);
                }
            });
        Ok(())
    }
}
