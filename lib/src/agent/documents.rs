//! `textDocument/*` and `workspaceFolder/*` notifications
//!
//! These run strictly in arrival order on the connection's notification
//! worker. Listeners of the resulting host events are awaited before the next
//! notification starts, so any request that follows sees the settled state.

use super::Agent;
use crate::error::Result;
use crate::protocol::{ProtocolTextDocument, WorkspaceFolderChangeParams};
use std::sync::Arc;
use tracing::{debug, warn};

pub(super) fn register(agent: &Arc<Agent>) {
    agent.register_notification("textDocument/didOpen", did_open);
    agent.register_notification("textDocument/didChange", did_change);
    agent.register_notification("textDocument/didFocus", did_focus);
    agent.register_notification("textDocument/didClose", did_close);
    agent.register_notification("textDocument/didSave", did_save);
    agent.register_notification("workspaceFolder/didChange", did_change_folders);
}

async fn did_open(agent: Arc<Agent>, document: ProtocolTextDocument) -> Result<()> {
    let host = &agent.host;
    let opened = host.documents.load_document(&document);
    debug!("Opened {} ({})", opened.uri, opened.language_id);
    host.documents.on_did_open.fire_and_wait(opened.clone()).await;
    let editor = host.documents.new_text_editor(&opened);
    host.documents.set_active_text_editor(Some(editor)).await;
    Ok(())
}

async fn did_change(agent: Arc<Agent>, document: ProtocolTextDocument) -> Result<()> {
    let host = &agent.host;
    let update = host.documents.load_document_with_changes(&document);
    if let Some(divergence) = &update.divergence {
        host.report_divergence(divergence);
    }

    let editor = host.documents.new_text_editor(&update.document);
    if host.documents.active_text_editor().as_ref() != Some(&editor) {
        host.documents.set_active_text_editor(Some(editor)).await;
    }
    if !update.event.content_changes.is_empty() {
        host.documents.on_did_change.fire_and_wait(update.event).await;
    }
    Ok(())
}

async fn did_focus(agent: Arc<Agent>, document: ProtocolTextDocument) -> Result<()> {
    let host = &agent.host;
    let focused = host.documents.load_document(&document);
    let editor = host.documents.new_text_editor(&focused);
    host.documents.set_active_text_editor(Some(editor)).await;
    Ok(())
}

async fn did_close(agent: Arc<Agent>, document: ProtocolTextDocument) -> Result<()> {
    let host = &agent.host;
    let Some(closed) = host.documents.remove(&document.uri) else {
        warn!("didClose for unknown document {}", document.uri);
        return Ok(());
    };
    host.documents.on_did_close.fire_and_wait(closed).await;
    let was_active = host
        .documents
        .active_text_editor()
        .is_some_and(|editor| editor.uri == document.uri);
    if was_active {
        host.documents.set_active_text_editor(None).await;
    }
    Ok(())
}

async fn did_save(agent: Arc<Agent>, document: ProtocolTextDocument) -> Result<()> {
    let host = &agent.host;
    let saved = match host.documents.get(&document.uri) {
        Some(existing) if document.content.is_none() => existing,
        _ => host.documents.load_document(&document),
    };
    host.documents.on_did_save.fire_and_wait(saved).await;
    Ok(())
}

async fn did_change_folders(agent: Arc<Agent>, params: WorkspaceFolderChangeParams) -> Result<()> {
    agent.host.replace_workspace_folders(&params.uris).await;
    Ok(())
}
