//! `testing/*` requests used by end-to-end suites to inspect agent state

use super::Agent;
use crate::error::Result;
use crate::host::Diagnostic;
use crate::protocol::{WorkspaceDocumentsParams, WorkspaceDocumentsResult};
use crate::sync::lock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
struct DiagnosticsParams {
    uri: String,
}

#[derive(Debug, Serialize)]
struct DiagnosticsResult {
    diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Deserialize)]
struct ConfigurationParams {
    section: String,
}

pub(super) fn register(agent: &Arc<Agent>) {
    agent.register_request("testing/workspaceDocuments", workspace_documents);
    agent.register_request("testing/reset", |agent, _: Value, _token| async move {
        info!("Resetting agent state");
        agent.host.reset();
        lock(&agent.code_actions).clear();
        Ok(Value::Null)
    });
    agent.register_request(
        "testing/awaitPendingPromises",
        |agent, _: Value, _token| async move {
            agent.host.tasks.settle().await;
            Ok(Value::Null)
        },
    );
    agent.register_request(
        "testing/diagnostics",
        |agent, params: DiagnosticsParams, _token| async move {
            Ok(DiagnosticsResult {
                diagnostics: agent.host.diagnostics.get(&params.uri),
            })
        },
    );
    agent.register_request(
        "testing/configuration",
        |agent, params: ConfigurationParams, _token| async move {
            Ok(agent
                .host
                .configuration
                .get(&params.section)
                .unwrap_or(Value::Null))
        },
    );
}

async fn workspace_documents(
    agent: Arc<Agent>,
    params: WorkspaceDocumentsParams,
    _token: tokio_util::sync::CancellationToken,
) -> Result<WorkspaceDocumentsResult> {
    let mut documents: Vec<_> = agent
        .host
        .documents
        .all()
        .iter()
        .filter(|document| {
            params
                .uris
                .as_ref()
                .map_or(true, |uris| uris.contains(&document.uri))
        })
        .map(|document| document.to_protocol())
        .collect();
    documents.sort_by(|a, b| a.uri.cmp(&b.uri));
    Ok(WorkspaceDocumentsResult { documents })
}
