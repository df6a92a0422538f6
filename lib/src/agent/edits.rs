//! Edit tasks, code actions, completions, commands and diagnostics

use super::Agent;
use crate::capabilities::Capability;
use crate::documents::AgentTextDocument;
use crate::edit_tasks::EditTask;
use crate::error::{AgentError, Result};
use crate::events::Subscription;
use crate::host::languages::{ProtocolCodeLens, ProviderEvent, TriggerKind};
use crate::host::{HostContext, ProtocolDiagnostic};
use crate::protocol::{ExecuteCommandParams, IdParams, Location, Position, Range};
use crate::sync::lock;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ulid::Ulid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FoldingRangeParams {
    uri: String,
    range: Range,
}

#[derive(Debug, Serialize)]
struct FoldingRangeResult {
    ranges: Vec<Range>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProvideCodeActionsParams {
    location: Location,
    trigger_kind: TriggerKind,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProtocolCodeAction {
    id: String,
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    is_preferred: bool,
    #[serde(rename = "commandID", skip_serializing_if = "Option::is_none")]
    command_id: Option<String>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProvideCodeActionsResult {
    code_actions: Vec<ProtocolCodeAction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AutocompleteParams {
    uri: String,
    position: Position,
    #[serde(default = "default_trigger_kind")]
    trigger_kind: TriggerKind,
}

fn default_trigger_kind() -> TriggerKind {
    TriggerKind::Automatic
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AutocompleteItem {
    id: String,
    insert_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    range: Option<Range>,
}

#[derive(Debug, Default, Serialize)]
struct AutocompleteResult {
    items: Vec<AutocompleteItem>,
}

#[derive(Debug, Deserialize)]
struct PublishDiagnosticsParams {
    diagnostics: Vec<ProtocolDiagnostic>,
}

pub(super) fn register(agent: &Arc<Agent>) {
    agent.register_authenticated_request("editTask/accept", |agent, params: IdParams, _token| {
        async move {
            agent.host.fixups().accept(&params.id).await?;
            Ok(Value::Null)
        }
    });
    agent.register_authenticated_request("editTask/undo", |agent, params: IdParams, _token| {
        async move {
            agent.host.fixups().undo(&params.id).await?;
            Ok(Value::Null)
        }
    });
    agent.register_authenticated_request("editTask/cancel", |agent, params: IdParams, _token| {
        async move {
            agent.host.fixups().cancel(&params.id).await?;
            Ok(Value::Null)
        }
    });
    agent.register_authenticated_request("editTask/retry", |agent, params: IdParams, _token| {
        async move {
            let retried = agent.host.fixups().retry(&params.id).await?;
            Ok(retried.as_ref().map(EditTask::from))
        }
    });
    agent.register_authenticated_request(
        "editTask/getTaskDetails",
        |agent, params: IdParams, _token| async move {
            Ok(agent.host.fixups().task(&params.id).as_ref().map(EditTask::from))
        },
    );
    agent.register_authenticated_request("editTask/getFoldingRanges", folding_ranges);

    agent.register_authenticated_request("codeActions/provide", provide_code_actions);
    agent.register_authenticated_request("codeActions/trigger", trigger_code_action);
    agent.register_authenticated_request("autocomplete/execute", autocomplete);

    agent.register_authenticated_request(
        "command/execute",
        |agent, params: ExecuteCommandParams, _token| async move {
            agent
                .host
                .commands
                .execute(&params.command, params.arguments)
                .await
        },
    );
    agent.register_authenticated_request(
        "diagnostics/publish",
        |agent, params: PublishDiagnosticsParams, _token| async move {
            let changed = agent.host.diagnostics.publish(params.diagnostics);
            debug!("Published diagnostics for {} documents", changed.len());
            Ok(Value::Null)
        },
    );
}

async fn document(host: &HostContext, uri: &str) -> Option<AgentTextDocument> {
    match host.open_text_document(uri).await {
        Ok(document) => Some(document),
        Err(e) => {
            warn!("Document {} is not available: {}", uri, e);
            None
        }
    }
}

/// Folding ranges of the document that overlap the requested range
async fn folding_ranges(
    agent: Arc<Agent>,
    params: FoldingRangeParams,
    token: CancellationToken,
) -> Result<FoldingRangeResult> {
    let mut ranges = Vec::new();
    let Some(document) = document(&agent.host, &params.uri).await else {
        return Ok(FoldingRangeResult { ranges });
    };

    for provider in agent.host.languages.folding_ranges.providers_for(&document) {
        let found = provider
            .provide_folding_ranges(&document, token.clone())
            .await?;
        for folding in found {
            if folding.end < params.range.start.line || folding.start > params.range.end.line {
                continue;
            }
            // Clamping puts the end at the last character of its line
            let end = document.position_at(document.offset_at(Position::new(folding.end, u32::MAX)));
            ranges.push(Range::new(Position::new(folding.start, 0), end));
        }
    }
    ranges.sort_by_key(|range| (range.start, range.end));
    Ok(FoldingRangeResult { ranges })
}

async fn provide_code_actions(
    agent: Arc<Agent>,
    params: ProvideCodeActionsParams,
    token: CancellationToken,
) -> Result<ProvideCodeActionsResult> {
    agent
        .host
        .capabilities()
        .require(Capability::CodeActions, "codeActions/provide")?;

    let mut code_actions = Vec::new();
    let Some(document) = document(&agent.host, &params.location.uri).await else {
        return Ok(ProvideCodeActionsResult { code_actions });
    };

    for provider in agent.host.languages.code_actions.providers_for(&document) {
        let actions = match provider
            .provide_code_actions(
                &document,
                params.location.range,
                params.trigger_kind,
                token.clone(),
            )
            .await
        {
            Ok(actions) => actions,
            Err(e @ AgentError::RateLimited(_)) => return Err(e),
            Err(e) if token.is_cancelled() => {
                debug!("Code action provider cancelled: {}", e);
                return Ok(ProvideCodeActionsResult::default());
            }
            Err(e) => return Err(e),
        };
        if token.is_cancelled() {
            return Ok(ProvideCodeActionsResult::default());
        }

        let identified: Vec<_> = actions
            .into_iter()
            .map(|action| (Ulid::new().to_string(), action))
            .collect();
        code_actions.extend(identified.iter().map(|(id, action)| ProtocolCodeAction {
            id: id.clone(),
            title: action.title.clone(),
            kind: action.kind.clone(),
            is_preferred: action.is_preferred,
            command_id: action.command.as_ref().map(|command| command.command.clone()),
        }));
        lock(&agent.code_actions).extend(identified);
    }
    Ok(ProvideCodeActionsResult { code_actions })
}

async fn trigger_code_action(
    agent: Arc<Agent>,
    params: IdParams,
    _token: CancellationToken,
) -> Result<Value> {
    let action = lock(&agent.code_actions).get(&params.id).cloned();
    let Some(action) = action else {
        warn!("No code action with id {}", params.id);
        return Ok(Value::Null);
    };
    match action.command {
        Some(command) => {
            agent
                .host
                .commands
                .execute(&command.command, command.arguments)
                .await
        }
        None => {
            debug!("Code action '{}' has no command", action.title);
            Ok(Value::Null)
        }
    }
}

/// Inline completions from every matching provider
///
/// Cancellation yields an empty result; rate limiting always propagates.
async fn autocomplete(
    agent: Arc<Agent>,
    params: AutocompleteParams,
    token: CancellationToken,
) -> Result<AutocompleteResult> {
    let Some(document) = document(&agent.host, &params.uri).await else {
        return Ok(AutocompleteResult::default());
    };

    let mut items = Vec::new();
    for provider in agent
        .host
        .languages
        .inline_completions
        .providers_for(&document)
    {
        let completions = match provider
            .provide_inline_completions(
                &document,
                params.position,
                params.trigger_kind,
                token.clone(),
            )
            .await
        {
            Ok(completions) => completions,
            Err(e @ AgentError::RateLimited(_)) => return Err(e),
            Err(e) if token.is_cancelled() => {
                debug!("Completion provider cancelled: {}", e);
                return Ok(AutocompleteResult::default());
            }
            Err(e) => return Err(e),
        };
        if token.is_cancelled() {
            return Ok(AutocompleteResult::default());
        }
        items.extend(completions.into_iter().map(|completion| AutocompleteItem {
            id: Ulid::new().to_string(),
            insert_text: completion.insert_text,
            range: completion.range,
        }));
    }
    Ok(AutocompleteResult { items })
}

/// Send the active document's code lenses to the client
async fn display_code_lenses(host: &HostContext) {
    if !host.capabilities().supports(Capability::CodeLenses) {
        return;
    }
    let Some(document) = host
        .active_text_editor()
        .and_then(|editor| host.documents.get(&editor.uri))
    else {
        return;
    };

    let mut lenses = Vec::new();
    for provider in host.languages.code_lenses.providers_for(&document) {
        match provider
            .provide_code_lenses(&document, CancellationToken::new())
            .await
        {
            Ok(found) => lenses.extend(found.iter().map(ProtocolCodeLens::from)),
            Err(e) => warn!("Code lens provider failed: {}", e),
        }
    }
    host.client
        .display_code_lenses(&json!({ "uri": document.uri, "codeLenses": lenses }));
}

fn refresh_code_lenses(host: &Weak<HostContext>) -> BoxFuture<'static, ()> {
    let host = host.upgrade();
    async move {
        if let Some(host) = host {
            display_code_lenses(&host).await;
        }
    }
    .boxed()
}

/// Mirror code lens providers to `codeLenses/display`
///
/// Lenses are re-sent when a provider is added or removed, when a provider
/// reports a change, and when the active editor changes.
pub(super) fn forward_code_lenses(host: &Arc<HostContext>) {
    // Change subscriptions of registered providers, keyed by registration id
    let watched: Arc<Mutex<HashMap<u64, Subscription>>> = Arc::default();

    let weak = Arc::downgrade(host);
    let on_add_watched = Arc::clone(&watched);
    let _on_add = host
        .languages
        .code_lenses
        .on_did_add
        .on(move |event: ProviderEvent| {
            let weak = weak.clone();
            let watched = Arc::clone(&on_add_watched);
            async move {
                let Some(host) = weak.upgrade() else {
                    return;
                };
                if let Some(provider) = host.languages.code_lenses.get(event.id) {
                    if let Some(changes) = provider.on_did_change() {
                        let weak = weak.clone();
                        let subscription = changes.on(move |_| refresh_code_lenses(&weak));
                        lock(&watched).insert(event.id, subscription);
                        // Removed while we were subscribing
                        if host.languages.code_lenses.get(event.id).is_none() {
                            if let Some(subscription) = lock(&watched).remove(&event.id) {
                                subscription.dispose();
                            }
                        }
                    }
                }
                display_code_lenses(&host).await;
            }
        });

    let weak = Arc::downgrade(host);
    let _on_remove = host
        .languages
        .code_lenses
        .on_did_remove
        .on(move |event: ProviderEvent| {
            if let Some(subscription) = lock(&watched).remove(&event.id) {
                subscription.dispose();
            }
            refresh_code_lenses(&weak)
        });

    let weak = Arc::downgrade(host);
    let _on_editor = host
        .documents
        .on_did_change_active_editor
        .on(move |_| refresh_code_lenses(&weak));
}
