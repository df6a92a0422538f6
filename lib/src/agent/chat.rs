//! Chat panel and webview methods
//!
//! A missing panel is not an error here: clients race panel disposal against
//! their own requests, so unknown ids resolve to `null`.

use super::Agent;
use crate::error::{AgentError, Result};
use crate::panels::{AttributionLookup, Panel};
use crate::protocol::IdParams;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct SubmitMessageParams {
    id: String,
    message: Value,
}

#[derive(Debug, Deserialize)]
struct AttributionSearchParams {
    id: String,
    snippet: String,
}

#[derive(Debug, Deserialize)]
struct ReceiveMessageParams {
    id: String,
    message: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiveStringEncodedParams {
    id: String,
    message_string_encoded: String,
}

pub(super) fn register(agent: &Arc<Agent>) {
    agent.register_authenticated_request("chat/new", |agent, _: Value, _token| new_chat(agent));
    agent.register_authenticated_request("chat/submitMessage", submit_message);
    agent.register_authenticated_request(
        "chat/models",
        |agent, params: IdParams, _token| async move {
            Ok(agent
                .panel(&params.id)
                .map(|panel| json!({ "models": panel.models() })))
        },
    );
    agent.register_authenticated_request(
        "chat/remoteRepos",
        |agent, params: IdParams, _token| async move {
            Ok(agent
                .panel(&params.id)
                .map(|panel| json!({ "remoteRepos": panel.remote_repos() })))
        },
    );
    agent.register_authenticated_request("attribution/search", attribution_search);
    agent.register_authenticated_request(
        "webview/receiveMessage",
        |agent, params: ReceiveMessageParams, _token| async move {
            agent.deliver_to_panel(&params.id, params.message).await;
            Ok(Value::Null)
        },
    );
    agent.register_authenticated_request(
        "webview/receiveMessageStringEncoded",
        |agent, params: ReceiveStringEncodedParams, _token| async move {
            let message: Value = serde_json::from_str(&params.message_string_encoded)
                .map_err(|e| AgentError::InvalidParams(format!("Malformed webview message: {e}")))?;
            agent.deliver_to_panel(&params.id, message).await;
            Ok(Value::Null)
        },
    );
    agent.register_notification("webview/didDispose", |agent, params: IdParams| {
        agent.dispose_panel(&params.id);
        async { Ok(()) }
    });
}

impl Agent {
    fn panel(&self, id: &str) -> Option<Arc<Panel>> {
        let panel = self.host.panels.get(id);
        if panel.is_none() {
            warn!("No panel with id {}", id);
        }
        panel
    }

    async fn deliver_to_panel(&self, id: &str, message: Value) {
        if let Some(panel) = self.panel(id) {
            panel.receive_message(message).await;
        }
    }

    /// Client-initiated disposal; the client already knows, so it is not told
    fn dispose_panel(&self, id: &str) {
        if self.host.panels.dispose(id).is_some() {
            return;
        }
        if !self.host.panels.dispose_native(id, false) {
            debug!("Panel {} was already disposed", id);
        }
    }
}

async fn new_chat(agent: Arc<Agent>) -> Result<Value> {
    let command = format!("{}.chat.newPanel", agent.host.configuration.namespace());
    match agent.host.commands.execute(&command, Vec::new()).await? {
        Value::String(id) => {
            info!("Opened chat panel {}", id);
            Ok(Value::String(id))
        }
        other => {
            warn!("{} did not return a panel id: {}", command, other);
            Ok(Value::Null)
        }
    }
}

fn submit_payload(message: Value) -> Value {
    match message {
        Value::Object(mut fields) => {
            fields
                .entry("command")
                .or_insert_with(|| Value::String("submit".to_string()));
            Value::Object(fields)
        }
        text => json!({ "command": "submit", "text": text }),
    }
}

/// Submit one message and wait until the panel reports it is done
async fn submit_message(
    agent: Arc<Agent>,
    params: SubmitMessageParams,
    token: CancellationToken,
) -> Result<Value> {
    let Some(panel) = agent.panel(&params.id) else {
        return Ok(Value::Null);
    };
    panel.begin_submission()?;

    if panel.on_receive_message.listener_count() == 0 {
        warn!("Panel {} has no message handler", panel.id());
        panel.set_in_progress(false);
        return Ok(panel.transcript().unwrap_or(Value::Null));
    }

    let mut in_progress = panel.watch_in_progress();
    panel.receive_message(submit_payload(params.message)).await;

    let finished = async {
        // The sender lives in the panel we hold, so this only ends on `false`
        let _ = in_progress.wait_for(|busy| !*busy).await;
    };
    tokio::select! {
        _ = finished => {}
        _ = token.cancelled() => {
            panel.set_in_progress(false);
            panel.receive_message(json!({ "command": "abort" })).await;
            return Err(AgentError::Cancelled);
        }
    }
    Ok(panel.transcript().unwrap_or(Value::Null))
}

/// Look up attribution for a snippet, searching at most once per snippet
async fn attribution_search(
    agent: Arc<Agent>,
    params: AttributionSearchParams,
    token: CancellationToken,
) -> Result<Value> {
    let Some(panel) = agent.panel(&params.id) else {
        return Ok(Value::Null);
    };

    let (receiver, first) = match panel.lookup_attribution(&params.snippet) {
        AttributionLookup::Cached(result) => return Ok(result),
        AttributionLookup::Pending { receiver, first } => (receiver, first),
    };
    if first {
        if panel.on_receive_message.listener_count() == 0 {
            panel.abandon_attribution(&params.snippet);
            return Ok(Value::Null);
        }
        panel
            .receive_message(json!({ "command": "attribution-search", "snippet": params.snippet }))
            .await;
    }

    tokio::select! {
        result = receiver => Ok(result.unwrap_or(Value::Null)),
        _ = token.cancelled() => {
            if first {
                panel.abandon_attribution(&params.snippet);
            }
            Err(AgentError::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_payload() {
        assert_eq!(
            submit_payload(json!("hello")),
            json!({"command": "submit", "text": "hello"})
        );
        assert_eq!(
            submit_payload(json!({"text": "hi", "command": "edit"})),
            json!({"command": "edit", "text": "hi"})
        );
        assert_eq!(
            submit_payload(json!({"text": "hi"})),
            json!({"command": "submit", "text": "hi"})
        );
    }
}
